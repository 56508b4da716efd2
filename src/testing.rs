//! Scripted in-memory `LlmClient` for unit tests.
//!
//! Responses are consumed in order: `generate_content` pops the next
//! decomposition body, `stream_content` pops the next stream script. Every
//! request is recorded so tests can inspect the prompts that were sent.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::Notify;

use crate::llm::{ChunkStream, ContentChunk, GenerateRequest, LlmClient, LlmError};

/// One scripted streaming response.
#[derive(Default)]
pub struct StreamScript {
    open_error: Option<LlmError>,
    gate: Option<Arc<Notify>>,
    items: Vec<Result<ContentChunk, LlmError>>,
}

impl StreamScript {
    /// A stream of text-only chunks.
    pub fn text(deltas: &[&str]) -> Self {
        Self::chunks(deltas.iter().map(|d| ContentChunk::text(*d)).collect())
    }

    pub fn chunks(chunks: Vec<ContentChunk>) -> Self {
        Self {
            items: chunks.into_iter().map(Ok).collect(),
            ..Self::default()
        }
    }

    /// A stream that fails before yielding anything.
    pub fn open_error(error: LlmError) -> Self {
        Self {
            open_error: Some(error),
            ..Self::default()
        }
    }

    /// Fail after the scripted chunks.
    pub fn then_fail(mut self, error: LlmError) -> Self {
        self.items.push(Err(error));
        self
    }

    /// Hold the first chunk back until `gate` is notified.
    pub fn gated(mut self, gate: Arc<Notify>) -> Self {
        self.gate = Some(gate);
        self
    }
}

#[derive(Default)]
pub struct ScriptedClient {
    decompositions: Mutex<VecDeque<Result<String, LlmError>>>,
    streams: Mutex<VecDeque<StreamScript>>,
    requests: Mutex<Vec<GenerateRequest>>,
}

impl ScriptedClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_decomposition(self, response: Result<String, LlmError>) -> Self {
        self.decompositions.lock().unwrap().push_back(response);
        self
    }

    /// Shorthand for a successful decomposition into `sub_tasks`.
    pub fn with_plan(self, sub_tasks: &[&str]) -> Self {
        let body = serde_json::json!({ "subTasks": sub_tasks }).to_string();
        self.with_decomposition(Ok(body))
    }

    pub fn with_stream(self, script: StreamScript) -> Self {
        self.streams.lock().unwrap().push_back(script);
        self
    }

    /// Every request received so far, in order.
    pub fn requests(&self) -> Vec<GenerateRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl LlmClient for ScriptedClient {
    async fn generate_content(&self, request: GenerateRequest) -> Result<String, LlmError> {
        self.requests.lock().unwrap().push(request);
        self.decompositions
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(LlmError::parse_error("no scripted response".to_string())))
    }

    async fn stream_content(&self, request: GenerateRequest) -> Result<ChunkStream, LlmError> {
        self.requests.lock().unwrap().push(request);
        let script = self
            .streams
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| LlmError::parse_error("no scripted stream".to_string()))?;
        if let Some(error) = script.open_error {
            return Err(error);
        }

        let StreamScript { gate, items, .. } = script;
        Ok(async_stream::stream! {
            if let Some(gate) = gate {
                gate.notified().await;
            }
            for item in items {
                yield item;
            }
        }
        .boxed())
    }
}
