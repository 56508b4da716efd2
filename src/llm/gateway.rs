//! Model gateway: the four model calls the pipeline makes.
//!
//! Each call builds its prompt from the caller's data up front, so the
//! returned streams own everything they need and never borrow the ledger.
//! Streams are lazy: nothing is sent until the first poll. They end after
//! the first error.

use std::sync::{Arc, OnceLock};

use futures::stream::BoxStream;
use futures::StreamExt;
use regex::Regex;

use super::{ContentChunk, GenerateRequest, LlmClient, LlmError};
use crate::prompt;
use crate::task::Ledger;

/// Stream of text deltas (reflection, consolidation).
pub type TextStream = BoxStream<'static, Result<String, GenerationError>>;

/// Stream of text deltas with citations (execution).
pub type ExecuteStream = BoxStream<'static, Result<ContentChunk, GenerationError>>;

/// The streamed pipeline stage a generation error belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Reflection,
    Execution,
    Consolidation,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Stage::Reflection => write!(f, "Reflection"),
            Stage::Execution => write!(f, "Execution"),
            Stage::Consolidation => write!(f, "Consolidation"),
        }
    }
}

/// A streaming call failed while opening or while being drained.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{stage} failed: {source}")]
pub struct GenerationError {
    pub stage: Stage,
    #[source]
    pub source: LlmError,
}

impl GenerationError {
    pub fn new(stage: Stage, source: LlmError) -> Self {
        Self { stage, source }
    }

    /// The provider was unavailable, as opposed to rejecting the request.
    pub fn is_transient(&self) -> bool {
        self.source.is_transient()
    }
}

/// The decomposition call did not produce a usable plan.
#[derive(Debug, Clone, thiserror::Error)]
pub enum DecompositionError {
    #[error("Failed to decompose the task: {0}")]
    Request(#[source] LlmError),

    #[error("Failed to decompose the task: response is not valid JSON ({0})")]
    InvalidJson(String),

    #[error("Failed to decompose the task: response has no subTasks array")]
    MissingSubTasks,

    #[error("Failed to decompose the task: sub-task {0} is not a string")]
    InvalidSubTask(usize),

    #[error("Failed to decompose the task: the plan has no sub-tasks")]
    EmptyPlan,
}

/// Parse a decomposition response body into sub-task descriptions.
///
/// Tolerates a markdown code fence around the JSON object.
pub fn parse_sub_tasks(body: &str) -> Result<Vec<String>, DecompositionError> {
    static FENCE: OnceLock<Regex> = OnceLock::new();
    let fence = FENCE.get_or_init(|| {
        Regex::new(r"(?s)^\s*```(?:json)?\s*(.*?)\s*```\s*$").expect("valid fence regex")
    });
    let json = fence
        .captures(body)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str())
        .unwrap_or(body)
        .trim();

    let value: serde_json::Value =
        serde_json::from_str(json).map_err(|e| DecompositionError::InvalidJson(e.to_string()))?;

    let items = value
        .get("subTasks")
        .and_then(|v| v.as_array())
        .ok_or(DecompositionError::MissingSubTasks)?;

    let sub_tasks = items
        .iter()
        .enumerate()
        .map(|(i, item)| {
            item.as_str()
                .map(str::to_string)
                .ok_or(DecompositionError::InvalidSubTask(i))
        })
        .collect::<Result<Vec<_>, _>>()?;

    if sub_tasks.is_empty() {
        return Err(DecompositionError::EmptyPlan);
    }
    Ok(sub_tasks)
}

/// Gateway between the pipeline and an LLM provider.
#[derive(Clone)]
pub struct ModelGateway {
    client: Arc<dyn LlmClient>,
}

impl ModelGateway {
    pub fn new(client: Arc<dyn LlmClient>) -> Self {
        Self { client }
    }

    /// Ask the model to split `task` into ordered sub-task descriptions.
    pub async fn decompose(&self, task: &str) -> Result<Vec<String>, DecompositionError> {
        let request = GenerateRequest::new(prompt::decomposition(task))
            .with_response_schema(prompt::decomposition_schema());

        let body = self
            .client
            .generate_content(request)
            .await
            .map_err(DecompositionError::Request)?;

        parse_sub_tasks(&body)
    }

    /// Stream the reflection for sub-task `index`.
    pub fn reflect_stream(&self, main_task: &str, ledger: &Ledger, index: usize) -> TextStream {
        let request = GenerateRequest::new(prompt::reflection(main_task, ledger.records(), index));
        self.text_stream(request, Stage::Reflection)
    }

    /// Stream the search-grounded execution of sub-task `index`.
    pub fn execute_stream(&self, main_task: &str, ledger: &Ledger, index: usize) -> ExecuteStream {
        let request = GenerateRequest::new(prompt::execution(main_task, ledger.records(), index))
            .with_web_search();
        let client = Arc::clone(&self.client);

        Box::pin(async_stream::stream! {
            let mut chunks = match client.stream_content(request).await {
                Ok(chunks) => chunks,
                Err(e) => {
                    yield Err(GenerationError::new(Stage::Execution, e));
                    return;
                }
            };
            while let Some(chunk) = chunks.next().await {
                match chunk {
                    Ok(chunk) => {
                        yield Ok(chunk);
                    }
                    Err(e) => {
                        yield Err(GenerationError::new(Stage::Execution, e));
                        break;
                    }
                }
            }
        })
    }

    /// Stream the final answer synthesized from every sub-task.
    pub fn consolidate_stream(&self, main_task: &str, ledger: &Ledger) -> TextStream {
        let request = GenerateRequest::new(prompt::consolidation(main_task, ledger.records()));
        self.text_stream(request, Stage::Consolidation)
    }

    fn text_stream(&self, request: GenerateRequest, stage: Stage) -> TextStream {
        let client = Arc::clone(&self.client);

        Box::pin(async_stream::stream! {
            let mut chunks = match client.stream_content(request).await {
                Ok(chunks) => chunks,
                Err(e) => {
                    yield Err(GenerationError::new(stage, e));
                    return;
                }
            };
            while let Some(chunk) = chunks.next().await {
                match chunk {
                    Ok(chunk) if chunk.text.is_empty() => continue,
                    Ok(chunk) => {
                        yield Ok(chunk.text);
                    }
                    Err(e) => {
                        yield Err(GenerationError::new(stage, e));
                        break;
                    }
                }
            }
        })
    }
}
