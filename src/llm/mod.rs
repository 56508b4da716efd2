//! LLM client module for interacting with language models.
//!
//! This module provides a trait-based abstraction over LLM providers,
//! with Gemini as the primary implementation, and the [`ModelGateway`]
//! that turns pipeline state into the four model calls the engine needs.

mod error;
mod gateway;
mod gemini;

pub use error::{classify_http_status, LlmError, LlmErrorKind};
pub use gateway::{
    parse_sub_tasks, DecompositionError, ExecuteStream, GenerationError, ModelGateway, Stage,
    TextStream,
};
pub use gemini::GeminiClient;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

/// A grounding citation attached to a streamed chunk.
///
/// Providers occasionally return grounding entries without a web uri; those
/// are kept here as-is and dropped when merged into a sub-task's sources.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Citation {
    pub uri: Option<String>,
    pub title: Option<String>,
}

impl Citation {
    /// Create a citation with a uri and no title.
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            uri: Some(uri.into()),
            title: None,
        }
    }

    /// Create a citation with a uri and a title.
    pub fn titled(uri: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            uri: Some(uri.into()),
            title: Some(title.into()),
        }
    }
}

/// One unit received from a streaming generation call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContentChunk {
    /// Text delta (may be empty, e.g. for grounding-only chunks)
    pub text: String,
    /// Grounding citations carried by this chunk
    pub citations: Vec<Citation>,
}

impl ContentChunk {
    /// Create a text-only chunk.
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            citations: Vec::new(),
        }
    }

    /// Attach citations to this chunk.
    pub fn with_citations(mut self, citations: Vec<Citation>) -> Self {
        self.citations = citations;
        self
    }
}

/// A single-prompt generation request.
#[derive(Debug, Clone, Default)]
pub struct GenerateRequest {
    /// Prompt text sent as the only user turn
    pub prompt: String,
    /// JSON schema constraining the response (enables JSON output)
    pub response_schema: Option<serde_json::Value>,
    /// Enable the provider's web search grounding tool
    pub web_search: bool,
}

impl GenerateRequest {
    /// Create a plain text request.
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            response_schema: None,
            web_search: false,
        }
    }

    /// Constrain the response to JSON matching `schema`.
    pub fn with_response_schema(mut self, schema: serde_json::Value) -> Self {
        self.response_schema = Some(schema);
        self
    }

    /// Enable web search grounding.
    pub fn with_web_search(mut self) -> Self {
        self.web_search = true;
        self
    }
}

/// Lazy, single-pass stream of chunks from one generation call.
pub type ChunkStream = BoxStream<'static, Result<ContentChunk, LlmError>>;

/// Trait for LLM clients.
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Send one request and return the full response text.
    async fn generate_content(&self, request: GenerateRequest) -> Result<String, LlmError>;

    /// Open a streaming generation call.
    ///
    /// Errors raised while opening may surface either here or as the first
    /// item of the stream; callers must handle both.
    async fn stream_content(&self, request: GenerateRequest) -> Result<ChunkStream, LlmError>;
}
