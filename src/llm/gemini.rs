//! Gemini (Generative Language API) client implementation.
//!
//! Blocking calls go to `models/{model}:generateContent`; streaming calls go to
//! `models/{model}:streamGenerateContent?alt=sse` and are consumed with
//! `reqwest-eventsource`. Nothing is retried.

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use reqwest_eventsource::{retry::Never, Event, EventSource};
use serde::{Deserialize, Serialize};

use super::{ChunkStream, Citation, ContentChunk, GenerateRequest, LlmClient, LlmError};
use crate::config::Config;

/// Gemini API client.
pub struct GeminiClient {
    client: Client,
    api_key: String,
    model: String,
    base_url: String,
}

impl GeminiClient {
    /// Create a client from the service configuration.
    pub fn from_config(config: &Config) -> Self {
        Self {
            client: Client::new(),
            api_key: config.api_key.clone(),
            model: config.model.clone(),
            base_url: config.base_url.clone(),
        }
    }

    fn endpoint(&self, method: &str) -> String {
        format!("{}/models/{}:{}", self.base_url, self.model, method)
    }

    fn request_builder(&self, url: String, body: &GeminiRequest) -> reqwest::RequestBuilder {
        self.client
            .post(url)
            .header("x-goog-api-key", &self.api_key)
            .header("Content-Type", "application/json")
            .json(body)
    }

    fn transport_error(e: reqwest::Error) -> LlmError {
        if e.is_timeout() {
            LlmError::network_error(format!("Request timeout: {}", e))
        } else if e.is_connect() {
            LlmError::network_error(format!("Connection failed: {}", e))
        } else {
            LlmError::network_error(format!("Request failed: {}", e))
        }
    }

    /// Map an event source failure into an `LlmError`, reading the response
    /// body for HTTP errors.
    async fn stream_error(err: reqwest_eventsource::Error) -> LlmError {
        use reqwest_eventsource::Error as EsError;

        match err {
            EsError::InvalidStatusCode(status, response) => {
                let body = response.text().await.unwrap_or_default();
                LlmError::from_status(status.as_u16(), body)
            }
            EsError::InvalidContentType(content_type, response) => {
                let body = response.text().await.unwrap_or_default();
                LlmError::parse_error(format!(
                    "Unexpected content type {:?}: {}",
                    content_type, body
                ))
            }
            EsError::Transport(e) => Self::transport_error(e),
            other => LlmError::network_error(format!("Stream failed: {}", other)),
        }
    }
}

#[async_trait]
impl LlmClient for GeminiClient {
    async fn generate_content(&self, request: GenerateRequest) -> Result<String, LlmError> {
        let body = GeminiRequest::from(&request);
        tracing::debug!(
            model = %self.model,
            structured = request.response_schema.is_some(),
            "Sending generateContent request"
        );

        let response = self
            .request_builder(self.endpoint("generateContent"), &body)
            .send()
            .await
            .map_err(Self::transport_error)?;

        let status = response.status();
        let text = response.text().await.unwrap_or_default();

        if !status.is_success() {
            return Err(LlmError::from_status(status.as_u16(), text));
        }

        let parsed: GeminiResponse = serde_json::from_str(&text).map_err(|e| {
            LlmError::parse_error(format!("Failed to parse response: {}, body: {}", e, text))
        })?;

        let chunk = parsed.into_chunk()?;
        Ok(chunk.text)
    }

    async fn stream_content(&self, request: GenerateRequest) -> Result<ChunkStream, LlmError> {
        let body = GeminiRequest::from(&request);
        tracing::debug!(
            model = %self.model,
            web_search = request.web_search,
            "Opening streamGenerateContent request"
        );

        let url = format!("{}?alt=sse", self.endpoint("streamGenerateContent"));
        let mut source = EventSource::new(self.request_builder(url, &body))
            .map_err(|e| LlmError::network_error(format!("Failed to open stream: {}", e)))?;
        source.set_retry_policy(Box::new(Never));

        let stream = async_stream::stream! {
            while let Some(event) = source.next().await {
                match event {
                    Ok(Event::Open) => continue,
                    Ok(Event::Message(message)) => match parse_stream_chunk(&message.data) {
                        Ok(chunk) => {
                            yield Ok(chunk);
                        }
                        Err(e) => {
                            yield Err(e);
                            break;
                        }
                    },
                    Err(reqwest_eventsource::Error::StreamEnded) => break,
                    Err(e) => {
                        yield Err(GeminiClient::stream_error(e).await);
                        break;
                    }
                }
            }
            source.close();
        };

        Ok(Box::pin(stream))
    }
}

/// Decode one SSE `data:` payload into a chunk.
pub(crate) fn parse_stream_chunk(data: &str) -> Result<ContentChunk, LlmError> {
    let parsed: GeminiResponse = serde_json::from_str(data).map_err(|e| {
        LlmError::parse_error(format!("Failed to parse stream chunk: {}, data: {}", e, data))
    })?;
    parsed.into_chunk()
}

/// Gemini request format.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiRequest {
    contents: Vec<GeminiContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    generation_config: Option<GenerationConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<GeminiTool>>,
}

impl From<&GenerateRequest> for GeminiRequest {
    fn from(request: &GenerateRequest) -> Self {
        Self {
            contents: vec![GeminiContent {
                role: "user".to_string(),
                parts: vec![GeminiPart {
                    text: request.prompt.clone(),
                }],
            }],
            generation_config: request.response_schema.as_ref().map(|schema| {
                GenerationConfig {
                    response_mime_type: "application/json".to_string(),
                    response_schema: schema.clone(),
                }
            }),
            tools: request.web_search.then(|| {
                vec![GeminiTool {
                    google_search: GoogleSearch {},
                }]
            }),
        }
    }
}

#[derive(Debug, Serialize)]
struct GeminiContent {
    role: String,
    parts: Vec<GeminiPart>,
}

#[derive(Debug, Serialize)]
struct GeminiPart {
    text: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    response_mime_type: String,
    response_schema: serde_json::Value,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiTool {
    google_search: GoogleSearch,
}

#[derive(Debug, Serialize)]
struct GoogleSearch {}

/// Gemini response format (shared by full responses and stream chunks).
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<GeminiCandidate>,
    #[serde(default)]
    prompt_feedback: Option<PromptFeedback>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiCandidate {
    #[serde(default)]
    content: Option<CandidateContent>,
    #[serde(default)]
    grounding_metadata: Option<GroundingMetadata>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<CandidatePart>,
}

#[derive(Debug, Deserialize)]
struct CandidatePart {
    #[serde(default)]
    text: Option<String>,
    /// Thought summaries from thinking models; never part of the answer text.
    #[serde(default)]
    thought: Option<bool>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GroundingMetadata {
    #[serde(default)]
    grounding_chunks: Vec<GroundingChunk>,
}

#[derive(Debug, Deserialize)]
struct GroundingChunk {
    #[serde(default)]
    web: Option<WebSource>,
}

#[derive(Debug, Deserialize)]
struct WebSource {
    #[serde(default)]
    uri: Option<String>,
    #[serde(default)]
    title: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PromptFeedback {
    #[serde(default)]
    block_reason: Option<String>,
}

impl GeminiResponse {
    /// Collapse the first candidate into text plus citations.
    fn into_chunk(self) -> Result<ContentChunk, LlmError> {
        let Some(candidate) = self.candidates.into_iter().next() else {
            if let Some(reason) = self.prompt_feedback.and_then(|f| f.block_reason) {
                return Err(LlmError::blocked(format!("Prompt blocked: {}", reason)));
            }
            return Ok(ContentChunk::default());
        };

        let text = candidate
            .content
            .map(|content| {
                content
                    .parts
                    .into_iter()
                    .filter(|part| part.thought != Some(true))
                    .filter_map(|part| part.text)
                    .collect::<String>()
            })
            .unwrap_or_default();

        let citations = candidate
            .grounding_metadata
            .map(|metadata| {
                metadata
                    .grounding_chunks
                    .into_iter()
                    .map(|chunk| match chunk.web {
                        Some(web) => Citation {
                            uri: web.uri,
                            title: web.title,
                        },
                        None => Citation::default(),
                    })
                    .collect()
            })
            .unwrap_or_default();

        Ok(ContentChunk { text, citations })
    }
}
