use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use ingest::{DocumentBlob, PDF_MEDIA_TYPE};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::ApiError;

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
const API_VERSION: &str = "2023-06-01";

/// Everything needed for one model call.
#[derive(Debug, Clone)]
pub struct ModelRequest {
    pub model: String,
    /// Stage and scope, e.g. `results:positions_4-9`. Used for logging.
    pub label: String,
    pub instruction: String,
    pub document: Option<DocumentBlob>,
    pub max_output_tokens: u32,
    pub temperature: f32,
    pub estimated_input_tokens: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    #[serde(default)]
    pub cache_write_tokens: u64,
    #[serde(default)]
    pub cache_read_tokens: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ModelResponse {
    pub text: String,
    pub usage: TokenUsage,
}

/// The remote model boundary. Implementations make exactly one attempt per call.
#[async_trait]
pub trait ModelClient: Send + Sync {
    async fn complete(&self, request: &ModelRequest) -> Result<ModelResponse, ApiError>;
}

#[derive(Clone)]
pub struct AnthropicClient {
    base_url: String,
    api_key: String,
    client: reqwest::Client,
}

impl AnthropicClient {
    pub fn new(api_key: impl Into<String>) -> Result<Self> {
        Self::with_base_url(api_key, DEFAULT_BASE_URL)
    }

    pub fn with_base_url(api_key: impl Into<String>, base_url: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(300))
            .build()
            .context("Failed to build Anthropic HTTP client")?;

        Ok(Self {
            base_url: base_url.into(),
            api_key: api_key.into(),
            client,
        })
    }
}

#[derive(Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    temperature: f32,
    messages: Vec<Message<'a>>,
}

#[derive(Serialize)]
struct Message<'a> {
    role: &'a str,
    content: Vec<ContentBlock<'a>>,
}

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentBlock<'a> {
    Document { source: DocumentSource },
    Text { text: &'a str },
}

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum DocumentSource {
    Base64 { media_type: &'static str, data: String },
    Text { media_type: &'static str, data: String },
}

impl From<&DocumentBlob> for DocumentSource {
    fn from(blob: &DocumentBlob) -> Self {
        if blob.media_type == PDF_MEDIA_TYPE {
            DocumentSource::Base64 {
                media_type: blob.media_type,
                data: STANDARD.encode(&blob.data),
            }
        } else {
            DocumentSource::Text {
                media_type: blob.media_type,
                data: String::from_utf8_lossy(&blob.data).into_owned(),
            }
        }
    }
}

#[derive(Deserialize)]
struct MessagesResponse {
    content: Vec<ResponseBlock>,
    usage: WireUsage,
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ResponseBlock {
    Text {
        text: String,
    },
    #[serde(other)]
    Other,
}

#[derive(Deserialize)]
struct WireUsage {
    input_tokens: u64,
    output_tokens: u64,
    #[serde(default)]
    cache_creation_input_tokens: Option<u64>,
    #[serde(default)]
    cache_read_input_tokens: Option<u64>,
}

#[async_trait]
impl ModelClient for AnthropicClient {
    async fn complete(&self, request: &ModelRequest) -> Result<ModelResponse, ApiError> {
        let url = format!("{}/v1/messages", self.base_url);

        let mut content = Vec::with_capacity(2);
        if let Some(blob) = &request.document {
            content.push(ContentBlock::Document {
                source: DocumentSource::from(blob),
            });
        }
        content.push(ContentBlock::Text {
            text: &request.instruction,
        });

        let body = MessagesRequest {
            model: &request.model,
            max_tokens: request.max_output_tokens,
            temperature: request.temperature,
            messages: vec![Message {
                role: "user",
                content,
            }],
        };

        let response = self
            .client
            .post(&url)
            .header("x-api-key", self.api_key.trim())
            .header("anthropic-version", API_VERSION)
            .json(&body)
            .send()
            .await
            .map_err(|e| ApiError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let message = response
                .text()
                .await
                .unwrap_or_else(|_| "<body unavailable>".to_string());
            if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
                return Err(ApiError::RateLimited(message));
            }
            return Err(ApiError::Request {
                status: status.as_u16(),
                message,
            });
        }

        let parsed: MessagesResponse = response
            .json()
            .await
            .map_err(|e| ApiError::Transport(format!("failed to decode response: {}", e)))?;

        let text = parsed
            .content
            .into_iter()
            .filter_map(|block| match block {
                ResponseBlock::Text { text } => Some(text),
                ResponseBlock::Other => None,
            })
            .collect::<Vec<_>>()
            .join("\n");

        Ok(ModelResponse {
            text,
            usage: TokenUsage {
                input_tokens: parsed.usage.input_tokens,
                output_tokens: parsed.usage.output_tokens,
                cache_write_tokens: parsed.usage.cache_creation_input_tokens.unwrap_or(0),
                cache_read_tokens: parsed.usage.cache_read_input_tokens.unwrap_or(0),
            },
        })
    }
}
