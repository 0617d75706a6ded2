use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::stream::ChatStream;
use super::types::{ChatRequest, Completion, Role, StreamFrame, Usage};
use super::{LlmError, Provider, REQUEST_TIMEOUT, STREAM_IDLE_TIMEOUT, ensure_success};
use crate::config::{ApiKey, env_nonempty};

const API_BASE: &str = "https://api.anthropic.com";
const API_VERSION: &str = "2023-06-01";
const DEFAULT_MODEL: &str = "claude-3-5-haiku-latest";
/// The messages API requires an explicit output cap.
const DEFAULT_MAX_TOKENS: u32 = 4096;

#[derive(Debug, Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<&'a str>,
    messages: Vec<ApiMessage<'a>>,
    stream: bool,
}

#[derive(Debug, Serialize)]
struct ApiMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    content: Vec<ContentBlock>,
    usage: Option<ApiUsage>,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    kind: String,
    text: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ApiUsage {
    #[serde(default)]
    input_tokens: u32,
    #[serde(default)]
    output_tokens: u32,
}

impl From<ApiUsage> for Usage {
    fn from(u: ApiUsage) -> Self {
        Usage {
            input_tokens: u.input_tokens,
            output_tokens: u.output_tokens,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum StreamEvent {
    MessageStart { message: StartMessage },
    ContentBlockDelta { delta: Delta },
    MessageDelta { usage: Option<ApiUsage> },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct StartMessage {
    usage: Option<ApiUsage>,
}

#[derive(Debug, Deserialize)]
struct Delta {
    text: Option<String>,
}

#[derive(Clone)]
pub struct AnthropicClient {
    http: Client,
    api_key: ApiKey,
    model: String,
    base_url: String,
}

impl AnthropicClient {
    pub fn from_env(http: Client) -> Result<Self, LlmError> {
        let provider = Provider::Anthropic;
        let api_key = ApiKey::from_env(provider.key_var()).ok_or(LlmError::NotConfigured {
            provider,
            var: provider.key_var(),
        })?;
        Ok(Self {
            http,
            api_key,
            model: env_nonempty(provider.model_var()).unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            base_url: API_BASE.to_string(),
        })
    }

    #[cfg(test)]
    pub(crate) fn with_base_url(http: Client, base_url: &str) -> Self {
        Self {
            http,
            api_key: ApiKey::new("test-key"),
            model: DEFAULT_MODEL.to_string(),
            base_url: base_url.to_string(),
        }
    }

    async fn send(
        &self,
        request: &ChatRequest,
        stream: bool,
    ) -> Result<reqwest::Response, LlmError> {
        let body = MessagesRequest {
            model: &self.model,
            max_tokens: request.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            temperature: request.temperature,
            system: request.system(),
            messages: request
                .conversation()
                .map(|m| ApiMessage {
                    role: if m.role == Role::Assistant { "assistant" } else { "user" },
                    content: &m.content,
                })
                .collect(),
            stream,
        };
        let mut builder = self
            .http
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", self.api_key.expose())
            .header("anthropic-version", API_VERSION)
            .header("User-Agent", crate::USER_AGENT)
            .json(&body);
        if !stream {
            builder = builder.timeout(REQUEST_TIMEOUT);
        }
        let response = tokio::time::timeout(REQUEST_TIMEOUT, builder.send())
            .await
            .map_err(|_| LlmError::Timeout("anthropic did not respond".into()))??;
        ensure_success(Provider::Anthropic, response).await
    }

    pub async fn complete(&self, request: &ChatRequest) -> Result<Completion, LlmError> {
        let response = self.send(request, false).await?;
        let body: MessagesResponse = response.json().await?;
        let content: String = body
            .content
            .into_iter()
            .filter(|b| b.kind == "text")
            .filter_map(|b| b.text)
            .collect();
        debug!(model = %self.model, "anthropic completion received");
        Ok(Completion {
            content,
            usage: body.usage.map(Usage::from),
            provider: Provider::Anthropic,
        })
    }

    pub async fn stream(&self, request: &ChatRequest) -> Result<ChatStream, LlmError> {
        let response = self.send(request, true).await?;
        Ok(ChatStream::from_response(response, decode_event, STREAM_IDLE_TIMEOUT))
    }
}

/// Input tokens arrive with `message_start`, output tokens with `message_delta`.
pub fn decode_event(data: &str) -> Vec<StreamFrame> {
    let Ok(event) = serde_json::from_str::<StreamEvent>(data) else {
        debug!(data, "skipping undecodable anthropic event");
        return Vec::new();
    };
    match event {
        StreamEvent::MessageStart { message } => message
            .usage
            .map(|u| vec![StreamFrame::Usage(u.into())])
            .unwrap_or_default(),
        StreamEvent::ContentBlockDelta { delta } => delta
            .text
            .filter(|t| !t.is_empty())
            .map(|t| vec![StreamFrame::Content(t)])
            .unwrap_or_default(),
        StreamEvent::MessageDelta { usage } => usage
            .map(|u| vec![StreamFrame::Usage(u.into())])
            .unwrap_or_default(),
        StreamEvent::Other => Vec::new(),
    }
}
