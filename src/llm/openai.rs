//! OpenAI chat completions, also used for OpenAI-compatible Groq.

use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::stream::ChatStream;
use super::types::{ChatRequest, Completion, Message, StreamFrame, Usage};
use super::{LlmError, Provider, REQUEST_TIMEOUT, STREAM_IDLE_TIMEOUT, ensure_success};
use crate::config::{ApiKey, env_nonempty};

const OPENAI_BASE: &str = "https://api.openai.com/v1";
const GROQ_BASE: &str = "https://api.groq.com/openai/v1";

#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: &'a [Message],
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream_options: Option<StreamOptions>,
}

#[derive(Debug, Serialize)]
struct StreamOptions {
    include_usage: bool,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    #[serde(default)]
    choices: Vec<Choice>,
    usage: Option<ApiUsage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: Option<ChoiceMessage>,
    delta: Option<ChoiceMessage>,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiUsage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
}

impl From<ApiUsage> for Usage {
    fn from(u: ApiUsage) -> Self {
        Usage {
            input_tokens: u.prompt_tokens,
            output_tokens: u.completion_tokens,
        }
    }
}

#[derive(Clone)]
pub struct OpenAiClient {
    http: Client,
    provider: Provider,
    api_key: ApiKey,
    model: String,
    base_url: String,
}

impl OpenAiClient {
    pub fn from_env(provider: Provider, http: Client) -> Result<Self, LlmError> {
        let api_key = ApiKey::from_env(provider.key_var()).ok_or(LlmError::NotConfigured {
            provider,
            var: provider.key_var(),
        })?;
        let (base_url, default_model) = match provider {
            Provider::Groq => (GROQ_BASE, "llama-3.3-70b-versatile"),
            _ => (OPENAI_BASE, "gpt-4o-mini"),
        };
        Ok(Self {
            http,
            provider,
            api_key,
            model: env_nonempty(provider.model_var()).unwrap_or_else(|| default_model.to_string()),
            base_url: base_url.to_string(),
        })
    }

    #[cfg(test)]
    pub(crate) fn with_base_url(provider: Provider, http: Client, base_url: &str) -> Self {
        Self {
            http,
            provider,
            api_key: ApiKey::new("test-key"),
            model: "test-model".to_string(),
            base_url: base_url.to_string(),
        }
    }

    async fn send(
        &self,
        request: &ChatRequest,
        stream: bool,
    ) -> Result<reqwest::Response, LlmError> {
        let body = ChatCompletionRequest {
            model: &self.model,
            messages: &request.messages,
            temperature: request.temperature,
            max_tokens: request.max_tokens,
            stream,
            stream_options: stream.then_some(StreamOptions {
                include_usage: true,
            }),
        };
        let mut builder = self
            .http
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(self.api_key.expose())
            .header("User-Agent", crate::USER_AGENT)
            .json(&body);
        if !stream {
            builder = builder.timeout(REQUEST_TIMEOUT);
        }
        let response = tokio::time::timeout(REQUEST_TIMEOUT, builder.send())
            .await
            .map_err(|_| LlmError::Timeout(format!("{} did not respond", self.provider)))??;
        ensure_success(self.provider, response).await
    }

    pub async fn complete(&self, request: &ChatRequest) -> Result<Completion, LlmError> {
        let response = self.send(request, false).await?;
        let body: ChatCompletionResponse = response.json().await?;
        let content = body
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message)
            .and_then(|m| m.content)
            .ok_or_else(|| LlmError::Decode {
                provider: self.provider,
                message: "no choices in response".into(),
            })?;
        debug!(provider = %self.provider, model = %self.model, "completion received");
        Ok(Completion {
            content,
            usage: body.usage.map(Usage::from),
            provider: self.provider,
        })
    }

    pub async fn stream(&self, request: &ChatRequest) -> Result<ChatStream, LlmError> {
        let response = self.send(request, true).await?;
        Ok(ChatStream::from_response(response, decode_event, STREAM_IDLE_TIMEOUT))
    }
}

/// `data:` payload -> frames. The final chunk carries `usage` with empty `choices`.
pub fn decode_event(data: &str) -> Vec<StreamFrame> {
    if data == "[DONE]" {
        return Vec::new();
    }
    let Ok(chunk) = serde_json::from_str::<ChatCompletionResponse>(data) else {
        debug!(data, "skipping undecodable openai chunk");
        return Vec::new();
    };
    let mut frames: Vec<StreamFrame> = chunk
        .choices
        .into_iter()
        .filter_map(|c| c.delta.and_then(|d| d.content))
        .filter(|text| !text.is_empty())
        .map(StreamFrame::Content)
        .collect();
    if let Some(usage) = chunk.usage {
        frames.push(StreamFrame::Usage(usage.into()));
    }
    frames
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_content_delta() {
        let frames = decode_event(r#"{"choices":[{"delta":{"content":"Hi"}}]}"#);
        assert_eq!(frames, vec![StreamFrame::Content("Hi".into())]);
    }

    #[test]
    fn decodes_trailing_usage_chunk() {
        let frames =
            decode_event(r#"{"choices":[],"usage":{"prompt_tokens":12,"completion_tokens":7}}"#);
        assert_eq!(
            frames,
            vec![StreamFrame::Usage(Usage {
                input_tokens: 12,
                output_tokens: 7
            })]
        );
    }

    #[test]
    fn ignores_done_role_only_and_garbage() {
        assert!(decode_event("[DONE]").is_empty());
        assert!(decode_event(r#"{"choices":[{"delta":{"role":"assistant"}}]}"#).is_empty());
        assert!(decode_event("not json").is_empty());
    }
}

#[cfg(test)]
mod http_tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn request() -> ChatRequest {
        ChatRequest::new(vec![Message::system("sys"), Message::user("hello")], 0.1)
    }

    #[tokio::test]
    async fn complete_returns_content_and_usage() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .and(header("authorization", "Bearer test-key"))
            .and(body_partial_json(serde_json::json!({
                "model": "test-model",
                "stream": false,
                "messages": [{"role": "system", "content": "sys"}, {"role": "user", "content": "hello"}]
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "choices": [{"message": {"role": "assistant", "content": "world"}}],
                "usage": {"prompt_tokens": 9, "completion_tokens": 1}
            })))
            .mount(&server)
            .await;

        let client = OpenAiClient::with_base_url(Provider::OpenAi, Client::new(), &server.uri());
        let out = client.complete(&request()).await.unwrap();
        assert_eq!(out.content, "world");
        assert_eq!(
            out.usage,
            Some(Usage {
                input_tokens: 9,
                output_tokens: 1
            })
        );
    }

    #[tokio::test]
    async fn rate_limit_is_typed() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429))
            .mount(&server)
            .await;

        let client = OpenAiClient::with_base_url(Provider::Groq, Client::new(), &server.uri());
        let err = client.complete(&request()).await.unwrap_err();
        assert!(matches!(err, LlmError::RateLimited(Provider::Groq)));
    }

    #[tokio::test]
    async fn empty_choices_is_decode_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({"choices": []})),
            )
            .mount(&server)
            .await;

        let client = OpenAiClient::with_base_url(Provider::OpenAi, Client::new(), &server.uri());
        let err = client.complete(&request()).await.unwrap_err();
        assert!(matches!(err, LlmError::Decode { .. }));
    }

    #[tokio::test]
    async fn stream_requests_usage_and_decodes_frames() {
        let server = MockServer::start().await;
        let body = "data: {\"choices\":[{\"delta\":{\"content\":\"a\"}}]}\n\n\
                    data: {\"choices\":[{\"delta\":{\"content\":\"b\"}}]}\n\n\
                    data: {\"choices\":[],\"usage\":{\"prompt_tokens\":3,\"completion_tokens\":2}}\n\n\
                    data: [DONE]\n\n";
        Mock::given(method("POST"))
            .and(body_partial_json(serde_json::json!({
                "stream": true,
                "stream_options": {"include_usage": true}
            })))
            .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
            .mount(&server)
            .await;

        let client = OpenAiClient::with_base_url(Provider::OpenAi, Client::new(), &server.uri());
        let (text, usage) = client
            .stream(&request())
            .await
            .unwrap()
            .collect_text()
            .await
            .unwrap();
        assert_eq!(text, "ab");
        assert_eq!(
            usage,
            Some(Usage {
                input_tokens: 3,
                output_tokens: 2
            })
        );
    }
}
