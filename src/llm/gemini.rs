use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::stream::ChatStream;
use super::types::{ChatRequest, Completion, Role, StreamFrame, Usage};
use super::{LlmError, Provider, REQUEST_TIMEOUT, STREAM_IDLE_TIMEOUT, ensure_success};
use crate::config::{ApiKey, env_nonempty};

const API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta/models";
const DEFAULT_MODEL: &str = "gemini-2.5-flash";

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentRequest {
    contents: Vec<Content>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<Content>,
    generation_config: GenerationConfig,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_output_tokens: Option<u32>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Content {
    #[serde(default)]
    parts: Vec<Part>,
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Part {
    #[serde(default)]
    text: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentResponse {
    candidates: Option<Vec<Candidate>>,
    usage_metadata: Option<UsageMetadata>,
    error: Option<ApiError>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Option<Content>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UsageMetadata {
    #[serde(default)]
    prompt_token_count: u32,
    #[serde(default)]
    candidates_token_count: u32,
}

impl From<UsageMetadata> for Usage {
    fn from(u: UsageMetadata) -> Self {
        Usage {
            input_tokens: u.prompt_token_count,
            output_tokens: u.candidates_token_count,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ApiError {
    code: Option<u16>,
    message: Option<String>,
}

fn text(content: String) -> Content {
    Content {
        parts: vec![Part { text: content }],
        role: None,
    }
}

impl GenerateContentResponse {
    fn text(&self) -> String {
        self.candidates
            .as_ref()
            .and_then(|c| c.first())
            .and_then(|c| c.content.as_ref())
            .map(|content| content.parts.iter().map(|p| p.text.as_str()).collect())
            .unwrap_or_default()
    }
}

#[derive(Clone)]
pub struct GeminiClient {
    http: Client,
    api_key: ApiKey,
    model: String,
    base_url: String,
}

impl GeminiClient {
    pub fn from_env(http: Client) -> Result<Self, LlmError> {
        let provider = Provider::Gemini;
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

    fn body(request: &ChatRequest) -> GenerateContentRequest {
        GenerateContentRequest {
            contents: request
                .conversation()
                .map(|m| Content {
                    parts: vec![Part {
                        text: m.content.clone(),
                    }],
                    role: Some(if m.role == Role::Assistant { "model" } else { "user" }.into()),
                })
                .collect(),
            system_instruction: request.system().map(|s| text(s.to_string())),
            generation_config: GenerationConfig {
                temperature: request.temperature,
                max_output_tokens: request.max_tokens,
            },
        }
    }

    async fn send(
        &self,
        request: &ChatRequest,
        stream: bool,
    ) -> Result<reqwest::Response, LlmError> {
        let url = if stream {
            format!("{}/{}:streamGenerateContent?alt=sse", self.base_url, self.model)
        } else {
            format!("{}/{}:generateContent", self.base_url, self.model)
        };

        debug_assert!(
            url.starts_with("https://") || cfg!(test),
            "API key must only be sent over HTTPS"
        );

        let mut builder = self
            .http
            .post(&url)
            .header("x-goog-api-key", self.api_key.expose())
            .header("User-Agent", crate::USER_AGENT)
            .json(&Self::body(request));
        if !stream {
            builder = builder.timeout(REQUEST_TIMEOUT);
        }
        let response = tokio::time::timeout(REQUEST_TIMEOUT, builder.send())
            .await
            .map_err(|_| LlmError::Timeout("gemini did not respond".into()))??;
        ensure_success(Provider::Gemini, response).await
    }

    pub async fn complete(&self, request: &ChatRequest) -> Result<Completion, LlmError> {
        let response = self.send(request, false).await?;
        let body: GenerateContentResponse = response.json().await?;

        if let Some(err) = &body.error {
            let classified = classify_api_error(err);
            warn!(error = %classified, "Gemini API error in 200 response");
            return Err(classified);
        }

        let content = body.text();
        if content.is_empty() {
            warn!("Gemini returned empty answer (safety filter or empty response)");
        }
        debug!(model = %self.model, "gemini completion received");
        Ok(Completion {
            content,
            usage: body.usage_metadata.map(Usage::from),
            provider: Provider::Gemini,
        })
    }

    pub async fn stream(&self, request: &ChatRequest) -> Result<ChatStream, LlmError> {
        let response = self.send(request, true).await?;
        Ok(ChatStream::from_response(response, decode_event, STREAM_IDLE_TIMEOUT))
    }
}

/// Each SSE event is a full `GenerateContentResponse` holding the next slice
/// of text; `usageMetadata` grows as the stream advances.
pub fn decode_event(data: &str) -> Vec<StreamFrame> {
    let Ok(chunk) = serde_json::from_str::<GenerateContentResponse>(data) else {
        debug!(data, "skipping undecodable gemini chunk");
        return Vec::new();
    };
    let mut frames = Vec::new();
    let text = chunk.text();
    if !text.is_empty() {
        frames.push(StreamFrame::Content(text));
    }
    if let Some(usage) = chunk.usage_metadata {
        frames.push(StreamFrame::Usage(usage.into()));
    }
    frames
}

fn classify_api_error(err: &ApiError) -> LlmError {
    let message = err
        .message
        .clone()
        .unwrap_or_else(|| "Unknown error".to_string());

    match err.code {
        Some(429) => LlmError::RateLimited(Provider::Gemini),
        Some(code) => LlmError::Api {
            provider: Provider::Gemini,
            code,
            message,
        },
        None => LlmError::Api {
            provider: Provider::Gemini,
            code: 0,
            message: format!("Unknown error (no status code): {message}"),
        },
    }
}


#[cfg(test)]
mod http_tests {
    use super::*;
    use crate::llm::types::Message;
    use wiremock::matchers::{header, method, path_regex, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn request() -> ChatRequest {
        ChatRequest::new(vec![Message::user("test query")], 0.2)
    }

    #[tokio::test]
    async fn complete_returns_text() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path_regex(r":generateContent$"))
            .and(header("x-goog-api-key", "test-key"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "candidates": [{
                    "content": {"parts": [{"text": "Test answer"}], "role": "model"}
                }],
                "usageMetadata": {"promptTokenCount": 3, "candidatesTokenCount": 2}
            })))
            .mount(&server)
            .await;

        let client = GeminiClient::with_base_url(Client::new(), &server.uri());
        let out = client.complete(&request()).await.unwrap();
        assert_eq!(out.content, "Test answer");
        assert_eq!(out.usage.unwrap().input_tokens, 3);
    }

    #[tokio::test]
    async fn complete_200_with_error_field_is_classified() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path_regex(r":generateContent$"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "error": {"code": 429, "message": "Resource exhausted"}
            })))
            .mount(&server)
            .await;

        let client = GeminiClient::with_base_url(Client::new(), &server.uri());
        let err = client.complete(&request()).await.unwrap_err();
        assert!(matches!(err, LlmError::RateLimited(Provider::Gemini)));
    }

    #[tokio::test]
    async fn complete_500_with_invalid_body_keeps_snippet() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path_regex(r":generateContent$"))
            .respond_with(ResponseTemplate::new(500).set_body_string("not json"))
            .mount(&server)
            .await;

        let client = GeminiClient::with_base_url(Client::new(), &server.uri());
        match client.complete(&request()).await {
            Err(LlmError::Api { code: 500, message, .. }) => {
                assert!(message.contains("not json"), "got: {message}");
            }
            other => panic!("expected Api(500), got: {other:?}"),
        }
    }

    #[tokio::test]
    async fn stream_uses_sse_endpoint() {
        let server = MockServer::start().await;
        let body = "data: {\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"Rust \"}]}}]}\r\n\r\n\
                    data: {\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"rocks\"}]}}],\"usageMetadata\":{\"promptTokenCount\":5,\"candidatesTokenCount\":2}}\r\n\r\n";
        Mock::given(method("POST"))
            .and(path_regex(r":streamGenerateContent$"))
            .and(query_param("alt", "sse"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
            .mount(&server)
            .await;

        let client = GeminiClient::with_base_url(Client::new(), &server.uri());
        let (text, usage) = client.stream(&request()).await.unwrap().collect_text().await.unwrap();
        assert_eq!(text, "Rust rocks");
        assert_eq!(usage.unwrap().output_tokens, 2);
    }
}
