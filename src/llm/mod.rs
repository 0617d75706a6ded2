//! Uniform chat interface over interchangeable LLM providers.
//!
//! Providers form a closed set (`Provider`); dispatch goes through the
//! `Backend` enum so adding one is checked exhaustively at compile time.
//! `ProviderChain` adds a single fallback hop on transient failures.

pub mod anthropic;
pub mod gemini;
pub mod openai;
pub mod stream;
pub mod tokens;
pub mod types;

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use tracing::{debug, warn};

use crate::text::truncate_chars;
use anthropic::AnthropicClient;
use gemini::GeminiClient;
use openai::OpenAiClient;
use stream::ChatStream;
use types::{ChatRequest, Completion};

/// Covers connect + full response for non-streamed calls, and connect + headers
/// for streamed ones.
pub(crate) const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);
/// Maximum silence between two chunks of a streamed body.
pub(crate) const STREAM_IDLE_TIMEOUT: Duration = Duration::from_secs(30);
const ERROR_SNIPPET_CHARS: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Provider {
    OpenAi,
    Groq,
    Anthropic,
    Gemini,
}

impl Provider {
    pub const ALL: [Provider; 4] = [
        Provider::OpenAi,
        Provider::Groq,
        Provider::Anthropic,
        Provider::Gemini,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Provider::OpenAi => "openai",
            Provider::Groq => "groq",
            Provider::Anthropic => "anthropic",
            Provider::Gemini => "gemini",
        }
    }

    pub fn key_var(self) -> &'static str {
        match self {
            Provider::OpenAi => "OPENAI_API_KEY",
            Provider::Groq => "GROQ_API_KEY",
            Provider::Anthropic => "ANTHROPIC_API_KEY",
            Provider::Gemini => "GEMINI_API_KEY",
        }
    }

    pub fn model_var(self) -> &'static str {
        match self {
            Provider::OpenAi => "OPENAI_MODEL",
            Provider::Groq => "GROQ_MODEL",
            Provider::Anthropic => "ANTHROPIC_MODEL",
            Provider::Gemini => "GEMINI_MODEL",
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Provider {
    type Err = LlmError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "openai" => Ok(Provider::OpenAi),
            "groq" => Ok(Provider::Groq),
            "anthropic" | "claude" => Ok(Provider::Anthropic),
            "gemini" | "google" => Ok(Provider::Gemini),
            _ => Err(LlmError::UnknownProvider(s.to_string())),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("unknown LLM provider '{0}' (expected openai, groq, anthropic or gemini)")]
    UnknownProvider(String),

    #[error("{provider} is not configured: set {var}")]
    NotConfigured { provider: Provider, var: &'static str },

    #[error("{0} rate limit exceeded. Please retry later.")]
    RateLimited(Provider),

    #[error("{provider} API error ({code}): {message}")]
    Api {
        provider: Provider,
        code: u16,
        message: String,
    },

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("LLM call timed out: {0}")]
    Timeout(String),

    #[error("malformed {provider} response: {message}")]
    Decode { provider: Provider, message: String },
}

impl LlmError {
    /// Client mistakes (unknown or unconfigured provider, bad request) are
    /// never worth retrying; upstream hiccups are.
    pub fn is_retriable(&self) -> bool {
        match self {
            LlmError::RateLimited(_) | LlmError::Network(_) | LlmError::Timeout(_) => true,
            LlmError::Api { code, .. } => *code >= 500,
            LlmError::UnknownProvider(_)
            | LlmError::NotConfigured { .. }
            | LlmError::Decode { .. } => false,
        }
    }

    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            LlmError::UnknownProvider(_) | LlmError::NotConfigured { .. }
        )
    }
}

#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// Provider used when a request does not pick one; part of cache salts.
    fn default_provider(&self) -> Provider;

    async fn complete(&self, request: &ChatRequest) -> Result<Completion, LlmError>;

    async fn stream(&self, request: &ChatRequest) -> Result<ChatStream, LlmError>;
}

enum Backend {
    OpenAi(OpenAiClient),
    Anthropic(AnthropicClient),
    Gemini(GeminiClient),
}

impl Backend {
    fn from_env(provider: Provider, http: &Client) -> Result<Self, LlmError> {
        match provider {
            Provider::OpenAi | Provider::Groq => {
                OpenAiClient::from_env(provider, http.clone()).map(Backend::OpenAi)
            }
            Provider::Anthropic => AnthropicClient::from_env(http.clone()).map(Backend::Anthropic),
            Provider::Gemini => GeminiClient::from_env(http.clone()).map(Backend::Gemini),
        }
    }

    async fn complete(&self, request: &ChatRequest) -> Result<Completion, LlmError> {
        match self {
            Backend::OpenAi(c) => c.complete(request).await,
            Backend::Anthropic(c) => c.complete(request).await,
            Backend::Gemini(c) => c.complete(request).await,
        }
    }

    async fn stream(&self, request: &ChatRequest) -> Result<ChatStream, LlmError> {
        match self {
            Backend::OpenAi(c) => c.stream(request).await,
            Backend::Anthropic(c) => c.stream(request).await,
            Backend::Gemini(c) => c.stream(request).await,
        }
    }
}

pub struct ProviderChain {
    backends: HashMap<Provider, Backend>,
    primary: Provider,
    fallback: Option<Provider>,
}

impl ProviderChain {
    /// Fails fast when the primary id is unknown or has no key; an unusable
    /// fallback is only logged.
    pub fn from_env(
        http: Client,
        primary: &str,
        fallback: Option<&str>,
    ) -> Result<Self, LlmError> {
        let primary: Provider = primary.parse()?;
        let fallback: Option<Provider> = fallback.map(str::parse).transpose()?;

        let mut backends = HashMap::new();
        for provider in Provider::ALL {
            match Backend::from_env(provider, &http) {
                Ok(backend) => {
                    backends.insert(provider, backend);
                }
                Err(e) => debug!(%provider, error = %e, "provider unavailable"),
            }
        }
        Self::from_backends(backends, primary, fallback)
    }

    fn from_backends(
        backends: HashMap<Provider, Backend>,
        primary: Provider,
        fallback: Option<Provider>,
    ) -> Result<Self, LlmError> {
        if !backends.contains_key(&primary) {
            return Err(LlmError::NotConfigured {
                provider: primary,
                var: primary.key_var(),
            });
        }
        let fallback = fallback.filter(|f| {
            let usable = *f != primary && backends.contains_key(f);
            if !usable {
                warn!(fallback = %f, "fallback provider unusable, running without one");
            }
            usable
        });
        Ok(Self {
            backends,
            primary,
            fallback,
        })
    }

    fn backend(&self, provider: Provider) -> Result<&Backend, LlmError> {
        self.backends
            .get(&provider)
            .ok_or(LlmError::NotConfigured {
                provider,
                var: provider.key_var(),
            })
    }

    fn fallback_for(&self, failed: Provider, error: &LlmError) -> Option<Provider> {
        let next = self.fallback.filter(|f| *f != failed && error.is_retriable())?;
        warn!(from = %failed, to = %next, error = %error, "falling back to secondary provider");
        Some(next)
    }
}

#[async_trait]
impl LanguageModel for ProviderChain {
    fn default_provider(&self) -> Provider {
        self.primary
    }

    async fn complete(&self, request: &ChatRequest) -> Result<Completion, LlmError> {
        let provider = request.provider.unwrap_or(self.primary);
        match self.backend(provider)?.complete(request).await {
            Err(e) => match self.fallback_for(provider, &e) {
                Some(next) => self.backend(next)?.complete(request).await,
                None => Err(e),
            },
            ok => ok,
        }
    }

    async fn stream(&self, request: &ChatRequest) -> Result<ChatStream, LlmError> {
        let provider = request.provider.unwrap_or(self.primary);
        match self.backend(provider)?.stream(request).await {
            Err(e) => match self.fallback_for(provider, &e) {
                Some(next) => self.backend(next)?.stream(request).await,
                None => Err(e),
            },
            ok => ok,
        }
    }
}

/// Maps non-2xx responses to typed errors, pulling a message out of the
/// body when one is there.
pub(crate) async fn ensure_success(
    provider: Provider,
    response: reqwest::Response,
) -> Result<reqwest::Response, LlmError> {
    let status = response.status();
    if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
        warn!(%provider, "LLM API rate limited");
        return Err(LlmError::RateLimited(provider));
    }
    if status.is_success() {
        return Ok(response);
    }
    let text = response.text().await.unwrap_or_default();
    let message = body_error_message(&text)
        .unwrap_or_else(|| {
            format!("HTTP {status}: {}", truncate_chars(&text, ERROR_SNIPPET_CHARS))
        });
    warn!(%provider, status = %status, "LLM API error");
    Err(LlmError::Api {
        provider,
        code: status.as_u16(),
        message,
    })
}

pub(crate) fn body_error_message(body: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(body).ok()?;
    let error = value.get("error").unwrap_or(&value);
    error
        .get("message")
        .and_then(|m| m.as_str())
        .or_else(|| error.as_str())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::types::{Message, StreamFrame};
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn parses_provider_ids_and_aliases() {
        assert_eq!("OpenAI".parse::<Provider>().unwrap(), Provider::OpenAi);
        assert_eq!("claude".parse::<Provider>().unwrap(), Provider::Anthropic);
        assert_eq!(" gemini ".parse::<Provider>().unwrap(), Provider::Gemini);
        for p in Provider::ALL {
            assert_eq!(p.as_str().parse::<Provider>().unwrap(), p);
        }
    }

    #[test]
    fn unknown_provider_is_a_configuration_error() {
        let err = "mistral".parse::<Provider>().unwrap_err();
        assert!(err.is_configuration());
        assert!(!err.is_retriable());
    }

    #[test]
    fn retriable_classification() {
        assert!(LlmError::RateLimited(Provider::OpenAi).is_retriable());
        assert!(LlmError::Timeout("x".into()).is_retriable());
        let server = LlmError::Api {
            provider: Provider::Gemini,
            code: 503,
            message: "overloaded".into(),
        };
        assert!(server.is_retriable());
        let client = LlmError::Api {
            provider: Provider::Gemini,
            code: 400,
            message: "bad".into(),
        };
        assert!(!client.is_retriable());
        assert!(
            !LlmError::NotConfigured {
                provider: Provider::Groq,
                var: "GROQ_API_KEY"
            }
            .is_retriable()
        );
    }

    #[test]
    fn extracts_error_messages_from_common_shapes() {
        assert_eq!(
            body_error_message(r#"{"error":{"message":"bad key"}}"#).as_deref(),
            Some("bad key")
        );
        assert_eq!(
            body_error_message(r#"{"error":"plain"}"#).as_deref(),
            Some("plain")
        );
        assert_eq!(
            body_error_message(r#"{"message":"top"}"#).as_deref(),
            Some("top")
        );
        assert_eq!(body_error_message("<html>"), None);
    }

    fn openai_backend(provider: Provider, uri: &str) -> Backend {
        Backend::OpenAi(OpenAiClient::with_base_url(provider, Client::new(), uri))
    }

    #[test]
    fn missing_primary_fails_fast() {
        let err = ProviderChain::from_backends(HashMap::new(), Provider::Anthropic, None)
            .err()
            .unwrap();
        assert!(matches!(
            err,
            LlmError::NotConfigured {
                provider: Provider::Anthropic,
                var: "ANTHROPIC_API_KEY"
            }
        ));
    }

    #[test]
    fn unusable_fallback_is_dropped() {
        let backends = HashMap::from([(
            Provider::OpenAi,
            openai_backend(Provider::OpenAi, "http://localhost:0"),
        )]);
        let chain =
            ProviderChain::from_backends(backends, Provider::OpenAi, Some(Provider::Gemini))
                .unwrap();
        assert!(chain.fallback.is_none());
    }

    #[tokio::test]
    async fn falls_back_once_on_server_error() {
        let primary = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(503).set_body_string("overloaded"))
            .expect(1)
            .mount(&primary)
            .await;
        let secondary = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "choices": [{"message": {"role": "assistant", "content": "from groq"}}]
            })))
            .expect(1)
            .mount(&secondary)
            .await;

        let backends = HashMap::from([
            (Provider::OpenAi, openai_backend(Provider::OpenAi, &primary.uri())),
            (Provider::Groq, openai_backend(Provider::Groq, &secondary.uri())),
        ]);
        let chain =
            ProviderChain::from_backends(backends, Provider::OpenAi, Some(Provider::Groq))
                .unwrap();

        let req = ChatRequest::new(vec![Message::user("hi")], 0.2);
        let out = chain.complete(&req).await.unwrap();
        assert_eq!(out.content, "from groq");
        assert_eq!(out.provider, Provider::Groq);
    }

    #[tokio::test]
    async fn client_errors_do_not_fall_back() {
        let primary = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(400).set_body_json(serde_json::json!({
                "error": {"message": "bad request"}
            })))
            .mount(&primary)
            .await;
        let secondary = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&secondary)
            .await;

        let backends = HashMap::from([
            (Provider::OpenAi, openai_backend(Provider::OpenAi, &primary.uri())),
            (Provider::Groq, openai_backend(Provider::Groq, &secondary.uri())),
        ]);
        let chain =
            ProviderChain::from_backends(backends, Provider::OpenAi, Some(Provider::Groq))
                .unwrap();

        let req = ChatRequest::new(vec![Message::user("hi")], 0.2);
        match chain.complete(&req).await {
            Err(LlmError::Api { code: 400, message, .. }) => assert_eq!(message, "bad request"),
            other => panic!("expected Api(400), got: {other:?}"),
        }
    }

    #[tokio::test]
    async fn request_can_pick_unconfigured_provider_and_fail_fast() {
        let backends = HashMap::from([(
            Provider::OpenAi,
            openai_backend(Provider::OpenAi, "http://localhost:0"),
        )]);
        let chain = ProviderChain::from_backends(backends, Provider::OpenAi, None).unwrap();
        let mut req = ChatRequest::new(vec![Message::user("hi")], 0.2);
        req.provider = Some(Provider::Gemini);

        let err = chain.stream(&req).await.err().unwrap();
        assert!(err.is_configuration());
    }

    #[tokio::test]
    async fn stream_goes_through_primary() {
        let server = MockServer::start().await;
        let body = "data: {\"choices\":[{\"delta\":{\"content\":\"Hel\"}}]}\n\n\
                    data: {\"choices\":[{\"delta\":{\"content\":\"lo\"}}]}\n\n\
                    data: [DONE]\n\n";
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
            .mount(&server)
            .await;
        let backends = HashMap::from([(
            Provider::OpenAi,
            openai_backend(Provider::OpenAi, &server.uri()),
        )]);
        let chain = ProviderChain::from_backends(backends, Provider::OpenAi, None).unwrap();

        let mut stream = chain
            .stream(&ChatRequest::new(vec![Message::user("hi")], 0.5))
            .await
            .unwrap();
        let mut text = String::new();
        while let Some(frame) = stream.next_frame().await {
            if let StreamFrame::Content(c) = frame.unwrap() {
                text.push_str(&c);
            }
        }
        assert_eq!(text, "Hello");
    }
}
