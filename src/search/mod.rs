//! Web search provider boundary and the Tavily-style HTTP client behind it.

pub mod source;
pub mod types;

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use tracing::{debug, warn};

use crate::config::ApiKey;
use crate::llm::body_error_message;
use crate::text::truncate_chars;
use types::{SearchRequest, SearchResponse, wire};

const API_BASE: &str = "https://api.tavily.com";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(20);
const MAX_RETRIES: u32 = 3;
const INITIAL_BACKOFF_MS: u64 = 1000;

#[derive(Debug, thiserror::Error)]
pub enum SearchError {
    #[error("TAVILY_API_KEY not set. Get one at https://app.tavily.com")]
    ApiKeyNotSet,

    #[error("Search API rate limit exceeded. Please retry later.")]
    RateLimited,

    #[error("Search API quota exhausted: {0}")]
    QuotaExhausted(String),

    #[error("Search API error ({code}): {message}")]
    Api { code: u16, message: String },

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("search timed out after {0}s")]
    Timeout(u64),
}

impl SearchError {
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            SearchError::RateLimited
                | SearchError::Timeout(_)
                | SearchError::Api {
                    code: 500..=599,
                    ..
                }
        )
    }
}

#[async_trait]
pub trait SearchProvider: Send + Sync {
    async fn search(&self, request: &SearchRequest) -> Result<SearchResponse, SearchError>;
}

#[derive(Clone)]
pub struct TavilyClient {
    http: Client,
    api_key: ApiKey,
    base_url: String,
    initial_backoff_ms: u64,
}

impl TavilyClient {
    pub fn from_env(http: Client) -> Result<Self, SearchError> {
        let api_key = ApiKey::from_env("TAVILY_API_KEY").ok_or(SearchError::ApiKeyNotSet)?;
        Ok(Self {
            http,
            api_key,
            base_url: API_BASE.to_string(),
            initial_backoff_ms: INITIAL_BACKOFF_MS,
        })
    }

    #[cfg(test)]
    pub(crate) fn with_base_url(http: Client, base_url: &str) -> Self {
        Self {
            http,
            api_key: ApiKey::new("test-key"),
            base_url: base_url.to_string(),
            initial_backoff_ms: 1,
        }
    }

    async fn search_once(&self, request: &SearchRequest) -> Result<SearchResponse, SearchError> {
        let body = wire::Request {
            query: &request.query,
            search_depth: request.depth.as_str(),
            include_images: request.include_images,
            include_image_descriptions: request.include_images,
            max_results: request.max_results,
        };

        let response = self
            .http
            .post(format!("{}/search", self.base_url))
            .bearer_auth(self.api_key.expose())
            .header("User-Agent", crate::USER_AGENT)
            .json(&body)
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    SearchError::Timeout(REQUEST_TIMEOUT.as_secs())
                } else {
                    SearchError::Network(e)
                }
            })?;

        let status = response.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            warn!("search API rate limited");
            return Err(SearchError::RateLimited);
        }
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let err = classify_status(status.as_u16(), &text);
            warn!(status = %status, error = %err, "search API error");
            return Err(err);
        }

        let body: wire::Response = response.json().await?;
        let out = SearchResponse::from(body);
        debug!(query = %request.query, hits = out.results.len(), "search complete");
        Ok(out)
    }

    /// Equal jitter backoff: base/2 + rand(0, base/2).
    fn jittered_backoff(&self, attempt: u32) -> u64 {
        let base = self.initial_backoff_ms * 2u64.pow(attempt);
        let half = base / 2;
        half + fastrand::u64(..half.max(1))
    }
}

#[async_trait]
impl SearchProvider for TavilyClient {
    async fn search(&self, request: &SearchRequest) -> Result<SearchResponse, SearchError> {
        let mut last_err = None;
        for attempt in 0..MAX_RETRIES {
            match self.search_once(request).await {
                Ok(response) => return Ok(response),
                Err(e) if e.is_retriable() => {
                    last_err = Some(e);
                    if attempt + 1 < MAX_RETRIES {
                        let delay_ms = self.jittered_backoff(attempt);
                        debug!(
                            attempt = attempt + 1,
                            delay_ms, "retrying search after transient error"
                        );
                        tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                    }
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_err.unwrap_or(SearchError::RateLimited))
    }
}

fn classify_status(code: u16, body: &str) -> SearchError {
    let message = body_error_message(body)
        .or_else(|| {
            serde_json::from_str::<serde_json::Value>(body)
                .ok()?
                .get("detail")?
                .get("error")?
                .as_str()
                .map(str::to_string)
        })
        .unwrap_or_else(|| format!("HTTP {code}: {}", truncate_chars(body, 200)));

    match code {
        429 => SearchError::RateLimited,
        // 432/433: plan or pay-as-you-go limit reached.
        403 | 432 | 433 => SearchError::QuotaExhausted(message),
        _ => SearchError::Api { code, message },
    }
}


#[cfg(test)]
mod http_tests {
    use super::*;
    use crate::search::types::SearchDepth;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn request() -> SearchRequest {
        SearchRequest {
            query: "rust async runtimes".into(),
            include_images: false,
            depth: SearchDepth::Advanced,
            max_results: 5,
        }
    }

    #[tokio::test]
    async fn search_success_returns_hits() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/search"))
            .and(header("authorization", "Bearer test-key"))
            .and(body_partial_json(serde_json::json!({
                "query": "rust async runtimes",
                "search_depth": "advanced",
                "max_results": 5
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "results": [{
                    "title": "Tokio",
                    "url": "https://tokio.rs",
                    "content": "An asynchronous runtime for Rust"
                }]
            })))
            .mount(&server)
            .await;

        let client = TavilyClient::with_base_url(Client::new(), &server.uri());
        let out = client.search(&request()).await.unwrap();
        assert_eq!(out.results.len(), 1);
        assert_eq!(out.results[0].url, "https://tokio.rs");
    }

    #[tokio::test]
    async fn search_retries_server_errors_then_succeeds() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({"results": []})),
            )
            .mount(&server)
            .await;

        let client = TavilyClient::with_base_url(Client::new(), &server.uri());
        let out = client.search(&request()).await.unwrap();
        assert!(out.results.is_empty());
    }

    #[tokio::test]
    async fn search_429_exhausts_retries() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429))
            .expect(3)
            .mount(&server)
            .await;

        let client = TavilyClient::with_base_url(Client::new(), &server.uri());
        let result = client.search(&request()).await;
        assert!(matches!(result, Err(SearchError::RateLimited)));
    }

    #[tokio::test]
    async fn search_401_is_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(401).set_body_json(serde_json::json!({
                "detail": {"error": "Unauthorized: missing or invalid API key."}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let client = TavilyClient::with_base_url(Client::new(), &server.uri());
        match client.search(&request()).await {
            Err(SearchError::Api { code: 401, message }) => {
                assert!(message.contains("invalid API key"))
            }
            other => panic!("expected Api(401), got: {other:?}"),
        }
    }
}
