//! Scripted stand-ins for the model and search boundaries.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::llm::stream::ChatStream;
use crate::llm::types::{ChatRequest, Completion, StreamFrame, Usage};
use crate::llm::{LanguageModel, LlmError, Provider};
use crate::search::types::{SearchHit, SearchRequest, SearchResponse};
use crate::search::{SearchError, SearchProvider};

enum Reply {
    Text(String),
    Fail(fn() -> LlmError),
}

/// Answers with the first scripted reply whose needle appears anywhere in
/// the request's messages. Unmatched requests fail with a non-retriable error.
pub(crate) struct ScriptedModel {
    replies: Vec<(String, Reply)>,
    usage: Option<Usage>,
    requests: Mutex<Vec<ChatRequest>>,
}

impl ScriptedModel {
    pub(crate) fn new() -> Self {
        Self {
            replies: Vec::new(),
            usage: None,
            requests: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn reply(mut self, needle: &str, text: &str) -> Self {
        self.replies.push((needle.to_string(), Reply::Text(text.to_string())));
        self
    }

    pub(crate) fn fail(mut self, needle: &str, error: fn() -> LlmError) -> Self {
        self.replies.push((needle.to_string(), Reply::Fail(error)));
        self
    }

    pub(crate) fn with_usage(mut self, usage: Usage) -> Self {
        self.usage = Some(usage);
        self
    }

    /// Number of requests whose messages contain `needle`.
    pub(crate) fn calls(&self, needle: &str) -> usize {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.messages.iter().any(|m| m.content.contains(needle)))
            .count()
    }

    pub(crate) fn requests(&self) -> Vec<ChatRequest> {
        self.requests.lock().unwrap().clone()
    }

    fn answer(&self, request: &ChatRequest) -> Result<String, LlmError> {
        self.requests.lock().unwrap().push(request.clone());
        let reply = self.replies.iter().find(|(needle, _)| {
            request
                .messages
                .iter()
                .any(|m| m.content.contains(needle.as_str()))
        });
        match reply {
            Some((_, Reply::Text(text))) => Ok(text.clone()),
            Some((_, Reply::Fail(error))) => Err(error()),
            None => Err(LlmError::Api {
                provider: Provider::OpenAi,
                code: 400,
                message: "no scripted reply".into(),
            }),
        }
    }
}

#[async_trait]
impl LanguageModel for ScriptedModel {
    fn default_provider(&self) -> Provider {
        Provider::OpenAi
    }

    async fn complete(&self, request: &ChatRequest) -> Result<Completion, LlmError> {
        Ok(Completion {
            content: self.answer(request)?,
            usage: self.usage,
            provider: Provider::OpenAi,
        })
    }

    async fn stream(&self, request: &ChatRequest) -> Result<ChatStream, LlmError> {
        let text = self.answer(request)?;
        let mut frames: Vec<StreamFrame> = text
            .split_inclusive(' ')
            .map(|w| StreamFrame::Content(w.to_string()))
            .collect();
        if let Some(usage) = self.usage {
            frames.push(StreamFrame::Usage(usage));
        }
        Ok(ChatStream::from_frames(frames))
    }
}

/// Search double keyed by exact query text; unknown queries return no hits.
#[derive(Default)]
pub(crate) struct ScriptedSearch {
    responses: HashMap<String, SearchResponse>,
    failing: Vec<String>,
    requests: Mutex<Vec<SearchRequest>>,
}

impl ScriptedSearch {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn hits(mut self, query: &str, urls: &[&str]) -> Self {
        let results = urls
            .iter()
            .map(|url| SearchHit {
                title: format!("Page {url}"),
                url: url.to_string(),
                content: format!("Content of {url}"),
                author: None,
                published_date: None,
            })
            .collect();
        self.responses.insert(
            query.to_string(),
            SearchResponse {
                results,
                images: Vec::new(),
            },
        );
        self
    }

    pub(crate) fn fail(mut self, query: &str) -> Self {
        self.failing.push(query.to_string());
        self
    }

    pub(crate) fn calls(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub(crate) fn queries(&self) -> Vec<String> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .map(|r| r.query.clone())
            .collect()
    }
}

#[async_trait]
impl SearchProvider for ScriptedSearch {
    async fn search(&self, request: &SearchRequest) -> Result<SearchResponse, SearchError> {
        self.requests.lock().unwrap().push(request.clone());
        if self.failing.contains(&request.query) {
            return Err(SearchError::Api {
                code: 502,
                message: "bad gateway".into(),
            });
        }
        Ok(self
            .responses
            .get(&request.query)
            .cloned()
            .unwrap_or_default())
    }
}
