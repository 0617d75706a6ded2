//! Final cited answer, streamed.

use std::time::Duration;

use tracing::{debug, warn};

use super::extractor::{ExtractedKnowledge, SourceIndex};
use super::searcher::AspectSearchResult;
use crate::cache::{CacheKey, CacheService, CacheType, hash_numbered_urls};
use crate::credits::Mode;
use crate::llm::stream::ChatStream;
use crate::llm::types::{ChatRequest, Message};
use crate::llm::{LanguageModel, LlmError, Provider};
use crate::text::{single_line, truncate_chars};

pub(crate) const SYNTHESIZER_ROLE: &str = "You write well-sourced answers from research material.";
const TEMPERATURE: f32 = 0.5;
const MAX_TOKENS: u32 = 4000;
const SOURCE_CHARS: usize = 1200;

/// Changes whenever the mode, provider or source numbering changes, even for
/// an identical query. A replayed answer's `[n]` citations are only valid
/// under the numbering it was written against.
pub fn cache_key(query: &str, mode: Mode, provider: Provider, index: &SourceIndex) -> CacheKey {
    CacheKey::new(CacheType::Synthesis, query)
        .salt(mode)
        .provider(provider.as_str())
        .salt(hash_numbered_urls(index.iter()))
}

fn instructions(mode: Mode) -> &'static str {
    match mode {
        Mode::Web => {
            "Answer the question directly and concisely in a few paragraphs."
        }
        Mode::Research => {
            "Write a thorough, well-structured report with markdown headings. Open with a \
             short summary, cover each aspect, point out disagreements between sources, \
             and close with key takeaways."
        }
        Mode::Brainstorm => {
            "Use the material from other domains as inspiration. Propose concrete, \
             unconventional ideas for the user's challenge, each explaining which domain \
             inspired it and how the analogy transfers."
        }
    }
}

fn knowledge_section(knowledge: &[ExtractedKnowledge]) -> String {
    let mut out = String::new();
    for k in knowledge.iter().filter(|k| !k.is_placeholder()) {
        out.push_str(&format!("### {}\n", single_line(&k.aspect)));
        if !k.key_insight.is_empty() {
            out.push_str(&format!("Key insight: {}\n", single_line(&k.key_insight)));
        }
        let cite = |sources: &[u32]| {
            sources
                .iter()
                .map(|n| format!("[{n}]"))
                .collect::<String>()
        };
        for c in &k.claims {
            out.push_str(&format!("- Claim: {} {}\n", single_line(&c.statement), cite(&c.sources)));
        }
        for s in &k.statistics {
            out.push_str(&format!(
                "- Statistic: {} ({}) {}\n",
                single_line(&s.value),
                single_line(&s.context),
                cite(&s.sources)
            ));
        }
        for d in &k.definitions {
            out.push_str(&format!(
                "- Definition: {}: {} {}\n",
                single_line(&d.term),
                single_line(&d.definition),
                cite(&d.sources)
            ));
        }
        for o in &k.expert_opinions {
            out.push_str(&format!(
                "- Expert opinion ({}): {} {}\n",
                single_line(&o.expert),
                single_line(&o.opinion),
                cite(&o.sources)
            ));
        }
        for c in &k.contradictions {
            out.push_str(&format!(
                "- Contradiction: {} {}\n",
                single_line(&c.description),
                cite(&c.sources)
            ));
        }
        out.push('\n');
    }
    out
}

pub fn messages(
    query: &str,
    mode: Mode,
    aspects: &[AspectSearchResult],
    knowledge: &[ExtractedKnowledge],
    index: &SourceIndex,
) -> Vec<Message> {
    let system = format!(
        "{SYNTHESIZER_ROLE}\n{}\n\
         Cite sources inline with their bracketed numbers, e.g. [1] or [2][5]. Only use \
         the numbers listed below and never invent sources. If the material does not \
         answer part of the question, say so.",
        instructions(mode)
    );

    let mut user = format!("Question: {}\n\n", single_line(query));
    let notes = knowledge_section(knowledge);
    if !notes.is_empty() {
        user.push_str("## Extracted notes\n\n");
        user.push_str(&notes);
    }

    user.push_str("## Sources\n");
    let mut listed = std::collections::HashSet::new();
    for aspect in aspects {
        for hit in &aspect.results {
            let Some(id) = index.get(&hit.url) else {
                continue;
            };
            if !listed.insert(id) {
                continue;
            }
            user.push_str(&format!(
                "\n[{id}] {} ({})\n{}\n",
                single_line(&hit.title),
                hit.url,
                truncate_chars(&hit.content, SOURCE_CHARS)
            ));
        }
    }
    if listed.is_empty() {
        user.push_str("\n(no sources found)\n");
    }
    vec![Message::system(system), Message::user(user)]
}

/// Either a live stream or a replay of a cached answer; both look the same
/// to the consumer.
pub async fn open(
    llm: &dyn LanguageModel,
    cache: &CacheService,
    key: &CacheKey,
    request: &ChatRequest,
    connect_timeout: Duration,
) -> Result<ChatStream, LlmError> {
    match cache.get::<String>(key).await.data {
        Some(text) if !text.trim().is_empty() => {
            debug!(%key, "replaying cached synthesis");
            return Ok(ChatStream::replay(&text));
        }
        Some(_) => {
            warn!(%key, "cached synthesis is blank, evicting");
            cache.delete(key).await;
        }
        None => {}
    }
    tokio::time::timeout(connect_timeout, llm.stream(request))
        .await
        .map_err(|_| {
            LlmError::Timeout(format!(
                "synthesis did not start within {}s",
                connect_timeout.as_secs()
            ))
        })?
}

pub fn request(messages: Vec<Message>, provider: Provider) -> ChatRequest {
    let mut request = ChatRequest::new(messages, TEMPERATURE).max_tokens(MAX_TOKENS);
    request.provider = Some(provider);
    request
}
