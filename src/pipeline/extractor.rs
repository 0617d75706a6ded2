//! Per-aspect knowledge extraction over a run-wide citation index.
//!
//! Citation numbers are assigned before any extraction call is made, in plan
//! order, so concurrent calls only ever read the index.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::complete_within;
use super::json::{self, Parsed};
use super::searcher::AspectSearchResult;
use crate::cache::{CacheKey, CacheService, CacheType, hash_urls};
use crate::llm::types::{ChatRequest, Message};
use crate::llm::{LanguageModel, Provider};
use crate::text::{single_line, truncate_chars};

pub(crate) const EXTRACTOR_ROLE: &str = "You extract verifiable knowledge from search results.";
pub const EXTRACTION_FAILED: &str = "Extraction failed - using raw data";
const TEMPERATURE: f32 = 0.1;
const MAX_TOKENS: u32 = 2000;
const SOURCE_CHARS: usize = 1500;

/// Run-scoped URL to citation number map. Numbers start at 1 and a URL
/// keeps its number for the rest of the run.
#[derive(Debug, Default, Clone)]
pub struct SourceIndex {
    by_url: HashMap<String, u32>,
    urls: Vec<String>,
}

impl SourceIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Existing number for `url`, or the next free one.
    pub fn assign(&mut self, url: &str) -> u32 {
        if let Some(&id) = self.by_url.get(url) {
            return id;
        }
        self.urls.push(url.to_string());
        let id = self.urls.len() as u32;
        self.by_url.insert(url.to_string(), id);
        id
    }

    pub fn assign_all(&mut self, aspects: &[AspectSearchResult]) {
        for hit in aspects.iter().flat_map(|a| &a.results) {
            self.assign(&hit.url);
        }
    }

    pub fn get(&self, url: &str) -> Option<u32> {
        self.by_url.get(url).copied()
    }

    pub fn url(&self, id: u32) -> Option<&str> {
        let slot = usize::try_from(id).ok()?.checked_sub(1)?;
        self.urls.get(slot).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.urls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.urls.is_empty()
    }

    /// `(number, url)` in assignment order.
    pub fn iter(&self) -> impl Iterator<Item = (u32, &str)> {
        self.urls
            .iter()
            .enumerate()
            .map(|(i, url)| (i as u32 + 1, url.as_str()))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Claim {
    pub statement: String,
    #[serde(default)]
    pub sources: Vec<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Statistic {
    pub value: String,
    #[serde(default)]
    pub context: String,
    #[serde(default)]
    pub sources: Vec<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Definition {
    pub term: String,
    pub definition: String,
    #[serde(default)]
    pub sources: Vec<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExpertOpinion {
    #[serde(default)]
    pub expert: String,
    pub opinion: String,
    #[serde(default)]
    pub sources: Vec<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Contradiction {
    pub description: String,
    #[serde(default)]
    pub sources: Vec<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractedKnowledge {
    #[serde(default)]
    pub aspect: String,
    #[serde(default)]
    pub claims: Vec<Claim>,
    #[serde(default)]
    pub statistics: Vec<Statistic>,
    #[serde(default)]
    pub definitions: Vec<Definition>,
    #[serde(default)]
    pub expert_opinions: Vec<ExpertOpinion>,
    #[serde(default)]
    pub contradictions: Vec<Contradiction>,
    #[serde(default)]
    pub key_insight: String,
}

impl ExtractedKnowledge {
    pub fn placeholder(aspect: &str) -> Self {
        Self {
            aspect: aspect.to_string(),
            key_insight: EXTRACTION_FAILED.to_string(),
            ..Self::default()
        }
    }

    pub fn is_placeholder(&self) -> bool {
        self.key_insight == EXTRACTION_FAILED && self.claims.is_empty()
    }

    /// Rewrites every citation list; numbers mapped to `None` are dropped.
    fn remap_sources(&mut self, mut map: impl FnMut(u32) -> Option<u32>) {
        let mut fix = |sources: &mut Vec<u32>| {
            let mapped: Vec<u32> = sources.iter().filter_map(|&n| map(n)).collect();
            *sources = mapped;
        };
        self.claims.iter_mut().for_each(|c| fix(&mut c.sources));
        self.statistics.iter_mut().for_each(|s| fix(&mut s.sources));
        self.definitions.iter_mut().for_each(|d| fix(&mut d.sources));
        self.expert_opinions.iter_mut().for_each(|o| fix(&mut o.sources));
        self.contradictions.iter_mut().for_each(|c| fix(&mut c.sources));
    }

    fn cited(&self) -> impl Iterator<Item = u32> + '_ {
        self.claims
            .iter()
            .flat_map(|c| &c.sources)
            .chain(self.statistics.iter().flat_map(|s| &s.sources))
            .chain(self.definitions.iter().flat_map(|d| &d.sources))
            .chain(self.expert_opinions.iter().flat_map(|o| &o.sources))
            .chain(self.contradictions.iter().flat_map(|c| &c.sources))
            .copied()
    }
}

/// Cached extraction together with the URL behind each citation number it
/// was produced with.
#[derive(Debug, Serialize, Deserialize)]
struct CachedExtraction {
    knowledge: ExtractedKnowledge,
    sources: BTreeMap<u32, String>,
}

/// The prompt carries the question and aspect name, so both belong in the key.
fn cache_key(query: &str, aspect: &AspectSearchResult, provider: Provider) -> CacheKey {
    CacheKey::new(CacheType::Extraction, query)
        .salt(&aspect.aspect)
        .salt(&aspect.query)
        .salt(hash_urls(aspect.results.iter().map(|h| h.url.as_str())))
        .provider(provider.as_str())
}

fn messages(query: &str, aspect: &AspectSearchResult, index: &SourceIndex) -> Vec<Message> {
    let system = format!(
        "{EXTRACTOR_ROLE}\n\
         Use only the numbered sources. Cite them by number in every `sources` list.\n\
         Respond with JSON only:\n\
         {{\"claims\": [{{\"statement\": \"...\", \"sources\": [1], \"confidence\": \"high|medium|low\"}}],\n\
         \"statistics\": [{{\"value\": \"...\", \"context\": \"...\", \"sources\": [1]}}],\n\
         \"definitions\": [{{\"term\": \"...\", \"definition\": \"...\", \"sources\": [1]}}],\n\
         \"expertOpinions\": [{{\"expert\": \"...\", \"opinion\": \"...\", \"sources\": [1]}}],\n\
         \"contradictions\": [{{\"description\": \"...\", \"sources\": [1, 2]}}],\n\
         \"keyInsight\": \"one sentence\"}}"
    );

    let mut user = format!(
        "Research question: {}\nAspect: {}\n\nSources:\n",
        single_line(query),
        single_line(&aspect.aspect)
    );
    for hit in &aspect.results {
        let Some(id) = index.get(&hit.url) else {
            continue;
        };
        user.push_str(&format!(
            "\n[{id}] {}\nURL: {}\n{}\n",
            single_line(&hit.title),
            hit.url,
            truncate_chars(&hit.content, SOURCE_CHARS)
        ));
    }
    vec![Message::system(system), Message::user(user)]
}

/// Citations outside the aspect's own sources are dropped.
pub fn parse_knowledge(raw: &str, aspect: &str, allowed: &[u32]) -> Parsed<ExtractedKnowledge> {
    json::parse::<ExtractedKnowledge>(raw).map(|mut knowledge| {
        knowledge.aspect = aspect.to_string();
        knowledge.remap_sources(|n| allowed.contains(&n).then_some(n));
        knowledge
    })
}

/// Assigns citation numbers for every hit, then extracts all aspects
/// concurrently. Output is in aspect order; a failed aspect yields the
/// placeholder.
pub async fn extract_all(
    llm: &dyn LanguageModel,
    cache: &CacheService,
    provider: Provider,
    query: &str,
    aspects: &[AspectSearchResult],
    index: &mut SourceIndex,
    timeout: Duration,
) -> Vec<ExtractedKnowledge> {
    index.assign_all(aspects);
    let index: &SourceIndex = index;
    join_all(
        aspects
            .iter()
            .map(|aspect| extract_one(llm, cache, provider, query, aspect, index, timeout)),
    )
    .await
}

async fn extract_one(
    llm: &dyn LanguageModel,
    cache: &CacheService,
    provider: Provider,
    query: &str,
    aspect: &AspectSearchResult,
    index: &SourceIndex,
    timeout: Duration,
) -> ExtractedKnowledge {
    if aspect.results.is_empty() {
        debug!(aspect = %aspect.aspect, "no sources to extract from");
        return ExtractedKnowledge {
            aspect: aspect.aspect.clone(),
            ..ExtractedKnowledge::default()
        };
    }

    let key = cache_key(query, aspect, provider);
    if let Some(cached) = cache.get::<CachedExtraction>(&key).await.data {
        let mut knowledge = cached.knowledge;
        knowledge.aspect = aspect.aspect.clone();
        knowledge.remap_sources(|n| cached.sources.get(&n).and_then(|url| index.get(url)));
        return knowledge;
    }

    let allowed: Vec<u32> = aspect
        .results
        .iter()
        .filter_map(|h| index.get(&h.url))
        .collect();
    let mut request = ChatRequest::new(messages(query, aspect, index), TEMPERATURE)
        .max_tokens(MAX_TOKENS);
    request.provider = Some(provider);

    let raw = match complete_within(llm, &request, timeout).await {
        Ok(completion) => completion.content,
        Err(e) => {
            warn!(aspect = %aspect.aspect, error = %e, "extraction call failed, using raw data");
            return ExtractedKnowledge::placeholder(&aspect.aspect);
        }
    };

    match parse_knowledge(&raw, &aspect.aspect, &allowed) {
        Parsed::Parsed(knowledge) => {
            let sources = knowledge
                .cited()
                .filter_map(|n| index.url(n).map(|url| (n, url.to_string())))
                .collect();
            let entry = CachedExtraction { knowledge, sources };
            cache.set(&key, query, &entry).await;
            debug!(
                aspect = %aspect.aspect,
                claims = entry.knowledge.claims.len(),
                "aspect extracted"
            );
            entry.knowledge
        }
        Parsed::Fallback(reason) => {
            warn!(aspect = %aspect.aspect, reason, "extraction output unusable, using raw data");
            ExtractedKnowledge::placeholder(&aspect.aspect)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheConfig;
    use crate::pipeline::testing::ScriptedModel;
    use crate::search::types::SearchHit;

    fn aspect(name: &str, query: &str, urls: &[&str]) -> AspectSearchResult {
        AspectSearchResult {
            aspect: name.into(),
            query: query.into(),
            results: urls
                .iter()
                .map(|u| SearchHit {
                    title: format!("T {u}"),
                    url: u.to_string(),
                    content: "body".into(),
                    author: None,
                    published_date: None,
                })
                .collect(),
            images: Vec::new(),
        }
    }

    fn cache() -> CacheService {
        CacheService::new(CacheConfig::default(), None)
    }

    async fn run(
        llm: &ScriptedModel,
        cache: &CacheService,
        query: &str,
        aspects: &[AspectSearchResult],
        index: &mut SourceIndex,
    ) -> Vec<ExtractedKnowledge> {
        let timeout = Duration::from_secs(5);
        extract_all(llm, cache, Provider::OpenAi, query, aspects, index, timeout).await
    }

    #[test]
    fn index_is_stable_and_starts_at_one() {
        let mut index = SourceIndex::new();
        assert_eq!(index.assign("https://x.com/a"), 1);
        assert_eq!(index.assign("https://y.com"), 2);
        assert_eq!(index.assign("https://x.com/a"), 1);
        assert_eq!(index.len(), 2);
        assert_eq!(index.url(2), Some("https://y.com"));
        assert_eq!(index.url(0), None);
        assert_eq!(index.url(3), None);
    }

    #[test]
    fn shared_url_across_aspects_reuses_number() {
        let mut index = SourceIndex::new();
        index.assign_all(&[
            aspect("a", "qa", &["https://first.com", "https://x.com/a"]),
            aspect("b", "qb", &["https://x.com/a", "https://second.com"]),
        ]);
        assert_eq!(index.get("https://x.com/a"), Some(2));
        assert_eq!(index.get("https://second.com"), Some(3));
        let numbers: Vec<u32> = index.iter().map(|(n, _)| n).collect();
        assert_eq!(numbers, vec![1, 2, 3]);
    }

    #[test]
    fn parse_drops_foreign_citations() {
        let raw = r#"{"claims": [{"statement": "s", "sources": [1, 9]}], "keyInsight": "k"}"#;
        let Parsed::Parsed(k) = parse_knowledge(raw, "price", &[1, 2]) else {
            panic!("expected parsed knowledge");
        };
        assert_eq!(k.aspect, "price");
        assert_eq!(k.claims[0].sources, vec![1]);
        assert_eq!(k.key_insight, "k");
    }

    #[tokio::test]
    async fn invalid_json_yields_placeholder() {
        let llm = ScriptedModel::new().reply(EXTRACTOR_ROLE, "not valid json");
        let mut index = SourceIndex::new();
        let out = extract_all(
            &llm,
            &cache(),
            Provider::OpenAi,
            "q",
            &[aspect("a", "qa", &["https://a.com"])],
            &mut index,
            Duration::from_secs(5),
        )
        .await;
        assert_eq!(out, vec![ExtractedKnowledge::placeholder("a")]);
        assert!(out[0].claims.is_empty());
        assert_eq!(out[0].key_insight, EXTRACTION_FAILED);
    }

    #[tokio::test]
    async fn prompt_numbers_match_shared_index() {
        let llm = ScriptedModel::new()
            .reply("Aspect: alpha", r#"{"claims": [], "keyInsight": "a"}"#)
            .reply("Aspect: beta", r#"{"claims": [], "keyInsight": "b"}"#);
        let mut index = SourceIndex::new();
        let aspects = [
            aspect("alpha", "qa", &["https://x.com/a", "https://a.com"]),
            aspect("beta", "qb", &["https://b.com", "https://x.com/a"]),
        ];
        let out = run(&llm, &cache(), "q", &aspects, &mut index).await;

        assert_eq!(out[1].key_insight, "b");
        let beta = llm
            .requests()
            .into_iter()
            .find(|r| r.messages[1].content.contains("Aspect: beta"))
            .unwrap();
        assert!(beta.messages[1].content.contains("[1] T https://x.com/a"));
        assert!(beta.messages[1].content.contains("[3] T https://b.com"));
    }

    #[tokio::test]
    async fn cached_extraction_is_remapped_to_current_run() {
        let cache = cache();
        let llm = ScriptedModel::new().reply(
            EXTRACTOR_ROLE,
            r#"{"claims": [{"statement": "s", "sources": [2]}], "keyInsight": "k"}"#,
        );
        let target = aspect("a", "qa", &["https://one.com", "https://two.com"]);

        let mut first = SourceIndex::new();
        let out = run(&llm, &cache, "q", std::slice::from_ref(&target), &mut first).await;
        assert_eq!(out[0].claims[0].sources, vec![2]);

        // Another run where earlier aspects already took numbers 1..=3.
        let mut second = SourceIndex::new();
        for url in ["https://p.com", "https://q.com", "https://r.com"] {
            second.assign(url);
        }
        let out = run(&llm, &cache, "q", &[target], &mut second).await;
        assert_eq!(llm.calls(EXTRACTOR_ROLE), 1);
        assert_eq!(second.get("https://two.com"), Some(5));
        assert_eq!(out[0].claims[0].sources, vec![5]);
    }

    #[tokio::test]
    async fn aspect_without_results_skips_the_model() {
        let llm = ScriptedModel::new();
        let mut index = SourceIndex::new();
        let empty = [aspect("empty", "qe", &[])];
        let out = run(&llm, &cache(), "q", &empty, &mut index).await;
        assert_eq!(out[0].aspect, "empty");
        assert!(!out[0].is_placeholder());
        assert_eq!(llm.requests().len(), 0);
    }

    #[tokio::test]
    async fn different_questions_do_not_share_extractions() {
        let cache = cache();
        let llm = ScriptedModel::new()
            .reply("battery recycling", r#"{"claims": [], "keyInsight": "recycling"}"#)
            .reply("battery safety", r#"{"claims": [], "keyInsight": "safety"}"#);
        let shared = [aspect("a", "lithium", &["https://x.com"])];

        let first = run(&llm, &cache, "battery recycling", &shared, &mut SourceIndex::new()).await;
        let second = run(&llm, &cache, "battery safety", &shared, &mut SourceIndex::new()).await;

        assert_eq!(first[0].key_insight, "recycling");
        assert_eq!(second[0].key_insight, "safety");
        assert_eq!(llm.calls(EXTRACTOR_ROLE), 2);
    }

    #[tokio::test]
    async fn aspect_name_is_part_of_the_cache_key() {
        let cache = cache();
        let llm = ScriptedModel::new()
            .reply("Aspect: cost", r#"{"claims": [], "keyInsight": "cost"}"#)
            .reply("Aspect: range", r#"{"claims": [], "keyInsight": "range"}"#);

        let cost = [aspect("cost", "ev battery", &["https://x.com"])];
        let range = [aspect("range", "ev battery", &["https://x.com"])];
        run(&llm, &cache, "q", &cost, &mut SourceIndex::new()).await;
        let out = run(&llm, &cache, "q", &range, &mut SourceIndex::new()).await;

        assert_eq!(out[0].key_insight, "range");
        assert_eq!(llm.calls(EXTRACTOR_ROLE), 2);
    }
}
