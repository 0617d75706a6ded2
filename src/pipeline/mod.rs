//! Query answering pipeline.
//!
//! `Pipeline::start` validates the request and reserves credits, then runs
//! the stages in a spawned task that reports through a `PipelineRun` event
//! stream:
//!
//! ```text
//! route -> plan -> search -> extract -> gaps -> [search -> extract] -> synthesize -> proofread
//! ```
//!
//! Dropping the `PipelineRun` aborts the task and every call in flight; the
//! reservation is then released by the admission's drop guard.

pub mod extractor;
pub mod gaps;
pub mod json;
pub mod planner;
pub mod proofread;
pub mod router;
pub mod searcher;
pub mod synthesizer;

#[cfg(test)]
pub(crate) mod testing;

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::Stream;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cache::{CacheKey, CacheService, CacheType};
use crate::config::PipelineConfig;
use crate::credits::{Admission, CreditClient, Mode};
use crate::error::PipelineError;
use crate::llm::tokens::estimate_usage;
use crate::llm::types::{ChatRequest, Completion, StreamFrame, Usage};
use crate::llm::{LanguageModel, LlmError, Provider};
use crate::search::SearchProvider;
use crate::search::source::Source;
use crate::search::types::{SearchDepth, SearchHit, SearchImage};
use extractor::{ExtractedKnowledge, SourceIndex};
use planner::{PlanItem, Strategy};
use router::Category;
use searcher::{AspectSearchResult, SearchParams};

const EVENT_CAPACITY: usize = 64;
pub const MAX_QUERY_CHARS: usize = 2000;

#[derive(Debug, Clone)]
pub struct QueryRequest {
    pub query: String,
    pub mode: Mode,
    /// Authenticated caller, `None` for anonymous use.
    pub user_id: Option<String>,
    /// Overrides the chain's primary provider for every stage.
    pub provider: Option<Provider>,
}

impl QueryRequest {
    pub fn new(query: impl Into<String>, mode: Mode) -> Self {
        Self {
            query: query.into(),
            mode,
            user_id: None,
            provider: None,
        }
    }

    pub fn user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Routing,
    Planning,
    Searching,
    Extracting,
    AnalyzingGaps,
    FollowUp,
    Synthesizing,
    Proofreading,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Stage::Routing => "Understanding the question",
            Stage::Planning => "Planning research",
            Stage::Searching => "Searching the web",
            Stage::Extracting => "Extracting key facts",
            Stage::AnalyzingGaps => "Checking for gaps",
            Stage::FollowUp => "Filling gaps",
            Stage::Synthesizing => "Writing the answer",
            Stage::Proofreading => "Proofreading",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum PipelineEvent {
    Stage(Stage),
    Plan {
        category: Option<Category>,
        items: Vec<PlanItem>,
    },
    Sources(Vec<Source>),
    Images(Vec<SearchImage>),
    Content(String),
    Usage {
        input_tokens: u32,
        output_tokens: u32,
        /// Counted locally because the provider reported nothing.
        estimated: bool,
    },
    /// Corrected full answer replacing the streamed text.
    Proofread(String),
    Error(String),
    Done {
        cached: bool,
        credits_charged: u32,
    },
}

/// Event stream of one run. Dropping it cancels the run.
pub struct PipelineRun {
    rx: mpsc::Receiver<PipelineEvent>,
    task: Option<JoinHandle<()>>,
}

impl PipelineRun {
    pub async fn next_event(&mut self) -> Option<PipelineEvent> {
        self.rx.recv().await
    }

    pub async fn collect(mut self) -> Vec<PipelineEvent> {
        let mut events = Vec::new();
        while let Some(event) = self.next_event().await {
            events.push(event);
        }
        events
    }
}

impl Stream for PipelineRun {
    type Item = PipelineEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

impl Drop for PipelineRun {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Why a run stopped early.
enum Halt {
    Disconnected,
    Failed(PipelineError),
}

impl From<PipelineError> for Halt {
    fn from(e: PipelineError) -> Self {
        Halt::Failed(e)
    }
}

impl From<LlmError> for Halt {
    fn from(e: LlmError) -> Self {
        Halt::Failed(e.into())
    }
}

struct Events(mpsc::Sender<PipelineEvent>);

impl Events {
    async fn send(&self, event: PipelineEvent) -> Result<(), Halt> {
        self.0.send(event).await.map_err(|_| Halt::Disconnected)
    }

    async fn stage(&self, stage: Stage) -> Result<(), Halt> {
        debug!(%stage, "stage");
        self.send(PipelineEvent::Stage(stage)).await
    }
}

struct RunReport {
    live_searches: u32,
    cached: bool,
}

#[derive(Debug, Serialize, Deserialize)]
struct CachedPlan {
    category: Option<Category>,
    items: Vec<PlanItem>,
}

/// Bounds a non-streamed model call.
pub(crate) async fn complete_within(
    llm: &dyn LanguageModel,
    request: &ChatRequest,
    timeout: Duration,
) -> Result<Completion, LlmError> {
    tokio::time::timeout(timeout, llm.complete(request))
        .await
        .map_err(|_| LlmError::Timeout(format!("no response within {}s", timeout.as_secs())))?
}

pub fn validate(query: &str) -> Result<&str, PipelineError> {
    let query = query.trim();
    if query.is_empty() {
        return Err(PipelineError::Validation("query must not be empty".into()));
    }
    let chars = query.chars().count();
    if chars > MAX_QUERY_CHARS {
        return Err(PipelineError::Validation(format!(
            "query is {chars} characters, the limit is {MAX_QUERY_CHARS}"
        )));
    }
    Ok(query)
}

fn search_params(mode: Mode, max_results: u8) -> SearchParams {
    match mode {
        Mode::Web => SearchParams {
            depth: SearchDepth::Basic,
            max_results,
            include_images: true,
        },
        Mode::Research => SearchParams {
            depth: SearchDepth::Advanced,
            max_results,
            include_images: false,
        },
        Mode::Brainstorm => SearchParams {
            depth: SearchDepth::Basic,
            max_results,
            include_images: false,
        },
    }
}

/// One display record per indexed URL, numbered like the citations.
pub fn collect_sources(
    aspects: &[AspectSearchResult],
    index: &SourceIndex,
    now: DateTime<Utc>,
) -> Vec<Source> {
    let mut first_hit: HashMap<&str, &SearchHit> = HashMap::new();
    for hit in aspects.iter().flat_map(|a| &a.results) {
        first_hit.entry(hit.url.as_str()).or_insert(hit);
    }
    index
        .iter()
        .filter_map(|(id, url)| first_hit.get(url).map(|hit| Source::from_hit(id, hit, now)))
        .collect()
}

fn collect_images(aspects: &[AspectSearchResult]) -> Vec<SearchImage> {
    let mut seen = HashSet::new();
    aspects
        .iter()
        .flat_map(|a| &a.images)
        .filter(|img| seen.insert(img.url.clone()))
        .cloned()
        .collect()
}

#[derive(Clone)]
pub struct Pipeline {
    llm: Arc<dyn LanguageModel>,
    search: Arc<dyn SearchProvider>,
    cache: Arc<CacheService>,
    credits: CreditClient,
    config: PipelineConfig,
}

impl Pipeline {
    pub fn new(
        llm: Arc<dyn LanguageModel>,
        search: Arc<dyn SearchProvider>,
        cache: Arc<CacheService>,
        credits: CreditClient,
        config: PipelineConfig,
    ) -> Self {
        Self {
            llm,
            search,
            cache,
            credits,
            config,
        }
    }

    /// Fails only for invalid requests and credit or rate denials; every
    /// later problem arrives as a `PipelineEvent::Error`.
    pub async fn start(&self, request: QueryRequest) -> Result<PipelineRun, PipelineError> {
        validate(&request.query)?;
        let admission = self
            .credits
            .admit(request.user_id.as_deref(), request.mode)
            .await?;
        info!(
            mode = %request.mode,
            user = request.user_id.as_deref().unwrap_or("anonymous"),
            metering = ?admission.metering(),
            reservation = admission.reservation().map(|r| r.id.as_str()),
            "query accepted"
        );

        let (tx, rx) = mpsc::channel(EVENT_CAPACITY);
        let pipeline = self.clone();
        let task = tokio::spawn(async move { pipeline.run(request, admission, Events(tx)).await });
        Ok(PipelineRun {
            rx,
            task: Some(task),
        })
    }

    async fn run(self, request: QueryRequest, admission: Admission, events: Events) {
        match self.execute(&request, &events).await {
            Ok(report) => {
                let (credits_charged, _settle) = admission.finalize(report.live_searches);
                info!(
                    live_searches = report.live_searches,
                    credits_charged,
                    cached = report.cached,
                    "query answered"
                );
                let _ = events
                    .send(PipelineEvent::Done {
                        cached: report.cached,
                        credits_charged,
                    })
                    .await;
            }
            Err(Halt::Disconnected) => {
                debug!("caller went away, releasing credits");
                drop(admission.cancel());
            }
            Err(Halt::Failed(e)) => {
                warn!(error = %e, "query failed, releasing credits");
                drop(admission.cancel());
                let _ = events.send(PipelineEvent::Error(e.to_string())).await;
            }
        }
    }

    async fn execute(&self, request: &QueryRequest, events: &Events) -> Result<RunReport, Halt> {
        let query = request.query.trim();
        let mode = request.mode;
        let provider = request
            .provider
            .unwrap_or_else(|| self.llm.default_provider());
        let timeout = self.config.call_timeout;
        let params = search_params(mode, self.config.max_results);
        let mut index = SourceIndex::new();
        let mut live_searches = 0;

        let (aspects, knowledge) = if mode == Mode::Web {
            events.stage(Stage::Searching).await?;
            let round = searcher::search_all(
                &*self.search,
                &self.cache,
                &[PlanItem::new("web", query)],
                params,
                timeout,
            )
            .await;
            live_searches += round.live_calls;
            index.assign_all(&round.aspects);
            (round.aspects, Vec::new())
        } else {
            let (category, items) = self.plan(query, mode, provider, events).await?;
            events
                .send(PipelineEvent::Plan {
                    category,
                    items: items.clone(),
                })
                .await?;

            events.stage(Stage::Searching).await?;
            let round =
                searcher::search_all(&*self.search, &self.cache, &items, params, timeout).await;
            live_searches += round.live_calls;

            events.stage(Stage::Extracting).await?;
            let mut knowledge = self
                .extract(provider, query, &round.aspects, &mut index)
                .await;
            let mut aspects = round.aspects;

            if mode == Mode::Research {
                events.stage(Stage::AnalyzingGaps).await?;
                let analysis =
                    gaps::analyze(&*self.llm, provider, query, &knowledge, timeout).await;
                if analysis.has_gaps() {
                    events.stage(Stage::FollowUp).await?;
                    let follow_up: Vec<PlanItem> =
                        analysis.gaps.iter().map(|g| g.to_plan_item()).collect();
                    let round = searcher::search_all(
                        &*self.search,
                        &self.cache,
                        &follow_up,
                        params,
                        timeout,
                    )
                    .await;
                    live_searches += round.live_calls;
                    let more = self
                        .extract(provider, query, &round.aspects, &mut index)
                        .await;
                    aspects.extend(round.aspects);
                    knowledge.extend(more);
                }
            }
            (aspects, knowledge)
        };

        events
            .send(PipelineEvent::Sources(collect_sources(
                &aspects,
                &index,
                Utc::now(),
            )))
            .await?;
        let images = collect_images(&aspects);
        if !images.is_empty() {
            events.send(PipelineEvent::Images(images)).await?;
        }

        events.stage(Stage::Synthesizing).await?;
        let key = synthesizer::cache_key(query, mode, provider, &index);
        let llm_request = synthesizer::request(
            synthesizer::messages(query, mode, &aspects, &knowledge, &index),
            provider,
        );
        let mut stream =
            synthesizer::open(&*self.llm, &self.cache, &key, &llm_request, timeout).await?;
        let cached = stream.is_cached();

        let mut text = String::new();
        let mut usage: Option<Usage> = None;
        while let Some(frame) = stream.next_frame().await {
            match frame? {
                StreamFrame::Content(chunk) => {
                    text.push_str(&chunk);
                    events.send(PipelineEvent::Content(chunk)).await?;
                }
                StreamFrame::Usage(u) => usage = Some(usage.unwrap_or_default().merge(u)),
            }
        }

        if !cached {
            let (usage, estimated) = match usage {
                Some(u) => (u, false),
                None => (estimate_usage(&llm_request.messages, &text), true),
            };
            events
                .send(PipelineEvent::Usage {
                    input_tokens: usage.input_tokens,
                    output_tokens: usage.output_tokens,
                    estimated,
                })
                .await?;
            self.finish_answer(query, mode, provider, &key, text, events)
                .await?;
        }

        Ok(RunReport {
            live_searches,
            cached,
        })
    }

    /// Proofreads a fresh answer and caches whichever version the caller
    /// ends up with.
    async fn finish_answer(
        &self,
        query: &str,
        mode: Mode,
        provider: Provider,
        key: &CacheKey,
        text: String,
        events: &Events,
    ) -> Result<(), Halt> {
        if text.trim().is_empty() {
            warn!("model returned an empty answer, not caching");
            return Ok(());
        }
        let mut answer = text;
        if self.config.proofread && mode != Mode::Web {
            events.stage(Stage::Proofreading).await?;
            if let Some(revised) =
                proofread::proofread(&*self.llm, provider, &answer, self.config.call_timeout).await
            {
                events.send(PipelineEvent::Proofread(revised.clone())).await?;
                answer = revised;
            }
        }
        self.cache.set(key, query, &answer).await;
        Ok(())
    }

    async fn plan(
        &self,
        query: &str,
        mode: Mode,
        provider: Provider,
        events: &Events,
    ) -> Result<(Option<Category>, Vec<PlanItem>), Halt> {
        let key = CacheKey::new(CacheType::Plan, query)
            .salt(mode)
            .provider(provider.as_str());
        if let Some(cached) = self.cache.get::<CachedPlan>(&key).await.data {
            return Ok((cached.category, cached.items));
        }

        let timeout = self.config.call_timeout;
        let (category, strategy) = if mode == Mode::Brainstorm {
            (None, Strategy::Brainstorm)
        } else {
            events.stage(Stage::Routing).await?;
            let category = router::route(&*self.llm, provider, query, timeout).await;
            (Some(category), Strategy::Category(category))
        };

        events.stage(Stage::Planning).await?;
        let items = planner::plan(&*self.llm, provider, query, strategy, timeout).await;
        if items != planner::fallback_plan(query) {
            let entry = CachedPlan { category, items };
            self.cache.set(&key, query, &entry).await;
            return Ok((entry.category, entry.items));
        }
        Ok((category, items))
    }

    async fn extract(
        &self,
        provider: Provider,
        query: &str,
        aspects: &[AspectSearchResult],
        index: &mut SourceIndex,
    ) -> Vec<ExtractedKnowledge> {
        extractor::extract_all(
            &*self.llm,
            &self.cache,
            provider,
            query,
            aspects,
            index,
            self.config.call_timeout,
        )
        .await
    }
}
