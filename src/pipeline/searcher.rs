//! Concurrent fan-out of plan items to the search provider.

use std::time::Duration;

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::planner::PlanItem;
use crate::cache::{CacheKey, CacheService, CacheType};
use crate::search::types::{SearchDepth, SearchHit, SearchImage, SearchRequest, SearchResponse};
use crate::search::{SearchError, SearchProvider};

#[derive(Debug, Clone, Copy)]
pub struct SearchParams {
    pub depth: SearchDepth,
    pub max_results: u8,
    pub include_images: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AspectSearchResult {
    pub aspect: String,
    pub query: String,
    pub results: Vec<SearchHit>,
    #[serde(default)]
    pub images: Vec<SearchImage>,
}

#[derive(Debug, Default)]
pub struct SearchRound {
    /// One entry per plan item, in plan order.
    pub aspects: Vec<AspectSearchResult>,
    /// Successful calls that reached the provider (cache hits excluded).
    pub live_calls: u32,
}

pub fn cache_key(query: &str, params: &SearchParams) -> CacheKey {
    CacheKey::new(CacheType::Search, query)
        .salt(params.depth.as_str())
        .salt(params.max_results)
        .salt(if params.include_images { "img" } else { "noimg" })
}

/// Searches every item concurrently and waits for all of them. A failed item
/// keeps its slot with no results.
pub async fn search_all(
    provider: &dyn SearchProvider,
    cache: &CacheService,
    items: &[PlanItem],
    params: SearchParams,
    timeout: Duration,
) -> SearchRound {
    let outcomes = join_all(
        items
            .iter()
            .map(|item| search_one(provider, cache, item, params, timeout)),
    )
    .await;

    let mut round = SearchRound::default();
    for (aspect, live) in outcomes {
        if live {
            round.live_calls += 1;
        }
        round.aspects.push(aspect);
    }
    debug!(
        aspects = round.aspects.len(),
        live_calls = round.live_calls,
        "search round complete"
    );
    round
}

async fn search_one(
    provider: &dyn SearchProvider,
    cache: &CacheService,
    item: &PlanItem,
    params: SearchParams,
    timeout: Duration,
) -> (AspectSearchResult, bool) {
    let key = cache_key(&item.query, &params);
    let into_aspect = |response: SearchResponse| AspectSearchResult {
        aspect: item.aspect.clone(),
        query: item.query.clone(),
        results: response.results,
        images: response.images,
    };

    if let Some(cached) = cache.get::<SearchResponse>(&key).await.data {
        return (into_aspect(cached), false);
    }

    let request = SearchRequest {
        query: item.query.clone(),
        include_images: params.include_images,
        depth: params.depth,
        max_results: params.max_results,
    };
    let outcome = tokio::time::timeout(timeout, provider.search(&request))
        .await
        .unwrap_or(Err(SearchError::Timeout(timeout.as_secs())));

    match outcome {
        Ok(response) => {
            debug!(aspect = %item.aspect, hits = response.results.len(), "aspect searched");
            cache.set(&key, &item.query, &response).await;
            (into_aspect(response), true)
        }
        Err(e) => {
            warn!(
                aspect = %item.aspect,
                query = %item.query,
                error = %e,
                "aspect search failed, continuing without results"
            );
            (into_aspect(SearchResponse::default()), false)
        }
    }
}
