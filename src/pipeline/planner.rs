//! Research planning: turns a query into at most four (aspect, sub-query)
//! pairs, using a prompt strategy chosen by the routed category.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::complete_within;
use super::json::{self, Parsed};
use super::router::Category;
use crate::llm::{LanguageModel, Provider};
use crate::llm::types::{ChatRequest, Message};
use crate::text::single_line;

pub(crate) const PLANNER_ROLE: &str = "You plan web research.";
pub(crate) const BRAINSTORM_ROLE: &str = "You plan cross-domain inspiration searches.";
pub const MAX_PLAN_ITEMS: usize = 4;
const TEMPERATURE: f32 = 0.3;
const MAX_TOKENS: u32 = 600;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanItem {
    pub aspect: String,
    pub query: String,
}

impl PlanItem {
    pub fn new(aspect: impl Into<String>, query: impl Into<String>) -> Self {
        Self {
            aspect: aspect.into(),
            query: query.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    Category(Category),
    /// Angles from unrelated creative domains instead of facets of the topic.
    Brainstorm,
}

fn category_guidance(category: Category) -> &'static str {
    match category {
        Category::Shopping => {
            "Cover: current top options and prices, expert and user reviews, \
             comparisons between leading alternatives, and buying pitfalls."
        }
        Category::Travel => {
            "Cover: top attractions and experiences, getting there and around, \
             where to stay by budget, and seasonal or practical tips."
        }
        Category::Technical => {
            "Cover: official documentation or specifications, implementation \
             approaches with trade-offs, known issues and fixes, and current best practice."
        }
        Category::Academic => {
            "Cover: foundational research, recent findings, competing theories or \
             methodologies, and open questions in the field."
        }
        Category::Explanatory => {
            "Cover: the core concept in plain terms, how it works step by step, \
             concrete examples, and common misconceptions."
        }
        Category::Finance => {
            "Cover: latest figures and market data, expert analysis and forecasts, \
             risks, and historical context."
        }
        Category::General => {
            "Cover the most important distinct facets a thorough answer needs: \
             background, current state, different perspectives, and practical implications."
        }
    }
}

fn messages(query: &str, strategy: Strategy) -> Vec<Message> {
    let system = match strategy {
        Strategy::Category(category) => format!(
            "{PLANNER_ROLE}\n\
             Break the user's {category} query into 2 to {MAX_PLAN_ITEMS} distinct aspects, \
             each with a focused web search query.\n\
             {}\n\
             Respond with JSON only: {{\"plan\": [{{\"aspect\": \"...\", \"query\": \"...\"}}]}}",
            category_guidance(category)
        ),
        Strategy::Brainstorm => format!(
            "{BRAINSTORM_ROLE}\n\
             For the user's challenge, pick {MAX_PLAN_ITEMS} unrelated domains (for example \
             biology, game design, architecture, music) whose solutions to analogous \
             problems could inspire new ideas. For each, write a web search query that \
             finds how that domain handles the analogous problem.\n\
             Respond with JSON only: {{\"angles\": [{{\"aspect\": \"<domain>\", \"query\": \"...\"}}]}}"
        ),
    };
    vec![
        Message::system(system),
        Message::user(format!("Query: {}", single_line(query))),
    ]
}

fn plan_item(value: &serde_json::Value) -> Option<PlanItem> {
    let aspect = json::str_field(value, "aspect").or_else(|| json::str_field(value, "angle"))?;
    let query = json::str_field(value, "query")?;
    Some(PlanItem { aspect, query })
}

/// Invalid entries are dropped and the rest truncated; an empty outcome is a
/// fallback.
pub fn parse_plan(raw: &str) -> Parsed<Vec<PlanItem>> {
    let value = match json::parse::<serde_json::Value>(raw) {
        Parsed::Parsed(v) => v,
        Parsed::Fallback(reason) => return Parsed::Fallback(reason),
    };
    let key = if value.get("angles").is_some() {
        "angles"
    } else {
        "plan"
    };
    let Some(items) = json::array_field(value, key) else {
        return Parsed::Fallback("no plan array".into());
    };
    let plan: Vec<PlanItem> = items
        .iter()
        .filter_map(plan_item)
        .take(MAX_PLAN_ITEMS)
        .collect();
    if plan.is_empty() {
        Parsed::Fallback("plan has no valid items".into())
    } else {
        Parsed::Parsed(plan)
    }
}

pub fn fallback_plan(query: &str) -> Vec<PlanItem> {
    vec![PlanItem::new("general", query.trim())]
}

/// Always yields 1 to `MAX_PLAN_ITEMS` items.
pub async fn plan(
    llm: &dyn LanguageModel,
    provider: Provider,
    query: &str,
    strategy: Strategy,
    timeout: Duration,
) -> Vec<PlanItem> {
    let mut request =
        ChatRequest::new(messages(query, strategy), TEMPERATURE).max_tokens(MAX_TOKENS);
    request.provider = Some(provider);
    let raw = match complete_within(llm, &request, timeout).await {
        Ok(completion) => completion.content,
        Err(e) => {
            warn!(error = %e, "planner call failed, using single-item plan");
            return fallback_plan(query);
        }
    };
    let items = parse_plan(&raw).or_else(|reason| {
        warn!(reason, "planner output unusable, using single-item plan");
        fallback_plan(query)
    });
    debug!(items = items.len(), ?strategy, "plan ready");
    items
}
