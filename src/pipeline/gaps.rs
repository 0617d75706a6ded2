//! Coverage gap analysis that drives the optional second search round.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::complete_within;
use super::extractor::ExtractedKnowledge;
use super::json::{self, Parsed};
use super::planner::PlanItem;
use crate::llm::{LanguageModel, Provider};
use crate::llm::types::{ChatRequest, Message};
use crate::text::single_line;

pub(crate) const GAPS_ROLE: &str = "You review research notes for missing coverage.";
pub const MAX_GAPS: usize = 3;
const TEMPERATURE: f32 = 0.2;
const MAX_TOKENS: u32 = 600;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Importance {
    High,
    Medium,
    Low,
}

impl Importance {
    fn from_label(label: &str) -> Option<Self> {
        match label.to_ascii_lowercase().as_str() {
            "high" => Some(Importance::High),
            "medium" => Some(Importance::Medium),
            "low" => Some(Importance::Low),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Gap {
    #[serde(rename = "type")]
    pub kind: String,
    pub gap: String,
    pub query: String,
    pub importance: Importance,
}

impl Gap {
    pub fn to_plan_item(&self) -> PlanItem {
        PlanItem::new(format!("{} (follow-up)", self.kind), self.query.clone())
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct GapAnalysis {
    pub gaps: Vec<Gap>,
}

impl GapAnalysis {
    pub fn has_gaps(&self) -> bool {
        !self.gaps.is_empty()
    }
}

fn gap(value: &serde_json::Value) -> Option<Gap> {
    Some(Gap {
        kind: json::str_field(value, "type")?,
        gap: json::str_field(value, "gap")?,
        query: json::str_field(value, "query")?,
        importance: Importance::from_label(&json::str_field(value, "importance")?)?,
    })
}

/// Keeps well-formed entries only, at most `MAX_GAPS` of them.
pub fn parse_gaps(raw: &str) -> Parsed<Vec<Gap>> {
    let value = match json::parse::<serde_json::Value>(raw) {
        Parsed::Parsed(v) => v,
        Parsed::Fallback(reason) => return Parsed::Fallback(reason),
    };
    match json::array_field(value, "gaps") {
        Some(items) => Parsed::Parsed(items.iter().filter_map(gap).take(MAX_GAPS).collect()),
        None => Parsed::Fallback("no gaps array".into()),
    }
}

fn summarize(knowledge: &[ExtractedKnowledge]) -> String {
    let mut out = String::new();
    for k in knowledge {
        out.push_str(&format!("## {}\n", single_line(&k.aspect)));
        if k.is_placeholder() {
            out.push_str("(no structured notes)\n\n");
            continue;
        }
        if !k.key_insight.is_empty() {
            out.push_str(&format!("Key insight: {}\n", single_line(&k.key_insight)));
        }
        for claim in &k.claims {
            out.push_str(&format!("- {}\n", single_line(&claim.statement)));
        }
        for stat in &k.statistics {
            out.push_str(&format!(
                "- {}: {}\n",
                single_line(&stat.value),
                single_line(&stat.context)
            ));
        }
        for c in &k.contradictions {
            out.push_str(&format!("- Contradiction: {}\n", single_line(&c.description)));
        }
        out.push('\n');
    }
    out
}

fn messages(query: &str, knowledge: &[ExtractedKnowledge]) -> Vec<Message> {
    let system = format!(
        "{GAPS_ROLE}\n\
         Identify up to {MAX_GAPS} important gaps: missing perspectives, outdated or \
         unverified data, unresolved contradictions, or unanswered parts of the question. \
         Return an empty list when coverage is sufficient.\n\
         Respond with JSON only: {{\"gaps\": [{{\"type\": \"missing_perspective|outdated|contradiction|unanswered\", \
         \"gap\": \"what is missing\", \"query\": \"web search to fill it\", \"importance\": \"high|medium|low\"}}]}}"
    );
    let user = format!(
        "Research question: {}\n\nNotes so far:\n\n{}",
        single_line(query),
        summarize(knowledge)
    );
    vec![Message::system(system), Message::user(user)]
}

/// Any failure means "no gaps": the answer then comes from round one only.
pub async fn analyze(
    llm: &dyn LanguageModel,
    provider: Provider,
    query: &str,
    knowledge: &[ExtractedKnowledge],
    timeout: Duration,
) -> GapAnalysis {
    let mut request =
        ChatRequest::new(messages(query, knowledge), TEMPERATURE).max_tokens(MAX_TOKENS);
    request.provider = Some(provider);
    let raw = match complete_within(llm, &request, timeout).await {
        Ok(completion) => completion.content,
        Err(e) => {
            warn!(error = %e, "gap analysis failed, skipping follow-up round");
            return GapAnalysis::default();
        }
    };
    let gaps = parse_gaps(&raw).or_else(|reason| {
        warn!(reason, "gap analysis output unusable, skipping follow-up round");
        Vec::new()
    });
    debug!(gaps = gaps.len(), "gap analysis complete");
    GapAnalysis { gaps }
}
