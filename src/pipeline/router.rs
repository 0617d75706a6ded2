//! Query intent classification.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::json::{self, Parsed};
use super::complete_within;
use crate::llm::{LanguageModel, Provider};
use crate::llm::types::{ChatRequest, Message};
use crate::text::single_line;

pub(crate) const ROUTER_ROLE: &str = "You classify web search queries by intent.";
const TEMPERATURE: f32 = 0.0;
const MAX_TOKENS: u32 = 50;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Shopping,
    Travel,
    Technical,
    Academic,
    Explanatory,
    Finance,
    #[default]
    General,
}

impl Category {
    pub const ALL: [Category; 7] = [
        Category::Shopping,
        Category::Travel,
        Category::Technical,
        Category::Academic,
        Category::Explanatory,
        Category::Finance,
        Category::General,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Category::Shopping => "shopping",
            Category::Travel => "travel",
            Category::Technical => "technical",
            Category::Academic => "academic",
            Category::Explanatory => "explanatory",
            Category::Finance => "finance",
            Category::General => "general",
        }
    }

    pub fn from_label(label: &str) -> Option<Self> {
        let label = label.trim();
        Self::ALL
            .into_iter()
            .find(|c| c.as_str().eq_ignore_ascii_case(label))
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn messages(query: &str) -> Vec<Message> {
    let labels: Vec<&str> = Category::ALL.iter().map(|c| c.as_str()).collect();
    let system = format!(
        "{ROUTER_ROLE}\n\
         Pick exactly one category from: {}.\n\
         - shopping: products, prices, reviews, buying advice\n\
         - travel: destinations, itineraries, transport, lodging\n\
         - technical: programming, software, hardware, engineering\n\
         - academic: research papers, scientific findings, scholarly topics\n\
         - explanatory: how or why something works, concepts, history\n\
         - finance: markets, investing, companies, personal finance\n\
         - general: anything else\n\
         Respond with JSON only: {{\"category\": \"<category>\"}}",
        labels.join(", ")
    );
    vec![
        Message::system(system),
        Message::user(format!("Query: {}", single_line(query))),
    ]
}

pub fn parse_category(raw: &str) -> Parsed<Category> {
    match json::parse::<serde_json::Value>(raw) {
        Parsed::Parsed(value) => match json::str_field(&value, "category") {
            Some(label) => match Category::from_label(&label) {
                Some(category) => Parsed::Parsed(category),
                None => Parsed::Fallback(format!("unknown category '{label}'")),
            },
            None => Parsed::Fallback("missing category field".into()),
        },
        Parsed::Fallback(reason) => Parsed::Fallback(reason),
    }
}

/// Never fails: any problem routes to `General`.
pub async fn route(
    llm: &dyn LanguageModel,
    provider: Provider,
    query: &str,
    timeout: Duration,
) -> Category {
    let mut request = ChatRequest::new(messages(query), TEMPERATURE).max_tokens(MAX_TOKENS);
    request.provider = Some(provider);
    let raw = match complete_within(llm, &request, timeout).await {
        Ok(completion) => completion.content,
        Err(e) => {
            warn!(error = %e, "router call failed, using general");
            return Category::General;
        }
    };
    let category = parse_category(&raw).or_else(|reason| {
        warn!(reason, "router output unusable, using general");
        Category::General
    });
    debug!(%category, "query routed");
    category
}
