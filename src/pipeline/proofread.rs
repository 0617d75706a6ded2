//! Optional cleanup pass over the finished answer.

use std::time::Duration;

use tracing::{debug, warn};

use super::complete_within;
use crate::llm::types::{ChatRequest, Message};
use crate::llm::{LanguageModel, Provider};

pub(crate) const PROOFREAD_ROLE: &str = "You are a careful copy editor.";
const TEMPERATURE: f32 = 0.1;

fn citations(text: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let mut rest = text;
    while let Some(start) = rest.find('[') {
        rest = &rest[start + 1..];
        let Some(end) = rest.find(']') else {
            break;
        };
        let inner = &rest[..end];
        if !inner.is_empty() && inner.bytes().all(|b| b.is_ascii_digit()) {
            out.push(inner);
        }
        rest = &rest[end + 1..];
    }
    out.sort_unstable();
    out
}

/// Corrected text, or `None` when the original should stay: the call failed,
/// came back empty, changed nothing, or altered the citations.
pub async fn proofread(
    llm: &dyn LanguageModel,
    provider: Provider,
    text: &str,
    timeout: Duration,
) -> Option<String> {
    let system = format!(
        "{PROOFREAD_ROLE}\n\
         Fix spelling, grammar and formatting problems in the markdown below. Keep its \
         meaning, structure and every bracketed citation like [3] exactly as they are. \
         Return only the corrected markdown."
    );
    let messages = vec![Message::system(system), Message::user(text)];
    let mut request = ChatRequest::new(messages, TEMPERATURE);
    request.provider = Some(provider);

    let revised = match complete_within(llm, &request, timeout).await {
        Ok(completion) => completion.content.trim().to_string(),
        Err(e) => {
            warn!(error = %e, "proofreading failed, keeping original");
            return None;
        }
    };
    if revised.is_empty() || revised == text.trim() {
        return None;
    }
    if citations(&revised) != citations(text) {
        warn!("proofreading altered citations, keeping original");
        return None;
    }
    debug!("answer proofread");
    Some(revised)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::testing::ScriptedModel;

    const TIMEOUT: Duration = Duration::from_secs(5);

    #[test]
    fn collects_numeric_citations_only() {
        assert_eq!(citations("a [2] b [1][10] [x] [] [3"), vec!["1", "10", "2"]);
    }

    #[tokio::test]
    async fn returns_corrected_text() {
        let llm = ScriptedModel::new().reply(PROOFREAD_ROLE, "The sky is blue [1].");
        let out = proofread(&llm, Provider::OpenAi, "The sky are blue [1].", TIMEOUT).await;
        assert_eq!(out.as_deref(), Some("The sky is blue [1]."));
    }

    #[tokio::test]
    async fn keeps_original_when_citations_change() {
        let llm = ScriptedModel::new().reply(PROOFREAD_ROLE, "The sky is blue.");
        let out = proofread(&llm, Provider::OpenAi, "The sky are blue [1].", TIMEOUT).await;
        assert!(out.is_none());
    }

    #[tokio::test]
    async fn keeps_original_on_failure() {
        let llm = ScriptedModel::new();
        assert!(proofread(&llm, Provider::OpenAi, "text", TIMEOUT).await.is_none());
    }
}
