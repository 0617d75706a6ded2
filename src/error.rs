//! Errors a caller of the pipeline can see.
//!
//! Stage-local problems (unparseable model output, cache outages, failed
//! searches, a broken gap analysis) never get here; they are replaced with
//! fallback values where they happen. Only the answer model can fail a run.

use std::time::Duration;

use crate::credits::CreditDenial;
use crate::llm::LlmError;

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("invalid request: {0}")]
    Validation(String),

    #[error("upstream provider failed: {0}")]
    Upstream(#[from] LlmError),

    #[error("insufficient credits: {required} required, {available} available")]
    CreditInsufficient { required: u32, available: u32 },

    #[error("rate limit reached{}", retry_hint(.retry_after))]
    RateLimited { retry_after: Option<Duration> },
}

fn retry_hint(retry_after: &Option<Duration>) -> String {
    retry_after
        .map(|d| format!(", retry in {}s", d.as_secs().max(1)))
        .unwrap_or_default()
}

impl PipelineError {
    /// The caller sent something wrong or is out of allowance; retrying the
    /// same request immediately will not help.
    pub fn is_client_error(&self) -> bool {
        match self {
            PipelineError::Validation(_)
            | PipelineError::CreditInsufficient { .. }
            | PipelineError::RateLimited { .. } => true,
            PipelineError::Upstream(e) => e.is_configuration(),
        }
    }
}

impl From<CreditDenial> for PipelineError {
    fn from(d: CreditDenial) -> Self {
        match d {
            CreditDenial::Insufficient {
                required,
                available,
            } => PipelineError::CreditInsufficient {
                required,
                available,
            },
            CreditDenial::RateLimited { retry_after } => PipelineError::RateLimited { retry_after },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::Provider;

    #[test]
    fn rate_limit_message_carries_retry_hint() {
        let err = PipelineError::from(CreditDenial::RateLimited {
            retry_after: Some(Duration::from_secs(90)),
        });
        assert_eq!(err.to_string(), "rate limit reached, retry in 90s");
        assert!(err.is_client_error());

        let bare = PipelineError::RateLimited { retry_after: None };
        assert_eq!(bare.to_string(), "rate limit reached");
    }

    #[test]
    fn configuration_mistakes_are_client_errors() {
        let unconfigured = PipelineError::from(LlmError::NotConfigured {
            provider: Provider::Gemini,
            var: "GEMINI_API_KEY",
        });
        assert!(unconfigured.is_client_error());

        let outage = PipelineError::from(LlmError::Api {
            provider: Provider::OpenAi,
            code: 503,
            message: "down".into(),
        });
        assert!(!outage.is_client_error());
    }

    #[test]
    fn insufficient_maps_from_denial() {
        let err = PipelineError::from(CreditDenial::Insufficient {
            required: 4,
            available: 1,
        });
        assert!(matches!(
            err,
            PipelineError::CreditInsufficient {
                required: 4,
                available: 1
            }
        ));
    }
}
