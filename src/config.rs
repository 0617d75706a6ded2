//! Environment-driven configuration.
//!
//! Provider keys are read by the clients themselves (`ProviderChain::from_env`,
//! `TavilyClient::from_env`); this module holds everything else.

use std::env;
use std::time::Duration;

use tracing::warn;

use crate::cache::CacheType;

const HOUR: u64 = 60 * 60;

pub const DEFAULT_PROVIDER: &str = "openai";

#[derive(Debug, Clone)]
pub struct Config {
    /// Primary LLM provider id (`LLM_PROVIDER`).
    pub provider: String,
    /// Provider tried once when the primary fails transiently (`LLM_FALLBACK_PROVIDER`).
    pub fallback_provider: Option<String>,
    pub cache: CacheConfig,
    pub pipeline: PipelineConfig,
}

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub fast_capacity: usize,
    pub fast_ttl: Duration,
    pub sweep_interval: Duration,
    pub search_ttl: Duration,
    pub plan_ttl: Duration,
    pub extraction_ttl: Duration,
    pub synthesis_ttl: Duration,
}

impl CacheConfig {
    pub fn ttl_for(&self, kind: CacheType) -> Duration {
        match kind {
            CacheType::Search => self.search_ttl,
            CacheType::Plan => self.plan_ttl,
            CacheType::Extraction => self.extraction_ttl,
            CacheType::Synthesis => self.synthesis_ttl,
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            fast_capacity: 500,
            fast_ttl: Duration::from_secs(15 * 60),
            sweep_interval: Duration::from_secs(60),
            search_ttl: Duration::from_secs(48 * HOUR),
            plan_ttl: Duration::from_secs(48 * HOUR),
            // Sources behind an extraction may have changed since it was cached.
            extraction_ttl: Duration::from_secs(24 * HOUR),
            synthesis_ttl: Duration::from_secs(48 * HOUR),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Results requested per search call.
    pub max_results: u8,
    /// Outer bound on any single search or LLM call made by a stage.
    pub call_timeout: Duration,
    /// Budget for the detached credit finalize/cancel task.
    pub settle_timeout: Duration,
    pub proofread: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_results: 5,
            call_timeout: Duration::from_secs(90),
            settle_timeout: Duration::from_secs(10),
            proofread: true,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        let defaults = CacheConfig::default();
        let cache = CacheConfig {
            search_ttl: env_hours("CACHE_TTL_SEARCH_HOURS", defaults.search_ttl),
            plan_ttl: env_hours("CACHE_TTL_PLAN_HOURS", defaults.plan_ttl),
            extraction_ttl: env_hours("CACHE_TTL_EXTRACTION_HOURS", defaults.extraction_ttl),
            synthesis_ttl: env_hours("CACHE_TTL_SYNTHESIS_HOURS", defaults.synthesis_ttl),
            ..defaults
        };
        Self {
            provider: env_nonempty("LLM_PROVIDER").unwrap_or_else(|| DEFAULT_PROVIDER.to_string()),
            fallback_provider: env_nonempty("LLM_FALLBACK_PROVIDER"),
            cache,
            pipeline: PipelineConfig::default(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            provider: DEFAULT_PROVIDER.to_string(),
            fallback_provider: None,
            cache: CacheConfig::default(),
            pipeline: PipelineConfig::default(),
        }
    }
}

/// Secret that never shows up in `Debug` output or logs.
#[derive(Clone)]
pub struct ApiKey(String);

impl ApiKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn from_env(var: &str) -> Option<Self> {
        env_nonempty(var).map(Self)
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for ApiKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("[REDACTED]")
    }
}

/// Reads an env var, treating blank values as unset.
pub fn env_nonempty(name: &str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_hours(name: &str, default: Duration) -> Duration {
    let Some(raw) = env_nonempty(name) else {
        return default;
    };
    parse_hours(&raw).unwrap_or_else(|| {
        warn!(var = name, value = %raw, "ignoring malformed cache TTL");
        default
    })
}

fn parse_hours(raw: &str) -> Option<Duration> {
    raw.parse::<u64>()
        .ok()
        .filter(|h| *h > 0)
        .map(|h| Duration::from_secs(h * HOUR))
}
