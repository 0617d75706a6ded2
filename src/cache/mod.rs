//! Two-tier cache consulted by every cacheable pipeline stage.
//!
//! Lookup goes fast tier -> slow tier, promoting slow hits into the fast tier.
//! The slow tier is best-effort: any store failure degrades to fast-only and
//! is never surfaced to callers.

pub mod fast;
pub mod store;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::CacheConfig;
use fast::FastTier;
use store::{CacheRow, CacheStore};

const HASH_LEN: usize = 16;
const STORE_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheType {
    Search,
    Plan,
    Extraction,
    Synthesis,
}

impl CacheType {
    pub fn as_str(self) -> &'static str {
        match self {
            CacheType::Search => "search",
            CacheType::Plan => "plan",
            CacheType::Extraction => "extraction",
            CacheType::Synthesis => "synthesis",
        }
    }
}

impl fmt::Display for CacheType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
    Fast,
    Slow,
    Miss,
}

#[derive(Debug)]
pub struct CacheLookup<T> {
    pub data: Option<T>,
    pub source: CacheSource,
}

impl<T> CacheLookup<T> {
    fn miss() -> Self {
        Self {
            data: None,
            source: CacheSource::Miss,
        }
    }
}

/// Lower-cased, trimmed, whitespace-collapsed form used before any hashing.
pub fn normalize_query(query: &str) -> String {
    query
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

fn short_hash(input: &str) -> String {
    let digest = format!("{:x}", Sha256::digest(input.as_bytes()));
    digest[..HASH_LEN].to_string()
}

/// Order-independent fingerprint of a set of source URLs.
pub fn hash_urls<'a>(urls: impl IntoIterator<Item = &'a str>) -> String {
    let mut urls: Vec<&str> = urls.into_iter().collect();
    urls.sort_unstable();
    urls.dedup();
    short_hash(&urls.join("\n"))
}

/// Fingerprint of a citation numbering: the same URLs under different
/// numbers hash differently.
pub fn hash_numbered_urls<'a>(entries: impl IntoIterator<Item = (u32, &'a str)>) -> String {
    let lines: Vec<String> = entries
        .into_iter()
        .map(|(n, url)| format!("{n} {url}"))
        .collect();
    short_hash(&lines.join("\n"))
}

/// `type:hash(normalized query)[:salt]`. Salt parts carry every parameter
/// that changes the cached result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheKey {
    kind: CacheType,
    key: String,
    salted: bool,
    provider: Option<String>,
}

impl CacheKey {
    pub fn new(kind: CacheType, query: &str) -> Self {
        Self {
            kind,
            key: format!("{kind}:{}", short_hash(&normalize_query(query))),
            salted: false,
            provider: None,
        }
    }

    pub fn salt(mut self, part: impl fmt::Display) -> Self {
        self.key.push(if self.salted { '|' } else { ':' });
        self.salted = true;
        self.key.push_str(&part.to_string());
        self
    }

    /// Salts with the provider id and records it on the stored row.
    pub fn provider(mut self, provider: &str) -> Self {
        self.provider = Some(provider.to_string());
        self.salt(provider)
    }

    pub fn kind(&self) -> CacheType {
        self.kind
    }

    pub fn as_str(&self) -> &str {
        &self.key
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key)
    }
}

pub struct CacheService {
    fast: Arc<FastTier>,
    store: Option<Arc<dyn CacheStore>>,
    config: CacheConfig,
    sweeper: Option<JoinHandle<()>>,
}

impl CacheService {
    /// Without a store the service runs fast-tier-only.
    pub fn new(config: CacheConfig, store: Option<Arc<dyn CacheStore>>) -> Self {
        Self {
            fast: Arc::new(FastTier::new(config.fast_capacity, config.fast_ttl)),
            store,
            config,
            sweeper: None,
        }
    }

    /// Starts the periodic expiry sweep; must be called inside a runtime.
    pub fn with_sweeper(mut self) -> Self {
        self.sweeper = Some(fast::spawn_sweeper(&self.fast, self.config.sweep_interval));
        self
    }

    pub async fn get<T: DeserializeOwned>(&self, key: &CacheKey) -> CacheLookup<T> {
        if let Some(value) = self.fast.get(key.as_str()) {
            match serde_json::from_value(value) {
                Ok(data) => {
                    debug!(%key, "cache hit (fast)");
                    return CacheLookup {
                        data: Some(data),
                        source: CacheSource::Fast,
                    };
                }
                Err(e) => {
                    warn!(%key, error = %e, "dropping undecodable fast tier entry");
                    self.fast.remove(key.as_str());
                }
            }
        }

        let Some(store) = &self.store else {
            return CacheLookup::miss();
        };

        let row = match tokio::time::timeout(STORE_TIMEOUT, store.get(key.as_str())).await {
            Ok(Ok(Some(row))) => row,
            Ok(Ok(None)) => {
                debug!(%key, "cache miss");
                return CacheLookup::miss();
            }
            Ok(Err(e)) => {
                warn!(%key, error = %e, "slow tier read failed, continuing without it");
                return CacheLookup::miss();
            }
            Err(_) => {
                warn!(%key, "slow tier read timed out, continuing without it");
                return CacheLookup::miss();
            }
        };

        let now = Utc::now();
        if row.is_expired(now) {
            debug!(%key, "slow tier entry expired");
            self.detach(store, key, |s, k| async move { s.delete(&k).await });
            return CacheLookup::miss();
        }

        let data = match serde_json::from_value::<T>(row.payload.clone()) {
            Ok(data) => data,
            Err(e) => {
                warn!(%key, error = %e, "slow tier payload has unexpected shape");
                return CacheLookup::miss();
            }
        };

        let remaining = (row.expires_at - now).to_std().ok();
        self.fast.insert(key.as_str().to_string(), row.payload, remaining);
        self.detach(store, key, |s, k| async move { s.record_hit(&k).await });
        debug!(%key, "cache hit (slow), promoted");

        CacheLookup {
            data: Some(data),
            source: CacheSource::Slow,
        }
    }

    pub async fn set<T: Serialize>(&self, key: &CacheKey, raw_query: &str, data: &T) {
        let payload = match serde_json::to_value(data) {
            Ok(v) => v,
            Err(e) => {
                warn!(%key, error = %e, "value not cacheable");
                return;
            }
        };

        self.fast.insert(key.as_str().to_string(), payload.clone(), None);

        let Some(store) = &self.store else {
            return;
        };
        let now = Utc::now();
        let ttl = chrono::Duration::from_std(self.config.ttl_for(key.kind()))
            .unwrap_or(chrono::Duration::hours(24));
        let row = CacheRow {
            key: key.as_str().to_string(),
            kind: key.kind(),
            query: raw_query.to_string(),
            payload,
            provider: key.provider.clone(),
            created_at: now,
            expires_at: now + ttl,
            hit_count: 0,
        };
        match tokio::time::timeout(STORE_TIMEOUT, store.upsert(row)).await {
            Ok(Ok(())) => debug!(%key, "cached"),
            Ok(Err(e)) => warn!(%key, error = %e, "slow tier write failed"),
            Err(_) => warn!(%key, "slow tier write timed out"),
        }
    }

    pub async fn delete(&self, key: &CacheKey) {
        self.fast.remove(key.as_str());
        let Some(store) = &self.store else {
            return;
        };
        match tokio::time::timeout(STORE_TIMEOUT, store.delete(key.as_str())).await {
            Ok(Ok(())) => debug!(%key, "evicted"),
            Ok(Err(e)) => warn!(%key, error = %e, "slow tier delete failed"),
            Err(_) => warn!(%key, "slow tier delete timed out"),
        }
    }

    fn detach<F, Fut>(&self, store: &Arc<dyn CacheStore>, key: &CacheKey, op: F)
    where
        F: FnOnce(Arc<dyn CacheStore>, String) -> Fut,
        Fut: Future<Output = Result<(), store::StoreError>> + Send + 'static,
    {
        let fut = op(Arc::clone(store), key.as_str().to_string());
        let key = key.as_str().to_string();
        tokio::spawn(async move {
            if let Err(e) = fut.await {
                debug!(key, error = %e, "background cache bookkeeping failed");
            }
        });
    }
}

impl Drop for CacheService {
    fn drop(&mut self) {
        if let Some(handle) = self.sweeper.take() {
            handle.abort();
        }
    }
}
