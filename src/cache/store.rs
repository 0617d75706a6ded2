//! Slow-tier backing store boundary.
//!
//! The pipeline never owns the durable store; it only talks to this trait.
//! `MemoryStore` is the process-local implementation used by the CLI and tests.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::CacheType;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("cache store unavailable: {0}")]
    Unavailable(String),

    #[error("cache store rejected row: {0}")]
    Rejected(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheRow {
    pub key: String,
    pub kind: CacheType,
    /// Raw query, kept for auditing only; lookups go through `key`.
    pub query: String,
    pub payload: Value,
    pub provider: Option<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub hit_count: u64,
}

impl CacheRow {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<CacheRow>, StoreError>;

    async fn upsert(&self, row: CacheRow) -> Result<(), StoreError>;

    async fn delete(&self, key: &str) -> Result<(), StoreError>;

    /// Bumps the hit counter. Callers do not wait on this.
    async fn record_hit(&self, key: &str) -> Result<(), StoreError>;
}

#[derive(Default)]
pub struct MemoryStore {
    rows: Mutex<HashMap<String, CacheRow>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    pub(crate) fn row(&self, key: &str) -> Option<CacheRow> {
        self.rows
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }
}

#[async_trait]
impl CacheStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<CacheRow>, StoreError> {
        let rows = self.rows.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(rows.get(key).cloned())
    }

    async fn upsert(&self, row: CacheRow) -> Result<(), StoreError> {
        if row.key.is_empty() {
            return Err(StoreError::Rejected("empty key".into()));
        }
        let mut rows = self.rows.lock().unwrap_or_else(PoisonError::into_inner);
        let hit_count = rows.get(&row.key).map_or(0, |r| r.hit_count);
        rows.insert(row.key.clone(), CacheRow { hit_count, ..row });
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.rows
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
        Ok(())
    }

    async fn record_hit(&self, key: &str) -> Result<(), StoreError> {
        if let Some(row) = self
            .rows
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get_mut(key)
        {
            row.hit_count += 1;
        }
        Ok(())
    }
}
