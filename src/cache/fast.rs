//! In-process fast tier: bounded LRU with a fixed TTL and a background sweep.

use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use lru::LruCache;
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

struct FastEntry {
    value: Value,
    expires_at: Instant,
}

/// Shared process-wide; every access goes through the mutex, and `LruCache`
/// keeps the access order that drives eviction.
pub struct FastTier {
    entries: Mutex<LruCache<String, FastEntry>>,
    ttl: Duration,
}

impl FastTier {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
            ttl,
        }
    }

    fn lock(&self) -> MutexGuard<'_, LruCache<String, FastEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns a copy of the live value and marks it most recently used.
    pub fn get(&self, key: &str) -> Option<Value> {
        let mut entries = self.lock();
        let now = Instant::now();
        match entries.get(key) {
            Some(entry) if entry.expires_at > now => Some(entry.value.clone()),
            Some(_) => {
                entries.pop(key);
                debug!(key, "fast tier entry expired");
                None
            }
            None => None,
        }
    }

    /// Inserts with the tier TTL, shortened to `max_ttl` when the value must
    /// not outlive its slow-tier row.
    pub fn insert(&self, key: String, value: Value, max_ttl: Option<Duration>) {
        let ttl = max_ttl.map_or(self.ttl, |cap| cap.min(self.ttl));
        let entry = FastEntry {
            value,
            expires_at: Instant::now() + ttl,
        };
        if let Some((evicted, _)) = self.lock().push(key.clone(), entry)
            && evicted != key
        {
            debug!(key = %evicted, "fast tier evicted least recently used entry");
        }
    }

    pub fn remove(&self, key: &str) {
        self.lock().pop(key);
    }

    pub fn purge_expired(&self) -> usize {
        let mut entries = self.lock();
        let now = Instant::now();
        let expired: Vec<String> = entries
            .iter()
            .filter(|(_, e)| e.expires_at <= now)
            .map(|(k, _)| k.clone())
            .collect();
        for key in &expired {
            entries.pop(key);
        }
        expired.len()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }
}

/// Periodically purges expired entries. Exits once the tier is dropped.
pub fn spawn_sweeper(tier: &Arc<FastTier>, every: Duration) -> JoinHandle<()> {
    let weak: Weak<FastTier> = Arc::downgrade(tier);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let Some(tier) = weak.upgrade() else {
                break;
            };
            let purged = tier.purge_expired();
            if purged > 0 {
                debug!(purged, remaining = tier.len(), "fast tier sweep");
            }
        }
    })
}
