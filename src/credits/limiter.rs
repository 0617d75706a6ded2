//! Per-user request counter used when no credit ledger is available.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;

pub const DAILY_WINDOW: Duration = Duration::from_secs(24 * 60 * 60);
pub const DEFAULT_DAILY_LIMIT: u32 = 20;

struct Window {
    started: Instant,
    count: u32,
}

/// Fixed-window counter keyed by user id.
pub struct LegacyLimiter {
    limit: u32,
    window: Duration,
    counters: Mutex<HashMap<String, Window>>,
}

impl Default for LegacyLimiter {
    fn default() -> Self {
        Self::new(DEFAULT_DAILY_LIMIT, DAILY_WINDOW)
    }
}

impl LegacyLimiter {
    pub fn new(limit: u32, window: Duration) -> Self {
        Self {
            limit,
            window,
            counters: Mutex::new(HashMap::new()),
        }
    }

    /// Counts one request; `Err(retry_after)` once the window is used up.
    /// Expired windows of every user are dropped on the way.
    pub fn check(&self, user_id: &str) -> Result<(), Duration> {
        let now = Instant::now();
        let Ok(mut counters) = self.counters.lock() else {
            return Ok(());
        };
        counters.retain(|_, w| now.duration_since(w.started) < self.window);
        let window = counters.entry(user_id.to_string()).or_insert(Window {
            started: now,
            count: 0,
        });
        if window.count >= self.limit {
            return Err(self.window - now.duration_since(window.started));
        }
        window.count += 1;
        Ok(())
    }

    #[cfg(test)]
    fn tracked(&self) -> usize {
        self.counters.lock().map(|c| c.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn denies_after_limit_with_retry_hint() {
        let limiter = LegacyLimiter::new(2, Duration::from_secs(100));
        assert!(limiter.check("u1").is_ok());
        assert!(limiter.check("u1").is_ok());

        tokio::time::advance(Duration::from_secs(40)).await;
        assert_eq!(limiter.check("u1"), Err(Duration::from_secs(60)));
        assert!(limiter.check("u2").is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn window_resets() {
        let limiter = LegacyLimiter::new(1, Duration::from_secs(10));
        assert!(limiter.check("u1").is_ok());
        assert!(limiter.check("u1").is_err());

        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(limiter.check("u1").is_ok());
        assert!(limiter.check("u1").is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn expired_users_are_forgotten() {
        let limiter = LegacyLimiter::new(5, Duration::from_secs(10));
        for user in ["a", "b", "c"] {
            limiter.check(user).unwrap();
        }
        assert_eq!(limiter.tracked(), 3);

        tokio::time::advance(Duration::from_secs(6)).await;
        limiter.check("d").unwrap();
        assert_eq!(limiter.tracked(), 4);

        tokio::time::advance(Duration::from_secs(5)).await;
        limiter.check("a").unwrap();
        assert_eq!(limiter.tracked(), 2);
    }
}
