//! Fixed-window request rate limiting.
//!
//! Counters live behind the [`CounterStore`] trait. [`InMemoryCounterStore`]
//! is only correct for a single process; deployments running several
//! instances need a shared store implementing the same trait, otherwise each
//! instance enforces its own budget.
//!
//! Expired windows are removed by a [`Sweeper`] task owned by the caller
//! rather than by an ambient timer.

pub mod memory;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::jobs::WorkerHandle;

pub use memory::InMemoryCounterStore;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("rate limit store unavailable: {0}")]
pub struct RateLimitError(pub String);

/// Hits recorded for one key in its current window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowCount {
    pub count: u32,
    pub reset_at: DateTime<Utc>,
}

#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Record one hit for `key`, opening a new window of length `window` if
    /// the previous one ended at or before `now`.
    async fn hit(&self, key: &str, window: Duration, now: DateTime<Utc>) -> Result<WindowCount, RateLimitError>;

    /// Drop windows that ended at or before `now`. Returns how many were removed.
    async fn sweep(&self, now: DateTime<Utc>) -> Result<usize, RateLimitError>;
}

/// Where the HTTP gate takes a client's key from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ClientKeySource {
    /// The TCP peer address.
    #[default]
    PeerAddress,
    /// The first `X-Forwarded-For` entry, else the peer address. Only sound
    /// behind a proxy that overwrites the header.
    ForwardedFor,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitConfig {
    pub window: Duration,
    pub max: u32,
    /// Shown to clients that hit the limit.
    pub message: String,
    pub key_source: ClientKeySource,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(15 * 60),
            max: 20,
            message: "too many requests, please try again later".to_string(),
            key_source: ClientKeySource::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub limit: u32,
    pub remaining: u32,
    pub reset_at: DateTime<Utc>,
    /// Whole seconds until the window resets; at least 1 when rejected.
    pub retry_after_secs: u64,
}

#[derive(Clone)]
pub struct RateLimiter {
    store: Arc<dyn CounterStore>,
    config: RateLimitConfig,
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl RateLimiter {
    pub fn new(store: Arc<dyn CounterStore>, config: RateLimitConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    pub async fn check(&self, key: &str) -> Result<RateLimitDecision, RateLimitError> {
        self.check_at(key, Utc::now()).await
    }

    pub async fn check_at(&self, key: &str, now: DateTime<Utc>) -> Result<RateLimitDecision, RateLimitError> {
        let hit = self.store.hit(key, self.config.window, now).await?;
        let allowed = hit.count <= self.config.max;
        let until_reset = (hit.reset_at - now).num_milliseconds().max(0) as u64;
        let retry_after_secs = until_reset.div_ceil(1000);

        Ok(RateLimitDecision {
            allowed,
            limit: self.config.max,
            remaining: self.config.max.saturating_sub(hit.count),
            reset_at: hit.reset_at,
            retry_after_secs: if allowed { retry_after_secs } else { retry_after_secs.max(1) },
        })
    }
}

/// Periodic removal of expired windows.
#[derive(Debug)]
pub struct Sweeper;

impl Sweeper {
    pub fn spawn(store: Arc<dyn CounterStore>, interval: Duration) -> WorkerHandle {
        WorkerHandle::periodic("rate-limit-sweeper", interval, move || {
            let store = store.clone();
            async move {
                let removed = store.sweep(Utc::now()).await?;
                if removed > 0 {
                    tracing::debug!(removed, "expired rate limit windows swept");
                }
                Ok::<_, RateLimitError>(())
            }
        })
    }
}
