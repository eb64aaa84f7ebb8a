use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{CounterStore, RateLimitError, WindowCount};

/// Single-process counter store.
#[derive(Debug, Default)]
pub struct InMemoryCounterStore {
    windows: Mutex<HashMap<String, WindowCount>>,
}

impl InMemoryCounterStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.windows.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl CounterStore for InMemoryCounterStore {
    async fn hit(&self, key: &str, window: Duration, now: DateTime<Utc>) -> Result<WindowCount, RateLimitError> {
        let window = chrono::Duration::from_std(window).map_err(|e| RateLimitError(e.to_string()))?;
        let mut windows = self.windows.lock().unwrap_or_else(PoisonError::into_inner);

        let entry = windows.entry(key.to_string()).or_insert(WindowCount {
            count: 0,
            reset_at: now + window,
        });
        if entry.reset_at <= now {
            entry.count = 0;
            entry.reset_at = now + window;
        }
        entry.count = entry.count.saturating_add(1);
        Ok(*entry)
    }

    async fn sweep(&self, now: DateTime<Utc>) -> Result<usize, RateLimitError> {
        let mut windows = self.windows.lock().unwrap_or_else(PoisonError::into_inner);
        let before = windows.len();
        windows.retain(|_, w| w.reset_at > now);
        Ok(before - windows.len())
    }
}
