use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Sliding window in-memory rate limiter (process local).
#[derive(Clone)]
pub struct InMemoryRateLimiter {
    store: Arc<DashMap<String, VecDeque<Instant>>>,
    pub enabled: bool,
}

impl InMemoryRateLimiter {
    pub fn new(enabled: bool) -> Self {
        Self { store: Arc::new(DashMap::new()), enabled }
    }

    /// Returns true if allowed, false if limited.
    pub fn check(&self, key: &str, limit: usize, window: Duration) -> bool {
        if !self.enabled { return true; }
        let now = Instant::now();
        let mut entry = self.store.entry(key.to_string()).or_default();
        while let Some(front) = entry.front() {
            if now.duration_since(*front) >= window { entry.pop_front(); } else { break; }
        }
        if entry.len() < limit {
            entry.push_back(now);
            true
        } else {
            false
        }
    }
}

/// Per-client guard for the web submission form.
#[derive(Clone)]
pub struct SubmissionLimiter {
    limiter: InMemoryRateLimiter,
    limit: usize,
    window: Duration,
}

impl SubmissionLimiter {
    pub fn new(limit: usize, window: Duration) -> Self {
        Self { limiter: InMemoryRateLimiter::new(limit > 0), limit, window }
    }
    pub fn allow(&self, client: &str) -> bool { self.limiter.check(&format!("submit:{client}"), self.limit, self.window) }
}

/// Minimum spacing between publish attempts, shared by every worker.
///
/// The waiting worker sleeps while holding the lock, so workers pass the
/// gate one at a time in arrival order.
pub struct PublishGate {
    last: Mutex<Option<Instant>>,
    interval: Duration,
}

impl PublishGate {
    pub fn new(interval: Duration) -> Self {
        Self { last: Mutex::new(None), interval }
    }

    /// Waits for the next slot. Returns false if `shutdown` fired first.
    pub async fn acquire(&self, shutdown: &CancellationToken) -> bool {
        let mut last = self.last.lock().await;
        if let Some(prev) = *last {
            let ready_at = prev + self.interval;
            tokio::select! {
                _ = shutdown.cancelled() => return false,
                _ = tokio::time::sleep_until(ready_at) => {}
            }
        }
        *last = Some(Instant::now());
        true
    }
}
