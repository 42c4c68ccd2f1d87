//! Fixed-window rate limiting for auth flows.
//!
//! Counters live behind [`CounterStore`], whose `increment_and_get` is
//! atomic: concurrent attempts on the same key each observe a distinct count,
//! so the limit cannot be overshot by a read-then-write race. The limiter is
//! injected as a dependency; there is no module-level state.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::time::Duration;

const DEFAULT_LIMIT: u32 = 5;
const DEFAULT_WINDOW: Duration = Duration::from_secs(10 * 60);

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RateLimitAction {
    AdminLogin,
    MfaVerify,
}

impl RateLimitAction {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AdminLogin => "admin_login",
            Self::MfaVerify => "mfa_verify",
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct RateLimitConfig {
    limit: u32,
    window: Duration,
}

impl RateLimitConfig {
    #[must_use]
    pub fn new() -> Self {
        Self {
            limit: DEFAULT_LIMIT,
            window: DEFAULT_WINDOW,
        }
    }

    #[must_use]
    pub fn with_limit(mut self, limit: u32) -> Self {
        self.limit = limit;
        self
    }

    #[must_use]
    pub fn with_window(mut self, window: Duration) -> Self {
        self.window = window;
        self
    }

    #[must_use]
    pub fn limit(&self) -> u32 {
        self.limit
    }

    #[must_use]
    pub fn window(&self) -> Duration {
        self.window
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Counter state for one key within its current window.
#[derive(Clone, Copy, Debug)]
pub struct WindowCounter {
    pub count: u32,
    pub window_start: DateTime<Utc>,
}

#[derive(Clone, Copy, Debug)]
pub struct RateLimitStatus {
    pub allowed: bool,
    pub remaining: u32,
    pub reset_at: DateTime<Utc>,
}

#[derive(Debug, thiserror::Error)]
pub enum RateLimitError {
    /// The counter store could not be reached. Admin-login callers must
    /// treat this as a denial, never as an allowance.
    #[error("rate limit store unavailable")]
    Unavailable(#[source] anyhow::Error),
}

/// Atomic attempt counters keyed by `action:subject`.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Atomically bump the counter for `key`, starting a fresh window first
    /// when the previous one has elapsed, and return the resulting state.
    async fn increment_and_get(
        &self,
        key: &str,
        window: Duration,
        now: DateTime<Utc>,
    ) -> Result<WindowCounter>;

    /// Read without mutating. Missing or elapsed records read as a fresh
    /// window with count 0.
    async fn peek(&self, key: &str, window: Duration, now: DateTime<Utc>) -> Result<WindowCounter>;
}

#[derive(Clone)]
pub struct FixedWindowLimiter {
    store: Arc<dyn CounterStore>,
    config: RateLimitConfig,
}

impl FixedWindowLimiter {
    #[must_use]
    pub fn new(store: Arc<dyn CounterStore>, config: RateLimitConfig) -> Self {
        Self { store, config }
    }

    #[must_use]
    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Consume one attempt slot for `(subject, action)`.
    ///
    /// The increment and the comparison happen against the same atomic
    /// result, so at most `limit` concurrent callers see `allowed = true`
    /// per window.
    ///
    /// # Errors
    /// Returns [`RateLimitError::Unavailable`] when the store is unreachable.
    pub async fn acquire(
        &self,
        subject: &str,
        action: RateLimitAction,
    ) -> Result<RateLimitStatus, RateLimitError> {
        let now = Utc::now();
        let counter = self
            .store
            .increment_and_get(&key(subject, action), self.config.window, now)
            .await
            .map_err(RateLimitError::Unavailable)?;
        Ok(self.status(counter, counter.count <= self.config.limit))
    }

    /// Read-only view of the current window; does not consume a slot.
    ///
    /// # Errors
    /// Returns [`RateLimitError::Unavailable`] when the store is unreachable.
    pub async fn check(
        &self,
        subject: &str,
        action: RateLimitAction,
    ) -> Result<RateLimitStatus, RateLimitError> {
        let now = Utc::now();
        let counter = self
            .store
            .peek(&key(subject, action), self.config.window, now)
            .await
            .map_err(RateLimitError::Unavailable)?;
        Ok(self.status(counter, counter.count < self.config.limit))
    }

    fn status(&self, counter: WindowCounter, allowed: bool) -> RateLimitStatus {
        let window = ChronoDuration::from_std(self.config.window)
            .unwrap_or_else(|_| ChronoDuration::zero());
        RateLimitStatus {
            allowed,
            remaining: self.config.limit.saturating_sub(counter.count),
            reset_at: counter.window_start + window,
        }
    }
}

fn key(subject: &str, action: RateLimitAction) -> String {
    format!("{}:{}", action.as_str(), subject)
}
