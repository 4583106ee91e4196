//! In-process sliding-window rate limiting.
//!
//! The limiter runs synchronously before any suspension point in the request
//! path, so the store is a plain mutex-guarded map of recent attempt
//! timestamps. An authenticated user is limited by identity rather than by
//! address, which keeps shared networks usable.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Gated action classes with independent limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RateAction {
    Purchase,
    Lookup,
}

impl RateAction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Purchase => "purchase",
            Self::Lookup => "lookup",
        }
    }
}

/// Limiting key: identity when known, source address otherwise.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RateKey {
    User(i64),
    Ip(String),
}

impl RateKey {
    /// Identity takes precedence over IP when both are known.
    pub fn for_request(user_id: Option<i64>, ip_address: &str) -> Self {
        match user_id {
            Some(id) => Self::User(id),
            None => Self::Ip(ip_address.to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    /// Attempt recorded; count includes it.
    Allowed(usize),
    /// Over the limit; the attempt was not recorded.
    Denied(usize),
}

impl RateDecision {
    pub fn is_allowed(self) -> bool {
        matches!(self, Self::Allowed(_))
    }
}

#[derive(Default)]
pub struct RateLimiter {
    buckets: Mutex<HashMap<(RateKey, RateAction), Vec<Instant>>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Prune entries older than `window`, then record-and-allow below
    /// `limit` or deny without recording.
    pub fn check(
        &self,
        key: RateKey,
        action: RateAction,
        limit: usize,
        window: Duration,
    ) -> RateDecision {
        self.check_at(key, action, limit, window, Instant::now())
    }

    fn check_at(
        &self,
        key: RateKey,
        action: RateAction,
        limit: usize,
        window: Duration,
        now: Instant,
    ) -> RateDecision {
        assert!(limit > 0, "Rate limit must be positive");
        assert!(!window.is_zero(), "Rate window must be positive");

        let mut buckets = self.buckets.lock().expect("rate limiter lock poisoned");
        let bucket = buckets.entry((key, action)).or_default();
        bucket.retain(|at| now.duration_since(*at) < window);

        let count = bucket.len();
        if count < limit {
            bucket.push(now);
            RateDecision::Allowed(count + 1)
        } else {
            RateDecision::Denied(count)
        }
    }
}
