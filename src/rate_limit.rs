use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use tokio::sync::Mutex;

pub const RATE_WINDOW: Duration = Duration::from_secs(60);

/// Who is asking. The host fills in whatever its chat event exposes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallerIdentity {
    pub group_id: Option<String>,
    pub session_id: Option<String>,
    pub sender_id: Option<String>,
}

impl CallerIdentity {
    /// Group beats session beats sender.
    pub fn rate_key(&self) -> String {
        fn non_blank(value: &Option<String>) -> Option<&str> {
            value.as_deref().map(str::trim).filter(|v| !v.is_empty())
        }

        if let Some(group) = non_blank(&self.group_id) {
            return format!("group:{group}");
        }
        if let Some(session) = non_blank(&self.session_id) {
            return format!("session:{session}");
        }
        format!("private:{}", non_blank(&self.sender_id).unwrap_or("unknown"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateDecision {
    pub allowed: bool,
    /// Seconds until the oldest call in the window expires; 0 when allowed.
    pub wait_secs: u64,
    /// Calls left in the window after this one; -1 when unlimited.
    pub remaining: i64,
}

impl RateDecision {
    pub fn denial_message(&self, limit: i64) -> String {
        format!(
            "Rate limited: at most {limit} calls per minute here, please retry in {} seconds.",
            self.wait_secs
        )
    }
}

/// Sliding one-minute window per rate key.
#[derive(Debug)]
pub struct RateLimiter {
    limit: i64,
    state: Mutex<RateState>,
}

#[derive(Debug, Default)]
struct RateState {
    buckets: HashMap<String, VecDeque<Instant>>,
    last_gc: Option<Instant>,
}

impl RateState {
    /// Drops keys whose newest call has left the window, at most once per window.
    fn collect_idle(&mut self, now: Instant) {
        if self
            .last_gc
            .is_some_and(|last| now.saturating_duration_since(last) < RATE_WINDOW)
        {
            return;
        }
        self.buckets.retain(|_, bucket| {
            bucket
                .back()
                .is_some_and(|newest| now.saturating_duration_since(*newest) < RATE_WINDOW)
        });
        self.last_gc = Some(now);
    }
}

impl RateLimiter {
    /// `limit <= 0` disables limiting.
    pub fn new(limit: i64) -> Self {
        Self {
            limit,
            state: Mutex::new(RateState::default()),
        }
    }

    pub fn limit(&self) -> i64 {
        self.limit
    }

    pub async fn try_acquire(&self, key: &str) -> RateDecision {
        self.try_acquire_at(key, Instant::now()).await
    }

    pub async fn try_acquire_at(&self, key: &str, now: Instant) -> RateDecision {
        if self.limit <= 0 {
            return RateDecision {
                allowed: true,
                wait_secs: 0,
                remaining: -1,
            };
        }

        let mut state = self.state.lock().await;
        state.collect_idle(now);
        let bucket = state.buckets.entry(key.to_string()).or_default();
        while let Some(oldest) = bucket.front() {
            if now.saturating_duration_since(*oldest) >= RATE_WINDOW {
                bucket.pop_front();
            } else {
                break;
            }
        }

        let limit = usize::try_from(self.limit).unwrap_or(usize::MAX);
        if bucket.len() >= limit {
            let wait_secs = bucket
                .front()
                .map(|oldest| {
                    let left = RATE_WINDOW.saturating_sub(now.saturating_duration_since(*oldest));
                    left.as_secs_f64().ceil() as u64
                })
                .unwrap_or(0)
                .max(1);
            tracing::debug!(key, wait_secs, "rate limit window full");
            return RateDecision {
                allowed: false,
                wait_secs,
                remaining: 0,
            };
        }

        bucket.push_back(now);
        RateDecision {
            allowed: true,
            wait_secs: 0,
            remaining: (self.limit - bucket.len() as i64).max(0),
        }
    }

    /// Number of rate keys currently holding call history.
    pub async fn tracked_keys(&self) -> usize {
        self.state.lock().await.buckets.len()
    }
}
