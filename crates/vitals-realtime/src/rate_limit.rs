//! Sliding-window per-user message budget.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

use crate::config::MIN_PERIOD;

/// Bounds how many messages each user may send per trailing window.
///
/// Windows are pruned lazily on access. Per-user state is created on the
/// first message and kept for the limiter's lifetime.
pub struct RateLimiter {
    limit: usize,
    window: Duration,
    windows: Mutex<HashMap<String, VecDeque<Instant>>>,
}

impl RateLimiter {
    /// Allow `limit` messages per `window` for each user. Both are raised
    /// to their minimum (one message, [`MIN_PERIOD`]) when zero.
    pub fn new(limit: usize, window: Duration) -> Self {
        Self {
            limit: limit.max(1),
            window: window.max(MIN_PERIOD),
            windows: Mutex::new(HashMap::new()),
        }
    }

    /// Record a message for `user_id` if the budget allows it.
    pub fn allow(&self, user_id: &str) -> bool {
        self.allow_at(user_id, Instant::now())
    }

    /// [`allow`](Self::allow) against an explicit clock reading.
    pub fn allow_at(&self, user_id: &str, now: Instant) -> bool {
        let mut windows = self.windows.lock();
        let stamps = windows.entry(user_id.to_owned()).or_default();
        prune(stamps, now, self.window);
        if stamps.len() >= self.limit {
            return false;
        }
        stamps.push_back(now);
        true
    }

    /// Messages `user_id` may still send in the current window.
    pub fn remaining(&self, user_id: &str) -> usize {
        let now = Instant::now();
        let mut windows = self.windows.lock();
        match windows.get_mut(user_id) {
            Some(stamps) => {
                prune(stamps, now, self.window);
                self.limit.saturating_sub(stamps.len())
            }
            None => self.limit,
        }
    }

    /// Users with window state.
    pub fn tracked_users(&self) -> usize {
        self.windows.lock().len()
    }
}

fn prune(stamps: &mut VecDeque<Instant>, now: Instant, window: Duration) {
    while let Some(&oldest) = stamps.front() {
        if now.duration_since(oldest) < window {
            break;
        }
        let _ = stamps.pop_front();
    }
}
