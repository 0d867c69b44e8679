use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use crate::pricing::Money;

/// Length of one accounting window in seconds.
pub const WINDOW_SECS: i64 = 3600;

pub fn window_duration() -> Duration {
    Duration::seconds(WINDOW_SECS)
}

/// Spend accumulated by one caller key in its current window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct UsageWindow {
    pub window_start: DateTime<Utc>,
    pub spent: Money,
    pub last_updated: DateTime<Utc>,
}

impl UsageWindow {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            window_start: now,
            spent: Money::ZERO,
            last_updated: now,
        }
    }

    pub fn window_end(&self) -> DateTime<Utc> {
        self.window_start + window_duration()
    }

    /// A window expires once a full hour has elapsed since it started.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now - self.window_start >= window_duration()
    }

    /// Start a fresh window if this one has expired. Returns whether it reset.
    pub fn refresh(&mut self, now: DateTime<Utc>) -> bool {
        if !self.is_expired(now) {
            return false;
        }
        *self = Self::new(now);
        true
    }
}
