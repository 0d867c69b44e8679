//! Per-caller rolling-window spend accounting.
//!
//! Each caller key owns an independent [`UsageWindow`] behind its own mutex, held
//! in a sharded concurrent map. Accounting for one caller never blocks another.
//! The process-wide limit is a single atomic shared by every window.

mod persistent;
mod window;

use std::sync::{
    Arc,
    atomic::{AtomicI64, Ordering},
};

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde::Serialize;

pub use persistent::{PersistentLimiter, RETENTION_HOURS, retention_horizon};
pub use window::{UsageWindow, WINDOW_SECS, window_duration};

use crate::{
    identity::ANONYMOUS,
    pricing::{Money, MoneyError},
};

/// Outcome of an admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpendDecision {
    pub allowed: bool,
    pub spent: Money,
    pub limit: Money,
    /// End of the caller's current window; `None` when the caller is not metered.
    pub window_end: Option<DateTime<Utc>>,
}

impl SpendDecision {
    fn untracked(limit: Money) -> Self {
        Self {
            allowed: true,
            spent: Money::ZERO,
            limit,
            window_end: None,
        }
    }

    /// Whole seconds until the window resets, rounded up.
    pub fn retry_after_secs(&self, now: DateTime<Utc>) -> u64 {
        let Some(end) = self.window_end else {
            return 0;
        };
        let millis = (end - now).num_milliseconds().max(0) as u64;
        millis.div_ceil(1000)
    }
}

/// Point-in-time view of one caller's window, for reporting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UsageSnapshot {
    pub key: String,
    pub spent: Money,
    pub limit: Money,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    /// Allowance left in this window; `Money::DISABLED` when limiting is off.
    pub remaining: Money,
    pub allowed: bool,
}

impl UsageSnapshot {
    fn new(key: &str, window: &UsageWindow, limit: Money) -> Self {
        let (remaining, allowed) = if key.is_empty() || limit.is_negative() {
            (Money::DISABLED, true)
        } else if limit.is_zero() {
            (Money::ZERO, false)
        } else {
            (limit.saturating_sub(window.spent), window.spent < limit)
        };

        Self {
            key: if key.is_empty() {
                ANONYMOUS.to_string()
            } else {
                key.to_string()
            },
            spent: window.spent,
            limit,
            window_start: window.window_start,
            window_end: window.window_end(),
            remaining,
            allowed,
        }
    }
}

#[derive(Debug)]
struct Slot {
    window: UsageWindow,
    /// Set when the slot has been evicted from the map; writers must look it up again.
    retired: bool,
}

type SharedSlot = Arc<Mutex<Slot>>;

/// In-memory spend limiter.
#[derive(Debug)]
pub struct SpendLimiter {
    limit: AtomicI64,
    windows: DashMap<String, SharedSlot>,
}

impl SpendLimiter {
    pub fn new(limit: Money) -> Self {
        Self {
            limit: AtomicI64::new(canonical_limit(limit).nanos()),
            windows: DashMap::new(),
        }
    }

    pub fn limit(&self) -> Money {
        Money::from_nanos(self.limit.load(Ordering::Acquire))
    }

    /// Whether debits are recorded. Only a negative (disabled) limit turns tracking off.
    pub fn is_tracking(&self) -> bool {
        !self.limit().is_negative()
    }

    /// Replace the limit for all callers, returning the previous one.
    ///
    /// Any negative value disables limiting. Spend already recorded is kept.
    pub fn update_limit(&self, limit: Money) -> Money {
        let limit = canonical_limit(limit);
        let previous = Money::from_nanos(self.limit.swap(limit.nanos(), Ordering::AcqRel));
        tracing::info!(
            old_limit = %previous,
            new_limit = %limit,
            disabled = limit.is_negative(),
            "Spend limit updated"
        );
        previous
    }

    pub fn update_limit_from_decimal(&self, usd: Decimal) -> Result<Money, MoneyError> {
        let limit = if usd.is_sign_negative() && !usd.is_zero() {
            Money::DISABLED
        } else {
            Money::from_decimal(usd)?
        };
        Ok(self.update_limit(limit))
    }

    pub fn allow(&self, key: &str) -> SpendDecision {
        self.allow_at(key, Utc::now())
    }

    /// Admission check at `now`. An expired window is reset as part of the check.
    pub fn allow_at(&self, key: &str, now: DateTime<Utc>) -> SpendDecision {
        let limit = self.limit();
        if key.is_empty() || limit.is_negative() {
            return SpendDecision::untracked(limit);
        }
        if limit.is_zero() {
            return SpendDecision {
                allowed: false,
                spent: Money::ZERO,
                limit,
                window_end: Some(now + window_duration()),
            };
        }

        let Some(slot) = self.slot(key) else {
            // Unseen callers have spent nothing; the window opens on first debit.
            return SpendDecision {
                allowed: true,
                spent: Money::ZERO,
                limit,
                window_end: Some(now + window_duration()),
            };
        };

        let mut slot = slot.lock();
        slot.window.refresh(now);
        SpendDecision {
            allowed: slot.window.spent < limit,
            spent: slot.window.spent,
            limit,
            window_end: Some(slot.window.window_end()),
        }
    }

    pub fn add_cost(&self, key: &str, delta: Money) -> Option<UsageWindow> {
        self.add_cost_at(key, delta, Utc::now())
    }

    /// Debit `delta` against `key`'s current window.
    ///
    /// Returns the window after the update, or `None` when nothing was recorded
    /// (non-positive delta, anonymous caller, or limiting disabled).
    pub fn add_cost_at(&self, key: &str, delta: Money, now: DateTime<Utc>) -> Option<UsageWindow> {
        if !delta.is_positive() || key.is_empty() || !self.is_tracking() {
            return None;
        }

        loop {
            let slot = self.slot_or_insert(key, now);
            let mut slot = slot.lock();
            if slot.retired {
                continue;
            }
            slot.window.refresh(now);
            slot.window.spent = slot.window.spent.saturating_add(delta);
            slot.window.last_updated = now;
            return Some(slot.window);
        }
    }

    /// Re-install a window recovered from storage, keeping its original start.
    ///
    /// Intended for startup replay. Expired windows and disabled limiting are ignored.
    pub fn restore_at(&self, key: &str, window: UsageWindow, now: DateTime<Utc>) -> bool {
        if key.is_empty() || !self.is_tracking() || window.is_expired(now) {
            return false;
        }
        let slot = Arc::new(Mutex::new(Slot {
            window,
            retired: false,
        }));
        if let Some(previous) = self.windows.insert(key.to_string(), slot) {
            previous.lock().retired = true;
        }
        true
    }

    pub fn usage(&self, key: &str) -> UsageSnapshot {
        self.usage_at(key, Utc::now())
    }

    /// Current usage for one key, applying the same expiry reset as [`SpendLimiter::allow_at`].
    pub fn usage_at(&self, key: &str, now: DateTime<Utc>) -> UsageSnapshot {
        let limit = self.limit();
        match self.slot(key) {
            Some(slot) => {
                let mut slot = slot.lock();
                slot.window.refresh(now);
                UsageSnapshot::new(key, &slot.window, limit)
            }
            None => UsageSnapshot::new(key, &UsageWindow::new(now), limit),
        }
    }

    pub fn all_usage(&self) -> Vec<UsageSnapshot> {
        self.all_usage_at(Utc::now())
    }

    /// Usage for every tracked key, sorted by key.
    pub fn all_usage_at(&self, now: DateTime<Utc>) -> Vec<UsageSnapshot> {
        let limit = self.limit();
        let slots: Vec<(String, SharedSlot)> = self
            .windows
            .iter()
            .map(|entry| (entry.key().clone(), Arc::clone(entry.value())))
            .collect();

        let mut snapshots: Vec<UsageSnapshot> = slots
            .into_iter()
            .map(|(key, slot)| {
                let mut slot = slot.lock();
                slot.window.refresh(now);
                UsageSnapshot::new(&key, &slot.window, limit)
            })
            .collect();
        snapshots.sort_by(|a, b| a.key.cmp(&b.key));
        snapshots
    }

    /// Drop windows that started more than `horizon` before `now`.
    pub fn evict_stale(&self, now: DateTime<Utc>, horizon: Duration) -> usize {
        let cutoff = now - horizon;
        let stale: Vec<String> = self
            .windows
            .iter()
            .filter(|entry| entry.value().lock().window.window_start < cutoff)
            .map(|entry| entry.key().clone())
            .collect();

        stale
            .iter()
            .filter(|key| {
                self.windows
                    .remove_if(key.as_str(), |_, slot| {
                        let mut slot = slot.lock();
                        let expired = slot.window.window_start < cutoff;
                        if expired {
                            slot.retired = true;
                        }
                        expired
                    })
                    .is_some()
            })
            .count()
    }

    pub fn tracked_keys(&self) -> usize {
        self.windows.len()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.windows.contains_key(key)
    }

    fn slot(&self, key: &str) -> Option<SharedSlot> {
        self.windows.get(key).map(|entry| Arc::clone(entry.value()))
    }

    fn slot_or_insert(&self, key: &str, now: DateTime<Utc>) -> SharedSlot {
        if let Some(slot) = self.slot(key) {
            return slot;
        }
        let entry = self.windows.entry(key.to_string()).or_insert_with(|| {
            Arc::new(Mutex::new(Slot {
                window: UsageWindow::new(now),
                retired: false,
            }))
        });
        Arc::clone(entry.value())
    }
}

fn canonical_limit(limit: Money) -> Money {
    if limit.is_negative() {
        Money::DISABLED
    } else {
        limit
    }
}
