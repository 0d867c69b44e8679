//! Durable spend limiter.
//!
//! Wraps [`SpendLimiter`] with a database copy of every window. Each debit writes
//! the caller's absolute total while holding the store's write lock, so the
//! stored value is never more than one write behind memory. On startup, windows
//! that are still open are replayed into memory.

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use rust_decimal::Decimal;
use tokio::sync::RwLock;

use super::{SpendDecision, SpendLimiter, UsageSnapshot, UsageWindow, window_duration};
use crate::{
    db::{DbPool, DbResult, SpendRecord},
    identity::mask_identity,
    pricing::{Money, MoneyError},
};

/// Default age after which stored windows are purged.
pub const RETENTION_HOURS: i64 = 24;

pub fn retention_horizon() -> Duration {
    Duration::hours(RETENTION_HOURS)
}

pub struct PersistentLimiter {
    limiter: SpendLimiter,
    /// `None` when running without a database, or after [`PersistentLimiter::close`].
    store: RwLock<Option<Arc<DbPool>>>,
    closed: AtomicBool,
    /// Masked credentials seen by this process, used when the store cannot be read.
    masked: DashMap<String, String>,
    retention: Duration,
}

impl PersistentLimiter {
    /// A limiter with no backing store.
    pub fn in_memory(limit: Money) -> Self {
        Self {
            limiter: SpendLimiter::new(limit),
            store: RwLock::new(None),
            closed: AtomicBool::new(false),
            masked: DashMap::new(),
            retention: retention_horizon(),
        }
    }

    pub async fn open(limit: Money, db: Option<Arc<DbPool>>, retention: Duration) -> Self {
        Self::open_at(limit, db, retention, Utc::now()).await
    }

    /// Build the limiter, purge expired rows and replay windows still open at `now`.
    ///
    /// Storage failures are logged and leave the limiter with empty state.
    pub async fn open_at(
        limit: Money,
        db: Option<Arc<DbPool>>,
        retention: Duration,
        now: DateTime<Utc>,
    ) -> Self {
        let this = Self {
            retention,
            ..Self::in_memory(limit)
        };
        let Some(db) = db else {
            tracing::info!("Spend tracking is in memory only; spend resets on restart");
            return this;
        };

        let mut store = this.store.write().await;
        match db
            .spend()
            .delete_started_before(now - this.retention)
            .await
        {
            Ok(deleted) if deleted > 0 => {
                tracing::info!(deleted, "Purged expired spend records");
            }
            Ok(_) => {}
            Err(e) => tracing::warn!(error = %e, "Failed to purge expired spend records"),
        }

        match db.spend().load_active(now - window_duration()).await {
            Ok(records) => {
                let total = records.len();
                let restored = records
                    .into_iter()
                    .filter(|record| this.restore_record(record, now))
                    .count();
                tracing::info!(restored, skipped = total - restored, "Restored spend windows");
            }
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    "Failed to load spend records, starting with empty state"
                );
            }
        }

        *store = Some(db);
        drop(store);
        this
    }

    fn restore_record(&self, record: &SpendRecord, now: DateTime<Utc>) -> bool {
        if !self.limiter.restore_at(&record.key, record.window(), now) {
            return false;
        }
        if !record.masked_key.is_empty() {
            self.masked
                .insert(record.key.clone(), record.masked_key.clone());
        }
        true
    }

    /// The in-memory limiter. Debits must go through this wrapper to be persisted.
    pub fn limiter(&self) -> &SpendLimiter {
        &self.limiter
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn limit(&self) -> Money {
        self.limiter.limit()
    }

    pub fn allow(&self, key: &str) -> SpendDecision {
        self.limiter.allow(key)
    }

    pub fn update_limit(&self, limit: Money) -> Money {
        self.limiter.update_limit(limit)
    }

    pub fn update_limit_from_decimal(&self, usd: Decimal) -> Result<Money, MoneyError> {
        self.limiter.update_limit_from_decimal(usd)
    }

    pub fn usage(&self, key: &str) -> UsageSnapshot {
        self.limiter.usage(key)
    }

    pub async fn add_cost_with_masked_key(
        &self,
        key: &str,
        masked_key: &str,
        delta: Money,
    ) -> Option<UsageWindow> {
        self.add_cost_with_masked_key_at(key, masked_key, delta, Utc::now())
            .await
    }

    /// Debit `delta` and persist the caller's new total.
    ///
    /// A failed write is logged; the in-memory debit stands either way.
    pub async fn add_cost_with_masked_key_at(
        &self,
        key: &str,
        masked_key: &str,
        delta: Money,
        now: DateTime<Utc>,
    ) -> Option<UsageWindow> {
        let store = self.store.write().await;
        let window = self.limiter.add_cost_at(key, delta, now)?;

        if !masked_key.is_empty() {
            self.masked.insert(key.to_string(), masked_key.to_string());
        }

        if let Some(db) = store.as_ref() {
            let record = SpendRecord::new(key, masked_key, &window);
            if let Err(e) = db.spend().upsert(&record).await {
                tracing::warn!(
                    error = %e,
                    masked_key = %masked_key,
                    spent = %window.spent,
                    "Failed to persist spend, continuing with in-memory state"
                );
            }
        }

        Some(window)
    }

    pub async fn usage_with_masked_keys(&self) -> Vec<UsageSnapshot> {
        self.usage_with_masked_keys_at(Utc::now()).await
    }

    /// Usage for every tracked caller, keyed by masked credential instead of hash.
    pub async fn usage_with_masked_keys_at(&self, now: DateTime<Utc>) -> Vec<UsageSnapshot> {
        let store = self.store.read().await;
        let stored = match store.as_ref() {
            Some(db) => db.spend().masked_keys().await.unwrap_or_else(|e| {
                tracing::warn!(error = %e, "Failed to read masked keys from store");
                Default::default()
            }),
            None => Default::default(),
        };
        drop(store);

        self.limiter
            .all_usage_at(now)
            .into_iter()
            .map(|mut snapshot| {
                snapshot.key = stored
                    .get(&snapshot.key)
                    .cloned()
                    .or_else(|| self.masked.get(&snapshot.key).map(|m| m.value().clone()))
                    .unwrap_or_else(|| mask_identity(&snapshot.key));
                snapshot
            })
            .collect()
    }

    /// Masked form of a single hashed key, if one is known.
    pub fn masked_key(&self, key: &str) -> Option<String> {
        self.masked.get(key).map(|m| m.value().clone())
    }

    pub async fn run_cleanup(&self) -> DbResult<u64> {
        self.run_cleanup_at(Utc::now()).await
    }

    /// Purge stored rows and in-memory windows older than the retention horizon.
    ///
    /// Returns the number of stored rows deleted.
    pub async fn run_cleanup_at(&self, now: DateTime<Utc>) -> DbResult<u64> {
        let store = self.store.write().await;

        let evicted = self.limiter.evict_stale(now, self.retention);
        if evicted > 0 {
            self.masked.retain(|key, _| self.limiter.contains(key));
            tracing::debug!(evicted, "Evicted stale in-memory spend windows");
        }

        match store.as_ref() {
            Some(db) => db.spend().delete_started_before(now - self.retention).await,
            None => Ok(0),
        }
    }

    /// Run a final cleanup and release the database. Later calls are no-ops.
    pub async fn close(&self) -> DbResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let mut store = self.store.write().await;
        let Some(db) = store.take() else {
            return Ok(());
        };

        let cleanup = db
            .spend()
            .delete_started_before(Utc::now() - self.retention)
            .await;
        db.close().await;
        tracing::info!("Spend store closed");

        cleanup.map(|_| ())
    }
}
