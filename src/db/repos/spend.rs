use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::{db::error::DbResult, limiter::UsageWindow, pricing::Money};

/// Durable copy of one caller's accounting window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpendRecord {
    /// Hashed caller identity.
    pub key: String,
    /// Display-safe rendering of the credential; empty when unknown.
    pub masked_key: String,
    pub window_start: DateTime<Utc>,
    pub spent: Money,
    pub last_updated: DateTime<Utc>,
}

impl SpendRecord {
    pub fn new(key: &str, masked_key: &str, window: &UsageWindow) -> Self {
        Self {
            key: key.to_string(),
            masked_key: masked_key.to_string(),
            window_start: window.window_start,
            spent: window.spent,
            last_updated: window.last_updated,
        }
    }

    pub fn window(&self) -> UsageWindow {
        UsageWindow {
            window_start: self.window_start,
            spent: self.spent,
            last_updated: self.last_updated,
        }
    }
}

#[async_trait]
pub trait SpendRepo: Send + Sync {
    /// Records whose window started strictly after `since`.
    async fn load_active(&self, since: DateTime<Utc>) -> DbResult<Vec<SpendRecord>>;

    /// Write the current total for a key, replacing any previous row.
    ///
    /// An empty `masked_key` keeps the previously stored one.
    async fn upsert(&self, record: &SpendRecord) -> DbResult<()>;

    /// Delete records whose window started before `cutoff`. Returns rows deleted.
    async fn delete_started_before(&self, cutoff: DateTime<Utc>) -> DbResult<u64>;

    /// Map of hashed key to masked key for every record that has one.
    async fn masked_keys(&self) -> DbResult<HashMap<String, String>>;

    async fn get(&self, key: &str) -> DbResult<Option<SpendRecord>>;
}
