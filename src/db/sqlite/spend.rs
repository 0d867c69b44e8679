use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};

use crate::{
    db::{
        error::{DbError, DbResult},
        repos::{SpendRecord, SpendRepo},
    },
    pricing::Money,
};

pub struct SqliteSpendRepo {
    pool: SqlitePool,
}

impl SqliteSpendRepo {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn parse_record(row: &sqlx::sqlite::SqliteRow) -> DbResult<SpendRecord> {
        Ok(SpendRecord {
            key: row.get("key"),
            masked_key: row.get("masked_key"),
            window_start: from_epoch(row.get("window_start"))?,
            spent: Money::from_nanos(row.get("spent")),
            last_updated: from_epoch(row.get("last_updated"))?,
        })
    }
}

fn from_epoch(secs: i64) -> DbResult<DateTime<Utc>> {
    DateTime::from_timestamp(secs, 0)
        .ok_or_else(|| DbError::InvalidData(format!("timestamp {secs} out of range")))
}

#[async_trait]
impl SpendRepo for SqliteSpendRepo {
    async fn load_active(&self, since: DateTime<Utc>) -> DbResult<Vec<SpendRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT key, masked_key, window_start, spent, last_updated
            FROM spend_windows
            WHERE window_start > ?
            ORDER BY key
            "#,
        )
        .bind(since.timestamp())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::parse_record).collect()
    }

    async fn upsert(&self, record: &SpendRecord) -> DbResult<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO spend_windows (key, masked_key, window_start, spent, last_updated)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT (key) DO UPDATE SET
                masked_key = CASE
                    WHEN excluded.masked_key != '' THEN excluded.masked_key
                    ELSE spend_windows.masked_key
                END,
                window_start = excluded.window_start,
                spent = excluded.spent,
                last_updated = excluded.last_updated
            "#,
        )
        .bind(&record.key)
        .bind(&record.masked_key)
        .bind(record.window_start.timestamp())
        .bind(record.spent.nanos())
        .bind(record.last_updated.timestamp())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn delete_started_before(&self, cutoff: DateTime<Utc>) -> DbResult<u64> {
        let result = sqlx::query("DELETE FROM spend_windows WHERE window_start < ?")
            .bind(cutoff.timestamp())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn masked_keys(&self) -> DbResult<HashMap<String, String>> {
        let rows = sqlx::query("SELECT key, masked_key FROM spend_windows WHERE masked_key != ''")
            .fetch_all(&self.pool)
            .await?;

        Ok(rows
            .iter()
            .map(|row| (row.get("key"), row.get("masked_key")))
            .collect())
    }

    async fn get(&self, key: &str) -> DbResult<Option<SpendRecord>> {
        let row = sqlx::query(
            r#"
            SELECT key, masked_key, window_start, spent, last_updated
            FROM spend_windows
            WHERE key = ?
            "#,
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::parse_record).transpose()
    }
}
