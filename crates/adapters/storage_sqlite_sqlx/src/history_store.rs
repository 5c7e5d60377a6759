//! `SQLite` implementation of [`HistoryStore`].

use std::collections::BTreeMap;

use sqlx::sqlite::SqliteRow;
use sqlx::{FromRow, Row, SqlitePool};

use rascal_app::ports::{HistoryStore, LatencyHistory};
use rascal_domain::error::RascalError;
use rascal_domain::time::now;

use crate::error::StorageError;

/// One persisted row, keyed by its rendered history key.
struct Wrapper(String, LatencyHistory);

impl<'r> FromRow<'r, SqliteRow> for Wrapper {
    fn from_row(row: &'r SqliteRow) -> Result<Self, sqlx::Error> {
        let key: String = row.try_get("key")?;
        let start_json: String = row.try_get("start_history")?;
        let complete_json: String = row.try_get("complete_history")?;

        let start_history: Vec<f64> =
            serde_json::from_str(&start_json).map_err(|err| sqlx::Error::Decode(Box::new(err)))?;
        let complete_history: Vec<f64> =
            serde_json::from_str(&complete_json).map_err(|err| sqlx::Error::Decode(Box::new(err)))?;

        Ok(Self(
            key,
            LatencyHistory {
                start_history,
                complete_history,
            },
        ))
    }
}

const SELECT_ALL: &str = "SELECT key, start_history, complete_history FROM latency_history";

const UPSERT: &str = r"
    INSERT INTO latency_history (key, start_history, complete_history, updated_at)
    VALUES (?, ?, ?, ?)
    ON CONFLICT(key) DO UPDATE SET
        start_history = excluded.start_history,
        complete_history = excluded.complete_history,
        updated_at = excluded.updated_at
";

/// `SQLite`-backed latency history store.
pub struct SqliteHistoryStore {
    pool: SqlitePool,
}

impl SqliteHistoryStore {
    /// Create a new store using the given connection pool.
    #[must_use]
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

impl HistoryStore for SqliteHistoryStore {
    async fn load(&self) -> Result<BTreeMap<String, LatencyHistory>, RascalError> {
        let rows: Vec<Wrapper> = sqlx::query_as(SELECT_ALL)
            .fetch_all(&self.pool)
            .await
            .map_err(StorageError::from)?;

        tracing::debug!(count = rows.len(), "latency histories loaded");
        Ok(rows.into_iter().map(|Wrapper(key, history)| (key, history)).collect())
    }

    async fn save(&self, histories: &BTreeMap<String, LatencyHistory>) -> Result<(), RascalError> {
        let updated_at = now().to_rfc3339();
        let mut tx = self.pool.begin().await.map_err(StorageError::from)?;

        for (key, history) in histories {
            let start_json = serde_json::to_string(&history.start_history).map_err(StorageError::from)?;
            let complete_json = serde_json::to_string(&history.complete_history).map_err(StorageError::from)?;

            sqlx::query(UPSERT)
                .bind(key)
                .bind(&start_json)
                .bind(&complete_json)
                .bind(&updated_at)
                .execute(&mut *tx)
                .await
                .map_err(StorageError::from)?;
        }

        tx.commit().await.map_err(StorageError::from)?;
        tracing::debug!(count = histories.len(), "latency histories saved");
        Ok(())
    }
}
