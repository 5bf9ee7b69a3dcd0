//! `PostgreSQL` record-store implementation for the ordlog engine.
//!
//! This crate provides [`PostgresRecordStore`], a production implementation
//! of [`ordlog_core::store::RecordStore`] backed by `sqlx`. It provides:
//!
//! - Linearizable per-topic id allocation via an upsert-on-missing counter
//!   table.
//! - Durable message inserts.
//! - Ascending, server-sorted range fetches.
//!
//! # Example
//!
//! ```no_run
//! use ordlog_postgres::PostgresRecordStore;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let store = PostgresRecordStore::connect("postgres://localhost/ordlog").await?;
//! store.migrate().await?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used))]

use chrono::{DateTime, Utc};
use ordlog_core::config::TopicConfig;
use ordlog_core::record::{LogCompactId, Record, RecordId, ShardingKey, TopicName};
use ordlog_core::store::{RecordStore, RecordStoreError};
use sqlx::{PgPool, Row};
use std::future::Future;
use std::pin::Pin;

/// `PostgreSQL`-backed [`RecordStore`].
///
/// # Schema
///
/// Two tables, created by [`PostgresRecordStore::migrate`]:
///
/// - `topic_counters(topic_name PRIMARY KEY, value)`: the linearized
///   per-topic sequence counter.
/// - `topic_messages(topic_name, id, created_at, sharding_key,
///   log_compact_id, payload)`, primary keyed on `(topic_name, id)`.
#[derive(Clone)]
pub struct PostgresRecordStore {
    pool: PgPool,
}

impl PostgresRecordStore {
    /// Connect to `PostgreSQL` using the given connection string.
    ///
    /// # Errors
    ///
    /// Returns [`RecordStoreError::AllocFailed`]-shaped errors are not
    /// returned here; connection failures surface as
    /// [`sqlx::Error`] wrapped in a boxed error, since this is a
    /// construction-time concern outside the `RecordStore` contract.
    pub async fn connect(connection_string: &str) -> Result<Self, sqlx::Error> {
        let pool = PgPool::connect(connection_string).await?;
        tracing::info!("connected to PostgreSQL record store");
        Ok(Self { pool })
    }

    /// Wrap an existing connection pool.
    #[must_use]
    pub const fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect using a [`TopicConfig`]'s `store_connection_string` and
    /// `store_database`.
    ///
    /// # Errors
    ///
    /// See [`PostgresRecordStore::connect`].
    pub async fn connect_with_config(config: &TopicConfig) -> Result<Self, sqlx::Error> {
        Self::connect(&config.store_url()).await
    }

    /// Run the embedded migrations, creating `topic_counters` and
    /// `topic_messages` if they do not already exist.
    ///
    /// # Errors
    ///
    /// Returns [`sqlx::migrate::MigrateError`] if a migration fails.
    pub async fn migrate(&self) -> Result<(), sqlx::migrate::MigrateError> {
        sqlx::migrate!("./migrations").run(&self.pool).await
    }

    fn row_to_record(topic: &str, row: &sqlx::postgres::PgRow) -> Result<Record, RecordStoreError> {
        let id: i64 = row.try_get("id").map_err(|e| RecordStoreError::FetchFailed {
            topic: topic.to_string(),
            reason: e.to_string(),
        })?;
        let created_at: DateTime<Utc> =
            row.try_get("created_at").map_err(|e| RecordStoreError::FetchFailed {
                topic: topic.to_string(),
                reason: e.to_string(),
            })?;
        let sharding_key: String =
            row.try_get("sharding_key").map_err(|e| RecordStoreError::FetchFailed {
                topic: topic.to_string(),
                reason: e.to_string(),
            })?;
        let log_compact_id: Option<String> =
            row.try_get("log_compact_id").map_err(|e| RecordStoreError::FetchFailed {
                topic: topic.to_string(),
                reason: e.to_string(),
            })?;
        let payload: serde_json::Value =
            row.try_get("payload").map_err(|e| RecordStoreError::FetchFailed {
                topic: topic.to_string(),
                reason: e.to_string(),
            })?;

        let sharding_key = ShardingKey::new(sharding_key).map_err(|_| RecordStoreError::FetchFailed {
            topic: topic.to_string(),
            reason: "stored record has an empty sharding key".to_string(),
        })?;

        #[allow(clippy::cast_sign_loss)] // ids are allocated starting at 1, never negative
        Ok(Record {
            id: RecordId::new(id as u64),
            created_at,
            sharding_key,
            log_compact_id: log_compact_id.map(LogCompactId::new),
            payload,
        })
    }
}

impl RecordStore for PostgresRecordStore {
    fn allocate_next_id(
        &self,
        topic: &TopicName,
    ) -> Pin<Box<dyn Future<Output = Result<RecordId, RecordStoreError>> + Send + '_>> {
        let topic = topic.clone();
        Box::pin(async move {
            let row: (i64,) = sqlx::query_as(
                r"
                INSERT INTO topic_counters (topic_name, value)
                VALUES ($1, 1)
                ON CONFLICT (topic_name)
                DO UPDATE SET value = topic_counters.value + 1
                RETURNING value
                ",
            )
            .bind(topic.as_str())
            .fetch_one(&self.pool)
            .await
            .map_err(|e| RecordStoreError::AllocFailed {
                topic: topic.to_string(),
                reason: e.to_string(),
            })?;

            #[allow(clippy::cast_sign_loss)] // counter values are always positive
            let id = RecordId::new(row.0 as u64);

            tracing::debug!(topic = %topic, id = %id, "allocated next id");
            Ok(id)
        })
    }

    fn insert(
        &self,
        topic: &TopicName,
        record: Record,
    ) -> Pin<Box<dyn Future<Output = Result<(), RecordStoreError>> + Send + '_>> {
        let topic = topic.clone();
        Box::pin(async move {
            #[allow(clippy::cast_possible_wrap)] // ids fit comfortably in i64 in practice
            let id = record.id.value() as i64;

            let result = sqlx::query(
                r"
                INSERT INTO topic_messages (
                    topic_name, id, created_at, sharding_key, log_compact_id, payload
                ) VALUES ($1, $2, $3, $4, $5, $6)
                ",
            )
            .bind(topic.as_str())
            .bind(id)
            .bind(record.created_at)
            .bind(record.sharding_key.as_str())
            .bind(record.log_compact_id.as_ref().map(LogCompactId::as_str))
            .bind(&record.payload)
            .execute(&self.pool)
            .await
            .map_err(|e| RecordStoreError::InsertNotAcknowledged {
                topic: topic.to_string(),
                id: record.id,
                reason: e.to_string(),
            })?;

            if result.rows_affected() != 1 {
                return Err(RecordStoreError::InsertNotAcknowledged {
                    topic: topic.to_string(),
                    id: record.id,
                    reason: "insert affected zero rows".to_string(),
                });
            }

            tracing::debug!(topic = %topic, id = %record.id, "inserted record");
            Ok(())
        })
    }

    fn fetch_after(
        &self,
        topic: &TopicName,
        after_id: Option<RecordId>,
        limit: usize,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<Record>, RecordStoreError>> + Send + '_>> {
        let topic = topic.clone();
        Box::pin(async move {
            #[allow(clippy::cast_possible_wrap)]
            let after: i64 = after_id.map_or(-1, |id| id.value() as i64);
            #[allow(clippy::cast_possible_wrap)]
            let limit = limit as i64;

            let rows = sqlx::query(
                r"
                SELECT id, created_at, sharding_key, log_compact_id, payload
                FROM topic_messages
                WHERE topic_name = $1 AND id > $2
                ORDER BY id ASC
                LIMIT $3
                ",
            )
            .bind(topic.as_str())
            .bind(after)
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| RecordStoreError::FetchFailed {
                topic: topic.to_string(),
                reason: e.to_string(),
            })?;

            rows.iter()
                .map(|row| Self::row_to_record(topic.as_str(), row))
                .collect()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_store_is_send_sync() {
        fn assert_send<T: Send>() {}
        fn assert_sync<T: Sync>() {}

        assert_send::<PostgresRecordStore>();
        assert_sync::<PostgresRecordStore>();
    }
}
