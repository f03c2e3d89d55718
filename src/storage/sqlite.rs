//! SQLite storage backend implementation
//!
//! This module provides a SQLite-based implementation of the `StorageBackend` trait.
//!
//! ## Features
//!
//! - **Embedded**: No separate database server required
//! - **WAL mode**: The command line can read history while the ingester writes
//! - **Connection pooling**: Efficient resource usage
//! - **Migrations**: Automatic schema versioning with sqlx
//!
//! Timestamps are stored as `YYYY-MM-DD HH:MM:SS` text, the same layout the
//! collector sends, so range queries and ordering work on the raw column.

use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use chrono::{NaiveDateTime, Utc};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow, SqliteSynchronous,
};
use sqlx::{Pool, Row, Sqlite};
use tracing::{debug, info, instrument, warn};

use super::backend::{HealthStatus, StorageBackend};
use super::error::{StorageError, StorageResult};
use crate::thresholds::{Metric, ThresholdSet};
use crate::{Reading, TIMESTAMP_FORMAT};

/// SQLite storage backend
pub struct SqliteBackend {
    pool: Pool<Sqlite>,
    db_path: String,
}

impl SqliteBackend {
    /// Create a new SQLite backend
    ///
    /// This will:
    /// 1. Create the database file (and its directory) if it doesn't exist
    /// 2. Run migrations to create tables
    /// 3. Configure SQLite for WAL mode
    ///
    /// ## Example
    ///
    /// ```no_run
    /// # use sysmon::storage::sqlite::SqliteBackend;
    /// # async fn example() -> anyhow::Result<()> {
    /// let backend = SqliteBackend::new("data/logs.db").await?;
    /// # Ok(())
    /// # }
    /// ```
    #[instrument(skip_all)]
    pub async fn new(db_path: impl AsRef<Path>) -> StorageResult<Self> {
        let db_path = db_path.as_ref();
        let db_path_str = db_path.to_string_lossy().to_string();

        info!("initializing SQLite backend at: {}", db_path_str);

        if let Some(parent) = db_path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }

        let options = SqliteConnectOptions::new()
            .filename(&db_path_str)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(std::time::Duration::from_secs(30));

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await
            .map_err(|e| StorageError::ConnectionFailed(e.to_string()))?;

        debug!("running database migrations");
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| StorageError::MigrationFailed(e.to_string()))?;

        info!("database migrations complete");

        Ok(Self {
            pool,
            db_path: db_path_str,
        })
    }

    fn format_timestamp(timestamp: &NaiveDateTime) -> String {
        timestamp.format(TIMESTAMP_FORMAT).to_string()
    }

    fn row_to_reading(row: &SqliteRow) -> StorageResult<Reading> {
        let timestamp: String = row.get("timestamp");
        let timestamp = NaiveDateTime::parse_from_str(&timestamp, TIMESTAMP_FORMAT).map_err(|e| {
            StorageError::SerializationError(format!("invalid timestamp {timestamp:?}: {e}"))
        })?;

        Ok(Reading {
            cpu_usage: row.get("cpu_usage"),
            memory_usage: row.get("memory_usage"),
            disk_io: row.get("disk_io"),
            network_usage: row.get("network_usage"),
            timestamp,
        })
    }
}

#[async_trait]
impl StorageBackend for SqliteBackend {
    #[instrument(skip(self, reading), fields(timestamp = %reading.timestamp))]
    async fn insert(&self, reading: &Reading) -> StorageResult<()> {
        sqlx::query(
            r#"
            INSERT INTO readings (timestamp, cpu_usage, memory_usage, disk_io, network_usage)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(Self::format_timestamp(&reading.timestamp))
        .bind(reading.cpu_usage)
        .bind(reading.memory_usage)
        .bind(reading.disk_io)
        .bind(reading.network_usage)
        .execute(&self.pool)
        .await
        .map_err(|e| StorageError::QueryFailed(e.to_string()))?;

        debug!("reading stored");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn latest(&self) -> StorageResult<Option<Reading>> {
        let row = sqlx::query(
            r#"
            SELECT timestamp, cpu_usage, memory_usage, disk_io, network_usage
            FROM readings
            ORDER BY timestamp DESC, id DESC
            LIMIT 1
            "#,
        )
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StorageError::QueryFailed(e.to_string()))?;

        row.as_ref().map(Self::row_to_reading).transpose()
    }

    #[instrument(skip(self))]
    async fn query_range(
        &self,
        start: NaiveDateTime,
        end: NaiveDateTime,
    ) -> StorageResult<Vec<Reading>> {
        debug!("querying readings from {} to {}", start, end);

        let rows = sqlx::query(
            r#"
            SELECT timestamp, cpu_usage, memory_usage, disk_io, network_usage
            FROM readings
            WHERE timestamp >= ? AND timestamp <= ?
            ORDER BY timestamp DESC, id DESC
            "#,
        )
        .bind(Self::format_timestamp(&start))
        .bind(Self::format_timestamp(&end))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StorageError::QueryFailed(e.to_string()))?;

        let results = rows
            .iter()
            .map(Self::row_to_reading)
            .collect::<StorageResult<Vec<_>>>()?;
        debug!("query returned {} readings", results.len());
        Ok(results)
    }

    #[instrument(skip(self))]
    async fn get_thresholds(&self) -> StorageResult<ThresholdSet> {
        let rows = sqlx::query("SELECT name, value FROM thresholds")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StorageError::QueryFailed(e.to_string()))?;

        let thresholds = rows
            .iter()
            .filter_map(|row| {
                let name: String = row.get("name");
                match name.parse::<Metric>() {
                    Ok(metric) => Some((metric, row.get::<f64, _>("value"))),
                    Err(e) => {
                        warn!("ignoring stored threshold: {e}");
                        None
                    }
                }
            })
            .collect();

        Ok(thresholds)
    }

    #[instrument(skip(self))]
    async fn set_threshold(&self, metric: Metric, limit: f64) -> StorageResult<()> {
        sqlx::query(
            r#"
            INSERT INTO thresholds (name, value, updated_at)
            VALUES (?, ?, ?)
            ON CONFLICT (name) DO UPDATE SET
                value = excluded.value,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(metric.name())
        .bind(limit)
        .bind(Utc::now().naive_utc().format(TIMESTAMP_FORMAT).to_string())
        .execute(&self.pool)
        .await
        .map_err(|e| StorageError::QueryFailed(e.to_string()))?;

        info!("threshold {} set to {}", metric, limit);
        Ok(())
    }

    #[instrument(skip(self), fields(before = %before))]
    async fn cleanup_old_readings(&self, before: NaiveDateTime) -> StorageResult<usize> {
        info!("cleaning up readings older than {}", before);

        let result = sqlx::query("DELETE FROM readings WHERE timestamp < ?")
            .bind(Self::format_timestamp(&before))
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::QueryFailed(e.to_string()))?;

        let deleted = result.rows_affected() as usize;
        info!("deleted {} old readings", deleted);

        Ok(deleted)
    }

    #[instrument(skip(self))]
    async fn health_check(&self) -> StorageResult<HealthStatus> {
        match sqlx::query("SELECT 1").fetch_one(&self.pool).await {
            Ok(_) => {
                let mut metadata = HashMap::new();
                metadata.insert("backend".to_string(), "sqlite".to_string());
                metadata.insert("db_path".to_string(), self.db_path.clone());

                Ok(HealthStatus {
                    healthy: true,
                    message: "SQLite backend operational".to_string(),
                    metadata,
                })
            }
            Err(e) => {
                warn!("health check failed: {}", e);
                Ok(HealthStatus {
                    healthy: false,
                    message: format!("health check failed: {}", e),
                    metadata: HashMap::new(),
                })
            }
        }
    }

    #[instrument(skip(self))]
    async fn get_stats(&self) -> StorageResult<String> {
        let (total_rows, oldest, newest): (i64, Option<String>, Option<String>) =
            sqlx::query_as("SELECT COUNT(*), MIN(timestamp), MAX(timestamp) FROM readings")
                .fetch_one(&self.pool)
                .await
                .map_err(|e| StorageError::QueryFailed(e.to_string()))?;

        let file_size = std::fs::metadata(&self.db_path)
            .map(|m| m.len())
            .unwrap_or(0);
        let file_size_mb = file_size as f64 / 1_000_000.0;

        let time_range = match (oldest, newest) {
            (Some(old), Some(new)) => format!("{old} to {new}"),
            _ => "no data".to_string(),
        };

        Ok(format!(
            "SQLite: {} rows, {:.2} MB on disk, time range: {}",
            total_rows, file_size_mb, time_range
        ))
    }

    async fn close(&self) -> StorageResult<()> {
        info!("closing SQLite backend");
        self.pool.close().await;
        Ok(())
    }
}
