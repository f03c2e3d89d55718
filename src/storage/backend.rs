//! Storage backend trait definition
//!
//! This module defines the core `StorageBackend` trait that all
//! storage implementations must implement.

use async_trait::async_trait;
use chrono::NaiveDateTime;

use super::error::StorageResult;
use crate::Reading;
use crate::thresholds::{Metric, ThresholdSet};

/// Health status of the storage backend
#[derive(Debug, Clone)]
pub struct HealthStatus {
    /// Is the backend operational?
    pub healthy: bool,

    /// Human-readable status message
    pub message: String,

    /// Additional backend-specific metadata
    pub metadata: std::collections::HashMap<String, String>,
}

/// Trait for persistent storage backends
///
/// The ingester writes one reading per cycle and reads the thresholds
/// once per cycle; the command line reads history and updates limits.
///
/// ## Thread Safety
///
/// Implementations must be `Send + Sync` as they will be used
/// across async tasks.
///
/// ## Error Handling
///
/// Methods return `StorageResult<T>` which wraps `StorageError`.
/// Implementations should convert backend-specific errors to
/// `StorageError` variants.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Persist one reading
    async fn insert(&self, reading: &Reading) -> StorageResult<()>;

    /// The most recent reading by timestamp, if any
    async fn latest(&self) -> StorageResult<Option<Reading>>;

    /// Readings with `start <= timestamp <= end`, newest first
    async fn query_range(
        &self,
        start: NaiveDateTime,
        end: NaiveDateTime,
    ) -> StorageResult<Vec<Reading>>;

    /// The configured limits; empty when nothing was ever configured
    async fn get_thresholds(&self) -> StorageResult<ThresholdSet>;

    /// Persist one limit, replacing any previous value
    async fn set_threshold(&self, metric: Metric, limit: f64) -> StorageResult<()>;

    /// Store the default limit for every metric that has none.
    ///
    /// Returns the resulting (complete) set.
    async fn seed_default_thresholds(&self) -> StorageResult<ThresholdSet> {
        let current = self.get_thresholds().await?;
        for metric in crate::thresholds::Metric::ALL {
            if current.limit(metric).is_none() {
                self.set_threshold(metric, metric.default_limit()).await?;
            }
        }
        Ok(current.merged_with_defaults())
    }

    /// Delete readings older than `before`
    ///
    /// Used for retention policy enforcement.
    /// Returns the number of readings deleted.
    async fn cleanup_old_readings(&self, before: NaiveDateTime) -> StorageResult<usize>;

    /// Check backend health
    ///
    /// Performs a lightweight operation to verify the backend
    /// is operational (e.g., ping database, check file access).
    async fn health_check(&self) -> StorageResult<HealthStatus>;

    /// Get backend-specific statistics
    ///
    /// Returns human-readable stats about the backend
    /// (e.g., "SQLite: 12000 rows, 1.20 MB on disk").
    async fn get_stats(&self) -> StorageResult<String>;

    /// Close the backend and release resources
    async fn close(&self) -> StorageResult<()>;
}
