//! In-memory storage backend (no persistence)
//!
//! This backend stores readings in a bounded buffer in memory.
//! It's useful for:
//! - Testing without database dependencies
//! - Deployments that only want the automation, not the history
//!
//! ## Limitations
//!
//! - **No persistence**: All data lost on restart
//! - **Limited capacity**: oldest readings are evicted once full

use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use chrono::NaiveDateTime;
use tokio::sync::RwLock;
use tracing::debug;

use super::backend::{HealthStatus, StorageBackend};
use super::error::StorageResult;
use crate::Reading;
use crate::thresholds::{Metric, ThresholdSet};

/// Maximum readings to keep in memory
const MAX_READINGS: usize = 10_000;

#[derive(Debug, Default)]
struct Inner {
    /// Readings in insertion order
    readings: VecDeque<Reading>,
    thresholds: ThresholdSet,
}

/// In-memory storage backend
#[derive(Debug, Default)]
pub struct MemoryBackend {
    inner: RwLock<Inner>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of readings currently held
    pub async fn len(&self) -> usize {
        self.inner.read().await.readings.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    async fn insert(&self, reading: &Reading) -> StorageResult<()> {
        let mut inner = self.inner.write().await;
        if inner.readings.len() == MAX_READINGS {
            inner.readings.pop_front();
        }
        inner.readings.push_back(*reading);
        Ok(())
    }

    async fn latest(&self) -> StorageResult<Option<Reading>> {
        let inner = self.inner.read().await;
        Ok(inner.readings.iter().max_by_key(|r| r.timestamp).copied())
    }

    async fn query_range(
        &self,
        start: NaiveDateTime,
        end: NaiveDateTime,
    ) -> StorageResult<Vec<Reading>> {
        debug!("querying in-memory storage from {start} to {end}");

        let inner = self.inner.read().await;
        let mut readings: Vec<Reading> = inner
            .readings
            .iter()
            .filter(|r| r.timestamp >= start && r.timestamp <= end)
            .copied()
            .collect();
        readings.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        Ok(readings)
    }

    async fn get_thresholds(&self) -> StorageResult<ThresholdSet> {
        Ok(self.inner.read().await.thresholds.clone())
    }

    async fn set_threshold(&self, metric: Metric, limit: f64) -> StorageResult<()> {
        self.inner.write().await.thresholds.set(metric, limit);
        Ok(())
    }

    async fn cleanup_old_readings(&self, before: NaiveDateTime) -> StorageResult<usize> {
        let mut inner = self.inner.write().await;
        let count = inner.readings.len();
        inner.readings.retain(|r| r.timestamp >= before);
        Ok(count - inner.readings.len())
    }

    async fn health_check(&self) -> StorageResult<HealthStatus> {
        Ok(HealthStatus {
            healthy: true,
            message: "In-memory storage operational".to_string(),
            metadata: HashMap::from([
                ("backend".to_string(), "memory".to_string()),
                ("total_readings".to_string(), self.len().await.to_string()),
            ]),
        })
    }

    async fn get_stats(&self) -> StorageResult<String> {
        Ok(format!("In-Memory: {} readings", self.len().await))
    }

    async fn close(&self) -> StorageResult<()> {
        debug!("closing in-memory backend (no-op)");
        Ok(())
    }
}
