//! Storage backends for reading persistence
//!
//! This module provides a trait-based abstraction over the store that
//! holds collected readings and the configured thresholds.
//!
//! ## Backends
//!
//! - **SQLite** (default): Embedded database file shared by the ingester
//!   and the command line
//! - **In-Memory** (fallback): No persistence, for tests or automation-only
//!   deployments
//!
//! ## Usage
//!
//! ```no_run
//! use sysmon::storage::{StorageBackend, sqlite::SqliteBackend};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let backend = SqliteBackend::new("data/logs.db").await?;
//!     let latest = backend.latest().await?;
//!     Ok(())
//! }
//! ```

pub mod backend;
pub mod error;
pub mod memory;
#[cfg(feature = "storage-sqlite")]
pub mod sqlite;

pub use backend::{HealthStatus, StorageBackend};
pub use error::{StorageError, StorageResult};

use tracing::error;

use crate::config::StorageConfig;

/// Open the backend selected by the configuration.
pub async fn open_backend(config: &StorageConfig) -> StorageResult<Box<dyn StorageBackend>> {
    match config {
        StorageConfig::None => Ok(Box::new(memory::MemoryBackend::new())),

        #[cfg(feature = "storage-sqlite")]
        StorageConfig::Sqlite { path, .. } => Ok(Box::new(sqlite::SqliteBackend::new(path).await?)),

        #[cfg(not(feature = "storage-sqlite"))]
        StorageConfig::Sqlite { .. } => Err(StorageError::InvalidConfig(
            "SQLite storage requested but the storage-sqlite feature is disabled".to_string(),
        )),
    }
}

/// Like [`open_backend`], but an unusable store degrades to the in-memory
/// backend so evaluation and dispatch keep running without persistence.
pub async fn open_backend_or_memory(config: &StorageConfig) -> Box<dyn StorageBackend> {
    match open_backend(config).await {
        Ok(backend) => backend,
        Err(e) => {
            error!("cannot open storage backend, readings will not be persisted: {e}");
            Box::new(memory::MemoryBackend::new())
        }
    }
}
