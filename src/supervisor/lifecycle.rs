//! The on-disk proof that monitoring is running

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum RecordError {
    #[error("cannot access lifecycle record {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("lifecycle record {} is corrupt: {source}", .path.display())]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Which processes make up the running deployment.
///
/// Existence alone proves nothing: the recorded pids still have to be
/// checked for liveness.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LifecycleRecord {
    pub collector_pid: u32,
    pub ingester_pid: u32,
    pub started_at: DateTime<Utc>,
}

impl LifecycleRecord {
    pub fn new(collector_pid: u32, ingester_pid: u32) -> Self {
        Self {
            collector_pid,
            ingester_pid,
            started_at: Utc::now(),
        }
    }

    pub fn pids(&self) -> [u32; 2] {
        [self.collector_pid, self.ingester_pid]
    }

    /// `Ok(None)` when there is no record.
    pub fn load(path: &Path) -> Result<Option<Self>, RecordError> {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(RecordError::Io {
                    path: path.to_path_buf(),
                    source,
                });
            }
        };

        serde_json::from_str(&content)
            .map(Some)
            .map_err(|source| RecordError::Corrupt {
                path: path.to_path_buf(),
                source,
            })
    }

    /// Write the record next to its final location and rename it into place.
    pub fn save(&self, path: &Path) -> Result<(), RecordError> {
        let io_error = |source| RecordError::Io {
            path: path.to_path_buf(),
            source,
        };

        if let Some(dir) = path.parent()
            && !dir.as_os_str().is_empty()
        {
            std::fs::create_dir_all(dir).map_err(io_error)?;
        }

        let content = serde_json::to_string_pretty(self).map_err(|source| RecordError::Corrupt {
            path: path.to_path_buf(),
            source,
        })?;

        let tmp = temp_path(path);
        std::fs::write(&tmp, content).map_err(io_error)?;
        std::fs::rename(&tmp, path).map_err(io_error)?;

        debug!("wrote lifecycle record {}", path.display());
        Ok(())
    }

    /// Delete the record and any half-written temp file. Returns whether a
    /// record was there.
    pub fn remove(path: &Path) -> Result<bool, RecordError> {
        let _ = std::fs::remove_file(temp_path(path));

        match std::fs::remove_file(path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(source) => Err(RecordError::Io {
                path: path.to_path_buf(),
                source,
            }),
        }
    }
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".tmp");
    path.with_file_name(name)
}
