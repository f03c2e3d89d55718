pub mod actions;
pub mod config;
pub mod decoder;
pub mod ingest;
pub mod storage;
pub mod supervisor;
pub mod thresholds;
pub mod util;

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

/// Timestamp layout used on the wire and in the store.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// One validated snapshot of the four monitored metrics.
///
/// Percentages (`cpu_usage`, `memory_usage`) and rates in MB/s (`disk_io`,
/// `network_usage`) are always finite and non-negative; the decoder refuses
/// anything else.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    pub cpu_usage: f64,
    pub memory_usage: f64,
    pub disk_io: f64,
    pub network_usage: f64,
    pub timestamp: NaiveDateTime,
}

impl Reading {
    /// Encode the reading in the collector wire format
    /// (`cpu,memory,disk_io,network,YYYY-MM-DD HH:MM:SS`).
    pub fn to_record(&self) -> String {
        format!(
            "{},{},{},{},{}",
            self.cpu_usage,
            self.memory_usage,
            self.disk_io,
            self.network_usage,
            self.timestamp.format(TIMESTAMP_FORMAT)
        )
    }
}
