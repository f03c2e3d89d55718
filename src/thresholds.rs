//! Threshold evaluation
//!
//! Each reading is compared against the current [`ThresholdSet`], metric by
//! metric. A metric triggers when its value is strictly greater than its
//! limit. The action a breach maps to is fixed policy:
//!
//! | metric          | action  |
//! |-----------------|---------|
//! | `cpu_usage`     | Cleanup |
//! | `memory_usage`  | Alert   |
//! | `disk_io`       | Cleanup |
//! | `network_usage` | Alert   |
//!
//! All four metrics are evaluated every time, so one reading can select the
//! same action twice (e.g. CPU and disk I/O both breaching).

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::Reading;

/// The four monitored metrics, in evaluation order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    CpuUsage,
    MemoryUsage,
    DiskIo,
    NetworkUsage,
}

impl Metric {
    pub const ALL: [Metric; 4] = [
        Metric::CpuUsage,
        Metric::MemoryUsage,
        Metric::DiskIo,
        Metric::NetworkUsage,
    ];

    /// Stable name used as key in the store and in configuration
    pub fn name(self) -> &'static str {
        match self {
            Metric::CpuUsage => "cpu_usage",
            Metric::MemoryUsage => "memory_usage",
            Metric::DiskIo => "disk_io",
            Metric::NetworkUsage => "network_usage",
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            Metric::CpuUsage => "CPU Usage",
            Metric::MemoryUsage => "Memory Usage",
            Metric::DiskIo => "Disk I/O",
            Metric::NetworkUsage => "Network Usage",
        }
    }

    pub fn unit(self) -> &'static str {
        if self.is_percentage() { "%" } else { "MB/s" }
    }

    /// Percentages are bounded to [0, 100], rates only from below.
    pub fn is_percentage(self) -> bool {
        matches!(self, Metric::CpuUsage | Metric::MemoryUsage)
    }

    /// Remediation selected when this metric breaches its limit.
    pub fn action(self) -> Action {
        match self {
            Metric::CpuUsage | Metric::DiskIo => Action::Cleanup,
            Metric::MemoryUsage | Metric::NetworkUsage => Action::Alert,
        }
    }

    /// Default limit seeded into an unconfigured store
    pub fn default_limit(self) -> f64 {
        match self {
            Metric::CpuUsage => 80.0,
            Metric::MemoryUsage => 90.0,
            Metric::DiskIo => 100.0,
            Metric::NetworkUsage => 50.0,
        }
    }

    pub fn value(self, reading: &Reading) -> f64 {
        match self {
            Metric::CpuUsage => reading.cpu_usage,
            Metric::MemoryUsage => reading.memory_usage,
            Metric::DiskIo => reading.disk_io,
            Metric::NetworkUsage => reading.network_usage,
        }
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown metric: {0}")]
pub struct UnknownMetric(pub String);

impl FromStr for Metric {
    type Err = UnknownMetric;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Metric::ALL
            .into_iter()
            .find(|metric| metric.name() == s)
            .ok_or_else(|| UnknownMetric(s.to_string()))
    }
}

/// Remediation category, each bound to one external executable
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Cleanup,
    Alert,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Cleanup => write!(f, "cleanup"),
            Action::Alert => write!(f, "alert"),
        }
    }
}

/// Current per-metric trigger limits
///
/// A metric without a limit never triggers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ThresholdSet {
    limits: BTreeMap<Metric, f64>,
}

impl ThresholdSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_defaults() -> Self {
        Self {
            limits: Metric::ALL
                .into_iter()
                .map(|metric| (metric, metric.default_limit()))
                .collect(),
        }
    }

    /// Fill in the default limit for every metric that has none.
    pub fn merged_with_defaults(mut self) -> Self {
        for metric in Metric::ALL {
            self.limits.entry(metric).or_insert(metric.default_limit());
        }
        self
    }

    pub fn limit(&self, metric: Metric) -> Option<f64> {
        self.limits.get(&metric).copied()
    }

    pub fn set(&mut self, metric: Metric, limit: f64) {
        self.limits.insert(metric, limit);
    }

    pub fn is_empty(&self) -> bool {
        self.limits.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (Metric, f64)> + '_ {
        self.limits.iter().map(|(metric, limit)| (*metric, *limit))
    }
}

impl FromIterator<(Metric, f64)> for ThresholdSet {
    fn from_iter<T: IntoIterator<Item = (Metric, f64)>>(iter: T) -> Self {
        Self {
            limits: iter.into_iter().collect(),
        }
    }
}

/// A single metric breach and the action it selects
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Trigger {
    pub metric: Metric,
    pub action: Action,
    pub value: f64,
    pub limit: f64,
}

/// Compare a reading against the thresholds.
///
/// The result is ordered like [`Metric::ALL`] and contains one entry per
/// breaching metric; actions are not deduplicated.
pub fn evaluate(reading: &Reading, thresholds: &ThresholdSet) -> Vec<Trigger> {
    Metric::ALL
        .into_iter()
        .filter_map(|metric| {
            let limit = thresholds.limit(metric)?;
            let value = metric.value(reading);
            (value > limit).then_some(Trigger {
                metric,
                action: metric.action(),
                value,
                limit,
            })
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum LimitError {
    #[error("please enter a valid number")]
    NotANumber,

    #[error("please enter a valid percentage (0-100)")]
    PercentageOutOfRange,

    #[error("please enter a non-negative rate")]
    NegativeRate,
}

/// Validate a limit for the given metric.
pub fn validate_limit(metric: Metric, limit: f64) -> Result<f64, LimitError> {
    if !limit.is_finite() {
        return Err(LimitError::NotANumber);
    }

    if metric.is_percentage() {
        if !(0.0..=100.0).contains(&limit) {
            return Err(LimitError::PercentageOutOfRange);
        }
    } else if limit < 0.0 {
        return Err(LimitError::NegativeRate);
    }

    Ok(limit)
}

/// Interpret one line of interactive input for a metric limit.
///
/// Blank input keeps `current`.
pub fn parse_limit_input(metric: Metric, input: &str, current: f64) -> Result<f64, LimitError> {
    let input = input.trim();
    if input.is_empty() {
        return Ok(current);
    }

    let limit = input.parse::<f64>().map_err(|_| LimitError::NotANumber)?;
    validate_limit(metric, limit)
}
