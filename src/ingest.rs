//! Ingestion loop - turns the collector stream into stored readings
//!
//! One cycle opens a fresh connection to the collector, performs exactly
//! one bounded read, decodes it, persists the reading, evaluates the
//! thresholds and dispatches the triggered actions:
//!
//! ```text
//! Disconnected → Connecting → Connected → Decoding → Persisting → Evaluating → Dispatching
//!      ↑              │ connect failed: sleep backoff          │
//!      └──────────────┴──────────── sleep cycle interval ──────┘
//! ```
//!
//! Nothing on this path is fatal. Connection failures are retried after
//! a backoff, bad records abandon the cycle, and a failed insert is logged
//! while evaluation and dispatch still happen. The connection is owned by a
//! single cycle and closed before the cycle returns, whatever the outcome.
//!
//! The loop has no cancellation signal of its own. It runs until its
//! process is terminated by the supervisor.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Local;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, instrument, trace, warn};

use crate::Reading;
use crate::actions::Dispatch;
use crate::config::IngesterConfig;
use crate::decoder::{self, DecodeError, Decoded};
use crate::storage::StorageBackend;
use crate::thresholds::{self, ThresholdSet, Trigger};

/// How often retention cleanup runs at most
const CLEANUP_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("cannot connect to collector at {address}: {source}")]
    Connect {
        address: String,
        #[source]
        source: std::io::Error,
    },

    #[error("timed out connecting to collector at {address}")]
    ConnectTimeout { address: String },

    #[error("failed to read from collector: {0}")]
    Read(#[source] std::io::Error),

    #[error("timed out waiting for collector data")]
    ReadTimeout,

    #[error("collector closed the connection without sending data")]
    PeerClosed,

    #[error("malformed record: {0}")]
    Decode(#[from] DecodeError),
}

impl IngestError {
    /// Connection failures are retried after the reconnect backoff,
    /// everything else after the regular cycle interval.
    pub fn is_connect(&self) -> bool {
        matches!(
            self,
            IngestError::Connect { .. } | IngestError::ConnectTimeout { .. }
        )
    }
}

/// Result of one successful cycle
#[derive(Debug, Clone)]
pub struct CycleReport {
    pub reading: Reading,

    /// Whether the store accepted the reading
    pub persisted: bool,

    /// Breaches found for this reading, in evaluation order
    pub triggers: Vec<Trigger>,
}

pub struct IngestionLoop {
    /// Collector address (`host:port`)
    address: String,

    config: IngesterConfig,

    backend: Arc<dyn StorageBackend>,

    dispatcher: Arc<dyn Dispatch>,

    /// Last thresholds loaded from the store
    thresholds: ThresholdSet,

    /// Retention window, `None` keeps everything
    retention: Option<chrono::Duration>,

    last_cleanup: Option<Instant>,
}

impl IngestionLoop {
    pub fn new(
        address: impl Into<String>,
        config: IngesterConfig,
        backend: Arc<dyn StorageBackend>,
        dispatcher: Arc<dyn Dispatch>,
    ) -> Self {
        Self {
            address: address.into(),
            config,
            backend,
            dispatcher,
            thresholds: ThresholdSet::with_defaults(),
            retention: None,
            last_cleanup: None,
        }
    }

    /// Delete readings older than `days` once per day.
    pub fn with_retention_days(mut self, days: Option<u32>) -> Self {
        self.retention = days.map(|days| chrono::Duration::days(i64::from(days)));
        self
    }

    /// Run forever.
    #[instrument(skip(self), fields(collector = %self.address))]
    pub async fn run(mut self) {
        info!("starting ingestion loop");

        loop {
            match self.run_cycle().await {
                Ok(report) => {
                    trace!(
                        "cycle complete: persisted={}, triggers={}",
                        report.persisted,
                        report.triggers.len()
                    );
                }
                Err(e) if e.is_connect() => {
                    warn!("{e}");
                    sleep(self.config.reconnect_backoff()).await;
                    continue;
                }
                Err(IngestError::PeerClosed) => {
                    debug!("collector closed the connection without data");
                }
                Err(e) => {
                    error!("cycle abandoned: {e}");
                }
            }

            sleep(self.config.cycle_interval()).await;
        }
    }

    /// Perform exactly one connect → read → decode → persist → evaluate →
    /// dispatch pass.
    #[instrument(skip(self), fields(collector = %self.address))]
    pub async fn run_cycle(&mut self) -> Result<CycleReport, IngestError> {
        let reading = {
            let mut stream = self.connect().await?;
            self.receive(&mut stream).await?
            // stream dropped (and closed) here on every path
        };

        Ok(self.process(reading).await)
    }

    async fn connect(&self) -> Result<TcpStream, IngestError> {
        trace!("connecting to collector");

        match timeout(self.config.connect_timeout(), TcpStream::connect(&self.address)).await {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(source)) => Err(IngestError::Connect {
                address: self.address.clone(),
                source,
            }),
            Err(_) => Err(IngestError::ConnectTimeout {
                address: self.address.clone(),
            }),
        }
    }

    async fn receive(&self, stream: &mut TcpStream) -> Result<Reading, IngestError> {
        let mut buffer = vec![0u8; self.config.read_buffer_bytes.max(1)];

        let read = timeout(self.config.read_timeout(), stream.read(&mut buffer))
            .await
            .map_err(|_| IngestError::ReadTimeout)?
            .map_err(IngestError::Read)?;

        trace!("read {read} bytes");

        match decoder::decode(&buffer[..read])? {
            Decoded::PeerClosed => Err(IngestError::PeerClosed),
            Decoded::Reading(reading) => Ok(reading),
        }
    }

    async fn process(&mut self, reading: Reading) -> CycleReport {
        let persisted = match self.backend.insert(&reading).await {
            Ok(()) => true,
            Err(e) => {
                error!("failed to persist reading: {e}");
                false
            }
        };

        self.refresh_thresholds().await;

        let triggers = thresholds::evaluate(&reading, &self.thresholds);
        for trigger in &triggers {
            warn!(
                "high {} detected: {}{} (limit {}{}), triggering {}",
                trigger.metric.description(),
                trigger.value,
                trigger.metric.unit(),
                trigger.limit,
                trigger.metric.unit(),
                trigger.action
            );
            self.dispatcher.dispatch(trigger);
        }

        self.cleanup_if_due().await;

        CycleReport {
            reading,
            persisted,
            triggers,
        }
    }

    /// Reload the thresholds, keeping the previous set if the store fails.
    async fn refresh_thresholds(&mut self) {
        match self.backend.get_thresholds().await {
            Ok(thresholds) => self.thresholds = thresholds.merged_with_defaults(),
            Err(e) => warn!("cannot load thresholds, keeping previous limits: {e}"),
        }
    }

    async fn cleanup_if_due(&mut self) {
        let Some(retention) = self.retention else {
            return;
        };

        if self
            .last_cleanup
            .is_some_and(|last| last.elapsed() < CLEANUP_INTERVAL)
        {
            return;
        }
        self.last_cleanup = Some(Instant::now());

        let cutoff = Local::now().naive_local() - retention;
        match self.backend.cleanup_old_readings(cutoff).await {
            Ok(deleted) => debug!("retention cleanup removed {deleted} readings"),
            Err(e) => warn!("retention cleanup failed: {e}"),
        }
    }
}
