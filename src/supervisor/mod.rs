//! Lifecycle management of the collector/ingester pair
//!
//! The supervisor owns three pieces of shared state: the two processes,
//! the [`LifecycleRecord`] naming them, and the collector's port. Every
//! operation starts from a fresh look at the host process list; the record
//! is never trusted on its own.
//!
//! Operations are not safe to run concurrently against the same data
//! directory. Callers serialize them (the `sysmon` binary runs exactly one
//! per invocation).

pub mod lifecycle;
pub mod port;
pub mod process;

use std::collections::HashSet;
use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use tokio::time::sleep;
use tracing::{debug, info, instrument, warn};

use crate::config::{CommandSpec, Config, SupervisorConfig};

pub use lifecycle::{LifecycleRecord, RecordError};
pub use port::PortState;
pub use process::{ProcessInfo, ProcessTable, Spawner, SystemProcessTable, TokioSpawner};

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("port {addr} is still in use by another process")]
    PortConflict { addr: SocketAddr },

    #[error("collector (pid {pid}) exited during startup, see {}", .log.display())]
    CollectorStartFailed { pid: u32, log: PathBuf },

    #[error("ingester (pid {pid}) exited during startup, see {}", .log.display())]
    IngesterStartFailed { pid: u32, log: PathBuf },

    #[error("port {addr} was not released within {timeout:?}")]
    ReconcileTimeout { addr: SocketAddr, timeout: Duration },

    #[error("cannot spawn {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot resolve collector address {address}: {source}")]
    Resolve {
        address: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Record(#[from] RecordError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Running,
    Stopped,
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunState::Running => write!(f, "running"),
            RunState::Stopped => write!(f, "stopped"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusReport {
    pub state: RunState,
    /// The record as found on disk, even when it is stale
    pub record: Option<LifecycleRecord>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartOutcome {
    Started(LifecycleRecord),
    AlreadyRunning(LifecycleRecord),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopOutcome {
    Stopped {
        record: Option<LifecycleRecord>,
        /// Every pid that was signalled, recorded trees and strays
        killed: Vec<u32>,
    },
    NotRunning,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Pids of stray processes (and their descendants) that were signalled
    pub killed: Vec<u32>,
    pub removed_record: bool,
    pub port: PortState,
}

pub struct Supervisor<P, S> {
    config: SupervisorConfig,
    collector: CommandSpec,
    ingester: CommandSpec,
    addr: SocketAddr,
    table: P,
    spawner: S,
    own_pid: u32,
}

impl<P: ProcessTable, S: Spawner> Supervisor<P, S> {
    pub fn new(config: &Config, table: P, spawner: S) -> Result<Self, SupervisorError> {
        let addr = config
            .collector
            .socket_addr()
            .map_err(|source| SupervisorError::Resolve {
                address: config.collector.address(),
                source,
            })?;

        Ok(Self {
            config: config.supervisor.clone(),
            collector: config.collector.command.clone(),
            ingester: config.ingester.command.clone(),
            addr,
            table,
            spawner,
            own_pid: std::process::id(),
        })
    }

    pub fn record_path(&self) -> PathBuf {
        self.config.record_path()
    }

    pub fn collector_log(&self) -> PathBuf {
        self.config.data_dir.join("collector.log")
    }

    pub fn ingester_log(&self) -> PathBuf {
        self.config.data_dir.join("ingester.log")
    }

    /// Running iff the record exists and both recorded processes are alive,
    /// not zombies and still running the collector and ingester commands.
    #[instrument(skip(self))]
    pub fn status(&mut self) -> Result<StatusReport, SupervisorError> {
        let record = match LifecycleRecord::load(&self.record_path()) {
            Ok(record) => record,
            Err(e @ RecordError::Corrupt { .. }) => {
                warn!("{e}");
                None
            }
            Err(e) => return Err(e.into()),
        };

        self.table.refresh();
        let state = match &record {
            Some(record) if self.is_live(record) => RunState::Running,
            _ => RunState::Stopped,
        };

        debug!("status: {state}");
        Ok(StatusReport { state, record })
    }

    #[instrument(skip(self))]
    pub async fn start(&mut self) -> Result<StartOutcome, SupervisorError> {
        let status = self.status()?;
        if status.state == RunState::Running
            && let Some(record) = status.record
        {
            info!(
                "already running (collector {}, ingester {})",
                record.collector_pid, record.ingester_pid
            );
            return Ok(StartOutcome::AlreadyRunning(record));
        }

        let report = self.sweep().await?;
        if report.port == PortState::StillBound {
            return Err(SupervisorError::PortConflict { addr: self.addr });
        }

        let collector_log = self.collector_log();
        let collector_pid = self.spawn(&self.collector, &collector_log)?;
        info!("started collector as {collector_pid}");

        sleep(self.config.grace()).await;
        self.table.refresh();
        if !self.table.is_alive(collector_pid) {
            self.rollback(&[collector_pid]).await;
            return Err(SupervisorError::CollectorStartFailed {
                pid: collector_pid,
                log: collector_log,
            });
        }

        let ingester_log = self.ingester_log();
        let ingester_pid = match self.spawn(&self.ingester, &ingester_log) {
            Ok(pid) => pid,
            Err(e) => {
                self.rollback(&[collector_pid]).await;
                return Err(e);
            }
        };
        info!("started ingester as {ingester_pid}");

        sleep(self.config.grace()).await;
        self.table.refresh();
        if !self.table.is_alive(ingester_pid) {
            self.rollback(&[ingester_pid, collector_pid]).await;
            return Err(SupervisorError::IngesterStartFailed {
                pid: ingester_pid,
                log: ingester_log,
            });
        }

        let record = LifecycleRecord::new(collector_pid, ingester_pid);
        if let Err(e) = record.save(&self.record_path()) {
            self.rollback(&[ingester_pid, collector_pid]).await;
            return Err(e.into());
        }

        Ok(StartOutcome::Started(record))
    }

    #[instrument(skip(self))]
    pub async fn stop(&mut self) -> Result<StopOutcome, SupervisorError> {
        let record = match LifecycleRecord::load(&self.record_path()) {
            Ok(Some(record)) => Some(record),
            Ok(None) => {
                info!("not running");
                return Ok(StopOutcome::NotRunning);
            }
            Err(e @ RecordError::Corrupt { .. }) => {
                warn!("{e}, sweeping by identity only");
                None
            }
            Err(e) => return Err(e.into()),
        };

        let mut killed = Vec::new();
        if let Some(record) = &record {
            self.table.refresh();
            for pid in self.owned_pids(record) {
                killed.extend(process::terminate_tree(&mut self.table, pid, self.config.grace()).await);
            }
        }
        LifecycleRecord::remove(&self.record_path())?;

        let report = self.sweep().await?;
        killed.extend(report.killed);

        if report.port == PortState::StillBound {
            return Err(SupervisorError::ReconcileTimeout {
                addr: self.addr,
                timeout: self.config.port_timeout(),
            });
        }

        info!("stopped, {} processes signalled", killed.len());
        Ok(StopOutcome::Stopped { record, killed })
    }

    /// Repair pass: kill strays matching the collector or ingester command,
    /// drop a stale record and wait for the collector port to be released.
    ///
    /// A live deployment and its process trees are left alone.
    #[instrument(skip(self))]
    pub async fn reconcile(&mut self) -> Result<ReconcileReport, SupervisorError> {
        let report = self.sweep().await?;

        if report.port == PortState::StillBound {
            return Err(SupervisorError::ReconcileTimeout {
                addr: self.addr,
                timeout: self.config.port_timeout(),
            });
        }

        Ok(report)
    }

    async fn sweep(&mut self) -> Result<ReconcileReport, SupervisorError> {
        let record = match LifecycleRecord::load(&self.record_path()) {
            Ok(record) => record,
            Err(e @ RecordError::Corrupt { .. }) => {
                warn!("{e}");
                None
            }
            Err(e) => return Err(e.into()),
        };

        self.table.refresh();
        let processes = self.table.processes();

        let live = record.filter(|record| self.is_live(record));

        let mut protected = HashSet::from([self.own_pid]);
        if let Some(record) = &live {
            for pid in record.pids() {
                protected.insert(pid);
                protected.extend(process::descendants_postorder(&processes, pid));
            }
        }

        let strays: Vec<u32> = processes
            .iter()
            .filter(|p| p.is_alive() && !protected.contains(&p.pid))
            .filter(|p| self.collector.matches(&p.cmd) || self.ingester.matches(&p.cmd))
            .map(|p| p.pid)
            .collect();

        let mut killed = Vec::new();
        for pid in strays {
            if killed.contains(&pid) {
                continue;
            }
            let name = processes
                .iter()
                .find(|p| p.pid == pid)
                .map(|p| p.name.as_str())
                .unwrap_or_default();
            warn!("terminating stray process {pid} ({name})");
            killed.extend(process::terminate_tree(&mut self.table, pid, self.config.grace()).await);
        }

        if live.is_some() {
            debug!("deployment is live, leaving record and port alone");
            return Ok(ReconcileReport {
                killed,
                removed_record: false,
                port: PortState::Skipped,
            });
        }

        let removed_record = LifecycleRecord::remove(&self.record_path())?;
        if removed_record {
            info!("removed stale lifecycle record");
        }

        let port = port::wait_for_port_free(
            self.addr,
            self.config.port_timeout(),
            self.config.port_poll(),
        )
        .await;
        if port == PortState::StillBound {
            warn!("{} is still bound", self.addr);
        }

        Ok(ReconcileReport {
            killed,
            removed_record,
            port,
        })
    }

    /// Both recorded processes are alive and still run the configured
    /// commands. A pid reused by an unrelated program does not count.
    fn is_live(&self, record: &LifecycleRecord) -> bool {
        self.roles(record)
            .into_iter()
            .all(|(pid, command)| self.table.is_alive(pid) && self.runs(pid, command))
    }

    /// Recorded pids that still belong to us, zombies included.
    fn owned_pids(&self, record: &LifecycleRecord) -> Vec<u32> {
        self.roles(record)
            .into_iter()
            .filter(|&(pid, command)| self.runs(pid, command))
            .map(|(pid, _)| pid)
            .collect()
    }

    fn roles<'a>(&'a self, record: &LifecycleRecord) -> [(u32, &'a CommandSpec); 2] {
        [
            (record.collector_pid, &self.collector),
            (record.ingester_pid, &self.ingester),
        ]
    }

    fn runs(&self, pid: u32, command: &CommandSpec) -> bool {
        let Some(process) = self.table.get(pid) else {
            return false;
        };

        // the command line of a zombie is gone, its pid cannot be reused yet
        if process.zombie || command.matches(&process.cmd) {
            return true;
        }

        debug!(
            "recorded pid {pid} now runs {:?}, expected {}",
            process.name, command
        );
        false
    }

    fn spawn(&self, command: &CommandSpec, log: &std::path::Path) -> Result<u32, SupervisorError> {
        self.spawner
            .spawn(command, log)
            .map_err(|source| SupervisorError::Spawn {
                command: command.to_string(),
                source,
            })
    }

    /// Best effort: tear down what a failed start already spawned.
    async fn rollback(&mut self, pids: &[u32]) {
        for &pid in pids {
            let killed = process::terminate_tree(&mut self.table, pid, self.config.grace()).await;
            debug!("rolled back {pid}: signalled {killed:?}");
        }
    }
}
