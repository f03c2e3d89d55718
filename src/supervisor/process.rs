//! Process enumeration, spawning and tree termination

use std::collections::{HashMap, HashSet};
use std::fs::OpenOptions;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use sysinfo::{Pid, ProcessRefreshKind, ProcessStatus, ProcessesToUpdate, Signal, System, UpdateKind};
use tokio::process::Command;
use tokio::time::{Instant, sleep};
use tracing::{debug, trace, warn};

use crate::config::CommandSpec;

/// Interval between liveness checks while waiting for a tree to exit
const EXIT_POLL: Duration = Duration::from_millis(50);

/// Snapshot of one host process
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessInfo {
    pub pid: u32,
    pub parent: Option<u32>,
    pub name: String,
    pub cmd: Vec<String>,
    pub zombie: bool,
}

impl ProcessInfo {
    pub fn is_alive(&self) -> bool {
        !self.zombie
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KillSignal {
    /// Ask the process to exit (SIGTERM where available)
    Terminate,
    /// Force it (SIGKILL)
    Kill,
}

/// Access to the host's process list.
///
/// [`ProcessTable::refresh`] takes a new snapshot; every other method
/// answers from the last one.
pub trait ProcessTable {
    fn refresh(&mut self);

    fn processes(&self) -> Vec<ProcessInfo>;

    /// Send `signal` to `pid`. Returns `false` if there was no such process.
    fn signal(&self, pid: u32, signal: KillSignal) -> bool;

    fn get(&self, pid: u32) -> Option<ProcessInfo> {
        self.processes().into_iter().find(|p| p.pid == pid)
    }

    /// A zombie counts as dead.
    fn is_alive(&self, pid: u32) -> bool {
        self.get(pid).is_some_and(|p| p.is_alive())
    }

    fn children(&self, pid: u32) -> Vec<u32> {
        self.processes()
            .into_iter()
            .filter(|p| p.parent == Some(pid))
            .map(|p| p.pid)
            .collect()
    }
}

/// [`ProcessTable`] backed by `sysinfo`
pub struct SystemProcessTable {
    system: System,
}

impl SystemProcessTable {
    pub fn new() -> Self {
        let mut table = Self {
            system: System::new(),
        };
        table.refresh();
        table
    }
}

impl Default for SystemProcessTable {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessTable for SystemProcessTable {
    fn refresh(&mut self) {
        let count = self.system.refresh_processes_specifics(
            ProcessesToUpdate::All,
            true,
            ProcessRefreshKind::nothing().with_cmd(UpdateKind::Always),
        );
        trace!("refreshed {count} processes");
    }

    fn processes(&self) -> Vec<ProcessInfo> {
        self.system
            .processes()
            .values()
            // threads show up as tasks on Linux
            .filter(|process| process.thread_kind().is_none())
            .map(|process| ProcessInfo {
                pid: process.pid().as_u32(),
                parent: process.parent().map(|pid| pid.as_u32()),
                name: process.name().to_string_lossy().to_string(),
                cmd: process
                    .cmd()
                    .iter()
                    .map(|arg| arg.to_string_lossy().to_string())
                    .collect(),
                zombie: process.status() == ProcessStatus::Zombie,
            })
            .collect()
    }

    fn signal(&self, pid: u32, signal: KillSignal) -> bool {
        let Some(process) = self.system.process(Pid::from_u32(pid)) else {
            return false;
        };

        match signal {
            KillSignal::Terminate => process
                .kill_with(Signal::Term)
                .unwrap_or_else(|| process.kill()),
            KillSignal::Kill => process.kill(),
        }
    }
}

/// All descendants of `root`, deepest first. `root` itself is not included.
pub fn descendants_postorder(processes: &[ProcessInfo], root: u32) -> Vec<u32> {
    let mut children: HashMap<u32, Vec<u32>> = HashMap::new();
    for process in processes {
        if let Some(parent) = process.parent
            && parent != process.pid
        {
            children.entry(parent).or_default().push(process.pid);
        }
    }

    fn visit(
        pid: u32,
        children: &HashMap<u32, Vec<u32>>,
        seen: &mut HashSet<u32>,
        out: &mut Vec<u32>,
    ) {
        for &child in children.get(&pid).map(Vec::as_slice).unwrap_or_default() {
            if seen.insert(child) {
                visit(child, children, seen, out);
                out.push(child);
            }
        }
    }

    let mut seen = HashSet::from([root]);
    let mut order = Vec::new();
    visit(root, &children, &mut seen, &mut order);
    order
}

/// Terminate `root` and every descendant, children before parents.
///
/// Processes still alive after `grace` are killed forcefully. A root that
/// no longer exists is not an error. Returns the pids that were signalled.
pub async fn terminate_tree<P: ProcessTable + ?Sized>(
    table: &mut P,
    root: u32,
    grace: Duration,
) -> Vec<u32> {
    table.refresh();

    let processes = table.processes();
    if !processes.iter().any(|p| p.pid == root) {
        debug!("process {root} already gone");
        return vec![];
    }

    let mut order = descendants_postorder(&processes, root);
    order.push(root);

    let signalled: Vec<u32> = order
        .into_iter()
        .filter(|&pid| {
            let delivered = table.signal(pid, KillSignal::Terminate);
            if delivered {
                trace!("sent terminate to {pid}");
            }
            delivered
        })
        .collect();

    let deadline = Instant::now() + grace;
    loop {
        table.refresh();
        let survivors: Vec<u32> = signalled
            .iter()
            .copied()
            .filter(|&pid| table.is_alive(pid))
            .collect();

        if survivors.is_empty() {
            break;
        }

        if Instant::now() >= deadline {
            for pid in survivors {
                warn!("process {pid} ignored terminate, killing it");
                table.signal(pid, KillSignal::Kill);
            }
            table.refresh();
            break;
        }

        sleep(EXIT_POLL).await;
    }

    signalled
}

/// Launches supervised processes
pub trait Spawner {
    /// Start `command` detached, with stdout and stderr appended to `log`.
    /// Returns the new process id.
    fn spawn(&self, command: &CommandSpec, log: &Path) -> std::io::Result<u32>;
}

/// [`Spawner`] on `tokio::process`.
///
/// Must be used from inside a tokio runtime: every child is handed to a
/// background task that waits on it, so an early exit is reaped instead of
/// lingering as a zombie of this process.
#[derive(Debug, Clone, Default)]
pub struct TokioSpawner {
    envs: Vec<(String, String)>,
}

impl TokioSpawner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pass an extra environment variable to every spawned process.
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }
}

impl Spawner for TokioSpawner {
    fn spawn(&self, command: &CommandSpec, log: &Path) -> std::io::Result<u32> {
        if let Some(dir) = log.parent()
            && !dir.as_os_str().is_empty()
        {
            std::fs::create_dir_all(dir)?;
        }

        let stdout = OpenOptions::new().create(true).append(true).open(log)?;
        let stderr = stdout.try_clone()?;

        let mut cmd = Command::new(&command.program);
        cmd.args(&command.args)
            .envs(self.envs.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr);

        // keep terminal signals aimed at the caller away from the child
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd.spawn()?;
        let pid = child.id().ok_or_else(|| {
            std::io::Error::other(format!("{command} exited before it got a pid"))
        })?;

        debug!("spawned {command} as {pid}, logging to {}", log.display());

        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) => debug!("process {pid} exited with {status}"),
                Err(e) => warn!("failed to wait for process {pid}: {e}"),
            }
        });

        Ok(pid)
    }
}
