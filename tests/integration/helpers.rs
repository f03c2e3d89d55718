//! Helper functions for integration tests

#![allow(dead_code)]

use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::NaiveDateTime;
use sysmon::Reading;
use sysmon::actions::Dispatch;
use sysmon::config::{CommandSpec, Config};
use sysmon::supervisor::process::KillSignal;
use sysmon::supervisor::{ProcessInfo, ProcessTable, Spawner};
use sysmon::thresholds::{Action, Metric, Trigger};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

pub fn ts(timestamp: &str) -> NaiveDateTime {
    NaiveDateTime::parse_from_str(timestamp, sysmon::TIMESTAMP_FORMAT).unwrap()
}

pub fn reading(cpu: f64, memory: f64, disk_io: f64, network: f64, timestamp: &str) -> Reading {
    Reading {
        cpu_usage: cpu,
        memory_usage: memory,
        disk_io,
        network_usage: network,
        timestamp: ts(timestamp),
    }
}

/// A port nothing listens on (at the time of the call)
pub async fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

/// Accept one connection, send `payload`, then report whether the other
/// side closed the connection.
pub async fn serve_once(payload: Vec<u8>) -> (String, JoinHandle<bool>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap().to_string();

    let handle = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        socket.write_all(&payload).await.unwrap();

        let mut buf = [0u8; 16];
        matches!(
            tokio::time::timeout(Duration::from_secs(2), socket.read(&mut buf)).await,
            Ok(Ok(0))
        )
    });

    (address, handle)
}

/// Collector stand-in answering every connection with the next payload
pub async fn serve_sequence(listener: TcpListener, payloads: Vec<Vec<u8>>) {
    for payload in payloads {
        let Ok((mut socket, _)) = listener.accept().await else {
            return;
        };
        let _ = socket.write_all(&payload).await;
        let _ = socket.shutdown().await;
    }
}

#[derive(Default)]
pub struct RecordingDispatcher {
    triggers: Mutex<Vec<Trigger>>,
}

impl RecordingDispatcher {
    pub fn actions(&self) -> Vec<(Metric, Action)> {
        self.triggers
            .lock()
            .unwrap()
            .iter()
            .map(|t| (t.metric, t.action))
            .collect()
    }
}

impl Dispatch for RecordingDispatcher {
    fn dispatch(&self, trigger: &Trigger) {
        self.triggers.lock().unwrap().push(*trigger);
    }
}

/// Configuration pointing all state into `dir`, with short timings
pub fn test_config(dir: &Path, port: u16) -> Config {
    let mut config = Config::default();
    config.collector.host = "127.0.0.1".to_string();
    config.collector.port = port;
    config.collector.command = CommandSpec::new("collector", ["--port".to_string(), port.to_string()]);
    config.ingester.command = CommandSpec::new("ingester", Vec::<String>::new());
    config.supervisor.data_dir = dir.to_path_buf();
    config.supervisor.grace_ms = 20;
    config.supervisor.port_timeout_ms = 300;
    config.supervisor.port_poll_ms = 20;
    config
}

#[derive(Debug, Default)]
struct HostState {
    processes: BTreeMap<u32, ProcessInfo>,
    next_pid: u32,
    spawned: Vec<String>,
    signals: Vec<(u32, KillSignal)>,
    crashing: HashSet<String>,
}

/// Simulated host: a process list shared by [`FakeTable`] and
/// [`FakeSpawner`].
#[derive(Debug, Clone)]
pub struct FakeHost {
    state: Arc<Mutex<HostState>>,
}

impl FakeHost {
    pub fn new() -> Self {
        let mut state = HostState {
            next_pid: 1000,
            ..HostState::default()
        };
        state.processes.insert(
            1,
            ProcessInfo {
                pid: 1,
                parent: None,
                name: "init".to_string(),
                cmd: vec!["/sbin/init".to_string()],
                zombie: false,
            },
        );
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    pub fn table(&self) -> FakeTable {
        FakeTable(self.clone())
    }

    pub fn spawner(&self) -> FakeSpawner {
        FakeSpawner(self.clone())
    }

    /// Processes started from `program` exit right away
    pub fn crash_on_start(&self, program: &str) {
        self.state.lock().unwrap().crashing.insert(program.to_string());
    }

    pub fn add_process(&self, cmd: &[&str], parent: u32) -> u32 {
        let mut state = self.state.lock().unwrap();
        state.next_pid += 1;
        let pid = state.next_pid;
        let cmd: Vec<String> = cmd.iter().map(|s| s.to_string()).collect();
        state.processes.insert(
            pid,
            ProcessInfo {
                pid,
                parent: Some(parent),
                name: cmd.first().cloned().unwrap_or_default(),
                cmd,
                zombie: false,
            },
        );
        pid
    }

    pub fn make_zombie(&self, pid: u32) {
        if let Some(process) = self.state.lock().unwrap().processes.get_mut(&pid) {
            process.zombie = true;
        }
    }

    /// Something outside the supervisor killed `pid`
    pub fn kill_external(&self, pid: u32) {
        remove_process(&mut self.state.lock().unwrap(), pid);
    }

    pub fn exists(&self, pid: u32) -> bool {
        self.state.lock().unwrap().processes.contains_key(&pid)
    }

    pub fn spawned(&self) -> Vec<String> {
        self.state.lock().unwrap().spawned.clone()
    }

    pub fn signals(&self) -> Vec<(u32, KillSignal)> {
        self.state.lock().unwrap().signals.clone()
    }

    /// Pids in the order they received their first signal
    pub fn signalled_order(&self) -> Vec<u32> {
        let mut order = Vec::new();
        for (pid, _) in self.signals() {
            if !order.contains(&pid) {
                order.push(pid);
            }
        }
        order
    }

    pub fn pids_running(&self, program: &str) -> Vec<u32> {
        self.state
            .lock()
            .unwrap()
            .processes
            .values()
            .filter(|p| !p.zombie && p.cmd.first().is_some_and(|c| c == program))
            .map(|p| p.pid)
            .collect()
    }
}

/// Orphans are re-parented to init
fn remove_process(state: &mut HostState, pid: u32) {
    state.processes.remove(&pid);
    for process in state.processes.values_mut() {
        if process.parent == Some(pid) {
            process.parent = Some(1);
        }
    }
}

pub struct FakeTable(FakeHost);

impl ProcessTable for FakeTable {
    fn refresh(&mut self) {}

    fn processes(&self) -> Vec<ProcessInfo> {
        self.0.state.lock().unwrap().processes.values().cloned().collect()
    }

    fn signal(&self, pid: u32, signal: KillSignal) -> bool {
        let mut state = self.0.state.lock().unwrap();
        if !state.processes.contains_key(&pid) {
            return false;
        }
        state.signals.push((pid, signal));
        remove_process(&mut state, pid);
        true
    }
}

pub struct FakeSpawner(FakeHost);

impl Spawner for FakeSpawner {
    fn spawn(&self, command: &CommandSpec, _log: &Path) -> std::io::Result<u32> {
        let program = command.program.to_string_lossy().to_string();
        let mut cmd = vec![program.as_str()];
        cmd.extend(command.args.iter().map(String::as_str));

        let pid = self.0.add_process(&cmd, std::process::id());
        let crashes = {
            let mut state = self.0.state.lock().unwrap();
            state.spawned.push(program.clone());
            state.crashing.contains(&program)
        };

        if crashes {
            self.0.make_zombie(pid);
        }

        Ok(pid)
    }
}
