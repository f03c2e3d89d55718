//! Integration tests for the process supervisor
//!
//! Most tests run against a simulated host so that they can create strays,
//! zombies and crashes at will. The last one drives real processes.

use assert_matches::assert_matches;
use pretty_assertions::assert_eq;
use sysmon::supervisor::{
    LifecycleRecord, PortState, RunState, StartOutcome, StopOutcome, Supervisor,
    SupervisorError,
};
use tempfile::tempdir;
use tokio::net::TcpListener;

use crate::helpers::{FakeHost, FakeSpawner, FakeTable, free_port, test_config};

fn supervisor(
    host: &FakeHost,
    config: &sysmon::config::Config,
) -> Supervisor<FakeTable, FakeSpawner> {
    Supervisor::new(config, host.table(), host.spawner()).unwrap()
}

#[tokio::test]
async fn test_start_twice_is_idempotent() {
    let dir = tempdir().unwrap();
    let config = test_config(dir.path(), free_port().await);
    let host = FakeHost::new();
    let mut supervisor = supervisor(&host, &config);

    let first = assert_matches!(supervisor.start().await, Ok(StartOutcome::Started(r)) => r);
    let second =
        assert_matches!(supervisor.start().await, Ok(StartOutcome::AlreadyRunning(r)) => r);

    assert_eq!(first, second);
    assert_eq!(host.spawned(), vec!["collector", "ingester"]);
    assert!(host.exists(first.collector_pid));
    assert!(host.exists(first.ingester_pid));
    assert_eq!(
        LifecycleRecord::load(&config.supervisor.record_path()).unwrap(),
        Some(first)
    );
}

#[tokio::test]
async fn test_stop_when_not_running() {
    let dir = tempdir().unwrap();
    let config = test_config(dir.path(), free_port().await);
    let host = FakeHost::new();
    let mut supervisor = supervisor(&host, &config);

    assert_matches!(supervisor.stop().await, Ok(StopOutcome::NotRunning));
    assert_matches!(supervisor.stop().await, Ok(StopOutcome::NotRunning));
    assert!(host.signals().is_empty());
}

#[tokio::test]
async fn test_stop_kills_whole_trees() {
    let dir = tempdir().unwrap();
    let config = test_config(dir.path(), free_port().await);
    let host = FakeHost::new();
    let mut supervisor = supervisor(&host, &config);

    let record = assert_matches!(supervisor.start().await, Ok(StartOutcome::Started(r)) => r);
    let helper = host.add_process(&["helper"], record.collector_pid);
    let grandchild = host.add_process(&["helper-child"], helper);

    let killed = assert_matches!(
        supervisor.stop().await,
        Ok(StopOutcome::Stopped { killed, record: Some(_) }) => killed
    );

    for pid in [record.collector_pid, record.ingester_pid, helper, grandchild] {
        assert!(!host.exists(pid), "{pid} survived stop");
        assert!(killed.contains(&pid));
    }

    // descendants before their ancestors
    assert_eq!(
        &host.signalled_order()[..3],
        &[grandchild, helper, record.collector_pid]
    );

    assert_eq!(LifecycleRecord::load(&config.supervisor.record_path()).unwrap(), None);
    assert_eq!(supervisor.status().unwrap().state, RunState::Stopped);
}

#[tokio::test]
async fn test_status_requires_both_processes() {
    let dir = tempdir().unwrap();
    let config = test_config(dir.path(), free_port().await);
    let host = FakeHost::new();
    let mut supervisor = supervisor(&host, &config);

    assert_eq!(supervisor.status().unwrap().state, RunState::Stopped);

    let record = assert_matches!(supervisor.start().await, Ok(StartOutcome::Started(r)) => r);
    assert_eq!(supervisor.status().unwrap().state, RunState::Running);

    host.kill_external(record.ingester_pid);
    let status = supervisor.status().unwrap();
    assert_eq!(status.state, RunState::Stopped);
    assert_eq!(status.record, Some(record));
}

#[tokio::test]
async fn test_zombie_counts_as_stopped() {
    let dir = tempdir().unwrap();
    let config = test_config(dir.path(), free_port().await);
    let host = FakeHost::new();
    let mut supervisor = supervisor(&host, &config);

    let record = assert_matches!(supervisor.start().await, Ok(StartOutcome::Started(r)) => r);
    host.make_zombie(record.collector_pid);

    assert_eq!(supervisor.status().unwrap().state, RunState::Stopped);
}

#[tokio::test]
async fn test_restart_after_partial_failure() {
    let dir = tempdir().unwrap();
    let config = test_config(dir.path(), free_port().await);
    let host = FakeHost::new();
    let mut supervisor = supervisor(&host, &config);

    let old = assert_matches!(supervisor.start().await, Ok(StartOutcome::Started(r)) => r);
    host.kill_external(old.ingester_pid);

    // the surviving collector is swept, a fresh pair is started
    let new = assert_matches!(supervisor.start().await, Ok(StartOutcome::Started(r)) => r);
    assert_ne!(new, old);
    assert!(!host.exists(old.collector_pid));
    assert_eq!(host.pids_running("collector"), vec![new.collector_pid]);
    assert_eq!(host.pids_running("ingester"), vec![new.ingester_pid]);
}

#[tokio::test]
async fn test_reconcile_sweeps_strays_and_stale_record() {
    let dir = tempdir().unwrap();
    let port = free_port().await;
    let config = test_config(dir.path(), port);
    let host = FakeHost::new();
    let mut supervisor = supervisor(&host, &config);

    let port_arg = port.to_string();

    // left behind by a crashed run whose record points at dead pids
    let stray_collector = host.add_process(&["collector", "--port", port_arg.as_str()], 1);
    let stray_child = host.add_process(&["helper"], stray_collector);
    let stray_ingester = host.add_process(&["/usr/local/bin/ingester"], 1);
    let unrelated = host.add_process(&["collector", "--port", "1"], 1);
    LifecycleRecord::new(4, 5)
        .save(&config.supervisor.record_path())
        .unwrap();

    let report = supervisor.reconcile().await.unwrap();

    assert!(report.removed_record);
    assert_eq!(report.port, PortState::Free);
    for pid in [stray_collector, stray_child, stray_ingester] {
        assert!(report.killed.contains(&pid));
        assert!(!host.exists(pid));
    }
    assert!(host.exists(unrelated));
    assert_eq!(LifecycleRecord::load(&config.supervisor.record_path()).unwrap(), None);
}

#[tokio::test]
async fn test_reconcile_spares_live_deployment() {
    let dir = tempdir().unwrap();
    let port = free_port().await;
    let config = test_config(dir.path(), port);
    let host = FakeHost::new();
    let mut supervisor = supervisor(&host, &config);

    let record = assert_matches!(supervisor.start().await, Ok(StartOutcome::Started(r)) => r);
    let port_arg = port.to_string();
    let helper = host.add_process(&["collector", "--port", port_arg.as_str()], record.collector_pid);
    let duplicate = host.add_process(&["ingester"], 1);

    let report = supervisor.reconcile().await.unwrap();

    assert_eq!(report.killed, vec![duplicate]);
    assert!(!report.removed_record);
    assert_eq!(report.port, PortState::Skipped);
    assert!(host.exists(helper));
    assert_eq!(supervisor.status().unwrap().state, RunState::Running);
}

#[tokio::test]
async fn test_reused_pids_are_not_ours() {
    let dir = tempdir().unwrap();
    let config = test_config(dir.path(), free_port().await);
    let host = FakeHost::new();
    let mut supervisor = supervisor(&host, &config);

    // after a reboot the recorded pids belong to someone else
    let sshd = host.add_process(&["/usr/sbin/sshd", "-D"], 1);
    let session = host.add_process(&["bash"], sshd);
    let editor = host.add_process(&["vim"], 1);
    let stale = LifecycleRecord::new(sshd, editor);
    stale.save(&config.supervisor.record_path()).unwrap();

    let status = supervisor.status().unwrap();
    assert_eq!(status.state, RunState::Stopped);
    assert_eq!(status.record, Some(stale.clone()));

    let killed = assert_matches!(
        supervisor.stop().await,
        Ok(StopOutcome::Stopped { record: Some(r), killed }) if r == stale => killed
    );
    assert!(killed.is_empty());
    for pid in [sshd, session, editor] {
        assert!(host.exists(pid), "{pid} was killed");
    }
    assert!(host.signals().is_empty());
    assert!(!config.supervisor.record_path().exists());

    stale.save(&config.supervisor.record_path()).unwrap();
    let record = assert_matches!(supervisor.start().await, Ok(StartOutcome::Started(r)) => r);
    assert_ne!(record, stale);
    assert_eq!(host.pids_running("collector"), vec![record.collector_pid]);
    assert_eq!(host.pids_running("ingester"), vec![record.ingester_pid]);
    for pid in [sshd, session, editor] {
        assert!(host.exists(pid));
    }
}

#[tokio::test]
async fn test_collector_crash_during_start() {
    let dir = tempdir().unwrap();
    let config = test_config(dir.path(), free_port().await);
    let host = FakeHost::new();
    host.crash_on_start("collector");
    let mut supervisor = supervisor(&host, &config);

    assert_matches!(
        supervisor.start().await,
        Err(SupervisorError::CollectorStartFailed { .. })
    );
    assert_eq!(host.spawned(), vec!["collector"]);
    assert_eq!(LifecycleRecord::load(&config.supervisor.record_path()).unwrap(), None);
}

#[tokio::test]
async fn test_ingester_crash_rolls_back_collector() {
    let dir = tempdir().unwrap();
    let config = test_config(dir.path(), free_port().await);
    let host = FakeHost::new();
    host.crash_on_start("ingester");
    let mut supervisor = supervisor(&host, &config);

    assert_matches!(
        supervisor.start().await,
        Err(SupervisorError::IngesterStartFailed { .. })
    );
    assert!(host.pids_running("collector").is_empty());
    assert_eq!(LifecycleRecord::load(&config.supervisor.record_path()).unwrap(), None);
    assert_eq!(supervisor.status().unwrap().state, RunState::Stopped);
}

#[tokio::test]
async fn test_port_conflict_spawns_nothing() {
    let dir = tempdir().unwrap();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let config = test_config(dir.path(), port);
    let host = FakeHost::new();
    let mut supervisor = supervisor(&host, &config);

    assert_matches!(
        supervisor.start().await,
        Err(SupervisorError::PortConflict { addr }) if addr.port() == port
    );
    assert!(host.spawned().is_empty());
    drop(listener);
}

#[tokio::test]
async fn test_stop_reports_port_still_bound() {
    let dir = tempdir().unwrap();
    let config = test_config(dir.path(), free_port().await);
    let host = FakeHost::new();
    let mut supervisor = supervisor(&host, &config);

    assert_matches!(supervisor.start().await, Ok(StartOutcome::Started(_)));

    // someone else grabs the port while we are running
    let listener = TcpListener::bind(("127.0.0.1", config.collector.port))
        .await
        .unwrap();

    assert_matches!(
        supervisor.stop().await,
        Err(SupervisorError::ReconcileTimeout { .. })
    );
    assert!(host.pids_running("collector").is_empty());
    assert!(host.pids_running("ingester").is_empty());
    drop(listener);
}

#[tokio::test]
async fn test_corrupt_record_is_treated_as_stale() {
    let dir = tempdir().unwrap();
    let config = test_config(dir.path(), free_port().await);
    let host = FakeHost::new();
    let mut supervisor = supervisor(&host, &config);

    std::fs::write(config.supervisor.record_path(), "12345\n67890\n").unwrap();
    assert_eq!(supervisor.status().unwrap().state, RunState::Stopped);

    let stray = host.add_process(&["ingester"], 1);
    assert_matches!(
        supervisor.stop().await,
        Ok(StopOutcome::Stopped { record: None, killed }) if killed == vec![stray]
    );
    assert!(!config.supervisor.record_path().exists());
}

#[cfg(unix)]
#[tokio::test]
async fn test_real_processes_lifecycle() {
    use std::time::Duration;
    use sysmon::config::CommandSpec;
    use sysmon::supervisor::process::KillSignal;
    use sysmon::supervisor::{ProcessTable, SystemProcessTable, TokioSpawner};

    let dir = tempdir().unwrap();
    let mut config = test_config(dir.path(), free_port().await);
    // unique arguments so only our processes match
    let seconds = 100_000 + std::process::id() % 50_000;
    config.collector.command = CommandSpec::new("sleep", [seconds.to_string()]);
    config.ingester.command = CommandSpec::new("sleep", [(seconds + 1).to_string()]);
    config.supervisor.grace_ms = 300;

    let mut supervisor =
        Supervisor::new(&config, SystemProcessTable::new(), TokioSpawner::new()).unwrap();

    let record = assert_matches!(supervisor.start().await, Ok(StartOutcome::Started(r)) => r);
    assert_eq!(supervisor.status().unwrap().state, RunState::Running);
    assert!(dir.path().join("collector.log").exists());

    // kill the ingester behind the supervisor's back
    let mut table = SystemProcessTable::new();
    assert!(table.signal(record.ingester_pid, KillSignal::Kill));

    let mut state = RunState::Running;
    for _ in 0..40 {
        state = supervisor.status().unwrap().state;
        if state == RunState::Stopped {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert_eq!(state, RunState::Stopped);

    assert_matches!(supervisor.stop().await, Ok(StopOutcome::Stopped { .. }));

    table.refresh();
    assert!(!table.is_alive(record.collector_pid));
    assert!(!table.is_alive(record.ingester_pid));
    assert_matches!(supervisor.stop().await, Ok(StopOutcome::NotRunning));
}
