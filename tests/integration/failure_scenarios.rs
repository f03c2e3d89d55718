//! Integration tests for ingestion under a flaky or misbehaving collector
//!
//! These tests verify that:
//! - The loop keeps retrying while the collector is down
//! - Malformed records are skipped without stopping the loop
//! - Empty connections are tolerated

use std::sync::Arc;
use std::time::Duration;

use sysmon::config::IngesterConfig;
use sysmon::ingest::{IngestError, IngestionLoop};
use sysmon::storage::StorageBackend;
use sysmon::storage::memory::MemoryBackend;
use tokio::net::TcpListener;
use tokio::time::timeout;

use crate::helpers::{RecordingDispatcher, free_port, serve_sequence};

fn fast_config() -> IngesterConfig {
    IngesterConfig {
        connect_timeout_ms: 500,
        read_timeout_ms: 500,
        reconnect_backoff_secs: 1,
        cycle_interval_secs: 0,
        ..IngesterConfig::default()
    }
}

async fn wait_for_readings(backend: &MemoryBackend, count: usize) -> bool {
    timeout(Duration::from_secs(10), async {
        while backend.len().await < count {
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    })
    .await
    .is_ok()
}

#[tokio::test]
async fn test_loop_survives_collector_coming_up_late() {
    let port = free_port().await;
    let backend = Arc::new(MemoryBackend::new());

    let ingestion = IngestionLoop::new(
        format!("127.0.0.1:{port}"),
        fast_config(),
        backend.clone(),
        Arc::new(RecordingDispatcher::default()),
    );
    let handle = tokio::spawn(ingestion.run());

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(backend.is_empty().await);

    let listener = TcpListener::bind(("127.0.0.1", port)).await.unwrap();
    tokio::spawn(serve_sequence(
        listener,
        vec![b"10,20,30,40,2024-01-01 12:00:00".to_vec()],
    ));

    assert!(wait_for_readings(&backend, 1).await);
    handle.abort();
}

#[tokio::test]
async fn test_loop_skips_bad_records() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap().to_string();
    let backend = Arc::new(MemoryBackend::new());

    tokio::spawn(serve_sequence(
        listener,
        vec![
            b"10,20,30,40,2024-01-01 12:00:00".to_vec(),
            b"garbage".to_vec(),
            b"".to_vec(),
            b"10,20,-30,40,2024-01-01 12:00:01".to_vec(),
            b"10,20,30,40,01/01/2024".to_vec(),
            b"11,21,31,41,2024-01-01 12:00:02".to_vec(),
        ],
    ));

    let ingestion = IngestionLoop::new(
        address,
        fast_config(),
        backend.clone(),
        Arc::new(RecordingDispatcher::default()),
    );
    let handle = tokio::spawn(ingestion.run());

    assert!(wait_for_readings(&backend, 2).await);
    handle.abort();

    let latest = backend.latest().await.unwrap().unwrap();
    assert_eq!(latest.cpu_usage, 11.0);
    assert_eq!(backend.len().await, 2);
}

#[tokio::test]
async fn test_silent_collector_times_out() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap().to_string();

    // accept but never write
    let peer = tokio::spawn(async move {
        let (socket, _) = listener.accept().await.unwrap();
        tokio::time::sleep(Duration::from_secs(2)).await;
        drop(socket);
    });

    let mut config = fast_config();
    config.read_timeout_ms = 100;
    let mut ingestion = IngestionLoop::new(
        address,
        config,
        Arc::new(MemoryBackend::new()),
        Arc::new(RecordingDispatcher::default()),
    );

    let err = ingestion.run_cycle().await.unwrap_err();
    assert!(matches!(err, IngestError::ReadTimeout));
    assert!(!err.is_connect());
    peer.abort();
}
