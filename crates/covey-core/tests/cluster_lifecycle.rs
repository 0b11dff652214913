//! Integration tests for building, stabilizing, and tearing down clusters
//! against scripted control-API servers and real local processes.

mod common;

use common::{cloud_status_body, serve_json};
use covey_core::{ClusterBuilder, NodeClient, Sandbox, WorkerCommand, teardown};
use covey_proto::{NodeAddr, NodeState};
use std::time::Duration;
use tempfile::TempDir;

async fn mock_cloud(cluster: &'static str, size: usize) -> Vec<NodeAddr> {
    let mut addrs = Vec::new();
    for _ in 0..size {
        let (port, _log) = serve_json(move |_path| cloud_status_body(cluster, size, true)).await;
        addrs.push(NodeAddr::new("127.0.0.1", port));
    }
    addrs
}

#[tokio::test]
async fn test_attached_cluster_reports_full_size_on_every_node() {
    for size in 1..=3usize {
        let dir = TempDir::new().unwrap();
        let sandbox = Sandbox::create(dir.path().join("sandbox")).unwrap();
        let addrs = mock_cloud("attach-n", size).await;

        let cluster = ClusterBuilder::new("attach-n", 0)
            .attach(addrs)
            .timeout(Duration::from_secs(5))
            .retry_delay(Duration::from_millis(50))
            .build(&sandbox)
            .await
            .unwrap();

        assert_eq!(cluster.expected_size(), size);
        for node in cluster.nodes() {
            let status = node.client().cloud_status().await.unwrap();
            assert_eq!(status.cloud_size, size);
            assert!(status.consensus);
        }
    }
}

#[tokio::test]
async fn test_undersized_cloud_times_out_with_context() {
    let dir = TempDir::new().unwrap();
    let sandbox = Sandbox::create(dir.path().join("sandbox")).unwrap();

    // The node only ever reports 1 of 2 members, without consensus.
    let (port, _log) = serve_json(|_path| cloud_status_body("undersized", 1, false)).await;

    let failure = ClusterBuilder::new("undersized", 0)
        .attach(vec![
            NodeAddr::new("127.0.0.1", port),
            NodeAddr::new("127.0.0.1", 1),
        ])
        .timeout(Duration::from_millis(400))
        .retry_delay(Duration::from_millis(50))
        .build(&sandbox)
        .await
        .unwrap_err();

    let msg = failure.to_string();
    assert!(msg.contains("did not stabilize"), "got: {msg}");
}

#[tokio::test]
async fn test_failed_build_keeps_partial_nodes_when_asked() {
    let dir = TempDir::new().unwrap();
    let sandbox = Sandbox::create(dir.path().join("sandbox")).unwrap();

    // Workers that start but never serve the control API.
    let worker = WorkerCommand {
        program: "sh".to_string(),
        args: vec!["-c".to_string(), "sleep 300".to_string()],
        env: vec![],
        heap_gb: None,
    };

    let failure = ClusterBuilder::new("partial", 2)
        .worker(worker)
        .base_port(59101)
        .timeout(Duration::from_millis(500))
        .retry_delay(Duration::from_millis(100))
        .keep_partial(true)
        .build(&sandbox)
        .await
        .unwrap_err();

    // Every successfully spawned node is handed back for inspection, and
    // the node whose window closed without converging is marked as such.
    let mut orphans = failure.orphans;
    assert_eq!(orphans.len(), 2);
    assert_eq!(orphans[0].state(), NodeState::Unreachable);
    for node in &mut orphans {
        node.terminate(Duration::from_secs(5)).await.unwrap();
    }
}

#[tokio::test]
async fn test_failed_build_unwinds_and_reports_log_faults() {
    let dir = TempDir::new().unwrap();
    let sandbox = Sandbox::create(dir.path().join("sandbox")).unwrap();

    // Workers that crash-log an exception and then hang without serving.
    let worker = WorkerCommand {
        program: "sh".to_string(),
        args: vec![
            "-c".to_string(),
            "echo 'java.lang.RuntimeException: startup boom'; sleep 300".to_string(),
        ],
        env: vec![],
        heap_gb: None,
    };

    let failure = ClusterBuilder::new("unwound", 2)
        .worker(worker)
        .base_port(59201)
        .timeout(Duration::from_millis(500))
        .retry_delay(Duration::from_millis(100))
        .build(&sandbox)
        .await
        .unwrap_err();

    // Cleanup ran (no orphans) and the log fault is reported alongside the
    // triggering stabilization timeout.
    assert!(failure.orphans.is_empty());
    assert!(failure.log_fault);
    let msg = failure.to_string();
    assert!(msg.contains("did not stabilize"), "got: {msg}");
    assert!(msg.contains("log scan found faults"), "got: {msg}");
}

#[tokio::test]
async fn test_teardown_after_attach_hits_shutdown_and_is_idempotent() {
    let dir = TempDir::new().unwrap();
    let sandbox = Sandbox::create(dir.path().join("sandbox")).unwrap();

    let (port, log) = serve_json(|path| {
        if path.starts_with("/Cloud.json") {
            cloud_status_body("att-down", 1, true)
        } else {
            r#"{"status":"done"}"#.to_string()
        }
    })
    .await;

    let mut cluster = ClusterBuilder::new("att-down", 0)
        .attach(vec![NodeAddr::new("127.0.0.1", port)])
        .timeout(Duration::from_secs(5))
        .retry_delay(Duration::from_millis(50))
        .build(&sandbox)
        .await
        .unwrap();

    teardown(&mut cluster, Duration::from_secs(2)).await.unwrap();
    assert!(
        log.lock()
            .unwrap()
            .iter()
            .any(|path| path.starts_with("/Shutdown.json"))
    );

    // Second teardown is a no-op.
    teardown(&mut cluster, Duration::from_secs(2)).await.unwrap();
}

#[tokio::test]
async fn test_node_client_rejects_malformed_status() {
    let (port, _log) = serve_json(|_path| r#"{"cloud_name":"x","consensus":true}"#.to_string()).await;
    let client = NodeClient::new(NodeAddr::new("127.0.0.1", port));
    let err = client.cloud_status().await.unwrap_err();
    assert!(!err.is_retryable());
    assert!(err.to_string().contains("protocol violation"));
}
