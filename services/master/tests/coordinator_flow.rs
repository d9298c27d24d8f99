//! Coordinator behavior against an in-memory store and a recording bus.

use async_trait::async_trait;
use chrono::{Duration, Utc};
use fleet_bus::{BusError, BusPublisher};
use fleet_protocol::{
    unix_now, BusMessage, CmdDone, Heartbeat, LogLine, LogStream, NodeStatus, RegisterReq,
};
use master::coordinator::{Coordinator, DispatchError, ABANDONED_EXIT_CODE};
use master::events::ViewerEvent;
use master::fanout::FanoutPlane;
use master::repo;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::Mutex;

const SECRET: &str = "s3cret";

#[derive(Default)]
struct RecordingBus {
    messages: Mutex<Vec<(String, BusMessage)>>,
}

impl RecordingBus {
    async fn take(&self) -> Vec<(String, BusMessage)> {
        std::mem::take(&mut *self.messages.lock().await)
    }
}

#[async_trait]
impl BusPublisher for RecordingBus {
    async fn publish(&self, topic: &str, msg: &BusMessage) -> Result<(), BusError> {
        self.messages
            .lock()
            .await
            .push((topic.to_owned(), msg.clone()));
        Ok(())
    }
}

async fn memory_pool() -> SqlitePool {
    // A single connection keeps every statement on the same in-memory DB.
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("in-memory pool");
    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .expect("migrations");
    pool
}

async fn harness() -> (Arc<Coordinator>, Arc<RecordingBus>, Arc<FanoutPlane>, SqlitePool) {
    let pool = memory_pool().await;
    let bus = Arc::new(RecordingBus::default());
    let fanout = Arc::new(FanoutPlane::new());
    let coordinator = Arc::new(Coordinator::new(
        pool.clone(),
        bus.clone(),
        fanout.clone(),
        SECRET.to_owned(),
    ));
    (coordinator, bus, fanout, pool)
}

fn register_req(node_name: &str, secret_key: &str) -> RegisterReq {
    RegisterReq {
        node_name: node_name.to_owned(),
        secret_key: secret_key.to_owned(),
        ip: "10.0.0.5".to_owned(),
        timestamp: unix_now(),
    }
}

/// Register `node_name` and return the node id from the published ack.
async fn register(coordinator: &Coordinator, bus: &RecordingBus, node_name: &str) -> String {
    coordinator
        .handle_register(register_req(node_name, SECRET))
        .await;
    let published = bus.take().await;
    match published.as_slice() {
        [(topic, BusMessage::RegisterAck(ack))] => {
            assert_eq!(topic, "system/register");
            ack.node_id.clone()
        }
        other => panic!("expected a single register_ack, got {other:?}"),
    }
}

// ---------------------------------------------------------------------------
// Registration
// ---------------------------------------------------------------------------

#[tokio::test]
async fn registration_assigns_a_twelve_hex_identity() {
    let (coordinator, bus, _fanout, pool) = harness().await;
    let node_id = register(&coordinator, &bus, "edge-01").await;

    assert_eq!(node_id.len(), 12);
    assert!(node_id.chars().all(|c| c.is_ascii_hexdigit()));

    let node = repo::nodes::get_by_name(&pool, "edge-01")
        .await
        .unwrap()
        .expect("node row inserted");
    assert_eq!(node.node_id, node_id);
    assert_eq!(node.status, "online");
    assert_eq!(node.ip, "10.0.0.5");
}

#[tokio::test]
async fn reregistration_reuses_the_existing_identity() {
    let (coordinator, bus, _fanout, pool) = harness().await;
    let first = register(&coordinator, &bus, "edge-01").await;
    let second = register(&coordinator, &bus, "edge-01").await;

    assert_eq!(first, second);
    let nodes = repo::nodes::list_all(&pool).await.unwrap();
    assert_eq!(nodes.len(), 1);
}

#[tokio::test]
async fn wrong_secret_is_denied_and_nothing_is_persisted() {
    let (coordinator, bus, _fanout, pool) = harness().await;
    coordinator
        .handle_register(register_req("edge-01", "wrong"))
        .await;

    let published = bus.take().await;
    match published.as_slice() {
        [(topic, BusMessage::RegisterNak(nak))] => {
            assert_eq!(topic, "system/register");
            assert_eq!(nak.reason, "secret mismatch");
        }
        other => panic!("expected a single register_nak, got {other:?}"),
    }
    assert!(repo::nodes::list_all(&pool).await.unwrap().is_empty());
}

#[tokio::test]
async fn registration_broadcasts_an_online_event() {
    let (coordinator, bus, fanout, _pool) = harness().await;
    let (tx, mut rx) = mpsc::channel(8);
    fanout.attach_global(tx).await;

    let node_id = register(&coordinator, &bus, "edge-01").await;

    match rx.try_recv().expect("one global event") {
        ViewerEvent::NodeUpdate { node_id: id, status } => {
            assert_eq!(id, node_id);
            assert_eq!(status, NodeStatus::Online);
        }
        other => panic!("expected node_update, got {other:?}"),
    }
}

// ---------------------------------------------------------------------------
// Dispatch
// ---------------------------------------------------------------------------

#[tokio::test]
async fn dispatch_to_a_missing_node_fails_without_side_effects() {
    let (coordinator, bus, _fanout, pool) = harness().await;
    let err = coordinator
        .dispatch("abc123def456", "echo hi")
        .await
        .unwrap_err();
    assert!(matches!(err, DispatchError::NodeMissing(_)));
    assert!(bus.take().await.is_empty());
    assert!(repo::executions::list(&pool, None, 10).await.unwrap().is_empty());
}

#[tokio::test]
async fn dispatch_to_an_offline_node_fails_without_side_effects() {
    let (coordinator, bus, _fanout, pool) = harness().await;
    let node_id = register(&coordinator, &bus, "edge-01").await;
    repo::nodes::set_status(&pool, &node_id, "offline")
        .await
        .unwrap();

    let err = coordinator.dispatch(&node_id, "echo hi").await.unwrap_err();
    assert!(matches!(err, DispatchError::NodeOffline(_)));
    assert!(bus.take().await.is_empty());
    assert!(repo::executions::list(&pool, None, 10).await.unwrap().is_empty());
}

#[tokio::test]
async fn dispatch_creates_a_running_execution_and_publishes_the_command() {
    let (coordinator, bus, _fanout, pool) = harness().await;
    let node_id = register(&coordinator, &bus, "edge-01").await;

    let exec_id = coordinator.dispatch(&node_id, "echo hi").await.unwrap();

    let execution = repo::executions::get(&pool, &exec_id)
        .await
        .unwrap()
        .expect("execution row");
    assert_eq!(execution.status, "running");
    assert_eq!(execution.exit_code, None);
    assert!(execution.finished_at.is_none());

    let node = repo::nodes::get_by_id(&pool, &node_id).await.unwrap().unwrap();
    assert_eq!(node.status, "busy");

    let published = bus.take().await;
    match published.as_slice() {
        [(topic, BusMessage::Cmd(cmd))] => {
            assert_eq!(topic, &format!("cmd/{node_id}"));
            assert_eq!(cmd.exec_id, exec_id);
            assert_eq!(cmd.command, "echo hi");
        }
        other => panic!("expected a single cmd, got {other:?}"),
    }
}

#[tokio::test]
async fn dispatch_to_a_busy_node_is_permitted() {
    let (coordinator, bus, _fanout, pool) = harness().await;
    let node_id = register(&coordinator, &bus, "edge-01").await;

    let first = coordinator.dispatch(&node_id, "sleep 5").await.unwrap();
    let second = coordinator.dispatch(&node_id, "echo queued").await.unwrap();
    assert_ne!(first, second);
    assert_eq!(
        repo::executions::list(&pool, Some(&node_id), 10)
            .await
            .unwrap()
            .len(),
        2
    );
}

// ---------------------------------------------------------------------------
// Log ingest and completion
// ---------------------------------------------------------------------------

fn log_line(exec_id: &str, node_id: &str, line: &str) -> LogLine {
    LogLine {
        exec_id: exec_id.to_owned(),
        node_id: node_id.to_owned(),
        stream: LogStream::Stdout,
        line: line.to_owned(),
        timestamp: unix_now(),
    }
}

fn cmd_done(exec_id: &str, node_id: &str, exit_code: i32) -> CmdDone {
    CmdDone {
        exec_id: exec_id.to_owned(),
        node_id: node_id.to_owned(),
        exit_code,
        timestamp: unix_now(),
    }
}

#[tokio::test]
async fn happy_path_execution_reaches_success_and_returns_the_node_to_idle() {
    let (coordinator, bus, _fanout, pool) = harness().await;
    let node_id = register(&coordinator, &bus, "edge-01").await;
    let exec_id = coordinator.dispatch(&node_id, "echo hi").await.unwrap();

    coordinator.handle_log_line(log_line(&exec_id, &node_id, "hi")).await;
    coordinator.handle_cmd_done(cmd_done(&exec_id, &node_id, 0)).await;

    let execution = repo::executions::get(&pool, &exec_id).await.unwrap().unwrap();
    assert_eq!(execution.status, "success");
    assert_eq!(execution.exit_code, Some(0));
    assert!(execution.finished_at.is_some());

    let node = repo::nodes::get_by_id(&pool, &node_id).await.unwrap().unwrap();
    assert_eq!(node.status, "idle");

    let logs = coordinator
        .get_execution_logs(&exec_id)
        .await
        .unwrap()
        .expect("execution exists");
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].line, "hi");
    assert_eq!(logs[0].stream, "stdout");
}

#[tokio::test]
async fn failing_command_marks_the_execution_failed() {
    let (coordinator, bus, _fanout, pool) = harness().await;
    let node_id = register(&coordinator, &bus, "edge-01").await;
    let exec_id = coordinator.dispatch(&node_id, "false").await.unwrap();

    coordinator.handle_cmd_done(cmd_done(&exec_id, &node_id, 2)).await;

    let execution = repo::executions::get(&pool, &exec_id).await.unwrap().unwrap();
    assert_eq!(execution.status, "failed");
    assert_eq!(execution.exit_code, Some(2));

    let node = repo::nodes::get_by_id(&pool, &node_id).await.unwrap().unwrap();
    assert_eq!(node.status, "idle");
}

#[tokio::test]
async fn duplicate_cmd_done_is_idempotent_and_emits_no_second_event() {
    let (coordinator, bus, fanout, pool) = harness().await;
    let node_id = register(&coordinator, &bus, "edge-01").await;
    let exec_id = coordinator.dispatch(&node_id, "false").await.unwrap();

    coordinator.handle_cmd_done(cmd_done(&exec_id, &node_id, 2)).await;
    let after_first = repo::executions::get(&pool, &exec_id).await.unwrap().unwrap();

    let (tx, mut rx) = mpsc::channel(8);
    fanout.attach_log(&node_id, tx).await;
    coordinator.handle_cmd_done(cmd_done(&exec_id, &node_id, 0)).await;

    let after_second = repo::executions::get(&pool, &exec_id).await.unwrap().unwrap();
    assert_eq!(after_second.status, after_first.status);
    assert_eq!(after_second.exit_code, after_first.exit_code);
    assert_eq!(after_second.finished_at, after_first.finished_at);
    assert!(rx.try_recv().is_err(), "duplicate must not emit events");
}

#[tokio::test]
async fn completion_event_precedes_the_idle_broadcast() {
    let (coordinator, bus, fanout, _pool) = harness().await;
    let node_id = register(&coordinator, &bus, "edge-01").await;
    let exec_id = coordinator.dispatch(&node_id, "echo hi").await.unwrap();

    // One channel attached to both planes observes relative order.
    let (tx, mut rx) = mpsc::channel(8);
    fanout.attach_log(&node_id, tx.clone()).await;
    fanout.attach_global(tx).await;

    coordinator.handle_cmd_done(cmd_done(&exec_id, &node_id, 0)).await;

    match rx.try_recv().expect("first event") {
        ViewerEvent::CmdDone { exec_id: id, .. } => assert_eq!(id, exec_id),
        other => panic!("expected cmd_done first, got {other:?}"),
    }
    match rx.try_recv().expect("second event") {
        ViewerEvent::NodeUpdate { status, .. } => assert_eq!(status, NodeStatus::Idle),
        other => panic!("expected node_update second, got {other:?}"),
    }
}

#[tokio::test]
async fn log_lines_are_returned_in_ingest_order() {
    let (coordinator, bus, _fanout, _pool) = harness().await;
    let node_id = register(&coordinator, &bus, "edge-01").await;
    let exec_id = coordinator.dispatch(&node_id, "seq 3").await.unwrap();

    for n in ["1", "2", "3"] {
        coordinator.handle_log_line(log_line(&exec_id, &node_id, n)).await;
    }

    let logs = coordinator
        .get_execution_logs(&exec_id)
        .await
        .unwrap()
        .unwrap();
    let lines: Vec<&str> = logs.iter().map(|l| l.line.as_str()).collect();
    assert_eq!(lines, vec!["1", "2", "3"]);
}

#[tokio::test]
async fn logs_for_an_unknown_execution_are_a_miss() {
    let (coordinator, _bus, _fanout, _pool) = harness().await;
    assert!(coordinator
        .get_execution_logs("abc123def456")
        .await
        .unwrap()
        .is_none());
}

// ---------------------------------------------------------------------------
// Heartbeats and liveness
// ---------------------------------------------------------------------------

#[tokio::test]
async fn heartbeat_updates_the_row_and_broadcasts() {
    let (coordinator, bus, fanout, pool) = harness().await;
    let node_id = register(&coordinator, &bus, "edge-01").await;
    let (tx, mut rx) = mpsc::channel(8);
    fanout.attach_global(tx).await;

    coordinator
        .handle_heartbeat(Heartbeat {
            node_id: node_id.clone(),
            status: NodeStatus::Idle,
            cpu_percent: 12.5,
            mem_percent: 40.0,
            timestamp: unix_now(),
        })
        .await;

    let node = repo::nodes::get_by_id(&pool, &node_id).await.unwrap().unwrap();
    assert_eq!(node.status, "idle");
    assert!((node.cpu_percent - 12.5).abs() < f64::EPSILON);

    assert!(matches!(
        rx.try_recv().expect("heartbeat event"),
        ViewerEvent::Heartbeat { .. }
    ));
}

#[tokio::test]
async fn heartbeat_for_an_unknown_node_is_dropped() {
    let (coordinator, _bus, fanout, _pool) = harness().await;
    let (tx, mut rx) = mpsc::channel(8);
    fanout.attach_global(tx).await;

    coordinator
        .handle_heartbeat(Heartbeat {
            node_id: "abc123def456".to_owned(),
            status: NodeStatus::Idle,
            cpu_percent: 0.0,
            mem_percent: 0.0,
            timestamp: unix_now(),
        })
        .await;

    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn sweep_marks_stale_nodes_offline_and_fails_their_executions() {
    let (coordinator, bus, fanout, pool) = harness().await;
    let node_id = register(&coordinator, &bus, "edge-01").await;
    let exec_id = coordinator.dispatch(&node_id, "sleep 600").await.unwrap();

    // Backdate the heartbeat past the offline threshold.
    sqlx::query("UPDATE nodes SET last_heartbeat = ? WHERE node_id = ?")
        .bind(Utc::now() - Duration::seconds(120))
        .bind(&node_id)
        .execute(&pool)
        .await
        .unwrap();

    let (tx, mut rx) = mpsc::channel(8);
    fanout.attach_log(&node_id, tx.clone()).await;
    fanout.attach_global(tx).await;

    let swept = coordinator.sweep_once().await.unwrap();
    assert_eq!(swept, vec![node_id.clone()]);

    let node = repo::nodes::get_by_id(&pool, &node_id).await.unwrap().unwrap();
    assert_eq!(node.status, "offline");

    let execution = repo::executions::get(&pool, &exec_id).await.unwrap().unwrap();
    assert_eq!(execution.status, "failed");
    assert_eq!(execution.exit_code, Some(ABANDONED_EXIT_CODE));

    match rx.try_recv().expect("abandoned completion first") {
        ViewerEvent::CmdDone { exit_code, .. } => assert_eq!(exit_code, ABANDONED_EXIT_CODE),
        other => panic!("expected cmd_done, got {other:?}"),
    }
    match rx.try_recv().expect("offline broadcast second") {
        ViewerEvent::NodeUpdate { status, .. } => assert_eq!(status, NodeStatus::Offline),
        other => panic!("expected node_update, got {other:?}"),
    }
}

#[tokio::test]
async fn sweep_leaves_fresh_nodes_alone() {
    let (coordinator, bus, _fanout, pool) = harness().await;
    let node_id = register(&coordinator, &bus, "edge-01").await;

    assert!(coordinator.sweep_once().await.unwrap().is_empty());
    let node = repo::nodes::get_by_id(&pool, &node_id).await.unwrap().unwrap();
    assert_eq!(node.status, "online");
}

#[tokio::test]
async fn startup_recovery_clears_stale_liveness_and_running_executions() {
    let (coordinator, bus, _fanout, pool) = harness().await;
    let node_id = register(&coordinator, &bus, "edge-01").await;
    let exec_id = coordinator.dispatch(&node_id, "sleep 600").await.unwrap();

    coordinator.startup_recovery().await.unwrap();

    let node = repo::nodes::get_by_id(&pool, &node_id).await.unwrap().unwrap();
    assert_eq!(node.status, "offline");
    let execution = repo::executions::get(&pool, &exec_id).await.unwrap().unwrap();
    assert_eq!(execution.status, "failed");
    assert_eq!(execution.exit_code, Some(ABANDONED_EXIT_CODE));
}
