//! Master-side coordinator: registration, heartbeat ingest, log ingest,
//! command dispatch, and the liveness sweep.
//!
//! Bus handlers are invoked on the bus network-loop task; they hand each
//! message to a spawned task and never block or propagate errors back into
//! the bus client.  Database writes always commit before the matching
//! fan-out event is pushed.

use crate::events::ViewerEvent;
use crate::fanout::FanoutPlane;
use crate::{id, repo};
use chrono::{Duration, Utc};
use fleet_bus::{BusClient, BusError, BusPublisher};
use fleet_protocol::{
    topic_cmd, unix_now, BusMessage, Cmd, CmdDone, ExecStatus, Heartbeat, LogLine, NodeStatus,
    RegisterAck, RegisterNak, RegisterReq, TOPIC_HEARTBEAT, TOPIC_LOG_WILDCARD, TOPIC_REGISTER,
};
use sqlx::SqlitePool;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// A node is declared offline once its last heartbeat is older than this.
pub const OFFLINE_AFTER_SECS: i64 = 60;

/// Sentinel exit code for executions that can never complete (node went
/// offline, or the Master restarted while they were running).
pub const ABANDONED_EXIT_CODE: i32 = -1;

const ID_INSERT_ATTEMPTS: u32 = 4;

/// Failures surfaced by [`Coordinator::dispatch`], mapped to HTTP status
/// codes by the routing layer.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("node not found: {0}")]
    NodeMissing(String),
    #[error("node {0} is offline")]
    NodeOffline(String),
    #[error("store failure: {0}")]
    Store(#[from] sqlx::Error),
    #[error("command publish failed: {0}")]
    Bus(#[from] BusError),
}

#[derive(Debug, Error)]
enum HandlerError {
    #[error(transparent)]
    Store(#[from] sqlx::Error),
    #[error(transparent)]
    Bus(#[from] BusError),
    #[error("could not allocate a unique node id")]
    IdExhausted,
}

pub struct Coordinator {
    pool: SqlitePool,
    bus: Arc<dyn BusPublisher>,
    fanout: Arc<FanoutPlane>,
    secret_key: String,
}

impl Coordinator {
    pub fn new(
        pool: SqlitePool,
        bus: Arc<dyn BusPublisher>,
        fanout: Arc<FanoutPlane>,
        secret_key: String,
    ) -> Self {
        Self {
            pool,
            bus,
            fanout,
            secret_key,
        }
    }

    // -----------------------------------------------------------------------
    // Public operations (consumed by the HTTP layer)
    // -----------------------------------------------------------------------

    pub async fn list_nodes(&self) -> Result<Vec<repo::NodeRow>, sqlx::Error> {
        repo::nodes::list_all(&self.pool).await
    }

    pub async fn get_node(&self, node_id: &str) -> Result<Option<repo::NodeRow>, sqlx::Error> {
        repo::nodes::get_by_id(&self.pool, node_id).await
    }

    /// Create an execution record, mark the node busy, and publish the
    /// command on the node's command topic.
    ///
    /// Dispatch to a `busy` node is permitted — the Agent queues commands
    /// and runs them sequentially.  Only missing and offline nodes reject.
    pub async fn dispatch(&self, node_id: &str, command: &str) -> Result<String, DispatchError> {
        let node = repo::nodes::get_by_id(&self.pool, node_id)
            .await?
            .ok_or_else(|| DispatchError::NodeMissing(node_id.to_owned()))?;
        if node.status == NodeStatus::Offline.as_str() {
            return Err(DispatchError::NodeOffline(node_id.to_owned()));
        }

        let now = Utc::now();
        let mut exec_id = id::generate();
        for attempt in 0.. {
            match repo::executions::insert(&self.pool, &exec_id, node_id, command, now).await {
                Ok(()) => break,
                Err(sqlx::Error::Database(db))
                    if db.is_unique_violation() && attempt + 1 < ID_INSERT_ATTEMPTS =>
                {
                    exec_id = id::generate();
                }
                Err(e) => return Err(e.into()),
            }
        }
        repo::nodes::set_status(&self.pool, node_id, NodeStatus::Busy.as_str()).await?;

        self.bus
            .publish(
                &topic_cmd(node_id),
                &BusMessage::Cmd(Cmd {
                    exec_id: exec_id.clone(),
                    command: command.to_owned(),
                    timestamp: unix_now(),
                }),
            )
            .await?;
        info!(node_id = %node_id, exec_id = %exec_id, "command dispatched");
        Ok(exec_id)
    }

    pub async fn list_executions(
        &self,
        node_id: Option<&str>,
        limit: i64,
    ) -> Result<Vec<repo::ExecutionRow>, sqlx::Error> {
        repo::executions::list(&self.pool, node_id, limit).await
    }

    /// Ordered log lines for one execution; `None` when the execution does
    /// not exist.
    pub async fn get_execution_logs(
        &self,
        exec_id: &str,
    ) -> Result<Option<Vec<repo::LogLineRow>>, sqlx::Error> {
        if repo::executions::get(&self.pool, exec_id).await?.is_none() {
            return Ok(None);
        }
        repo::log_lines::list_for_execution(&self.pool, exec_id)
            .await
            .map(Some)
    }

    // -----------------------------------------------------------------------
    // Bus message handlers
    // -----------------------------------------------------------------------

    pub async fn handle_register(&self, req: RegisterReq) {
        if let Err(e) = self.register_inner(req).await {
            error!(error = %e, "register handler failed");
        }
    }

    async fn register_inner(&self, req: RegisterReq) -> Result<(), HandlerError> {
        if req.secret_key != self.secret_key {
            warn!(node_name = %req.node_name, "registration denied: secret mismatch");
            self.bus
                .publish(
                    TOPIC_REGISTER,
                    &BusMessage::RegisterNak(RegisterNak {
                        reason: "secret mismatch".to_owned(),
                    }),
                )
                .await?;
            return Ok(());
        }

        let now = Utc::now();
        let node_id = match repo::nodes::get_by_name(&self.pool, &req.node_name).await? {
            Some(node) => {
                repo::nodes::mark_online(&self.pool, &node.node_id, &req.ip, now).await?;
                info!(node_id = %node.node_id, node_name = %req.node_name, ip = %req.ip, "node re-registered");
                node.node_id
            }
            None => {
                let node_id = self.insert_with_fresh_id(&req).await?;
                info!(node_id = %node_id, node_name = %req.node_name, ip = %req.ip, "node registered");
                node_id
            }
        };

        self.bus
            .publish(
                TOPIC_REGISTER,
                &BusMessage::RegisterAck(RegisterAck {
                    node_id: node_id.clone(),
                    message: format!("registered as {node_id}"),
                }),
            )
            .await?;
        self.fanout
            .broadcast_global(ViewerEvent::node_update(&node_id, NodeStatus::Online))
            .await;
        Ok(())
    }

    /// Insert a fresh node row, re-drawing the id on a uniqueness clash.
    /// A clash on `node_name` (two concurrent registrations of the same
    /// name) resolves to the row that won the race.
    async fn insert_with_fresh_id(&self, req: &RegisterReq) -> Result<String, HandlerError> {
        for _ in 0..ID_INSERT_ATTEMPTS {
            let node_id = id::generate();
            match repo::nodes::insert(&self.pool, &node_id, &req.node_name, &req.ip, Utc::now())
                .await
            {
                Ok(()) => return Ok(node_id),
                Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                    if let Some(existing) =
                        repo::nodes::get_by_name(&self.pool, &req.node_name).await?
                    {
                        repo::nodes::mark_online(&self.pool, &existing.node_id, &req.ip, Utc::now())
                            .await?;
                        return Ok(existing.node_id);
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(HandlerError::IdExhausted)
    }

    pub async fn handle_heartbeat(&self, hb: Heartbeat) {
        if let Err(e) = self.heartbeat_inner(hb).await {
            error!(error = %e, "heartbeat handler failed");
        }
    }

    async fn heartbeat_inner(&self, hb: Heartbeat) -> Result<(), HandlerError> {
        let known = repo::nodes::apply_heartbeat(
            &self.pool,
            &hb.node_id,
            hb.status.as_str(),
            hb.cpu_percent,
            hb.mem_percent,
            Utc::now(),
        )
        .await?;
        if !known {
            warn!(node_id = %hb.node_id, "heartbeat for unknown node dropped");
            return Ok(());
        }
        self.fanout
            .broadcast_global(ViewerEvent::Heartbeat {
                node_id: hb.node_id,
                status: hb.status,
                cpu_percent: hb.cpu_percent,
                mem_percent: hb.mem_percent,
            })
            .await;
        Ok(())
    }

    pub async fn handle_log_line(&self, line: LogLine) {
        if let Err(e) = self.log_line_inner(line).await {
            error!(error = %e, "log handler failed");
        }
    }

    async fn log_line_inner(&self, line: LogLine) -> Result<(), HandlerError> {
        repo::log_lines::insert(
            &self.pool,
            &line.exec_id,
            line.stream.as_str(),
            &line.line,
            line.timestamp,
        )
        .await?;
        let node_id = line.node_id.clone();
        self.fanout
            .push_log(
                &node_id,
                ViewerEvent::LogLine {
                    exec_id: line.exec_id,
                    node_id: line.node_id,
                    stream: line.stream,
                    line: line.line,
                    timestamp: line.timestamp,
                },
            )
            .await;
        Ok(())
    }

    pub async fn handle_cmd_done(&self, done: CmdDone) {
        if let Err(e) = self.cmd_done_inner(done).await {
            error!(error = %e, "cmd_done handler failed");
        }
    }

    async fn cmd_done_inner(&self, done: CmdDone) -> Result<(), HandlerError> {
        let status = ExecStatus::from_exit_code(done.exit_code);
        let finished = repo::executions::finish(
            &self.pool,
            &done.exec_id,
            status.as_str(),
            done.exit_code,
            Utc::now(),
        )
        .await?;
        if !finished {
            debug!(exec_id = %done.exec_id, "duplicate cmd_done ignored");
            return Ok(());
        }
        repo::nodes::set_status(&self.pool, &done.node_id, NodeStatus::Idle.as_str()).await?;
        info!(exec_id = %done.exec_id, node_id = %done.node_id, exit_code = done.exit_code, "execution finished");

        // Completion must reach log viewers before the idle broadcast.
        let node_id = done.node_id.clone();
        self.fanout
            .push_log(
                &node_id,
                ViewerEvent::CmdDone {
                    exec_id: done.exec_id,
                    node_id: done.node_id.clone(),
                    exit_code: done.exit_code,
                    status,
                },
            )
            .await;
        self.fanout
            .broadcast_global(ViewerEvent::node_update(&done.node_id, NodeStatus::Idle))
            .await;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Liveness sweep and startup recovery
    // -----------------------------------------------------------------------

    /// One sweep pass: nodes silent for longer than [`OFFLINE_AFTER_SECS`]
    /// go offline, and their running executions are failed with the
    /// abandoned sentinel so operators are not left watching a command
    /// that can never complete.
    pub async fn sweep_once(&self) -> Result<Vec<String>, sqlx::Error> {
        let cutoff = Utc::now() - Duration::seconds(OFFLINE_AFTER_SECS);
        let stale = repo::nodes::sweep_stale(&self.pool, cutoff).await?;
        for node_id in &stale {
            let abandoned = repo::executions::fail_running_for_node(
                &self.pool,
                node_id,
                ABANDONED_EXIT_CODE,
                Utc::now(),
            )
            .await?;
            for exec_id in abandoned {
                warn!(node_id = %node_id, exec_id = %exec_id, "execution abandoned: node went offline");
                self.fanout
                    .push_log(
                        node_id,
                        ViewerEvent::CmdDone {
                            exec_id,
                            node_id: node_id.clone(),
                            exit_code: ABANDONED_EXIT_CODE,
                            status: ExecStatus::Failed,
                        },
                    )
                    .await;
            }
            warn!(node_id = %node_id, "node marked offline: heartbeat timeout");
            self.fanout
                .broadcast_global(ViewerEvent::node_update(node_id, NodeStatus::Offline))
                .await;
        }
        Ok(stale)
    }

    /// Clear liveness state left over from an unclean shutdown.  No agent
    /// can be live before its first post-restart heartbeat, and `running`
    /// executions from a previous life can never complete.
    pub async fn startup_recovery(&self) -> Result<(), sqlx::Error> {
        let nodes = repo::nodes::mark_all_offline(&self.pool).await?;
        let executions =
            repo::executions::fail_all_running(&self.pool, ABANDONED_EXIT_CODE, Utc::now()).await?;
        if nodes > 0 || executions > 0 {
            info!(nodes, executions, "stale state cleared at startup");
        }
        Ok(())
    }
}

/// Messages buffered between the bus network loop and the log worker.
const LOG_INGEST_QUEUE_DEPTH: usize = 1024;

/// Wire the coordinator's handlers into the bus client.
///
/// The closures run on the bus network-loop task and never block:
/// registration and heartbeats are fire-and-forget spawns, while log
/// traffic funnels through a single worker so lines reach the store and
/// the fan-out plane in arrival order.
pub async fn attach_bus_handlers(
    bus: &BusClient,
    coordinator: Arc<Coordinator>,
) -> Result<(), BusError> {
    let coord = coordinator.clone();
    bus.subscribe(TOPIC_REGISTER, move |_topic, msg| {
        // The Master's own acks come back on this topic; only requests matter.
        if let BusMessage::RegisterReq(req) = msg {
            let coord = coord.clone();
            tokio::spawn(async move { coord.handle_register(req).await });
        }
    })
    .await?;

    let coord = coordinator.clone();
    bus.subscribe(TOPIC_HEARTBEAT, move |_topic, msg| {
        if let BusMessage::Heartbeat(hb) = msg {
            let coord = coord.clone();
            tokio::spawn(async move { coord.handle_heartbeat(hb).await });
        }
    })
    .await?;

    let (log_tx, mut log_rx) = mpsc::channel::<BusMessage>(LOG_INGEST_QUEUE_DEPTH);
    let coord = coordinator;
    tokio::spawn(async move {
        while let Some(msg) = log_rx.recv().await {
            match msg {
                BusMessage::LogLine(line) => coord.handle_log_line(line).await,
                BusMessage::CmdDone(done) => coord.handle_cmd_done(done).await,
                _ => {}
            }
        }
    });
    bus.subscribe(TOPIC_LOG_WILDCARD, move |topic, msg| match msg {
        BusMessage::LogLine(_) | BusMessage::CmdDone(_) => {
            if log_tx.try_send(msg).is_err() {
                warn!(topic, "log ingest queue full, dropping message");
            }
        }
        other => warn!(topic, kind = ?other, "unexpected message kind on log topic"),
    })
    .await?;

    Ok(())
}
