//! Agent lifecycle: registration handshake, heartbeat loop, and the
//! single-worker command queue.

use crate::config::AgentConfig;
use crate::sysstat::SystemSampler;
use crate::{executor, identity};
use fleet_bus::{BusClient, BusConfig, BusError};
use fleet_protocol::{
    topic_cmd, unix_now, BusMessage, Cmd, Heartbeat, NodeStatus, RegisterReq, TOPIC_HEARTBEAT,
    TOPIC_REGISTER,
};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

const REGISTER_TIMEOUT: Duration = Duration::from_secs(30);
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);
const PUBLISH_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Commands accepted while busy queue here and run sequentially.
const COMMAND_QUEUE_DEPTH: usize = 32;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error(transparent)]
    Bus(#[from] BusError),
    #[error("registration denied: {0}")]
    RegistrationDenied(String),
    #[error("no registration ack within {} seconds", REGISTER_TIMEOUT.as_secs())]
    RegistrationTimeout,
    #[error("failed to write identity file: {0}")]
    Identity(std::io::Error),
}

/// Run the agent until SIGINT.  An in-flight execution is allowed to
/// finish and publish its `cmd_done` before the process exits.
pub async fn run(cfg: AgentConfig) -> Result<(), AgentError> {
    let bus = BusClient::connect(&BusConfig {
        host: cfg.mqtt_host.clone(),
        port: cfg.mqtt_port,
        client_id: format!("agent-{}", cfg.node_name),
    })
    .await?;

    let node_id = register(&bus, &cfg).await?;

    let (job_tx, job_rx) = mpsc::channel::<Cmd>(COMMAND_QUEUE_DEPTH);
    bus.subscribe(&topic_cmd(&node_id), move |_topic, msg| {
        if let BusMessage::Cmd(cmd) = msg {
            if job_tx.try_send(cmd).is_err() {
                warn!("command queue full, dropping dispatch");
            }
        }
    })
    .await?;

    let (status_tx, status_rx) = watch::channel(NodeStatus::Idle);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let heartbeat = tokio::spawn(heartbeat_loop(bus.clone(), node_id.clone(), status_rx));
    let worker = tokio::spawn(worker_loop(
        bus.clone(),
        node_id.clone(),
        job_rx,
        status_tx,
        shutdown_rx,
    ));

    info!(node_id = %node_id, "agent ready");
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "failed to wait for shutdown signal");
    }
    info!("shutdown requested");

    heartbeat.abort();
    let _ = shutdown_tx.send(true);
    let _ = worker.await;
    bus.disconnect().await;
    info!("agent stopped");
    Ok(())
}

/// Publish a `register_req` and wait for the Master's verdict.
async fn register(bus: &BusClient, cfg: &AgentConfig) -> Result<String, AgentError> {
    let (ack_tx, mut ack_rx) = mpsc::channel::<BusMessage>(8);
    bus.subscribe(TOPIC_REGISTER, move |_topic, msg| match msg {
        BusMessage::RegisterAck(_) | BusMessage::RegisterNak(_) => {
            let _ = ack_tx.try_send(msg);
        }
        // Our own register_req echoes back on this topic.
        _ => {}
    })
    .await?;

    if let Some(cached) = identity::load(&cfg.node_id_file) {
        info!(node_id = %cached, "cached identity found; master remains authoritative");
    }

    let req = RegisterReq {
        node_name: cfg.node_name.clone(),
        secret_key: cfg.secret_key.clone(),
        ip: local_ip(),
        timestamp: unix_now(),
    };
    info!(node_name = %req.node_name, ip = %req.ip, "registering");
    bus.publish(TOPIC_REGISTER, &BusMessage::RegisterReq(req))
        .await?;

    match tokio::time::timeout(REGISTER_TIMEOUT, ack_rx.recv()).await {
        Ok(Some(BusMessage::RegisterAck(ack))) => {
            identity::save(&cfg.node_id_file, &ack.node_id).map_err(AgentError::Identity)?;
            info!(node_id = %ack.node_id, message = %ack.message, "registered");
            Ok(ack.node_id)
        }
        Ok(Some(BusMessage::RegisterNak(nak))) => {
            Err(AgentError::RegistrationDenied(nak.reason))
        }
        Ok(_) | Err(_) => Err(AgentError::RegistrationTimeout),
    }
}

/// Publish a heartbeat every 15 seconds with the current status and
/// best-effort system stats.  Transient publish failures back off briefly
/// and the loop continues.
async fn heartbeat_loop(bus: BusClient, node_id: String, status: watch::Receiver<NodeStatus>) {
    let mut sampler = SystemSampler::new();
    let mut interval = tokio::time::interval(HEARTBEAT_INTERVAL);
    loop {
        interval.tick().await;
        let (cpu_percent, mem_percent) = sampler.sample();
        let hb = BusMessage::Heartbeat(Heartbeat {
            node_id: node_id.clone(),
            status: *status.borrow(),
            cpu_percent,
            mem_percent,
            timestamp: unix_now(),
        });
        if let Err(e) = bus.publish(TOPIC_HEARTBEAT, &hb).await {
            warn!(error = %e, "heartbeat publish failed, retrying shortly");
            tokio::time::sleep(PUBLISH_RETRY_DELAY).await;
        }
    }
}

/// Drain the command queue one job at a time.  Shutdown is only observed
/// between jobs, so an in-flight execution always completes.
async fn worker_loop(
    bus: BusClient,
    node_id: String,
    mut jobs: mpsc::Receiver<Cmd>,
    status: watch::Sender<NodeStatus>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let cmd = tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            cmd = jobs.recv() => match cmd {
                Some(cmd) => cmd,
                None => break,
            },
        };
        let _ = status.send(NodeStatus::Busy);
        info!(exec_id = %cmd.exec_id, command = %cmd.command, "executing command");
        let exit_code = executor::execute(&bus, &cmd.command, &cmd.exec_id, &node_id).await;
        info!(exec_id = %cmd.exec_id, exit_code, "command finished");
        let _ = status.send(NodeStatus::Idle);
    }
}

/// Best-effort local IP discovery: the address a UDP socket would source
/// from for an external destination.  No packet is sent.
fn local_ip() -> String {
    let probe = || -> std::io::Result<String> {
        let socket = std::net::UdpSocket::bind("0.0.0.0:0")?;
        socket.connect("8.8.8.8:80")?;
        Ok(socket.local_addr()?.ip().to_string())
    };
    probe().unwrap_or_else(|_| "127.0.0.1".to_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_ip_is_a_parseable_address() {
        let ip = local_ip();
        assert!(ip.parse::<std::net::IpAddr>().is_ok(), "got: {ip}");
    }
}
