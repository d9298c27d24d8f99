//! fleet-bus: thin adapter over the MQTT client.
//!
//! Wraps `rumqttc` with the conventions the orchestrator relies on:
//! JSON payloads decoded into [`fleet_protocol::BusMessage`], QoS 1
//! everywhere, wildcard subscription dispatch to registered handlers, and
//! exponential-backoff reconnection with automatic re-subscription.
//!
//! Handlers run on the network-loop task and must not block; real work is
//! handed off (`tokio::spawn`, `try_send`) and the handler returns
//! immediately.

mod client;
mod dispatch;

pub use client::{BusClient, BusConfig};
pub use dispatch::topic_matches;

use async_trait::async_trait;
use fleet_protocol::BusMessage;
use thiserror::Error;

/// Errors surfaced by the bus adapter.
///
/// Message-receive paths never raise to the caller; these cover connect,
/// subscribe, and publish only.
#[derive(Debug, Error)]
pub enum BusError {
    #[error("broker connection failed: {0}")]
    Connect(String),
    #[error("mqtt client error: {0}")]
    Client(#[from] rumqttc::ClientError),
    #[error("payload serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Publish seam for everything that emits bus messages.
///
/// Implemented by [`BusClient`] and by recording doubles in tests, so the
/// coordinator and the agent executor can be exercised without a broker.
#[async_trait]
pub trait BusPublisher: Send + Sync {
    async fn publish(&self, topic: &str, msg: &BusMessage) -> Result<(), BusError>;
}
