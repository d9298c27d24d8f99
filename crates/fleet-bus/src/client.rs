//! MQTT client lifecycle: connect, background network loop, reconnect.

use crate::dispatch::{Handler, SubscriptionSet};
use crate::{BusError, BusPublisher};
use async_trait::async_trait;
use fleet_protocol::BusMessage;
use rumqttc::{AsyncClient, ConnectReturnCode, Event, EventLoop, Incoming, MqttOptions, QoS};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::{debug, info, warn};

const RECONNECT_MIN: Duration = Duration::from_secs(1);
const RECONNECT_MAX: Duration = Duration::from_secs(60);
const KEEP_ALIVE: Duration = Duration::from_secs(30);

/// Broker endpoint and client identity.
#[derive(Debug, Clone)]
pub struct BusConfig {
    pub host: String,
    pub port: u16,
    /// MQTT client id; must be unique per connected process.
    pub client_id: String,
}

/// Handle to a connected bus session.
///
/// Cheap to clone; all clones share the underlying connection and
/// subscription set.
#[derive(Clone)]
pub struct BusClient {
    client: AsyncClient,
    subs: Arc<RwLock<SubscriptionSet>>,
    closed: Arc<AtomicBool>,
}

impl BusClient {
    /// Connect to the broker, blocking until the CONNACK arrives (or the
    /// connection fails), then spawn the network loop.
    pub async fn connect(cfg: &BusConfig) -> Result<Self, BusError> {
        let mut opts = MqttOptions::new(cfg.client_id.clone(), cfg.host.clone(), cfg.port);
        opts.set_keep_alive(KEEP_ALIVE);
        let (client, mut eventloop) = AsyncClient::new(opts, 128);

        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Incoming::ConnAck(ack))) => {
                    if ack.code == ConnectReturnCode::Success {
                        break;
                    }
                    return Err(BusError::Connect(format!(
                        "broker refused connection: {:?}",
                        ack.code
                    )));
                }
                Ok(_) => {}
                Err(e) => return Err(BusError::Connect(e.to_string())),
            }
        }
        info!(host = %cfg.host, port = cfg.port, client_id = %cfg.client_id, "bus connected");

        let bus = BusClient {
            client,
            subs: Arc::new(RwLock::new(SubscriptionSet::default())),
            closed: Arc::new(AtomicBool::new(false)),
        };
        tokio::spawn(network_loop(
            bus.client.clone(),
            bus.subs.clone(),
            bus.closed.clone(),
            eventloop,
        ));
        Ok(bus)
    }

    /// Register `handler` for messages whose topic matches `pattern` and
    /// issue the broker SUBSCRIBE.  The pattern is re-applied automatically
    /// after every reconnect.
    pub async fn subscribe<F>(&self, pattern: &str, handler: F) -> Result<(), BusError>
    where
        F: Fn(&str, BusMessage) + Send + Sync + 'static,
    {
        let handler: Handler = Arc::new(handler);
        self.subs
            .write()
            .expect("subscription set lock poisoned")
            .add(pattern, handler);
        self.client.subscribe(pattern, QoS::AtLeastOnce).await?;
        Ok(())
    }

    /// Serialize `msg` to JSON and enqueue it for publish at QoS 1.
    pub async fn publish(&self, topic: &str, msg: &BusMessage) -> Result<(), BusError> {
        let payload = serde_json::to_vec(msg)?;
        self.client
            .publish(topic, QoS::AtLeastOnce, false, payload)
            .await?;
        Ok(())
    }

    /// Stop the network loop and close the connection.
    pub async fn disconnect(&self) {
        self.closed.store(true, Ordering::SeqCst);
        if let Err(e) = self.client.disconnect().await {
            debug!(error = %e, "disconnect request failed (connection already down)");
        }
    }
}

#[async_trait]
impl BusPublisher for BusClient {
    async fn publish(&self, topic: &str, msg: &BusMessage) -> Result<(), BusError> {
        BusClient::publish(self, topic, msg).await
    }
}

/// Drive the MQTT event loop: dispatch publishes, re-subscribe after each
/// reconnect, and back off exponentially while the broker is unreachable.
async fn network_loop(
    client: AsyncClient,
    subs: Arc<RwLock<SubscriptionSet>>,
    closed: Arc<AtomicBool>,
    mut eventloop: EventLoop,
) {
    let mut backoff = RECONNECT_MIN;
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Incoming::ConnAck(ack))) => {
                if ack.code != ConnectReturnCode::Success {
                    warn!(code = ?ack.code, "broker refused reconnection");
                    continue;
                }
                info!("bus connection (re-)established");
                backoff = RECONNECT_MIN;
                let patterns = subs
                    .read()
                    .expect("subscription set lock poisoned")
                    .patterns();
                for pattern in patterns {
                    if let Err(e) = client.subscribe(pattern.as_str(), QoS::AtLeastOnce).await {
                        warn!(pattern = %pattern, error = %e, "re-subscribe failed");
                    }
                }
            }
            Ok(Event::Incoming(Incoming::Publish(publish))) => {
                subs.read()
                    .expect("subscription set lock poisoned")
                    .dispatch(&publish.topic, &publish.payload);
            }
            Ok(_) => {}
            Err(e) => {
                if closed.load(Ordering::SeqCst) {
                    break;
                }
                warn!(error = %e, retry_in_secs = backoff.as_secs(), "bus connection lost");
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(RECONNECT_MAX);
            }
        }
    }
    debug!("bus network loop stopped");
}
