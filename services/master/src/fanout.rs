//! In-memory viewer fan-out plane.
//!
//! Two disjoint subscriber populations: a global set receiving fleet
//! status events, and per-node sets receiving that node's log events.
//! Pushes are best-effort: a closed channel removes the subscriber, a full
//! channel drops the event for that viewer (slow viewers lose events).

use crate::events::ViewerEvent;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::RwLock;

pub type ViewerId = u64;
pub type ViewerSender = mpsc::Sender<ViewerEvent>;

#[derive(Default)]
pub struct FanoutPlane {
    next_id: AtomicU64,
    global: RwLock<HashMap<ViewerId, ViewerSender>>,
    logs: RwLock<HashMap<String, HashMap<ViewerId, ViewerSender>>>,
}

impl FanoutPlane {
    pub fn new() -> Self {
        Self::default()
    }

    fn allocate_id(&self) -> ViewerId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub async fn attach_global(&self, tx: ViewerSender) -> ViewerId {
        let id = self.allocate_id();
        self.global.write().await.insert(id, tx);
        id
    }

    pub async fn detach_global(&self, id: ViewerId) {
        self.global.write().await.remove(&id);
    }

    pub async fn attach_log(&self, node_id: &str, tx: ViewerSender) -> ViewerId {
        let id = self.allocate_id();
        self.logs
            .write()
            .await
            .entry(node_id.to_owned())
            .or_default()
            .insert(id, tx);
        id
    }

    pub async fn detach_log(&self, node_id: &str, id: ViewerId) {
        let mut logs = self.logs.write().await;
        if let Some(set) = logs.get_mut(node_id) {
            set.remove(&id);
            if set.is_empty() {
                logs.remove(node_id);
            }
        }
    }

    /// Deliver a status event to every global subscriber.
    pub async fn broadcast_global(&self, event: ViewerEvent) {
        let targets: Vec<(ViewerId, ViewerSender)> = self
            .global
            .read()
            .await
            .iter()
            .map(|(id, tx)| (*id, tx.clone()))
            .collect();
        let dead = deliver(&targets, &event);
        if !dead.is_empty() {
            let mut global = self.global.write().await;
            for id in dead {
                global.remove(&id);
            }
        }
    }

    /// Deliver a log event to the subscribers watching `node_id`.
    pub async fn push_log(&self, node_id: &str, event: ViewerEvent) {
        let targets: Vec<(ViewerId, ViewerSender)> = match self.logs.read().await.get(node_id) {
            Some(set) => set.iter().map(|(id, tx)| (*id, tx.clone())).collect(),
            None => return,
        };
        let dead = deliver(&targets, &event);
        if !dead.is_empty() {
            let mut logs = self.logs.write().await;
            if let Some(set) = logs.get_mut(node_id) {
                for id in dead {
                    set.remove(&id);
                }
                if set.is_empty() {
                    logs.remove(node_id);
                }
            }
        }
    }

    pub async fn global_count(&self) -> usize {
        self.global.read().await.len()
    }

    pub async fn log_count(&self, node_id: &str) -> usize {
        self.logs.read().await.get(node_id).map_or(0, HashMap::len)
    }
}

/// Send to each target without holding any lock; returns the ids whose
/// channels are closed.
fn deliver(targets: &[(ViewerId, ViewerSender)], event: &ViewerEvent) -> Vec<ViewerId> {
    let mut dead = Vec::new();
    for (id, tx) in targets {
        match tx.try_send(event.clone()) {
            Ok(()) => {}
            // Slow viewer: the event is lost for them, but they stay attached.
            Err(TrySendError::Full(_)) => {}
            Err(TrySendError::Closed(_)) => dead.push(*id),
        }
    }
    dead
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_protocol::NodeStatus;

    fn status_event(node_id: &str) -> ViewerEvent {
        ViewerEvent::node_update(node_id, NodeStatus::Online)
    }

    #[tokio::test]
    async fn global_broadcast_reaches_every_attached_viewer() {
        let plane = FanoutPlane::new();
        let (tx_a, mut rx_a) = mpsc::channel(8);
        let (tx_b, mut rx_b) = mpsc::channel(8);
        plane.attach_global(tx_a).await;
        plane.attach_global(tx_b).await;

        plane.broadcast_global(status_event("abc123def456")).await;

        assert!(rx_a.try_recv().is_ok());
        assert!(rx_b.try_recv().is_ok());
    }

    #[tokio::test]
    async fn log_push_is_scoped_to_one_node() {
        let plane = FanoutPlane::new();
        let (tx_a, mut rx_a) = mpsc::channel(8);
        let (tx_b, mut rx_b) = mpsc::channel(8);
        plane.attach_log("node-a", tx_a).await;
        plane.attach_log("node-b", tx_b).await;

        plane.push_log("node-a", status_event("node-a")).await;

        assert!(rx_a.try_recv().is_ok());
        assert!(rx_b.try_recv().is_err());
    }

    #[tokio::test]
    async fn closed_channel_is_removed_on_push() {
        let plane = FanoutPlane::new();
        let (tx, rx) = mpsc::channel(8);
        plane.attach_global(tx).await;
        drop(rx);

        assert_eq!(plane.global_count().await, 1);
        plane.broadcast_global(status_event("abc123def456")).await;
        assert_eq!(plane.global_count().await, 0);
    }

    #[tokio::test]
    async fn full_channel_drops_event_but_keeps_subscriber() {
        let plane = FanoutPlane::new();
        let (tx, mut rx) = mpsc::channel(1);
        plane.attach_global(tx).await;

        plane.broadcast_global(status_event("abc123def456")).await;
        plane.broadcast_global(status_event("abc123def456")).await;

        assert_eq!(plane.global_count().await, 1);
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err(), "second event should have been dropped");
    }

    #[tokio::test]
    async fn detach_log_prunes_empty_node_sets() {
        let plane = FanoutPlane::new();
        let (tx, _rx) = mpsc::channel(8);
        let id = plane.attach_log("node-a", tx).await;
        assert_eq!(plane.log_count("node-a").await, 1);

        plane.detach_log("node-a", id).await;
        assert_eq!(plane.log_count("node-a").await, 0);
    }
}
