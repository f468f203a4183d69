//! In-memory network with injectable faults.
//!
//! Every node registers its [`MessageHandler`] with a shared [`SimNetwork`]
//! and talks to its peers through a [`SimTransport`]. Requests are delivered
//! by calling the peer's handler directly, after optional latency and loss,
//! unless a fault blocks the link.

use async_trait::async_trait;
use dashmap::DashMap;
use herald_core::{Message, MessageHandler, NodeId, Transport, TransportError};
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, info};

#[derive(Debug, Clone)]
pub struct NetworkConditions {
    pub latency_min: Duration,
    pub latency_max: Duration,
    /// Probability that a request is silently lost
    pub packet_loss_rate: f64,
}

impl Default for NetworkConditions {
    fn default() -> Self {
        Self {
            latency_min: Duration::from_millis(1),
            latency_max: Duration::from_millis(5),
            packet_loss_rate: 0.0,
        }
    }
}

impl NetworkConditions {
    pub fn instant() -> Self {
        Self {
            latency_min: Duration::ZERO,
            latency_max: Duration::ZERO,
            packet_loss_rate: 0.0,
        }
    }

    fn sample_latency(&self) -> Duration {
        if self.latency_max <= self.latency_min {
            return self.latency_min;
        }
        rand::thread_rng().gen_range(self.latency_min..self.latency_max)
    }

    fn drops(&self) -> bool {
        self.packet_loss_rate > 0.0 && rand::thread_rng().gen_bool(self.packet_loss_rate.min(1.0))
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct NetworkStats {
    pub messages_sent: u64,
    pub messages_delivered: u64,
    pub messages_refused: u64,
    pub messages_dropped: u64,
}

/// Shared registry of node handlers plus the fault table.
#[derive(Default)]
pub struct SimNetwork {
    handlers: DashMap<NodeId, Arc<dyn MessageHandler>>,
    /// Nodes whose every request in or out is refused
    isolated: RwLock<HashSet<NodeId>>,
    /// Directed links `(from, to)` whose requests are refused
    broken_links: RwLock<HashSet<(NodeId, NodeId)>>,
    conditions: RwLock<NetworkConditions>,
    stats: Mutex<NetworkStats>,
}

impl SimNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_conditions(conditions: NetworkConditions) -> Arc<Self> {
        let network = Self::default();
        *network.conditions.write() = conditions;
        Arc::new(network)
    }

    /// Transport used by `local` to reach its peers.
    pub fn transport(self: &Arc<Self>, local: NodeId) -> SimTransport {
        SimTransport {
            network: self.clone(),
            local,
        }
    }

    pub fn register(&self, id: NodeId, handler: Arc<dyn MessageHandler>) {
        debug!("Registered {} with the simulated network", id);
        self.handlers.insert(id, handler);
    }

    pub fn unregister(&self, id: &NodeId) {
        self.handlers.remove(id);
    }

    pub fn update_conditions(&self, conditions: NetworkConditions) {
        debug!("Updated network conditions: {:?}", conditions);
        *self.conditions.write() = conditions;
    }

    /// Refuses every request to or from `id`.
    pub fn isolate(&self, id: NodeId) {
        info!("Isolating {}", id);
        self.isolated.write().insert(id);
    }

    pub fn reconnect(&self, id: &NodeId) {
        info!("Reconnecting {}", id);
        self.isolated.write().remove(id);
    }

    /// Refuses requests sent by `from` to `to`. The reverse direction is
    /// unaffected.
    pub fn break_link(&self, from: NodeId, to: NodeId) {
        debug!("Breaking link {} -> {}", from, to);
        self.broken_links.write().insert((from, to));
    }

    pub fn repair_link(&self, from: &NodeId, to: &NodeId) {
        self.broken_links.write().remove(&(from.clone(), to.clone()));
    }

    pub fn clear_faults(&self) {
        info!("Clearing all network faults");
        self.isolated.write().clear();
        self.broken_links.write().clear();
    }

    pub fn stats(&self) -> NetworkStats {
        self.stats.lock().clone()
    }

    fn is_blocked(&self, from: &NodeId, to: &NodeId) -> bool {
        let isolated = self.isolated.read();
        if isolated.contains(from) || isolated.contains(to) {
            return true;
        }
        self.broken_links
            .read()
            .contains(&(from.clone(), to.clone()))
    }

    async fn deliver(
        &self,
        from: &NodeId,
        to: &NodeId,
        message: Message,
        timeout: Duration,
    ) -> Result<Message, TransportError> {
        self.stats.lock().messages_sent += 1;

        if self.is_blocked(from, to) {
            self.stats.lock().messages_refused += 1;
            return Err(TransportError::connection(to.clone(), "connection refused"));
        }

        let conditions = self.conditions.read().clone();
        if conditions.drops() {
            self.stats.lock().messages_dropped += 1;
            sleep(timeout).await;
            return Err(TransportError::TimedOut { peer: to.clone() });
        }

        let latency = conditions.sample_latency();
        if !latency.is_zero() {
            sleep(latency).await;
        }

        let handler = self
            .handlers
            .get(to)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| TransportError::connection(to.clone(), "no such node"))?;

        let reply = handler
            .handle_message(message)
            .await
            .map_err(|e| TransportError::connection(to.clone(), e.to_string()))?;
        self.stats.lock().messages_delivered += 1;
        Ok(reply)
    }
}

/// [`Transport`] over a [`SimNetwork`]. Peers are addressed by node id.
#[derive(Clone)]
pub struct SimTransport {
    network: Arc<SimNetwork>,
    local: NodeId,
}

#[async_trait]
impl Transport for SimTransport {
    type Handle = NodeId;

    async fn send(
        &self,
        _peer: &NodeId,
        handle: &NodeId,
        message: Message,
        timeout: Duration,
    ) -> Result<Message, TransportError> {
        self.network
            .deliver(&self.local, handle, message, timeout)
            .await
    }
}
