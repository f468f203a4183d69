//! Multi-node cluster harness over the simulated network.

use crate::network_sim::{SimNetwork, SimTransport};
use anyhow::{anyhow, Context};
use herald_core::{ElectionConfig, MessageHandler, NodeId};
use herald_engine::Node;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

pub type SimNode = Node<SimTransport>;

/// Leader view of every node in a cluster, keyed by node id.
pub type ClusterStatus = BTreeMap<NodeId, Option<NodeId>>;

/// A group of nodes that know each other as peers.
///
/// Several clusters may share one [`SimNetwork`]; moving a node between
/// clusters with [`TestCluster::remove`] and [`TestCluster::add`] changes
/// who it considers a peer, which is how partitions are staged.
pub struct TestCluster {
    network: Arc<SimNetwork>,
    nodes: BTreeMap<NodeId, SimNode>,
}

impl TestCluster {
    pub fn new() -> Self {
        Self::with_network(SimNetwork::new())
    }

    pub fn with_network(network: Arc<SimNetwork>) -> Self {
        Self {
            network,
            nodes: BTreeMap::new(),
        }
    }

    pub fn network(&self) -> &Arc<SimNetwork> {
        &self.network
    }

    /// Starts a node whose peers are the current members, then introduces
    /// it to each of them.
    pub async fn spawn_node(
        &mut self,
        id: impl Into<NodeId>,
        config: ElectionConfig,
    ) -> anyhow::Result<SimNode> {
        let id = id.into();
        let peers: Vec<(NodeId, NodeId)> = self
            .nodes
            .keys()
            .map(|peer| (peer.clone(), peer.clone()))
            .collect();

        let node = Node::new(
            id.clone(),
            peers,
            config,
            self.network.transport(id.clone()),
        )
        .await
        .with_context(|| format!("failed to start node {}", id))?;
        self.network
            .register(id.clone(), Arc::new(node.clone()) as Arc<dyn MessageHandler>);

        for (peer_id, peer) in &self.nodes {
            peer.add_peer(id.clone(), id.clone())
                .await
                .with_context(|| format!("{} could not add {}", peer_id, id))?;
        }
        info!("Spawned node {}", id);
        self.nodes.insert(id, node.clone());
        Ok(node)
    }

    /// Adds an existing node to this cluster, linking it with every member.
    pub async fn add(&mut self, id: impl Into<NodeId>, node: SimNode) -> anyhow::Result<()> {
        let id = id.into();
        for (peer_id, peer) in &self.nodes {
            peer.add_peer(id.clone(), id.clone()).await?;
            node.add_peer(peer_id.clone(), peer_id.clone()).await?;
        }
        self.nodes.insert(id, node);
        Ok(())
    }

    /// Takes a node out of this cluster, unlinking it from every member.
    /// The node keeps running.
    pub async fn remove(&mut self, id: impl Into<NodeId>) -> anyhow::Result<SimNode> {
        let id = id.into();
        let node = self
            .nodes
            .remove(&id)
            .ok_or_else(|| anyhow!("node {} is not in this cluster", id))?;
        for (peer_id, peer) in &self.nodes {
            peer.remove_peer(id.clone()).await?;
            node.remove_peer(peer_id.clone()).await?;
        }
        Ok(node)
    }

    pub fn node(&self, id: &str) -> Option<&SimNode> {
        self.nodes.get(&NodeId::from(id))
    }

    pub fn nodes(&self) -> impl Iterator<Item = (&NodeId, &SimNode)> {
        self.nodes.iter()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn status(&self) -> ClusterStatus {
        self.nodes
            .iter()
            .map(|(id, node)| (id.clone(), node.leader()))
            .collect()
    }

    /// First node that reports itself as leader.
    pub fn leader(&self) -> Option<&SimNode> {
        self.nodes.values().find(|node| node.is_leader())
    }

    pub fn leaders(&self) -> Vec<NodeId> {
        self.nodes
            .iter()
            .filter(|(_, node)| node.is_leader())
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Fails every request to and from `id`.
    pub fn add_network_error(&self, id: &str) {
        self.network.isolate(NodeId::from(id));
    }

    pub fn del_network_error(&self, id: &str) {
        self.network.reconnect(&NodeId::from(id));
    }

    /// Fails requests sent by `from` to `to`.
    pub fn add_peer_to_peer_error(&self, from: &str, to: &str) {
        self.network.break_link(NodeId::from(from), NodeId::from(to));
    }

    pub fn clear_errors(&self) {
        self.network.clear_faults();
    }

    pub async fn close(&mut self) {
        for (id, node) in std::mem::take(&mut self.nodes) {
            self.network.unregister(&id);
            if let Err(e) = node.close().await {
                warn!("Closing {} failed: {}", id, e);
            }
        }
    }
}

impl Default for TestCluster {
    fn default() -> Self {
        Self::new()
    }
}

/// Retries `check` until it passes, sleeping `interval` between attempts.
/// Returns the last failure once the attempts are used up.
pub async fn until_pass<F>(attempts: usize, interval: Duration, mut check: F) -> anyhow::Result<()>
where
    F: FnMut() -> anyhow::Result<()>,
{
    let mut last = anyhow!("no attempts made");
    for _ in 0..attempts {
        match check() {
            Ok(()) => return Ok(()),
            Err(e) => last = e,
        }
        tokio::time::sleep(interval).await;
    }
    Err(last.context(format!("condition still failing after {} attempts", attempts)))
}
