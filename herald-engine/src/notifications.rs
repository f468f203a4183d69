//! Leadership change notifications.

use herald_core::{Epoch, NodeId, NodeState};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::broadcast;
use tracing::debug;

/// Leadership events observed by one node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeadershipChange {
    /// This node became leader
    Elected {
        node_id: NodeId,
        epoch: Epoch,
        timestamp: u64,
    },

    /// This node stopped being leader (resigned, lost its quorum or yielded)
    SteppedDown {
        node_id: NodeId,
        epoch: Epoch,
        timestamp: u64,
    },

    /// The leader this node believes in changed
    LeaderChanged {
        node_id: NodeId,
        previous: Option<NodeId>,
        current: Option<NodeId>,
        epoch: Epoch,
        timestamp: u64,
    },
}

impl LeadershipChange {
    pub fn epoch(&self) -> Epoch {
        match self {
            Self::Elected { epoch, .. }
            | Self::SteppedDown { epoch, .. }
            | Self::LeaderChanged { epoch, .. } => *epoch,
        }
    }
}

fn timestamp_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// Turns successive snapshots of a node's state into change events and
/// broadcasts them to subscribers.
#[derive(Debug)]
pub struct LeadershipNotifier {
    node_id: NodeId,
    sender: broadcast::Sender<LeadershipChange>,
    last_state: NodeState,
    last_leader: Option<NodeId>,
}

impl LeadershipNotifier {
    pub fn new(node_id: NodeId, sender: broadcast::Sender<LeadershipChange>) -> Self {
        Self {
            node_id,
            sender,
            last_state: NodeState::Follower,
            last_leader: None,
        }
    }

    /// Compares the snapshot with the previous one and publishes what changed.
    pub fn observe(
        &mut self,
        state: NodeState,
        leader: Option<&NodeId>,
        epoch: Epoch,
    ) -> Vec<LeadershipChange> {
        let mut changes = Vec::new();
        let timestamp = timestamp_ms();

        if state == NodeState::Leader && self.last_state != NodeState::Leader {
            changes.push(LeadershipChange::Elected {
                node_id: self.node_id.clone(),
                epoch,
                timestamp,
            });
        }
        if state != NodeState::Leader && self.last_state == NodeState::Leader {
            changes.push(LeadershipChange::SteppedDown {
                node_id: self.node_id.clone(),
                epoch,
                timestamp,
            });
        }
        if leader != self.last_leader.as_ref() {
            changes.push(LeadershipChange::LeaderChanged {
                node_id: self.node_id.clone(),
                previous: self.last_leader.clone(),
                current: leader.cloned(),
                epoch,
                timestamp,
            });
        }

        self.last_state = state;
        self.last_leader = leader.cloned();

        for change in &changes {
            // no subscribers is fine
            if self.sender.send(change.clone()).is_err() {
                debug!("No subscribers for {:?}", change);
            }
        }
        changes
    }
}
