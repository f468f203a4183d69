use herald_core::{ElectionStatus, Epoch, NodeId, NodeState};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};

/// Counters describing what a node has done since it started.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ElectionStats {
    pub elections_started: u64,
    pub elections_won: u64,
    pub heartbeat_rounds: u64,
    pub quorum_losses: u64,
    pub resignations: u64,
    pub step_downs: u64,
}

/// Published view of a node, written by its election loop and read by any
/// number of API callers.
///
/// Reads never wait on the election loop: role and epoch are atomics, the
/// leader identity and peer list sit behind short-lived locks that only the
/// loop ever writes.
#[derive(Debug)]
pub struct SharedState {
    node_id: NodeId,
    state: AtomicU8,
    epoch: AtomicU64,
    quorum_size: AtomicUsize,
    closed: AtomicBool,
    leader: RwLock<Option<NodeId>>,
    peers: RwLock<Vec<NodeId>>,
    stats: Mutex<ElectionStats>,
}

impl SharedState {
    pub fn new(node_id: NodeId) -> Self {
        Self {
            node_id,
            state: AtomicU8::new(NodeState::Follower.as_u8()),
            epoch: AtomicU64::new(0),
            quorum_size: AtomicUsize::new(1),
            closed: AtomicBool::new(false),
            leader: RwLock::new(None),
            peers: RwLock::new(Vec::new()),
            stats: Mutex::new(ElectionStats::default()),
        }
    }

    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    pub fn state(&self) -> NodeState {
        NodeState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn epoch(&self) -> Epoch {
        Epoch::new(self.epoch.load(Ordering::Acquire))
    }

    pub fn leader(&self) -> Option<NodeId> {
        self.leader.read().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> ElectionStats {
        self.stats.lock().clone()
    }

    pub fn status(&self) -> ElectionStatus {
        ElectionStatus {
            node_id: self.node_id.clone(),
            state: self.state(),
            epoch: self.epoch(),
            leader: self.leader(),
            peers: self.peers.read().clone(),
            quorum_size: self.quorum_size.load(Ordering::Acquire),
        }
    }

    pub(crate) fn publish(&self, state: NodeState, epoch: Epoch, leader: Option<&NodeId>) {
        // leader first, so a reader that sees Leader also sees itself as leader
        {
            let mut current = self.leader.write();
            if current.as_ref() != leader {
                *current = leader.cloned();
            }
        }
        self.epoch.store(epoch.value(), Ordering::Release);
        self.state.store(state.as_u8(), Ordering::Release);
    }

    pub(crate) fn publish_membership(&self, peers: Vec<NodeId>, quorum_size: usize) {
        *self.peers.write() = peers;
        self.quorum_size.store(quorum_size, Ordering::Release);
    }

    pub(crate) fn mark_closed(&self) {
        self.closed.store(true, Ordering::Release);
    }

    pub(crate) fn record(&self, update: impl FnOnce(&mut ElectionStats)) {
        let mut stats = self.stats.lock();
        update(&mut *stats);
    }
}
