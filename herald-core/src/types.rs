//! # Core Types
//!
//! Fundamental types shared by every participant in a Herald election.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Unique identifier for a node taking part in an election.
///
/// Identifiers are compared lexicographically. The ordering matters: when two
/// nodes both claim leadership for the same epoch, the node with the smaller
/// identifier yields.
///
/// # Examples
///
/// ```rust
/// use herald_core::NodeId;
///
/// let a = NodeId::new("n0");
/// let b = NodeId::from("n1");
/// assert!(a < b);
/// assert_eq!(a.to_string(), "n0");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId(String);

impl NodeId {
    /// Creates a node identifier from any string-like value.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for NodeId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Election generation counter.
///
/// Every candidacy starts a new epoch. A message carrying a higher epoch
/// always wins over state from a lower one, which is how the protocol keeps
/// at most one leader per epoch without any cross-node locking.
///
/// # Examples
///
/// ```rust
/// use herald_core::Epoch;
///
/// let first = Epoch::new(1);
/// let second = first.next();
/// assert_eq!(second.value(), 2);
/// assert!(second > first);
/// ```
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Epoch(pub u64);

impl Epoch {
    /// The epoch every node starts in.
    pub const ZERO: Epoch = Epoch(0);

    pub fn new(value: u64) -> Self {
        Self(value)
    }

    /// Returns the epoch that follows this one.
    pub fn next(&self) -> Self {
        Self(self.0 + 1)
    }

    pub fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for Epoch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Local role of a node in the election protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeState {
    /// Follows a leader, or waits for one to appear
    Follower,
    /// Campaigning for votes in the current epoch
    Candidate,
    /// Holds leadership for the current epoch
    Leader,
}

impl NodeState {
    /// Compact encoding used to publish the state through an atomic.
    pub fn as_u8(self) -> u8 {
        match self {
            NodeState::Follower => 0,
            NodeState::Candidate => 1,
            NodeState::Leader => 2,
        }
    }

    /// Decodes a value produced by [`NodeState::as_u8`]. Unknown values map to
    /// `Follower`.
    pub fn from_u8(value: u8) -> Self {
        match value {
            1 => NodeState::Candidate,
            2 => NodeState::Leader,
            _ => NodeState::Follower,
        }
    }
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeState::Follower => write!(f, "follower"),
            NodeState::Candidate => write!(f, "candidate"),
            NodeState::Leader => write!(f, "leader"),
        }
    }
}

/// Point-in-time view of a node's election state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ElectionStatus {
    /// Identity of the node that produced this snapshot
    pub node_id: NodeId,
    /// Current local role
    pub state: NodeState,
    /// Current epoch
    pub epoch: Epoch,
    /// Leader this node believes in, if any
    pub leader: Option<NodeId>,
    /// Known peers, excluding the node itself, in sorted order
    pub peers: Vec<NodeId>,
    /// Number of members (self included) required for a quorum
    pub quorum_size: usize,
}

impl ElectionStatus {
    pub fn is_leader(&self) -> bool {
        self.state == NodeState::Leader
    }

    /// Cluster size as seen by this node, self included.
    pub fn cluster_size(&self) -> usize {
        self.peers.len() + 1
    }
}
