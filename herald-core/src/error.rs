//! # Error Types
//!
//! Errors surfaced by the election API, and the transport-level failure
//! classification that the protocol absorbs internally.

use crate::NodeId;
use thiserror::Error;

/// Errors returned by node construction and the public node API.
///
/// `InvalidConfig` and `DuplicateId` are fatal: they are reported by the
/// constructor and the node never starts. `NotLeader` is a recoverable misuse
/// of `resign()`. `Closed` is returned by every call made after shutdown.
///
/// Transport failures never appear here. A peer that times out or refuses a
/// connection simply counts as a non-response for that round.
///
/// # Examples
///
/// ```rust
/// use herald_core::ElectionError;
///
/// let error = ElectionError::invalid_config("heartbeat_timeout must be positive");
/// assert!(error.is_fatal());
/// assert!(!ElectionError::Closed.is_fatal());
/// ```
#[derive(Error, Debug)]
pub enum ElectionError {
    /// Timeout ordering or another configuration rule was violated
    #[error("Invalid configuration: {reason}")]
    InvalidConfig { reason: String },

    /// The node identity collides with a member of the cluster
    #[error("Node {node_id} is already a member of the cluster")]
    DuplicateId { node_id: NodeId },

    /// A leader-only operation was attempted on a non-leader
    #[error("Not the leader, current leader is {leader:?}")]
    NotLeader { leader: Option<NodeId> },

    /// The node has been shut down
    #[error("Node has been closed")]
    Closed,

    /// A message could not be dispatched
    #[error("Invalid message: {reason}")]
    InvalidMessage { reason: String },

    /// Socket setup failure in a transport server
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for election operations.
pub type Result<T> = std::result::Result<T, ElectionError>;

impl ElectionError {
    pub fn invalid_config(reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            reason: reason.into(),
        }
    }

    /// Errors that prevent a node from ever starting.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::InvalidConfig { .. } | Self::DuplicateId { .. })
    }
}

/// Failure classification for a single transport call.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// No response within the per-call timeout
    #[error("Request to {peer} timed out")]
    TimedOut { peer: NodeId },

    /// The peer could not be reached or the exchange failed
    #[error("Connection to {peer} failed: {reason}")]
    Connection { peer: NodeId, reason: String },
}

impl TransportError {
    pub fn connection(peer: NodeId, reason: impl Into<String>) -> Self {
        Self::Connection {
            peer,
            reason: reason.into(),
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::TimedOut { .. })
    }

    pub fn peer(&self) -> &NodeId {
        match self {
            Self::TimedOut { peer } | Self::Connection { peer, .. } => peer,
        }
    }
}
