//! # Herald Core
//!
//! Building blocks shared by every part of the Herald leader election
//! protocol:
//!
//! - **Types**: `NodeId`, `Epoch`, `NodeState` and the `ElectionStatus` snapshot
//! - **Messages**: the heartbeat, vote and resignation exchanges between peers
//! - **Configuration**: `ElectionConfig` and its timeout ordering rule
//! - **Membership**: the per-node peer registry that drives quorum size
//! - **Transport**: the `Transport` and `MessageHandler` traits that separate
//!   the protocol from the network
//! - **Errors**: `ElectionError` for the node API and `TransportError` for
//!   individual network calls
//!
//! ```rust
//! use herald_core::{ElectionConfig, Membership, NodeId};
//! use std::time::Duration;
//!
//! let config = ElectionConfig::new()
//!     .with_network_timeout(Duration::from_millis(100))
//!     .with_heartbeat_timeout(Duration::from_millis(200))
//!     .with_leader_quorum_timeout(Duration::from_millis(600))
//!     .with_election_timeout(Duration::from_millis(800));
//! assert!(config.validate().is_ok());
//!
//! let membership = Membership::with_peers(
//!     NodeId::from("n0"),
//!     vec![(NodeId::from("n1"), ()), (NodeId::from("n2"), ())],
//! )
//! .unwrap();
//! assert_eq!(membership.quorum_size(), 2);
//! ```

pub mod config;
pub mod error;
pub mod membership;
pub mod messages;
pub mod transport;
pub mod types;

pub use config::ElectionConfig;
pub use error::*;
pub use membership::Membership;
pub use messages::Message;
pub use transport::{MessageHandler, Transport};
pub use types::*;
