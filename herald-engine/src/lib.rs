//! # Herald Engine
//!
//! The election protocol itself: a synchronous state machine driven by a
//! single-writer async loop per node.
//!
//! - [`ElectionMachine`]: the Follower / Candidate / Leader transition table
//! - [`round`]: quorum fan-out over any [`herald_core::Transport`]
//! - [`ElectionTimer`]: randomized election timeouts
//! - [`Node`]: the public API, which also serves inbound protocol messages
//!   as a [`herald_core::MessageHandler`]
//! - [`LeadershipChange`]: notifications for subscribers

pub mod machine;
pub mod node;
pub mod notifications;
pub mod round;
pub mod state;
pub mod timer;

pub use machine::{Action, ElectionMachine, ElectionWindow};
pub use node::Node;
pub use notifications::{LeadershipChange, LeadershipNotifier};
pub use round::{RoundControl, RoundTally};
pub use state::{ElectionStats, SharedState};
pub use timer::ElectionTimer;
