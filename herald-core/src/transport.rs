use crate::{Message, NodeId, Result, TransportError};
use async_trait::async_trait;
use std::fmt::Debug;
use std::time::Duration;

/// Outbound side of the network boundary.
///
/// The election engine depends on this trait only. A TCP client, an
/// in-memory bus and a fault-injecting simulator are interchangeable without
/// touching the state machine.
///
/// Implementations must not assume anything about ordering or delivery; a
/// failed call is reported as a [`TransportError`] and the protocol treats it
/// as a non-response for the round it belongs to.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Opaque address of a remote node (a socket address, a registry key).
    type Handle: Clone + Debug + Send + Sync + 'static;

    /// Sends `message` to `peer` and waits for its reply, for at most `timeout`.
    async fn send(
        &self,
        peer: &NodeId,
        handle: &Self::Handle,
        message: Message,
        timeout: Duration,
    ) -> std::result::Result<Message, TransportError>;
}

/// Inbound side of the network boundary.
///
/// Transports hand every request they receive to a handler and return the
/// handler's reply to the sender.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle_message(&self, message: Message) -> Result<Message>;
}
