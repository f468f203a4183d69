//! # Herald Network
//!
//! TCP plumbing for the election protocol. [`TcpTransport`] is the client
//! half handed to a node; [`ElectionServer`] accepts connections and feeds
//! each request to the node as a [`herald_core::MessageHandler`].
//!
//! ```rust
//! use herald_network::{read_envelope, write_envelope, Envelope};
//! use herald_core::{Epoch, Message, NodeId};
//!
//! tokio_test::block_on(async {
//!     let (mut client, mut server) = tokio::io::duplex(1024);
//!     let request = Envelope::request(Message::heartbeat(NodeId::from("n0"), Epoch::new(1)));
//!     write_envelope(&mut client, &request).await.unwrap();
//!     assert_eq!(read_envelope(&mut server).await.unwrap(), request);
//! });
//! ```

pub mod tcp;

pub use tcp::{
    read_envelope, write_envelope, ElectionServer, Envelope, FrameError, TcpTransport,
    MAX_PAYLOAD_SIZE,
};
