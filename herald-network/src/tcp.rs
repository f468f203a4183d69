//! TCP transport for the election protocol.
//!
//! Every request opens a connection, writes one frame, reads one reply
//! frame and closes. Elections exchange a handful of small messages per
//! heartbeat period, so there is no connection pool to keep healthy and a
//! dead peer costs exactly one refused connect.
//!
//! Frame layout, all integers big endian:
//!
//! ```text
//! +-------------+-------------+---------------------------+
//! | length: u32 | crc32: u32  | bincode(Envelope): length |
//! +-------------+-------------+---------------------------+
//! ```

use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use herald_core::{Message, MessageHandler, NodeId, Transport, TransportError};
use serde::{Deserialize, Serialize};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Largest payload accepted in either direction. Election messages are tiny;
/// anything near this size is garbage on the wire.
pub const MAX_PAYLOAD_SIZE: usize = 64 * 1024;

const HEADER_SIZE: usize = 8;

/// Wire-level failures.
#[derive(Error, Debug)]
pub enum FrameError {
    #[error("Frame too large: {size} bytes")]
    TooLarge { size: usize },

    #[error("Checksum mismatch: expected {expected:#010x}, computed {actual:#010x}")]
    Checksum { expected: u32, actual: u32 },

    #[error("Reply {actual} does not answer request {expected}")]
    UnexpectedReply { expected: Uuid, actual: Uuid },

    #[error("Codec error: {0}")]
    Codec(#[from] bincode::Error),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// A request or reply as carried on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub request_id: Uuid,
    pub message: Message,
}

impl Envelope {
    pub fn request(message: Message) -> Self {
        Self {
            request_id: Uuid::new_v4(),
            message,
        }
    }

    pub fn reply_to(&self, message: Message) -> Self {
        Self {
            request_id: self.request_id,
            message,
        }
    }
}

#[derive(Debug)]
struct MessageFrame {
    checksum: u32,
    payload: Bytes,
}

impl MessageFrame {
    fn encode(envelope: &Envelope) -> Result<Self, FrameError> {
        let payload = Bytes::from(bincode::serialize(envelope)?);
        if payload.len() > MAX_PAYLOAD_SIZE {
            return Err(FrameError::TooLarge {
                size: payload.len(),
            });
        }
        Ok(Self {
            checksum: crc32fast::hash(&payload),
            payload,
        })
    }

    fn decode(&self) -> Result<Envelope, FrameError> {
        let actual = crc32fast::hash(&self.payload);
        if actual != self.checksum {
            return Err(FrameError::Checksum {
                expected: self.checksum,
                actual,
            });
        }
        Ok(bincode::deserialize(&self.payload)?)
    }

    fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_SIZE + self.payload.len());
        buf.put_u32(self.payload.len() as u32);
        buf.put_u32(self.checksum);
        buf.put_slice(&self.payload);
        buf.freeze()
    }

    async fn write_to<W>(&self, writer: &mut W) -> Result<(), FrameError>
    where
        W: AsyncWrite + Unpin,
    {
        writer.write_all(&self.to_bytes()).await?;
        writer.flush().await?;
        Ok(())
    }

    async fn read_from<R>(reader: &mut R) -> Result<Self, FrameError>
    where
        R: AsyncRead + Unpin,
    {
        let length = reader.read_u32().await? as usize;
        if length > MAX_PAYLOAD_SIZE {
            return Err(FrameError::TooLarge { size: length });
        }
        let checksum = reader.read_u32().await?;

        let mut payload = vec![0u8; length];
        reader.read_exact(&mut payload).await?;
        Ok(Self {
            checksum,
            payload: Bytes::from(payload),
        })
    }
}

/// Writes `envelope` as a single frame.
pub async fn write_envelope<W>(writer: &mut W, envelope: &Envelope) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
{
    MessageFrame::encode(envelope)?.write_to(writer).await
}

/// Reads one frame and checks its integrity.
pub async fn read_envelope<R>(reader: &mut R) -> Result<Envelope, FrameError>
where
    R: AsyncRead + Unpin,
{
    MessageFrame::read_from(reader).await?.decode()
}

/// Client side: one request-reply exchange per call. Peers are addressed
/// by socket address.
#[derive(Debug, Clone, Default)]
pub struct TcpTransport;

impl TcpTransport {
    pub fn new() -> Self {
        Self
    }

    async fn exchange(addr: SocketAddr, message: Message) -> Result<Message, FrameError> {
        let mut stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;

        let request = Envelope::request(message);
        write_envelope(&mut stream, &request).await?;
        let reply = read_envelope(&mut stream).await?;
        if reply.request_id != request.request_id {
            return Err(FrameError::UnexpectedReply {
                expected: request.request_id,
                actual: reply.request_id,
            });
        }
        Ok(reply.message)
    }
}

#[async_trait]
impl Transport for TcpTransport {
    type Handle = SocketAddr;

    async fn send(
        &self,
        peer: &NodeId,
        handle: &SocketAddr,
        message: Message,
        limit: Duration,
    ) -> Result<Message, TransportError> {
        match timeout(limit, Self::exchange(*handle, message)).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(e)) => {
                debug!("Request to {} at {} failed: {}", peer, handle, e);
                Err(TransportError::connection(peer.clone(), e.to_string()))
            }
            Err(_) => Err(TransportError::TimedOut { peer: peer.clone() }),
        }
    }
}

/// Server side: accepts connections and hands each request to a
/// [`MessageHandler`].
pub struct ElectionServer {
    local_addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl ElectionServer {
    /// Binds a listener. Binding happens before the handler exists so that
    /// the address can be handed to peers first.
    pub async fn bind(addr: SocketAddr) -> herald_core::Result<TcpListener> {
        let listener = TcpListener::bind(addr).await?;
        info!("Election listener bound to {}", listener.local_addr()?);
        Ok(listener)
    }

    /// Starts serving `listener` with `handler`.
    pub fn start(listener: TcpListener, handler: Arc<dyn MessageHandler>) -> herald_core::Result<Self> {
        let local_addr = listener.local_addr()?;
        let (shutdown, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(Self::accept_connections(listener, handler, shutdown_rx));
        Ok(Self {
            local_addr,
            shutdown,
            task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stops accepting connections and closes the open ones.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            warn!("Election server task ended abnormally: {}", e);
        }
        info!("Election server on {} stopped", self.local_addr);
    }

    async fn accept_connections(
        listener: TcpListener,
        handler: Arc<dyn MessageHandler>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        debug!("Accepted connection from {}", addr);
                        let handler = handler.clone();
                        let shutdown = shutdown.clone();
                        tokio::spawn(async move {
                            if let Err(e) = Self::serve_connection(stream, handler, shutdown).await {
                                debug!("Connection from {} closed: {}", addr, e);
                            }
                        });
                    }
                    Err(e) => {
                        error!("Failed to accept connection: {}", e);
                        sleep(Duration::from_millis(100)).await;
                    }
                },
            }
        }
    }

    async fn serve_connection(
        mut stream: TcpStream,
        handler: Arc<dyn MessageHandler>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), FrameError> {
        stream.set_nodelay(true)?;
        loop {
            let request = tokio::select! {
                _ = shutdown.changed() => return Ok(()),
                request = read_envelope(&mut stream) => match request {
                    Ok(request) => request,
                    Err(FrameError::Io(e)) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(()),
                    Err(e) => return Err(e),
                },
            };

            let kind = request.message.kind();
            match handler.handle_message(request.message.clone()).await {
                Ok(reply) => write_envelope(&mut stream, &request.reply_to(reply)).await?,
                Err(e) => {
                    // dropping the connection is how the caller learns of the failure
                    debug!("Rejected {} request: {}", kind, e);
                    return Ok(());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use herald_core::Epoch;

    fn heartbeat() -> Message {
        Message::heartbeat(NodeId::from("n0"), Epoch::new(3))
    }

    /// Acknowledges heartbeats; refuses anything else.
    struct AckHeartbeats;

    #[async_trait]
    impl MessageHandler for AckHeartbeats {
        async fn handle_message(&self, message: Message) -> herald_core::Result<Message> {
            match message {
                Message::Heartbeat { epoch, .. } => Ok(Message::HeartbeatAck {
                    follower_id: NodeId::from("n1"),
                    epoch,
                    granted: true,
                }),
                _ => Err(herald_core::ElectionError::Closed),
            }
        }
    }

    #[tokio::test]
    async fn test_frame_round_trip_over_stream() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        let envelope = Envelope::request(heartbeat());
        write_envelope(&mut client, &envelope).await.unwrap();
        let received = read_envelope(&mut server).await.unwrap();
        assert_eq!(received, envelope);
    }

    #[test]
    fn test_frame_layout() {
        let frame = MessageFrame::encode(&Envelope::request(heartbeat())).unwrap();
        let bytes = frame.to_bytes();
        assert_eq!(bytes.len(), HEADER_SIZE + frame.payload.len());
        assert_eq!(&bytes[..4], &(frame.payload.len() as u32).to_be_bytes());
        assert_eq!(&bytes[4..8], &crc32fast::hash(&frame.payload).to_be_bytes());
    }

    #[tokio::test]
    async fn test_corrupted_payload_is_rejected() {
        let frame = MessageFrame::encode(&Envelope::request(heartbeat())).unwrap();
        let mut bytes = BytesMut::from(&frame.to_bytes()[..]);
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;

        let mut reader = &bytes[..];
        let result = read_envelope(&mut reader).await;
        assert!(matches!(result, Err(FrameError::Checksum { .. })));
    }

    #[tokio::test]
    async fn test_oversized_frame_is_rejected() {
        let mut bytes = BytesMut::new();
        bytes.put_u32(MAX_PAYLOAD_SIZE as u32 + 1);
        bytes.put_u32(0);
        let mut reader = &bytes[..];
        let result = read_envelope(&mut reader).await;
        assert!(matches!(result, Err(FrameError::TooLarge { .. })));
    }

    #[tokio::test]
    async fn test_request_reply_over_tcp() {
        let listener = ElectionServer::bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let server = ElectionServer::start(listener, Arc::new(AckHeartbeats)).unwrap();
        let addr = server.local_addr();
        let transport = TcpTransport::new();
        let peer = NodeId::from("n1");

        let reply = transport
            .send(&peer, &addr, heartbeat(), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(reply.granted(), Some(true));
        assert_eq!(reply.epoch(), Some(Epoch::new(3)));

        // a handler error closes the connection without a reply
        let refused = transport
            .send(&peer, &addr, Message::probe(NodeId::from("n0")), Duration::from_secs(1))
            .await;
        assert!(matches!(refused, Err(TransportError::Connection { .. })));

        server.shutdown().await;
        let after = transport
            .send(&peer, &addr, heartbeat(), Duration::from_millis(500))
            .await;
        assert!(after.is_err());
    }
}
