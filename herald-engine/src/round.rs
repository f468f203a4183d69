//! Quorum rounds: fan a request out to every peer and tally the replies.
//!
//! Each peer call is bounded by the network timeout, so a round never
//! outlives one network timeout. The caller decides through a callback when
//! it has seen enough; dropping the remaining futures discards late replies.

use futures_util::future::BoxFuture;
use futures_util::stream::{FuturesUnordered, StreamExt};
use herald_core::{Epoch, Message, NodeId, Transport, TransportError};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Identifier of a round started by a node. Results carrying a stale id are
/// discarded.
pub type RoundId = u64;

/// What the caller wants after seeing the tally so far.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoundControl {
    Continue,
    Stop,
}

/// Running count of the replies to one round.
///
/// The sender always counts itself, so `granted` starts at one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoundTally {
    pub quorum: usize,
    pub peers: usize,
    pub granted: usize,
    pub responded: usize,
    pub failed: usize,
    /// Highest epoch seen in any reply, never below the sender's own epoch
    pub highest_epoch: Epoch,
}

impl RoundTally {
    pub fn new(quorum: usize, peers: usize, local_epoch: Epoch) -> Self {
        Self {
            quorum,
            peers,
            granted: 1,
            responded: 0,
            failed: 0,
            highest_epoch: local_epoch,
        }
    }

    pub fn record(&mut self, peer: &NodeId, result: &Result<Message, TransportError>) {
        match result {
            Ok(reply) => {
                self.responded += 1;
                if reply.granted() == Some(true) {
                    self.granted += 1;
                }
                if let Some(epoch) = reply.epoch() {
                    self.highest_epoch = self.highest_epoch.max(epoch);
                }
            }
            Err(e) => {
                self.failed += 1;
                debug!("No reply from {}: {}", peer, e);
            }
        }
    }

    /// Peers that have neither replied nor failed yet.
    pub fn outstanding(&self) -> usize {
        self.peers.saturating_sub(self.responded + self.failed)
    }

    pub fn has_quorum(&self) -> bool {
        self.granted >= self.quorum
    }

    /// Even if every outstanding peer grants, the quorum cannot be reached.
    pub fn quorum_impossible(&self) -> bool {
        self.granted + self.outstanding() < self.quorum
    }

    pub fn is_decided(&self) -> bool {
        self.has_quorum() || self.quorum_impossible()
    }

    pub fn is_complete(&self) -> bool {
        self.outstanding() == 0
    }

    /// True when every peer call failed at the transport level.
    pub fn all_unreachable(&self) -> bool {
        self.responded == 0 && self.is_complete()
    }
}

type PeerCall = BoxFuture<'static, (NodeId, Result<Message, TransportError>)>;

/// Starts one bounded call per peer.
fn fan_out<T: Transport>(
    transport: Arc<T>,
    peers: Vec<(NodeId, T::Handle)>,
    message: Message,
    timeout: Duration,
) -> FuturesUnordered<PeerCall> {
    peers
        .into_iter()
        .map(|(peer, handle)| {
            let transport = transport.clone();
            let message = message.clone();
            let call: PeerCall = Box::pin(async move {
                let result =
                    match tokio::time::timeout(timeout, transport.send(&peer, &handle, message, timeout))
                        .await
                    {
                        Ok(result) => result,
                        Err(_) => Err(TransportError::TimedOut { peer: peer.clone() }),
                    };
                (peer, result)
            });
            call
        })
        .collect()
}

/// Sends `message` to every peer and feeds each reply into `tally`.
///
/// `observe` is called once before any reply arrives and again after each
/// one; returning [`RoundControl::Stop`] ends the round early.
pub async fn collect<T, F>(
    transport: Arc<T>,
    peers: Vec<(NodeId, T::Handle)>,
    message: Message,
    timeout: Duration,
    mut tally: RoundTally,
    mut observe: F,
) -> RoundTally
where
    T: Transport,
    F: FnMut(&RoundTally) -> RoundControl + Send,
{
    if observe(&tally) == RoundControl::Stop {
        return tally;
    }

    let mut pending = fan_out(transport, peers, message, timeout);
    while let Some((peer, result)) = pending.next().await {
        tally.record(&peer, &result);
        if observe(&tally) == RoundControl::Stop {
            break;
        }
    }
    tally
}
