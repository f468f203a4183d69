//! # Election Node
//!
//! The public façade of a cluster member. A [`Node`] owns a single election
//! loop task that is the only writer of the node's state. API calls and
//! inbound protocol messages are queued to that loop; status reads go
//! straight to the published [`SharedState`] and never wait on it.

use crate::machine::{Action, ElectionMachine, ElectionWindow};
use crate::notifications::{LeadershipChange, LeadershipNotifier};
use crate::round::{self, RoundControl, RoundId, RoundTally};
use crate::state::{ElectionStats, SharedState};
use crate::timer::{sleep_until_deadline, ElectionTimer, Timers};
use async_trait::async_trait;
use herald_core::{
    ElectionConfig, ElectionError, ElectionStatus, Epoch, Membership, Message, MessageHandler,
    NodeId, NodeState, Result, Transport,
};
use std::marker::PhantomData;
use std::ops::ControlFlow;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info};

const CHANGE_CHANNEL_CAPACITY: usize = 256;

/// Inputs of the election loop.
enum Event<H> {
    Inbound {
        message: Message,
        reply: oneshot::Sender<Result<Message>>,
    },
    Resign {
        reply: oneshot::Sender<Result<()>>,
    },
    AddPeer {
        id: NodeId,
        handle: H,
        reply: oneshot::Sender<Result<()>>,
    },
    RemovePeer {
        id: NodeId,
        reply: oneshot::Sender<Result<()>>,
    },
    Close {
        reply: oneshot::Sender<Result<()>>,
    },
    /// Every `Node` handle has been dropped
    Shutdown,
    VoteRoundFinished {
        round: RoundId,
        epoch: Epoch,
        tally: RoundTally,
    },
    HeartbeatQuorum {
        epoch: Epoch,
    },
    HeartbeatRoundFinished {
        round: RoundId,
        epoch: Epoch,
        tally: RoundTally,
    },
    ProbeFinished {
        round: RoundId,
        tally: RoundTally,
    },
}

enum Wake<H> {
    Event(Option<Event<H>>),
    ElectionTimeout,
    HeartbeatTick,
    QuorumWatchdog,
}

struct RunningRound {
    id: RoundId,
    task: JoinHandle<()>,
}

fn cancel(slot: &mut Option<RunningRound>) {
    if let Some(round) = slot.take() {
        round.task.abort();
    }
}

/// Takes the round out of `slot` if it is the one identified by `id`.
fn finish(slot: &mut Option<RunningRound>, id: RoundId) -> bool {
    match slot {
        Some(round) if round.id == id => {
            *slot = None;
            true
        }
        _ => false,
    }
}

struct NodeInner<H> {
    shared: Arc<SharedState>,
    events: mpsc::UnboundedSender<Event<H>>,
    changes: broadcast::Sender<LeadershipChange>,
}

impl<H> Drop for NodeInner<H> {
    fn drop(&mut self) {
        let _ = self.events.send(Event::Shutdown);
    }
}

/// A member of an election cluster.
///
/// Cloning a `Node` yields another handle to the same member. The election
/// loop stops when [`Node::close`] is called or when the last handle is
/// dropped.
///
/// # Examples
///
/// ```rust,no_run
/// use herald_core::{ElectionConfig, NodeId, Transport};
/// use herald_engine::Node;
///
/// async fn lead_alone<T: Transport>(transport: T) -> herald_core::Result<()> {
///     let node = Node::new(NodeId::from("n0"), Vec::new(), ElectionConfig::default(), transport).await?;
///     assert!(node.is_leader());
///     node.close().await
/// }
/// ```
pub struct Node<T: Transport> {
    inner: Arc<NodeInner<T::Handle>>,
    _transport: PhantomData<fn() -> T>,
}

impl<T: Transport> Clone for Node<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            _transport: PhantomData,
        }
    }
}

impl<T: Transport> std::fmt::Debug for Node<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("id", self.inner.shared.node_id())
            .field("state", &self.state())
            .field("epoch", &self.epoch())
            .finish()
    }
}

impl<T: Transport> Node<T> {
    /// Creates a node and starts its election loop.
    ///
    /// Without peers the node leads epoch 1 as soon as this returns. With
    /// peers it starts as a follower and probes them; if none of them can
    /// be reached it leads alone.
    pub async fn new(
        id: NodeId,
        peers: impl IntoIterator<Item = (NodeId, T::Handle)>,
        config: ElectionConfig,
        transport: T,
    ) -> Result<Self> {
        config.validate()?;
        let membership =
            Membership::with_peers(id.clone(), peers)?.with_minimum_quorum(config.minimum_quorum);

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        let shared = Arc::new(SharedState::new(id.clone()));

        let mut election = ElectionLoop {
            machine: ElectionMachine::new(id.clone(), &config),
            timer: ElectionTimer::new(&config),
            notifier: LeadershipNotifier::new(id.clone(), changes.clone()),
            membership,
            config,
            transport: Arc::new(transport),
            shared: shared.clone(),
            timers: Timers::default(),
            events_tx: events_tx.clone(),
            events_rx,
            next_round: 0,
            vote_round: None,
            heartbeat_round: None,
            probe_round: None,
        };

        info!(
            "Starting election node {} with {} peers",
            id,
            election.membership.peer_count()
        );
        let now = Instant::now();
        let actions = election
            .machine
            .start(election.membership.has_peers(), now);
        election.apply(actions, now);
        election.publish_membership();
        election.publish();
        tokio::spawn(election.run());

        Ok(Self {
            inner: Arc::new(NodeInner {
                shared,
                events: events_tx,
                changes,
            }),
            _transport: PhantomData,
        })
    }

    pub fn id(&self) -> &NodeId {
        self.inner.shared.node_id()
    }

    pub fn state(&self) -> NodeState {
        self.inner.shared.state()
    }

    pub fn is_leader(&self) -> bool {
        self.state() == NodeState::Leader
    }

    /// Leader this node currently believes in, possibly itself.
    pub fn leader(&self) -> Option<NodeId> {
        self.inner.shared.leader()
    }

    pub fn epoch(&self) -> Epoch {
        self.inner.shared.epoch()
    }

    pub fn status(&self) -> ElectionStatus {
        self.inner.shared.status()
    }

    pub fn stats(&self) -> ElectionStats {
        self.inner.shared.stats()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.shared.is_closed()
    }

    /// Subscribes to leadership changes observed from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<LeadershipChange> {
        self.inner.changes.subscribe()
    }

    /// Gives up leadership and tells every peer.
    ///
    /// Returns once the notices have been issued; it does not wait for the
    /// peers to acknowledge them. Fails with `NotLeader` on a non-leader.
    pub async fn resign(&self) -> Result<()> {
        self.request(|reply| Event::Resign { reply }).await
    }

    pub async fn add_peer(&self, id: NodeId, handle: T::Handle) -> Result<()> {
        self.request(|reply| Event::AddPeer { id, handle, reply })
            .await
    }

    /// Removes a peer. Removing an unknown peer is not an error.
    pub async fn remove_peer(&self, id: NodeId) -> Result<()> {
        self.request(|reply| Event::RemovePeer { id, reply }).await
    }

    /// Stops the node, resigning first if it leads. Every later call fails
    /// with `Closed`.
    pub async fn close(&self) -> Result<()> {
        self.request(|reply| Event::Close { reply }).await
    }

    async fn request<R>(
        &self,
        event: impl FnOnce(oneshot::Sender<Result<R>>) -> Event<T::Handle>,
    ) -> Result<R> {
        if self.is_closed() {
            return Err(ElectionError::Closed);
        }
        let (reply, response) = oneshot::channel();
        self.inner
            .events
            .send(event(reply))
            .map_err(|_| ElectionError::Closed)?;
        response.await.map_err(|_| ElectionError::Closed)?
    }
}

#[async_trait]
impl<T: Transport> MessageHandler for Node<T> {
    async fn handle_message(&self, message: Message) -> Result<Message> {
        message.validate_request()?;
        self.request(|reply| Event::Inbound { message, reply }).await
    }
}

/// State owned by the election loop task.
struct ElectionLoop<T: Transport> {
    machine: ElectionMachine,
    timer: ElectionTimer,
    notifier: LeadershipNotifier,
    membership: Membership<T::Handle>,
    config: ElectionConfig,
    transport: Arc<T>,
    shared: Arc<SharedState>,
    timers: Timers,
    events_tx: mpsc::UnboundedSender<Event<T::Handle>>,
    events_rx: mpsc::UnboundedReceiver<Event<T::Handle>>,
    next_round: RoundId,
    vote_round: Option<RunningRound>,
    heartbeat_round: Option<RunningRound>,
    probe_round: Option<RunningRound>,
}

impl<T: Transport> ElectionLoop<T> {
    async fn run(mut self) {
        loop {
            let timers = self.timers;
            let wake = tokio::select! {
                event = self.events_rx.recv() => Wake::Event(event),
                _ = sleep_until_deadline(timers.election) => Wake::ElectionTimeout,
                _ = sleep_until_deadline(timers.heartbeat) => Wake::HeartbeatTick,
                _ = sleep_until_deadline(timers.quorum_watchdog) => Wake::QuorumWatchdog,
            };

            let now = Instant::now();
            let flow = self.on_wake(wake, now);
            self.publish();
            if flow.is_break() {
                break;
            }
        }

        cancel(&mut self.vote_round);
        cancel(&mut self.heartbeat_round);
        cancel(&mut self.probe_round);
        debug!("Election loop for {} stopped", self.machine.id());
    }

    fn on_wake(&mut self, wake: Wake<T::Handle>, now: Instant) -> ControlFlow<()> {
        match wake {
            Wake::Event(Some(event)) => return self.on_event(event, now),
            Wake::Event(None) => return ControlFlow::Break(()),
            Wake::ElectionTimeout => {
                self.timers.election = None;
                let actions = self.machine.on_election_timeout(now);
                self.apply(actions, now);
            }
            Wake::HeartbeatTick => {
                self.timers.heartbeat = Some(now + self.config.heartbeat_timeout);
                self.start_heartbeat_round();
            }
            Wake::QuorumWatchdog => {
                self.timers.quorum_watchdog = None;
                let was_leader = self.machine.is_leader();
                let actions = self.machine.on_quorum_watchdog(now);
                if was_leader && !self.machine.is_leader() {
                    self.shared.record(|stats| stats.quorum_losses += 1);
                }
                self.apply(actions, now);
            }
        }
        ControlFlow::Continue(())
    }

    fn on_event(&mut self, event: Event<T::Handle>, now: Instant) -> ControlFlow<()> {
        match event {
            Event::Inbound { message, reply } => {
                let result = match self.machine.handle_request(message, now) {
                    Ok((response, actions)) => {
                        self.apply(actions, now);
                        Ok(response)
                    }
                    Err(e) => Err(e),
                };
                self.publish();
                let _ = reply.send(result);
            }
            Event::Resign { reply } => {
                let result = self.resign(now);
                self.publish();
                let _ = reply.send(result);
            }
            Event::AddPeer { id, handle, reply } => {
                let result = self.membership.insert(id.clone(), handle).map(|added| {
                    if added {
                        info!("Node {} added peer {}", self.machine.id(), id);
                    }
                });
                self.publish_membership();
                let _ = reply.send(result);
            }
            Event::RemovePeer { id, reply } => {
                if self.membership.remove(&id).is_some() {
                    info!("Node {} removed peer {}", self.machine.id(), id);
                }
                self.publish_membership();
                let _ = reply.send(Ok(()));
            }
            Event::Close { reply } => {
                self.shutdown(now);
                let _ = reply.send(Ok(()));
                return ControlFlow::Break(());
            }
            Event::Shutdown => {
                self.shutdown(now);
                return ControlFlow::Break(());
            }
            Event::VoteRoundFinished {
                round,
                epoch,
                tally,
            } => {
                if finish(&mut self.vote_round, round) {
                    let actions = self.machine.on_vote_round(epoch, &tally, now);
                    self.apply(actions, now);
                }
            }
            Event::HeartbeatQuorum { epoch } => {
                let actions = self.machine.on_heartbeat_quorum(epoch, now);
                self.apply(actions, now);
            }
            Event::HeartbeatRoundFinished {
                round,
                epoch,
                tally,
            } => {
                if finish(&mut self.heartbeat_round, round) {
                    let actions = self.machine.on_heartbeat_round(epoch, &tally, now);
                    self.apply(actions, now);
                }
            }
            Event::ProbeFinished { round, tally } => {
                if finish(&mut self.probe_round, round) {
                    let actions = self.machine.on_probe_round(&tally, now);
                    self.apply(actions, now);
                }
            }
        }
        ControlFlow::Continue(())
    }

    fn resign(&mut self, now: Instant) -> Result<()> {
        let actions = self.machine.resign(now)?;
        self.shared.record(|stats| stats.resignations += 1);
        self.apply(actions, now);
        Ok(())
    }

    fn shutdown(&mut self, now: Instant) {
        if self.machine.is_leader() {
            // the resignation broadcast is detached and outlives the loop
            let _ = self.resign(now);
        }
        cancel(&mut self.vote_round);
        cancel(&mut self.heartbeat_round);
        cancel(&mut self.probe_round);
        self.timers.disarm_all();
        self.shared.mark_closed();
        self.publish();
        info!("Node {} closed", self.machine.id());
    }

    fn apply(&mut self, actions: Vec<Action>, now: Instant) {
        for action in actions {
            match action {
                Action::ArmElectionTimer(window) => {
                    let delay = match window {
                        ElectionWindow::Full => self.timer.randomized(),
                        ElectionWindow::Short => self.timer.short(),
                    };
                    self.timers.election = Some(now + delay);
                }
                Action::DisarmElectionTimer => self.timers.election = None,
                Action::RequestVotes { epoch } => self.start_vote_round(epoch),
                Action::CancelVoteRound => cancel(&mut self.vote_round),
                Action::StartHeartbeats => {
                    self.shared.record(|stats| stats.elections_won += 1);
                    self.timers.heartbeat = Some(now);
                }
                Action::StopHeartbeats => {
                    self.shared.record(|stats| stats.step_downs += 1);
                    self.timers.heartbeat = None;
                    self.timers.quorum_watchdog = None;
                    cancel(&mut self.heartbeat_round);
                }
                Action::ArmQuorumWatchdog(deadline) => self.timers.quorum_watchdog = Some(deadline),
                Action::BroadcastResign { epoch } => self.broadcast_resign(epoch),
                Action::ProbePeers => self.start_probe(),
            }
        }
    }

    fn next_round_id(&mut self) -> RoundId {
        self.next_round += 1;
        self.next_round
    }

    fn start_vote_round(&mut self, epoch: Epoch) {
        cancel(&mut self.vote_round);
        self.shared.record(|stats| stats.elections_started += 1);

        let round_id = self.next_round_id();
        let peers = self.membership.snapshot();
        let tally = RoundTally::new(self.membership.quorum_size(), peers.len(), epoch);
        let message = Message::vote_request(self.machine.id().clone(), epoch);
        let transport = self.transport.clone();
        let timeout = self.config.network_timeout;
        let events = self.events_tx.clone();

        let task = tokio::spawn(async move {
            let tally = round::collect(transport, peers, message, timeout, tally, |tally| {
                if tally.is_decided() {
                    RoundControl::Stop
                } else {
                    RoundControl::Continue
                }
            })
            .await;
            let _ = events.send(Event::VoteRoundFinished {
                round: round_id,
                epoch,
                tally,
            });
        });
        self.vote_round = Some(RunningRound { id: round_id, task });
    }

    /// One heartbeat round. The loop hears about the quorum as soon as it
    /// is reached, then once more when every peer has answered or timed out.
    fn start_heartbeat_round(&mut self) {
        if !self.machine.is_leader() {
            self.timers.heartbeat = None;
            return;
        }
        self.shared.record(|stats| stats.heartbeat_rounds += 1);

        let round_id = self.next_round_id();
        let epoch = self.machine.epoch();
        let peers = self.membership.snapshot();
        let tally = RoundTally::new(self.membership.quorum_size(), peers.len(), epoch);
        let message = Message::heartbeat(self.machine.id().clone(), epoch);
        let transport = self.transport.clone();
        let timeout = self.config.network_timeout;
        let events = self.events_tx.clone();

        let task = tokio::spawn(async move {
            let quorum_events = events.clone();
            let mut reported = false;
            let tally = round::collect(transport, peers, message, timeout, tally, move |tally| {
                if !reported && tally.has_quorum() {
                    reported = true;
                    let _ = quorum_events.send(Event::HeartbeatQuorum { epoch });
                }
                RoundControl::Continue
            })
            .await;
            let _ = events.send(Event::HeartbeatRoundFinished {
                round: round_id,
                epoch,
                tally,
            });
        });

        // an earlier round that is still draining keeps running; its quorum
        // report still counts but its final tally is dropped
        self.heartbeat_round = Some(RunningRound { id: round_id, task });
    }

    fn start_probe(&mut self) {
        cancel(&mut self.probe_round);

        let round_id = self.next_round_id();
        let peers = self.membership.snapshot();
        let tally = RoundTally::new(
            self.membership.quorum_size(),
            peers.len(),
            self.machine.epoch(),
        );
        let message = Message::probe(self.machine.id().clone());
        let transport = self.transport.clone();
        let timeout = self.config.network_timeout;
        let events = self.events_tx.clone();

        let task = tokio::spawn(async move {
            let tally = round::collect(transport, peers, message, timeout, tally, |tally| {
                if tally.responded > 0 {
                    RoundControl::Stop
                } else {
                    RoundControl::Continue
                }
            })
            .await;
            let _ = events.send(Event::ProbeFinished {
                round: round_id,
                tally,
            });
        });
        self.probe_round = Some(RunningRound { id: round_id, task });
    }

    fn broadcast_resign(&mut self, epoch: Epoch) {
        let peers = self.membership.snapshot();
        let tally = RoundTally::new(self.membership.quorum_size(), peers.len(), epoch);
        let message = Message::resign(self.machine.id().clone(), epoch);
        let transport = self.transport.clone();
        let timeout = self.config.network_timeout;

        tokio::spawn(async move {
            let tally =
                round::collect(transport, peers, message, timeout, tally, |_| RoundControl::Continue)
                    .await;
            debug!(
                "Resignation of epoch {} acknowledged by {}/{} peers",
                epoch, tally.responded, tally.peers
            );
        });
    }

    fn publish(&mut self) {
        let state = self.machine.state();
        let epoch = self.machine.epoch();
        self.shared.publish(state, epoch, self.machine.leader());
        self.notifier.observe(state, self.machine.leader(), epoch);
    }

    fn publish_membership(&self) {
        self.shared
            .publish_membership(self.membership.peer_ids(), self.membership.quorum_size());
    }
}
