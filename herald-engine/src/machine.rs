//! # Election State Machine
//!
//! The per-node Follower / Candidate / Leader transition table.
//!
//! The machine is synchronous and owns no timers, tasks or sockets. Every
//! input (an inbound request, a timer firing, the outcome of a round) is a
//! method call that mutates the state and returns the [`Action`]s the caller
//! has to carry out. This keeps every transition testable without a runtime.

use crate::round::RoundTally;
use herald_core::{ElectionConfig, ElectionError, Epoch, Message, NodeId, NodeState, Result};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Which window the election timer is drawn from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElectionWindow {
    /// `[election_timeout, 2 * election_timeout)`
    Full,
    /// `[heartbeat_timeout, 2 * heartbeat_timeout)`, after a resignation
    Short,
}

/// Side effects requested by a transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Re-arm the election timer with a freshly drawn delay
    ArmElectionTimer(ElectionWindow),
    DisarmElectionTimer,
    /// Ask every peer for a vote in `epoch`, replacing any running vote round
    RequestVotes { epoch: Epoch },
    CancelVoteRound,
    /// Begin the heartbeat ticker, first round immediately
    StartHeartbeats,
    /// Stop the heartbeat ticker and the quorum watchdog, cancel the running
    /// heartbeat round
    StopHeartbeats,
    /// Move the quorum watchdog deadline
    ArmQuorumWatchdog(Instant),
    /// Tell every peer the leadership for `epoch` is given up
    BroadcastResign { epoch: Epoch },
    /// Check which peers are reachable before taking part in elections
    ProbePeers,
}

/// Election state of a single node.
#[derive(Debug)]
pub struct ElectionMachine {
    id: NodeId,
    state: NodeState,
    epoch: Epoch,
    leader: Option<NodeId>,
    voted_for: Option<NodeId>,
    last_heartbeat: Option<Instant>,
    last_quorum_contact: Option<Instant>,
    election_timeout: Duration,
    leader_quorum_timeout: Duration,
}

impl ElectionMachine {
    pub fn new(id: NodeId, config: &ElectionConfig) -> Self {
        Self {
            id,
            state: NodeState::Follower,
            epoch: Epoch::ZERO,
            leader: None,
            voted_for: None,
            last_heartbeat: None,
            last_quorum_contact: None,
            election_timeout: config.election_timeout,
            leader_quorum_timeout: config.leader_quorum_timeout,
        }
    }

    pub fn id(&self) -> &NodeId {
        &self.id
    }

    pub fn state(&self) -> NodeState {
        self.state
    }

    pub fn epoch(&self) -> Epoch {
        self.epoch
    }

    pub fn leader(&self) -> Option<&NodeId> {
        self.leader.as_ref()
    }

    pub fn voted_for(&self) -> Option<&NodeId> {
        self.voted_for.as_ref()
    }

    pub fn is_leader(&self) -> bool {
        self.state == NodeState::Leader
    }

    pub fn last_quorum_contact(&self) -> Option<Instant> {
        self.last_quorum_contact
    }

    /// Initial transition. A node without peers leads on its own; a node
    /// with peers starts as a follower and probes them.
    pub fn start(&mut self, has_peers: bool, now: Instant) -> Vec<Action> {
        if has_peers {
            vec![Action::ArmElectionTimer(ElectionWindow::Full), Action::ProbePeers]
        } else {
            self.promote_alone(now)
        }
    }

    /// Dispatches an inbound request and returns the reply.
    pub fn handle_request(&mut self, message: Message, now: Instant) -> Result<(Message, Vec<Action>)> {
        message.validate_request()?;
        let handled = match message {
            Message::Heartbeat { leader_id, epoch } => self.on_heartbeat(leader_id, epoch, now),
            Message::VoteRequest {
                candidate_id,
                epoch,
            } => self.on_vote_request(candidate_id, epoch, now),
            Message::Resign { leader_id, epoch } => self.on_resign(leader_id, epoch, now),
            Message::Probe { from } => (self.on_probe(&from), Vec::new()),
            other => {
                return Err(ElectionError::InvalidMessage {
                    reason: format!("unexpected {}", other.kind()),
                })
            }
        };
        Ok(handled)
    }

    pub fn on_election_timeout(&mut self, _now: Instant) -> Vec<Action> {
        if self.is_leader() {
            return Vec::new();
        }
        info!(
            "Node {} timed out waiting for a leader in epoch {}",
            self.id, self.epoch
        );
        self.start_candidacy()
    }

    pub fn on_vote_round(&mut self, epoch: Epoch, tally: &RoundTally, now: Instant) -> Vec<Action> {
        if self.state != NodeState::Candidate || epoch != self.epoch {
            debug!("Node {} ignoring stale vote round for epoch {}", self.id, epoch);
            return Vec::new();
        }

        if tally.highest_epoch > self.epoch {
            info!(
                "Node {} saw epoch {} while campaigning in {}, standing down",
                self.id, tally.highest_epoch, self.epoch
            );
            return self.step_down(tally.highest_epoch, None, ElectionWindow::Full, now);
        }

        if tally.has_quorum() {
            info!(
                "Node {} won the election for epoch {} with {}/{} votes",
                self.id,
                self.epoch,
                tally.granted,
                tally.peers + 1
            );
            return self.become_leader(now);
        }

        debug!(
            "Node {} lost the vote for epoch {} ({} of {} needed)",
            self.id, self.epoch, tally.granted, tally.quorum
        );
        Vec::new()
    }

    /// A heartbeat round has been acknowledged by a quorum.
    pub fn on_heartbeat_quorum(&mut self, epoch: Epoch, now: Instant) -> Vec<Action> {
        if !self.is_leader() || epoch != self.epoch {
            return Vec::new();
        }
        self.last_quorum_contact = Some(now);
        vec![Action::ArmQuorumWatchdog(now + self.leader_quorum_timeout)]
    }

    /// All replies to a heartbeat round are in, or timed out.
    ///
    /// A leader that still holds a quorum but heard of a higher epoch moves
    /// its own epoch forward and keeps leading. Without a quorum it yields.
    pub fn on_heartbeat_round(&mut self, epoch: Epoch, tally: &RoundTally, now: Instant) -> Vec<Action> {
        if !self.is_leader() || epoch != self.epoch || tally.highest_epoch <= self.epoch {
            return Vec::new();
        }

        if tally.has_quorum() {
            info!(
                "Leader {} advancing from epoch {} to {}",
                self.id, self.epoch, tally.highest_epoch
            );
            self.epoch = tally.highest_epoch;
            self.voted_for = Some(self.id.clone());
            Vec::new()
        } else {
            warn!(
                "Leader {} lost its quorum and saw epoch {}, stepping down",
                self.id, tally.highest_epoch
            );
            self.step_down(tally.highest_epoch, None, ElectionWindow::Full, now)
        }
    }

    pub fn on_quorum_watchdog(&mut self, now: Instant) -> Vec<Action> {
        if !self.is_leader() {
            return Vec::new();
        }
        match self.last_quorum_contact {
            Some(contact)
                if now.saturating_duration_since(contact) < self.leader_quorum_timeout =>
            {
                vec![Action::ArmQuorumWatchdog(contact + self.leader_quorum_timeout)]
            }
            _ => {
                warn!(
                    "Leader {} has not reached a quorum for {:?}, stepping down",
                    self.id, self.leader_quorum_timeout
                );
                self.step_down(self.epoch, None, ElectionWindow::Full, now)
            }
        }
    }

    pub fn on_probe_round(&mut self, tally: &RoundTally, now: Instant) -> Vec<Action> {
        let undisturbed =
            self.state == NodeState::Follower && self.leader.is_none() && self.epoch == Epoch::ZERO;

        if undisturbed && tally.all_unreachable() {
            info!("Node {} cannot reach any peer, leading alone", self.id);
            return self.promote_alone(now);
        }

        if tally.highest_epoch > self.epoch && self.state == NodeState::Follower {
            debug!(
                "Node {} catching up to epoch {} from probes",
                self.id, tally.highest_epoch
            );
            self.epoch = tally.highest_epoch;
            self.voted_for = None;
        }
        Vec::new()
    }

    pub fn on_heartbeat(&mut self, leader_id: NodeId, epoch: Epoch, now: Instant) -> (Message, Vec<Action>) {
        if epoch < self.epoch || leader_id == self.id {
            return (self.heartbeat_ack(false), Vec::new());
        }

        if epoch > self.epoch {
            let actions = self.step_down(epoch, Some(leader_id), ElectionWindow::Full, now);
            return (self.heartbeat_ack(true), actions);
        }

        match self.state {
            NodeState::Leader if self.id < leader_id => {
                warn!(
                    "Node {} and {} both lead epoch {}, yielding",
                    self.id, leader_id, epoch
                );
                let reply = self.heartbeat_ack(false);
                (reply, self.start_candidacy())
            }
            NodeState::Leader => (self.heartbeat_ack(false), Vec::new()),
            // a follower never switches between two claimants of one epoch;
            // refusing the second one leaves the conflict to the leaders
            NodeState::Follower if self.leader.as_ref().map_or(false, |l| l != &leader_id) => {
                debug!(
                    "Node {} refusing heartbeat from {} in epoch {}, already following {:?}",
                    self.id, leader_id, epoch, self.leader
                );
                (self.heartbeat_ack(false), Vec::new())
            }
            NodeState::Candidate | NodeState::Follower => {
                let actions = self.step_down(epoch, Some(leader_id), ElectionWindow::Full, now);
                (self.heartbeat_ack(true), actions)
            }
        }
    }

    pub fn on_vote_request(
        &mut self,
        candidate_id: NodeId,
        epoch: Epoch,
        now: Instant,
    ) -> (Message, Vec<Action>) {
        if epoch < self.epoch || candidate_id == self.id {
            return (self.vote_response(false), Vec::new());
        }

        if self.has_live_leader(now) && self.leader.as_ref() != Some(&candidate_id) {
            debug!(
                "Node {} refusing vote for {} in epoch {}, leader {:?} is alive",
                self.id, candidate_id, epoch, self.leader
            );
            return (self.vote_response(false), Vec::new());
        }

        let mut actions = Vec::new();
        if epoch > self.epoch {
            actions = self.step_down(epoch, None, ElectionWindow::Full, now);
        }

        let free_to_vote = self.state == NodeState::Follower
            && self.voted_for.as_ref().map_or(true, |v| v == &candidate_id);
        if !free_to_vote {
            return (self.vote_response(false), actions);
        }

        debug!(
            "Node {} voting for {} in epoch {}",
            self.id, candidate_id, epoch
        );
        self.voted_for = Some(candidate_id);
        let rearm = Action::ArmElectionTimer(ElectionWindow::Full);
        if !actions.contains(&rearm) {
            actions.push(rearm);
        }
        (self.vote_response(true), actions)
    }

    /// A resignation from the leader this node follows, or from any node in
    /// a newer epoch, clears the leader and shortens the next election.
    pub fn on_resign(&mut self, leader_id: NodeId, epoch: Epoch, now: Instant) -> (Message, Vec<Action>) {
        let relevant = leader_id != self.id
            && (epoch > self.epoch
                || (epoch == self.epoch && self.leader.as_ref() == Some(&leader_id)));
        if !relevant {
            return (self.resign_ack(), Vec::new());
        }

        info!(
            "Node {} notified that {} resigned epoch {}",
            self.id, leader_id, epoch
        );
        let actions = self.step_down(epoch, None, ElectionWindow::Short, now);
        (self.resign_ack(), actions)
    }

    pub fn on_probe(&self, from: &NodeId) -> Message {
        debug!("Node {} probed by {}", self.id, from);
        Message::ProbeAck {
            epoch: self.epoch,
            leader_id: self.leader.clone(),
        }
    }

    /// Gives up leadership. The resigner waits a full election window so a
    /// different node is likely to win the next epoch.
    pub fn resign(&mut self, now: Instant) -> Result<Vec<Action>> {
        if !self.is_leader() {
            return Err(ElectionError::NotLeader {
                leader: self.leader.clone(),
            });
        }

        let epoch = self.epoch;
        info!("Leader {} resigning epoch {}", self.id, epoch);
        let mut actions = self.step_down(epoch, None, ElectionWindow::Full, now);
        actions.push(Action::BroadcastResign { epoch });
        Ok(actions)
    }

    fn has_live_leader(&self, now: Instant) -> bool {
        match self.state {
            NodeState::Leader => true,
            _ => {
                self.leader.is_some()
                    && self
                        .last_heartbeat
                        .map_or(false, |at| now.saturating_duration_since(at) < self.election_timeout)
            }
        }
    }

    fn promote_alone(&mut self, now: Instant) -> Vec<Action> {
        self.epoch = self.epoch.next();
        self.voted_for = Some(self.id.clone());
        info!("Node {} leading alone in epoch {}", self.id, self.epoch);
        self.become_leader(now)
    }

    fn start_candidacy(&mut self) -> Vec<Action> {
        let mut actions = Vec::new();
        if self.state == NodeState::Leader {
            actions.push(Action::StopHeartbeats);
        }

        self.state = NodeState::Candidate;
        self.epoch = self.epoch.next();
        self.voted_for = Some(self.id.clone());
        self.leader = None;
        self.last_heartbeat = None;
        self.last_quorum_contact = None;
        info!("Node {} campaigning for epoch {}", self.id, self.epoch);

        actions.push(Action::ArmElectionTimer(ElectionWindow::Full));
        actions.push(Action::RequestVotes { epoch: self.epoch });
        actions
    }

    fn become_leader(&mut self, now: Instant) -> Vec<Action> {
        self.state = NodeState::Leader;
        self.leader = Some(self.id.clone());
        self.last_heartbeat = None;
        self.last_quorum_contact = Some(now);
        vec![
            Action::DisarmElectionTimer,
            Action::StartHeartbeats,
            Action::ArmQuorumWatchdog(now + self.leader_quorum_timeout),
        ]
    }

    fn step_down(
        &mut self,
        epoch: Epoch,
        leader: Option<NodeId>,
        window: ElectionWindow,
        now: Instant,
    ) -> Vec<Action> {
        let mut actions = Vec::new();
        match self.state {
            NodeState::Leader => actions.push(Action::StopHeartbeats),
            NodeState::Candidate => actions.push(Action::CancelVoteRound),
            NodeState::Follower => {}
        }

        if epoch > self.epoch {
            self.epoch = epoch;
            self.voted_for = None;
        }
        if leader.is_some() && self.leader != leader {
            info!(
                "Node {} following {} in epoch {}",
                self.id,
                leader.as_ref().map(NodeId::as_str).unwrap_or_default(),
                self.epoch
            );
        }

        self.state = NodeState::Follower;
        self.last_quorum_contact = None;
        self.last_heartbeat = leader.as_ref().map(|_| now);
        self.leader = leader;
        actions.push(Action::ArmElectionTimer(window));
        actions
    }

    fn heartbeat_ack(&self, granted: bool) -> Message {
        Message::HeartbeatAck {
            follower_id: self.id.clone(),
            epoch: self.epoch,
            granted,
        }
    }

    fn vote_response(&self, granted: bool) -> Message {
        Message::VoteResponse {
            granted,
            epoch: self.epoch,
        }
    }

    fn resign_ack(&self) -> Message {
        Message::ResignAck {
            follower_id: self.id.clone(),
            epoch: self.epoch,
        }
    }
}
