use crate::{ElectionError, Epoch, NodeId, Result};
use serde::{Deserialize, Serialize};

/// Election protocol messages.
///
/// Requests (`Heartbeat`, `VoteRequest`, `Resign`, `Probe`) travel from the
/// sender to a peer; the peer answers each with the matching response variant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    /// Periodic liveness claim from a leader
    Heartbeat { leader_id: NodeId, epoch: Epoch },
    /// Reply to a heartbeat; `granted` is false when the follower refuses the claim
    HeartbeatAck {
        follower_id: NodeId,
        epoch: Epoch,
        granted: bool,
    },
    /// A candidate asking for a vote in `epoch`
    VoteRequest { candidate_id: NodeId, epoch: Epoch },
    /// Reply to a vote request, carrying the voter's epoch
    VoteResponse { granted: bool, epoch: Epoch },
    /// A leader giving up leadership
    Resign { leader_id: NodeId, epoch: Epoch },
    /// Reply to a resignation notice
    ResignAck { follower_id: NodeId, epoch: Epoch },
    /// Reachability probe sent by a node on startup
    Probe { from: NodeId },
    /// Reply to a probe with the responder's view of the election
    ProbeAck {
        epoch: Epoch,
        leader_id: Option<NodeId>,
    },
}

impl Message {
    pub fn heartbeat(leader_id: NodeId, epoch: Epoch) -> Self {
        Self::Heartbeat { leader_id, epoch }
    }

    pub fn vote_request(candidate_id: NodeId, epoch: Epoch) -> Self {
        Self::VoteRequest {
            candidate_id,
            epoch,
        }
    }

    pub fn resign(leader_id: NodeId, epoch: Epoch) -> Self {
        Self::Resign { leader_id, epoch }
    }

    pub fn probe(from: NodeId) -> Self {
        Self::Probe { from }
    }

    /// Epoch carried by the message. Probes carry none.
    pub fn epoch(&self) -> Option<Epoch> {
        match self {
            Message::Heartbeat { epoch, .. }
            | Message::HeartbeatAck { epoch, .. }
            | Message::VoteRequest { epoch, .. }
            | Message::VoteResponse { epoch, .. }
            | Message::Resign { epoch, .. }
            | Message::ResignAck { epoch, .. }
            | Message::ProbeAck { epoch, .. } => Some(*epoch),
            Message::Probe { .. } => None,
        }
    }

    /// Whether the responder accepted the request. `None` for requests and
    /// for responses that carry no verdict.
    pub fn granted(&self) -> Option<bool> {
        match self {
            Message::HeartbeatAck { granted, .. } | Message::VoteResponse { granted, .. } => {
                Some(*granted)
            }
            Message::ResignAck { .. } => Some(true),
            _ => None,
        }
    }

    pub fn is_request(&self) -> bool {
        matches!(
            self,
            Message::Heartbeat { .. }
                | Message::VoteRequest { .. }
                | Message::Resign { .. }
                | Message::Probe { .. }
        )
    }

    /// Short name used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Heartbeat { .. } => "heartbeat",
            Message::HeartbeatAck { .. } => "heartbeat_ack",
            Message::VoteRequest { .. } => "vote_request",
            Message::VoteResponse { .. } => "vote_response",
            Message::Resign { .. } => "resign",
            Message::ResignAck { .. } => "resign_ack",
            Message::Probe { .. } => "probe",
            Message::ProbeAck { .. } => "probe_ack",
        }
    }

    /// Checks that the message can be dispatched to a node as an inbound request.
    pub fn validate_request(&self) -> Result<()> {
        if self.is_request() {
            Ok(())
        } else {
            Err(ElectionError::InvalidMessage {
                reason: format!("{} is a response and cannot be handled as a request", self.kind()),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_classification() {
        let id = NodeId::from("n0");
        assert!(Message::heartbeat(id.clone(), Epoch::new(1)).is_request());
        assert!(Message::vote_request(id.clone(), Epoch::new(1)).is_request());
        assert!(Message::resign(id.clone(), Epoch::new(1)).is_request());
        assert!(Message::probe(id).is_request());
        assert!(!Message::VoteResponse {
            granted: true,
            epoch: Epoch::new(1)
        }
        .is_request());
    }

    #[test]
    fn test_validate_rejects_responses() {
        let ack = Message::HeartbeatAck {
            follower_id: NodeId::from("n1"),
            epoch: Epoch::new(2),
            granted: true,
        };
        let err = ack.validate_request().unwrap_err();
        assert!(err.to_string().contains("heartbeat_ack"));
        assert!(Message::probe(NodeId::from("n1")).validate_request().is_ok());
    }

    #[test]
    fn test_epoch_and_verdict_accessors() {
        let response = Message::VoteResponse {
            granted: false,
            epoch: Epoch::new(9),
        };
        assert_eq!(response.epoch(), Some(Epoch::new(9)));
        assert_eq!(response.granted(), Some(false));
        assert_eq!(Message::probe(NodeId::from("n3")).epoch(), None);
        assert_eq!(
            Message::heartbeat(NodeId::from("n3"), Epoch::new(1)).granted(),
            None
        );
    }

    #[test]
    fn test_message_json_shape() {
        let message = Message::heartbeat(NodeId::from("n0"), Epoch::new(4));
        let json = serde_json::to_string(&message).unwrap();
        assert_eq!(json, r#"{"Heartbeat":{"leader_id":"n0","epoch":4}}"#);
        let decoded: Message = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, message);
    }
}
