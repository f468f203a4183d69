//! Per-node membership registry and quorum computation.

use crate::{ElectionError, NodeId, Result};
use std::collections::BTreeMap;

/// The set of peers a node knows about, with the transport handle used to
/// reach each of them.
///
/// The local node is always counted as a member but is never stored as a
/// peer. Quorum size is derived from the membership on every call, so adding
/// or removing a peer takes effect for the next round without any explicit
/// recomputation step.
#[derive(Debug, Clone)]
pub struct Membership<H> {
    local_id: NodeId,
    peers: BTreeMap<NodeId, H>,
    minimum_quorum: usize,
}

impl<H: Clone> Membership<H> {
    pub fn new(local_id: NodeId) -> Self {
        Self {
            local_id,
            peers: BTreeMap::new(),
            minimum_quorum: 0,
        }
    }

    /// Builds a membership from an initial peer list.
    ///
    /// Fails with `DuplicateId` if the local identity appears among the peers.
    pub fn with_peers(
        local_id: NodeId,
        peers: impl IntoIterator<Item = (NodeId, H)>,
    ) -> Result<Self> {
        let mut membership = Self::new(local_id);
        for (id, handle) in peers {
            membership.insert(id, handle)?;
        }
        Ok(membership)
    }

    pub fn with_minimum_quorum(mut self, minimum: usize) -> Self {
        self.minimum_quorum = minimum;
        self
    }

    /// Adds or replaces a peer. Returns `true` if the peer was not known before.
    pub fn insert(&mut self, id: NodeId, handle: H) -> Result<bool> {
        if id == self.local_id {
            return Err(ElectionError::DuplicateId { node_id: id });
        }
        Ok(self.peers.insert(id, handle).is_none())
    }

    pub fn remove(&mut self, id: &NodeId) -> Option<H> {
        self.peers.remove(id)
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        id == &self.local_id || self.peers.contains_key(id)
    }

    pub fn handle(&self, id: &NodeId) -> Option<&H> {
        self.peers.get(id)
    }

    pub fn peer_ids(&self) -> Vec<NodeId> {
        self.peers.keys().cloned().collect()
    }

    /// Owned copy of the peer list, used to dispatch a round without holding
    /// on to the registry.
    pub fn snapshot(&self) -> Vec<(NodeId, H)> {
        self.peers
            .iter()
            .map(|(id, handle)| (id.clone(), handle.clone()))
            .collect()
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    pub fn has_peers(&self) -> bool {
        !self.peers.is_empty()
    }

    /// Number of members, the local node included.
    pub fn cluster_size(&self) -> usize {
        self.peers.len() + 1
    }

    /// `floor(N / 2) + 1`, raised to the configured minimum but never above N.
    pub fn quorum_size(&self) -> usize {
        let n = self.cluster_size();
        let majority = n / 2 + 1;
        majority.max(self.minimum_quorum.min(n))
    }

    pub fn is_quorum(&self, count: usize) -> bool {
        count >= self.quorum_size()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn id(name: &str) -> NodeId {
        NodeId::from(name)
    }

    #[test]
    fn test_lone_node_is_its_own_quorum() {
        let membership: Membership<()> = Membership::new(id("n0"));
        assert_eq!(membership.cluster_size(), 1);
        assert_eq!(membership.quorum_size(), 1);
        assert!(membership.is_quorum(1));
        assert!(!membership.has_peers());
    }

    #[test]
    fn test_quorum_follows_membership_changes() {
        let mut membership = Membership::new(id("n0"));
        assert!(membership.insert(id("n1"), 1u16).unwrap());
        assert_eq!(membership.quorum_size(), 2);

        membership.insert(id("n2"), 2).unwrap();
        assert_eq!(membership.quorum_size(), 2);

        membership.insert(id("n3"), 3).unwrap();
        membership.insert(id("n4"), 4).unwrap();
        assert_eq!(membership.cluster_size(), 5);
        assert_eq!(membership.quorum_size(), 3);

        assert_eq!(membership.remove(&id("n4")), Some(4));
        assert_eq!(membership.remove(&id("n4")), None);
        assert_eq!(membership.quorum_size(), 3);
        membership.remove(&id("n3"));
        assert_eq!(membership.quorum_size(), 2);
    }

    #[test]
    fn test_insert_replaces_handle() {
        let mut membership = Membership::new(id("n0"));
        assert!(membership.insert(id("n1"), "old").unwrap());
        assert!(!membership.insert(id("n1"), "new").unwrap());
        assert_eq!(membership.handle(&id("n1")), Some(&"new"));
        assert_eq!(membership.peer_count(), 1);
    }

    #[test]
    fn test_rejects_own_identity() {
        let mut membership: Membership<()> = Membership::new(id("n0"));
        let err = membership.insert(id("n0"), ()).unwrap_err();
        assert!(matches!(err, ElectionError::DuplicateId { .. }));

        let result = Membership::with_peers(id("n0"), vec![(id("n1"), ()), (id("n0"), ())]);
        assert!(result.is_err());
    }

    #[test]
    fn test_minimum_quorum_is_capped_by_cluster_size() {
        let membership = Membership::with_peers(id("n0"), vec![(id("n1"), ()), (id("n2"), ())])
            .unwrap()
            .with_minimum_quorum(3);
        assert_eq!(membership.quorum_size(), 3);

        let lone: Membership<()> = Membership::new(id("n0")).with_minimum_quorum(3);
        assert_eq!(lone.quorum_size(), 1);
    }

    #[test]
    fn test_snapshot_is_sorted() {
        let membership = Membership::with_peers(
            id("n0"),
            vec![(id("n3"), 3), (id("n1"), 1), (id("n2"), 2)],
        )
        .unwrap();
        let ids: Vec<_> = membership.snapshot().into_iter().map(|(id, _)| id).collect();
        assert_eq!(ids, vec![id("n1"), id("n2"), id("n3")]);
        assert!(membership.contains(&id("n0")));
        assert!(!membership.contains(&id("n9")));
    }

    proptest! {
        #[test]
        fn quorum_is_strict_majority(peers in 0usize..64) {
            let membership = Membership::with_peers(
                id("self"),
                (0..peers).map(|i| (NodeId::new(format!("p{}", i)), ())),
            ).unwrap();
            let n = peers + 1;
            let quorum = membership.quorum_size();
            prop_assert_eq!(quorum, n / 2 + 1);
            // two disjoint quorums cannot exist
            prop_assert!(quorum * 2 > n);
        }
    }
}
