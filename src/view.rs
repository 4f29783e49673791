//! Immutable cluster view snapshots
//!
//! A view is the membership of the cluster at some period of time,
//! identified by a strictly increasing `view_id`. Whenever nodes join or
//! leave, a new view is agreed on and shared among all members; existing
//! snapshots are never mutated.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::NodeId;

/// An immutable, numbered snapshot of cluster membership.
///
/// Members keep their agreement order; two snapshots are equal iff both
/// the view id and the member sequences (order included) are equal. That
/// structural comparison is what detects duplicate retransmitted commits.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClusterView {
    view_id: u64,
    members: Vec<NodeId>,
}

impl ClusterView {
    /// The universal initial state before any agreement has occurred:
    /// view id 0 and no members.
    pub const EMPTY: ClusterView = ClusterView {
        view_id: 0,
        members: Vec::new(),
    };

    /// Create a new snapshot
    pub fn new(view_id: u64, members: Vec<NodeId>) -> Self {
        Self { view_id, members }
    }

    /// The view's sequence number; 0 is reserved for the empty sentinel
    pub fn view_id(&self) -> u64 {
        self.view_id
    }

    /// Members in agreement order
    pub fn members(&self) -> &[NodeId] {
        &self.members
    }

    /// Whether the address is a member of this view
    pub fn contains(&self, address: &NodeId) -> bool {
        self.members.contains(address)
    }

    /// Number of members
    pub fn len(&self) -> usize {
        self.members.len()
    }

    /// Whether this view has no members
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Acknowledgments required to commit a successor of this view: a
    /// strict majority of this view's members. The empty sentinel yields 1,
    /// so the bootstrap proposal commits on the proposer's own ack.
    pub fn quorum_size(&self) -> usize {
        self.members.len() / 2 + 1
    }
}

impl std::fmt::Display for ClusterView {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "view {} ({} members)", self.view_id, self.members.len())
    }
}

/// A committed snapshot plus the context of its commit, retained in the
/// view store's bounded history for resync and duplicate detection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitRecord {
    /// The committed snapshot
    pub snapshot: ClusterView,
    /// Members whose acknowledgments formed the quorum, as far as this
    /// node observed them
    pub acked_by: Vec<NodeId>,
    /// When this node applied the commit
    pub committed_at: DateTime<Utc>,
}

impl CommitRecord {
    /// Record a commit applied now
    pub fn new(snapshot: ClusterView, acked_by: Vec<NodeId>) -> Self {
        Self {
            snapshot,
            acked_by,
            committed_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_sentinel() {
        assert_eq!(ClusterView::EMPTY.view_id(), 0);
        assert!(ClusterView::EMPTY.is_empty());
        assert_eq!(ClusterView::EMPTY, ClusterView::new(0, vec![]));
    }

    #[test]
    fn test_equality_is_order_sensitive() {
        let a = NodeId::from_u128(1);
        let b = NodeId::from_u128(2);

        let ab = ClusterView::new(1, vec![a, b]);
        let ba = ClusterView::new(1, vec![b, a]);
        assert_ne!(ab, ba);
        assert_eq!(ab, ab.clone());
    }

    #[test]
    fn test_quorum_size() {
        let ids: Vec<NodeId> = (1..=5).map(NodeId::from_u128).collect();
        assert_eq!(ClusterView::EMPTY.quorum_size(), 1);
        assert_eq!(ClusterView::new(1, ids[..1].to_vec()).quorum_size(), 1);
        assert_eq!(ClusterView::new(1, ids[..2].to_vec()).quorum_size(), 2);
        assert_eq!(ClusterView::new(1, ids[..3].to_vec()).quorum_size(), 2);
        assert_eq!(ClusterView::new(1, ids[..4].to_vec()).quorum_size(), 3);
        assert_eq!(ClusterView::new(1, ids[..5].to_vec()).quorum_size(), 3);
    }
}
