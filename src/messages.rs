//! Protocol messages exchanged between cluster nodes
//!
//! Logical message shapes for the view agreement protocol, independent of
//! any particular transport. The wire encoding is length-agnostic bincode;
//! framing is left to the transport implementation.

use serde::{Deserialize, Serialize};

use crate::error::ConveneResult;
use crate::types::NodeId;
use crate::view::ClusterView;

/// Messages of the view agreement protocol
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProtocolMessage {
    /// A candidate successor of the base view, sent to every member of
    /// the base view
    Propose {
        base_view_id: u64,
        proposed_members: Vec<NodeId>,
        proposer_id: NodeId,
        epoch: u64,
    },
    /// Acknowledgment of a proposal, sent back to its proposer
    Ack {
        base_view_id: u64,
        proposer_id: NodeId,
        epoch: u64,
        acker: NodeId,
    },
    /// A committed view, broadcast to every member of the new view
    Commit {
        view_id: u64,
        members: Vec<NodeId>,
        proposer_id: NodeId,
        epoch: u64,
    },
    /// Request for the committed views from `from_view_id` onwards
    ResyncRequest { from_view_id: u64 },
    /// Contiguous committed views answering a resync request; empty when
    /// the responder no longer retains the requested range
    ResyncResponse { snapshots: Vec<ClusterView> },
}

impl ProtocolMessage {
    /// Encode for the wire
    pub fn encode(&self) -> ConveneResult<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    /// Decode from the wire
    pub fn decode(bytes: &[u8]) -> ConveneResult<Self> {
        Ok(bincode::deserialize(bytes)?)
    }

    /// Short name for logging
    pub fn kind(&self) -> &'static str {
        match self {
            ProtocolMessage::Propose { .. } => "propose",
            ProtocolMessage::Ack { .. } => "ack",
            ProtocolMessage::Commit { .. } => "commit",
            ProtocolMessage::ResyncRequest { .. } => "resync-request",
            ProtocolMessage::ResyncResponse { .. } => "resync-response",
        }
    }
}
