//! Transport boundary for protocol messages
//!
//! The core assumes an at-most-once, unordered, lossy message service and
//! nothing more. Sends are fire-and-forget; delivery of inbound messages
//! happens through a per-node channel registered with the transport.
//!
//! An in-memory implementation is provided for tests and simulations; it
//! routes encoded messages between registered nodes and can sever links to
//! model network partitions.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use tokio::sync::mpsc;

use crate::error::{ConveneError, ConveneResult};
use crate::messages::ProtocolMessage;
use crate::types::NodeId;

/// An inbound protocol message together with its sender
#[derive(Debug, Clone)]
pub struct Envelope {
    /// Address of the sending node
    pub from: NodeId,
    /// The protocol message
    pub message: ProtocolMessage,
}

/// Message service consumed by the core.
///
/// `send` hands the message to the wire and returns; an `Err` means the
/// destination is known to be unreachable right now, which callers may use
/// to drive retries. An `Ok` is not a delivery guarantee.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn send(&self, to: NodeId, message: ProtocolMessage) -> ConveneResult<()>;
}

/// In-process message hub connecting [`InMemoryTransport`] handles.
///
/// Every message crosses the hub as encoded bytes, so the wire codec is
/// exercised on each send. Links between nodes can be severed and healed
/// to model partitions.
#[derive(Debug, Default)]
pub struct InMemoryHub {
    routes: DashMap<NodeId, mpsc::Sender<Envelope>>,
    severed: DashSet<(NodeId, NodeId)>,
}

impl InMemoryHub {
    /// Create a new hub
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a node's inbound channel and get its transport handle
    pub fn register(
        self: &Arc<Self>,
        node: NodeId,
        inbox: mpsc::Sender<Envelope>,
    ) -> InMemoryTransport {
        self.routes.insert(node, inbox);
        InMemoryTransport {
            local: node,
            hub: Arc::clone(self),
        }
    }

    /// Sever both directions between every pair across the two groups
    pub fn partition(&self, left: &[NodeId], right: &[NodeId]) {
        for a in left {
            for b in right {
                self.severed.insert((*a, *b));
                self.severed.insert((*b, *a));
            }
        }
    }

    /// Restore all severed links
    pub fn heal(&self) {
        self.severed.clear();
    }

    fn deliver(&self, from: NodeId, to: NodeId, message: &ProtocolMessage) -> ConveneResult<()> {
        if self.severed.contains(&(from, to)) {
            return Err(ConveneError::Transport(format!(
                "link severed: {from} -> {to}"
            )));
        }
        let inbox = self
            .routes
            .get(&to)
            .ok_or_else(|| ConveneError::Transport(format!("unknown destination: {to}")))?;

        // Round-trip through the wire encoding, as a real transport would.
        let decoded = ProtocolMessage::decode(&message.encode()?)?;
        inbox
            .try_send(Envelope {
                from,
                message: decoded,
            })
            .map_err(|e| ConveneError::Transport(format!("inbox unavailable: {e}")))
    }
}

/// Transport handle bound to one registered node
#[derive(Clone)]
pub struct InMemoryTransport {
    local: NodeId,
    hub: Arc<InMemoryHub>,
}

impl InMemoryTransport {
    /// The node this handle sends as
    pub fn local(&self) -> NodeId {
        self.local
    }
}

#[async_trait]
impl Transport for InMemoryTransport {
    async fn send(&self, to: NodeId, message: ProtocolMessage) -> ConveneResult<()> {
        self.hub.deliver(self.local, to, &message)
    }
}
