//! # Convene: quorum-agreed cluster membership views
//!
//! Convene keeps a cluster's membership as a sequence of numbered,
//! immutable snapshots. Every change (a node joining, leaving, or being
//! suspected dead) produces a proposal for the next view; a proposal
//! becomes the next committed view only after a strict majority of the
//! current view's members acknowledge it, so every node observes the same
//! views in the same order.
//!
//! The entry point is [`ClusterNode`]: wire it to a [`Transport`], start
//! it, and feed it membership signals. Committed views are observable via
//! [`ClusterNode::current_view`] and ordered subscriber callbacks.

#![warn(clippy::all)]

pub mod coordinator;
pub mod detector;
pub mod disseminator;
pub mod error;
pub mod messages;
pub mod node;
pub mod persist;
pub mod proposer;
pub mod store;
pub mod transport;
pub mod types;
pub mod view;

// Re-export main types
pub use coordinator::{AgreementCoordinator, CoordinatorStats, RoundOutcome, RoundState};
pub use detector::{ChangeDetector, ChangeEvent, ChangeKind};
pub use disseminator::{DisseminatorStats, ViewDisseminator};
pub use error::{CommitError, ConveneError, ConveneResult, ProposalError};
pub use messages::ProtocolMessage;
pub use node::{ClusterNode, NodeStats};
pub use persist::ViewJournal;
pub use proposer::{ChangeRejection, Proposal, ViewProposer};
pub use store::{SubscriptionId, ViewStore};
pub use transport::{Envelope, InMemoryHub, InMemoryTransport, Transport};
pub use types::{
    CoordinatorConfig, DetectorConfig, DisseminatorConfig, NodeConfig, NodeHealth, NodeId,
    ProposerConfig, StoreConfig,
};
pub use view::{ClusterView, CommitRecord};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
