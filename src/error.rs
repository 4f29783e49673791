//! Error types for the cluster view membership system

use thiserror::Error;

/// Result type for membership operations
pub type ConveneResult<T> = Result<T, ConveneError>;

/// Main error type for membership operations
#[derive(Error, Debug)]
pub enum ConveneError {
    /// Transport errors
    #[error("transport error: {0}")]
    Transport(String),

    /// Serialization errors
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Two committed views share a view id with different members. Fatal:
    /// the node refuses to commit further views.
    #[error("cluster consistency violation: conflicting membership committed for view {view_id}")]
    ClusterConsistencyViolation { view_id: u64 },

    /// The worker task was already spawned
    #[error("node is already started")]
    AlreadyStarted,

    /// The node has stopped processing events
    #[error("node is not running")]
    NotRunning,

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors returned by the view store's commit operation
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CommitError {
    /// The snapshot's view id is not ahead of the current view. Duplicate
    /// and retransmitted commits land here and are absorbed silently.
    #[error("stale commit: view {proposed} is not ahead of current view {current}")]
    StaleCommit { proposed: u64, current: u64 },

    /// The snapshot skips ahead of the current view; this node missed a
    /// commit and must resync from a peer.
    #[error("view gap: view {proposed} skips ahead of current view {current}")]
    ViewGap { proposed: u64, current: u64 },

    /// The snapshot disagrees with an already-committed view of the same id
    #[error("conflicting membership for committed view {view_id}")]
    ConsistencyViolation { view_id: u64 },

    /// The store halted after a consistency violation
    #[error("view store is halted after a consistency violation")]
    Halted,
}

/// Terminal proposal failure, delivered with the dropped change through
/// the node's rejection channel
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProposalError {
    /// Retries were exhausted without the change being committed
    #[error("membership change was not applied after {attempts} attempts")]
    ChangeNotApplied { attempts: usize },
}

impl From<bincode::Error> for ConveneError {
    fn from(err: bincode::Error) -> Self {
        ConveneError::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for ConveneError {
    fn from(err: serde_json::Error) -> Self {
        ConveneError::Serialization(err.to_string())
    }
}
