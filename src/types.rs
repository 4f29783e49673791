//! Core types for the cluster view membership system
//!
//! Node identifiers, configuration structs, and health status shared
//! by every component of the crate.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::view::ClusterView;

/// Unique identifier of a cluster member.
///
/// The core treats addresses as opaque: only equality, hashing, and a
/// stable ordering (used by the proposal tie-break) are assumed. Network
/// semantics belong to the transport collaborator.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct NodeId(pub Uuid);

impl NodeId {
    /// Generate a new random node ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create from bytes
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }

    /// Create from a u128, useful for deterministic test fixtures
    pub fn from_u128(value: u128) -> Self {
        Self(Uuid::from_u128(value))
    }

    /// Get as bytes
    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }
}

impl Default for NodeId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Health of a node with respect to the membership protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeHealth {
    /// Participating normally
    Healthy,
    /// Unable to reach quorum; membership changes are stalled
    Degraded,
    /// Missed commits that no peer could supply; not proposing
    Desynchronized,
    /// Observed a protocol invariant violation; refuses further commits
    Poisoned,
}

/// View store configuration
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Number of commit records retained for resync catch-up
    pub history_retention: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            history_retention: 64,
        }
    }
}

/// Change detector configuration
#[derive(Debug, Clone)]
pub struct DetectorConfig {
    /// Repeated signals for the same address within this window collapse
    /// to a single change event
    pub debounce_window: Duration,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            debounce_window: Duration::from_millis(500),
        }
    }
}

/// View proposer configuration
#[derive(Debug, Clone)]
pub struct ProposerConfig {
    /// Whether this node may drive proposals at all. Nodes without the
    /// capability still acknowledge, commit, and serve resyncs.
    pub enabled: bool,
    /// Attempts per membership change before it is reported as not applied
    pub max_attempts: usize,
    /// Base delay for the exponential retry backoff
    pub backoff_base: Duration,
    /// Upper bound on the retry backoff
    pub backoff_max: Duration,
}

impl Default for ProposerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: 5,
            backoff_base: Duration::from_millis(100),
            backoff_max: Duration::from_secs(3),
        }
    }
}

/// Agreement coordinator configuration
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// How long a proposal round waits for quorum before aborting
    pub proposal_timeout: Duration,
    /// Resync attempts before the node marks itself desynchronized
    pub resync_max_attempts: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            proposal_timeout: Duration::from_secs(1),
            resync_max_attempts: 3,
        }
    }
}

/// View disseminator configuration
#[derive(Debug, Clone)]
pub struct DisseminatorConfig {
    /// Delivery attempts per commit target
    pub retry_attempts: usize,
    /// Base delay between delivery attempts
    pub retry_backoff: Duration,
}

impl Default for DisseminatorConfig {
    fn default() -> Self {
        Self {
            retry_attempts: 3,
            retry_backoff: Duration::from_millis(100),
        }
    }
}

/// Configuration for a cluster node
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Node identifier
    pub node_id: NodeId,
    /// View store configuration
    pub store: StoreConfig,
    /// Change detector configuration
    pub detector: DetectorConfig,
    /// View proposer configuration
    pub proposer: ProposerConfig,
    /// Agreement coordinator configuration
    pub coordinator: CoordinatorConfig,
    /// View disseminator configuration
    pub disseminator: DisseminatorConfig,
    /// Interval of the internal timer driving timeouts and retries
    pub tick_interval: Duration,
    /// Capacity of the node's event queue
    pub event_queue_capacity: usize,
    /// Committed view to seed the store with at startup; overrides any
    /// persisted snapshot
    pub initial_view: Option<ClusterView>,
    /// Where to persist the current committed snapshot, if durability
    /// across restarts is required
    pub persist_path: Option<PathBuf>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: NodeId::new(),
            store: StoreConfig::default(),
            detector: DetectorConfig::default(),
            proposer: ProposerConfig::default(),
            coordinator: CoordinatorConfig::default(),
            disseminator: DisseminatorConfig::default(),
            tick_interval: Duration::from_millis(25),
            event_queue_capacity: 256,
            initial_view: None,
            persist_path: None,
        }
    }
}
