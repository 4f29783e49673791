//! Change detector integration
//!
//! Normalizes raw join/leave/suspected-failure signals from the failure
//! detector and transport collaborators into change events, debouncing
//! repeated signals per address so flapping connectivity does not turn
//! into a proposal storm. The detector decides nothing about membership;
//! it only feeds the view proposer.

use std::collections::HashMap;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::types::{DetectorConfig, NodeId};

/// Kind of membership-change signal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChangeKind {
    /// A node asked to join, or a suspected node recovered
    Joined,
    /// A node left gracefully
    Left,
    /// The failure detector suspects the node is unreachable
    Suspected,
}

/// A normalized membership-change event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChangeEvent {
    pub kind: ChangeKind,
    pub address: NodeId,
}

/// Debouncing filter in front of the view proposer
#[derive(Debug)]
pub struct ChangeDetector {
    config: DetectorConfig,
    last_signal: HashMap<NodeId, (ChangeKind, Instant)>,
}

impl ChangeDetector {
    /// Create a new change detector
    pub fn new(config: DetectorConfig) -> Self {
        Self {
            config,
            last_signal: HashMap::new(),
        }
    }

    /// Feed a raw signal; returns the normalized event unless an identical
    /// signal for the same address arrived within the debounce window.
    pub fn observe(&mut self, kind: ChangeKind, address: NodeId, now: Instant) -> Option<ChangeEvent> {
        // Entries past the window can no longer collapse anything.
        self.last_signal
            .retain(|_, (_, at)| now.duration_since(*at) < self.config.debounce_window);
        if let Some((last_kind, last_at)) = self.last_signal.get(&address) {
            if *last_kind == kind && now.duration_since(*last_at) < self.config.debounce_window {
                debug!(%address, ?kind, "change signal collapsed by debounce");
                return None;
            }
        }
        self.last_signal.insert(address, (kind, now));
        Some(ChangeEvent { kind, address })
    }
}
