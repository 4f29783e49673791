//! View proposer
//!
//! Turns debounced change events into candidate views. At most one local
//! proposal is outstanding at a time; a simple guard enforces that without
//! blocking other nodes. Aborted rounds are retried with a fresh epoch and
//! jittered exponential backoff until the change commits, is observed in a
//! committed view, or the attempt budget runs out.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use rand::Rng;
use tracing::{debug, warn};

use crate::detector::{ChangeEvent, ChangeKind};
use crate::error::ProposalError;
use crate::types::{NodeId, ProposerConfig};
use crate::view::ClusterView;

/// A candidate next view. Transient: destroyed once committed or aborted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Proposal {
    /// The committed view this proposal extends
    pub base_view_id: u64,
    /// Membership of the candidate view, in agreement order
    pub proposed_members: Vec<NodeId>,
    /// The proposing node
    pub proposer_id: NodeId,
    /// Tie-break for concurrent proposers
    pub epoch: u64,
}

/// A membership change dropped after exhausting its proposal attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChangeRejection {
    pub event: ChangeEvent,
    pub error: ProposalError,
}

/// Builds proposals from pending change events
#[derive(Debug)]
pub struct ViewProposer {
    local: NodeId,
    config: ProposerConfig,
    pending: VecDeque<ChangeEvent>,
    /// Base view id of the outstanding local proposal, if any
    in_flight: Option<u64>,
    /// Attempts spent on the change at the front of the queue
    attempts: usize,
    next_attempt_at: Option<Instant>,
    /// Highest proposal epoch used or observed so far
    epoch: u64,
}

impl ViewProposer {
    /// Create a new proposer for the local node
    pub fn new(local: NodeId, config: ProposerConfig) -> Self {
        Self {
            local,
            config,
            pending: VecDeque::new(),
            in_flight: None,
            attempts: 0,
            next_attempt_at: None,
            epoch: 0,
        }
    }

    /// Fold an epoch observed on the wire into the local counter, so the
    /// next proposal outbids everything seen so far
    pub fn note_epoch(&mut self, seen: u64) {
        self.epoch = self.epoch.max(seen);
    }

    /// Queue a change event for proposal
    pub fn enqueue(&mut self, event: ChangeEvent) {
        if !self.pending.contains(&event) {
            self.pending.push_back(event);
        }
    }

    /// Whether any change is waiting to be proposed
    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Attempts spent on the change currently at the front of the queue
    pub fn attempts(&self) -> usize {
        self.attempts
    }

    /// Proposal-role check: the node must carry the proposer capability
    /// and be a member of the current view, or the view must still be the
    /// empty sentinel (bootstrap).
    pub fn is_eligible(&self, current: &ClusterView) -> bool {
        self.config.enabled && (current.view_id() == 0 || current.contains(&self.local))
    }

    /// Build the next proposal against the current committed view, if one
    /// is due. Changes already reflected in the current view are dropped.
    pub fn next_proposal(&mut self, current: &ClusterView, now: Instant) -> Option<Proposal> {
        if !self.is_eligible(current) || self.in_flight.is_some() {
            return None;
        }
        if let Some(at) = self.next_attempt_at {
            if now < at {
                return None;
            }
        }

        let proposed_members = loop {
            let event = *self.pending.front()?;
            if is_reflected(&event, current) {
                self.pending.pop_front();
                self.attempts = 0;
                self.next_attempt_at = None;
                continue;
            }
            break apply_change(&event, current);
        };

        self.epoch += 1;
        self.in_flight = Some(current.view_id());
        debug!(
            base_view_id = current.view_id(),
            epoch = self.epoch,
            "built proposal"
        );
        Some(Proposal {
            base_view_id: current.view_id(),
            proposed_members,
            proposer_id: self.local,
            epoch: self.epoch,
        })
    }

    /// Release the single-proposal guard when the round ends. On an abort
    /// the front change is scheduled for a backoff retry; exhausting the
    /// attempt budget drops it and reports the rejection.
    pub fn round_finished(&mut self, committed: bool, now: Instant) -> Option<ChangeRejection> {
        self.in_flight = None;

        if committed {
            self.attempts = 0;
            self.next_attempt_at = None;
            return None;
        }

        self.attempts += 1;
        if self.attempts >= self.config.max_attempts {
            let rejection = self.pending.pop_front().map(|event| ChangeRejection {
                event,
                error: ProposalError::ChangeNotApplied {
                    attempts: self.attempts,
                },
            });
            if let Some(rejection) = &rejection {
                warn!(
                    address = %rejection.event.address,
                    kind = ?rejection.event.kind,
                    error = %rejection.error,
                    "giving up on membership change"
                );
            }
            self.attempts = 0;
            self.next_attempt_at = None;
            return rejection;
        }

        self.next_attempt_at = Some(now + self.backoff_delay());
        None
    }

    /// Drop pending changes that a newly committed view already reflects
    pub fn on_view_committed(&mut self, view: &ClusterView) {
        let before = self.pending.len();
        self.pending.retain(|event| !is_reflected(event, view));
        if self.pending.len() != before {
            self.attempts = 0;
            self.next_attempt_at = None;
        }
    }

    fn backoff_delay(&self) -> Duration {
        let exp = (self.attempts.saturating_sub(1)).min(16) as u32;
        let mut delay = self.config.backoff_base.saturating_mul(1 << exp);
        if delay > self.config.backoff_max {
            delay = self.config.backoff_max;
        }
        let jitter_ms = self.config.backoff_base.as_millis() as u64;
        delay + Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
    }
}

fn is_reflected(event: &ChangeEvent, view: &ClusterView) -> bool {
    match event.kind {
        ChangeKind::Joined => view.contains(&event.address),
        ChangeKind::Left | ChangeKind::Suspected => !view.contains(&event.address),
    }
}

fn apply_change(event: &ChangeEvent, current: &ClusterView) -> Vec<NodeId> {
    let mut members = current.members().to_vec();
    match event.kind {
        ChangeKind::Joined => {
            if !members.contains(&event.address) {
                members.push(event.address);
            }
        }
        ChangeKind::Left | ChangeKind::Suspected => {
            members.retain(|member| *member != event.address);
        }
    }
    members
}
