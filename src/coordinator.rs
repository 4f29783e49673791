//! Agreement coordinator: the quorum protocol per proposal round
//!
//! Runs the state machine that turns a candidate view into a committed
//! view. A round is Proposing while acknowledgments are collected,
//! Committing once a strict majority of the *base* view's members acked
//! (the old view's member count sets the bar, so a shrinking view cannot
//! lower its own quorum), and Aborted when superseded or timed out.
//!
//! The coordinator is driven from a single event loop and never runs two
//! transitions concurrently; handlers return the messages to send instead
//! of performing I/O themselves.

use std::cmp::Reverse;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::RwLock;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::error::{CommitError, ConveneError};
use crate::messages::ProtocolMessage;
use crate::proposer::Proposal;
use crate::store::ViewStore;
use crate::types::{CoordinatorConfig, NodeId};
use crate::view::ClusterView;

/// A message to hand to the transport
#[derive(Debug)]
pub struct Outbound {
    pub to: NodeId,
    pub message: ProtocolMessage,
}

/// How a proposal round ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoundOutcome {
    Committed,
    Aborted,
}

/// Side effects of one protocol step, applied by the owning event loop
#[derive(Debug, Default)]
pub struct StepOutput {
    /// Messages to send (fire-and-forget; commits get retried delivery)
    pub outbound: Vec<Outbound>,
    /// The latest view committed locally during this step, if any
    pub committed: Option<Arc<ClusterView>>,
    /// Set when the local proposal round ended during this step
    pub round_finished: Option<RoundOutcome>,
    /// A protocol invariant violation that must halt the node
    pub fatal: Option<ConveneError>,
}

impl StepOutput {
    fn merge(&mut self, other: StepOutput) {
        self.outbound.extend(other.outbound);
        if other.committed.is_some() {
            self.committed = other.committed;
        }
        if other.round_finished.is_some() {
            self.round_finished = other.round_finished;
        }
        if other.fatal.is_some() {
            self.fatal = other.fatal;
        }
    }
}

/// State of the local proposal round
#[derive(Debug)]
pub enum RoundState {
    /// No local proposal in flight
    Idle,
    /// Proposal sent; collecting acknowledgments until the deadline
    Proposing {
        proposal: Proposal,
        acks: HashSet<NodeId>,
        deadline: Instant,
    },
    /// Quorum reached; committing and broadcasting
    Committing {
        proposal: Proposal,
        acked_by: Vec<NodeId>,
    },
    /// Round superseded or timed out; a fresh round may start
    Aborted,
}

/// Runtime counters for the agreement protocol
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct CoordinatorStats {
    pub proposals_started: u64,
    pub proposals_committed: u64,
    pub proposals_aborted: u64,
    pub acks_received: u64,
    pub commits_applied: u64,
    pub duplicate_commits: u64,
    pub resync_requests_sent: u64,
    pub resyncs_served: u64,
    pub consistency_violations: u64,
}

/// Drives quorum agreement for one node
pub struct AgreementCoordinator {
    local: NodeId,
    config: CoordinatorConfig,
    store: Arc<ViewStore>,
    round: RoundState,
    /// Highest-precedence proposal acknowledged for its base view:
    /// `(base_view_id, epoch, proposer)`
    acked: Option<(u64, u64, NodeId)>,
    resync_attempts: usize,
    desynchronized: bool,
    poisoned: bool,
    consecutive_timeouts: u64,
    stats: Arc<RwLock<CoordinatorStats>>,
}

/// Precedence of a proposal for tie-breaking: the higher epoch wins, and
/// on an exact tie the numerically lower proposer id wins.
fn precedence(epoch: u64, proposer: NodeId) -> (u64, Reverse<NodeId>) {
    (epoch, Reverse(proposer))
}

impl AgreementCoordinator {
    /// Create a coordinator over the node's view store
    pub fn new(local: NodeId, config: CoordinatorConfig, store: Arc<ViewStore>) -> Self {
        Self {
            local,
            config,
            store,
            round: RoundState::Idle,
            acked: None,
            resync_attempts: 0,
            desynchronized: false,
            poisoned: false,
            consecutive_timeouts: 0,
            stats: Arc::new(RwLock::new(CoordinatorStats::default())),
        }
    }

    /// Current round state
    pub fn round(&self) -> &RoundState {
        &self.round
    }

    /// Whether a new round may start
    pub fn can_start_round(&self) -> bool {
        !self.poisoned
            && !self.desynchronized
            && matches!(self.round, RoundState::Idle | RoundState::Aborted)
    }

    /// Whether this node gave up filling a view gap
    pub fn is_desynchronized(&self) -> bool {
        self.desynchronized
    }

    /// Whether this node halted after a consistency violation
    pub fn is_poisoned(&self) -> bool {
        self.poisoned
    }

    /// Timeout-aborted rounds since the last observed commit
    pub fn consecutive_timeouts(&self) -> u64 {
        self.consecutive_timeouts
    }

    /// Shared handle to the protocol counters
    pub fn stats_handle(&self) -> Arc<RwLock<CoordinatorStats>> {
        self.stats.clone()
    }

    /// Begin a proposal round for a locally built proposal
    pub fn start_round(&mut self, proposal: Proposal, now: Instant) -> StepOutput {
        let mut out = StepOutput::default();
        if !self.can_start_round() {
            out.round_finished = Some(RoundOutcome::Aborted);
            return out;
        }

        let base = self.store.current();
        if base.view_id() != proposal.base_view_id {
            // A commit raced past between building and starting the round.
            out.round_finished = Some(RoundOutcome::Aborted);
            return out;
        }

        self.stats.write().proposals_started += 1;
        self.record_own_ack(&proposal);

        let mut acks = HashSet::new();
        if base.is_empty() || base.contains(&self.local) {
            acks.insert(self.local);
        }

        if acks.len() >= base.quorum_size() {
            // Bootstrap or single-member base: the proposer's own ack is
            // already a strict majority.
            self.round = RoundState::Committing {
                acked_by: acks.into_iter().collect(),
                proposal,
            };
            out.merge(self.commit_current_round());
            return out;
        }

        debug!(
            base_view_id = proposal.base_view_id,
            epoch = proposal.epoch,
            "proposing view change"
        );
        for member in base.members() {
            if *member != self.local {
                out.outbound.push(Outbound {
                    to: *member,
                    message: ProtocolMessage::Propose {
                        base_view_id: proposal.base_view_id,
                        proposed_members: proposal.proposed_members.clone(),
                        proposer_id: proposal.proposer_id,
                        epoch: proposal.epoch,
                    },
                });
            }
        }
        self.round = RoundState::Proposing {
            proposal,
            acks,
            deadline: now + self.config.proposal_timeout,
        };
        out
    }

    /// Handle a protocol message from a peer
    pub fn handle_message(
        &mut self,
        from: NodeId,
        message: ProtocolMessage,
        now: Instant,
    ) -> StepOutput {
        let mut out = match message {
            ProtocolMessage::Propose {
                base_view_id,
                proposed_members,
                proposer_id,
                epoch,
            } => {
                self.handle_propose(from, base_view_id, proposed_members, proposer_id, epoch)
            }
            ProtocolMessage::Ack {
                base_view_id,
                proposer_id,
                epoch,
                acker,
            } => self.handle_ack(base_view_id, proposer_id, epoch, acker),
            ProtocolMessage::Commit {
                view_id,
                members,
                proposer_id,
                ..
            } => self.handle_commit(from, view_id, members, proposer_id),
            ProtocolMessage::ResyncRequest { from_view_id } => {
                self.handle_resync_request(from, from_view_id)
            }
            ProtocolMessage::ResyncResponse { snapshots } => {
                self.handle_resync_response(from, snapshots)
            }
        };
        // Fold any due timeout into the same step so deadlines stay honest
        // even when messages arrive faster than timer events.
        out.merge(self.handle_tick(now));
        out
    }

    /// Advance time-driven transitions: abort a round whose quorum
    /// deadline has passed
    pub fn handle_tick(&mut self, now: Instant) -> StepOutput {
        let mut out = StepOutput::default();
        if let RoundState::Proposing { deadline, proposal, .. } = &self.round {
            if now >= *deadline {
                warn!(
                    base_view_id = proposal.base_view_id,
                    epoch = proposal.epoch,
                    "proposal round timed out waiting for quorum"
                );
                self.consecutive_timeouts += 1;
                self.abort_round(&mut out, "quorum timeout");
            }
        }
        out
    }

    fn handle_propose(
        &mut self,
        from: NodeId,
        base_view_id: u64,
        proposed_members: Vec<NodeId>,
        proposer_id: NodeId,
        epoch: u64,
    ) -> StepOutput {
        let mut out = StepOutput::default();
        if self.poisoned || self.desynchronized {
            return out;
        }

        let current = self.store.current();
        if base_view_id > current.view_id() {
            // The proposer is ahead of us: we missed at least one commit.
            out.merge(self.request_resync(from));
            return out;
        }
        if base_view_id < current.view_id() {
            // Stale proposer; hand it our latest commit so it converges
            // without waiting for a gap.
            out.outbound.push(Outbound {
                to: from,
                message: ProtocolMessage::Commit {
                    view_id: current.view_id(),
                    members: current.members().to_vec(),
                    proposer_id: self.local,
                    epoch,
                },
            });
            return out;
        }

        let theirs = precedence(epoch, proposer_id);
        if let RoundState::Proposing { proposal, .. } = &self.round {
            if proposal.base_view_id == base_view_id {
                let ours = precedence(proposal.epoch, proposal.proposer_id);
                if ours >= theirs {
                    debug!(epoch, %proposer_id, "discarding losing competing proposal");
                    return out;
                }
                // Theirs wins: act as if we never proposed, then ack it.
                warn!(
                    our_epoch = proposal.epoch,
                    their_epoch = epoch,
                    "local proposal superseded by higher-precedence proposal"
                );
                self.abort_round(&mut out, "lost tie-break");
            }
        }

        if let Some((acked_base, acked_epoch, acked_proposer)) = self.acked {
            if acked_base == base_view_id && precedence(acked_epoch, acked_proposer) >= theirs {
                // Already acknowledged a winning proposal for this base.
                return out;
            }
        }

        self.acked = Some((base_view_id, epoch, proposer_id));
        debug!(base_view_id, epoch, %proposer_id, members = proposed_members.len(), "acknowledging proposal");
        out.outbound.push(Outbound {
            to: from,
            message: ProtocolMessage::Ack {
                base_view_id,
                proposer_id,
                epoch,
                acker: self.local,
            },
        });
        out
    }

    fn handle_ack(
        &mut self,
        base_view_id: u64,
        proposer_id: NodeId,
        epoch: u64,
        acker: NodeId,
    ) -> StepOutput {
        let mut out = StepOutput::default();
        if proposer_id != self.local {
            return out;
        }

        let quorum_reached = match &mut self.round {
            RoundState::Proposing {
                proposal, acks, ..
            } if proposal.base_view_id == base_view_id && proposal.epoch == epoch => {
                let base = self.store.current();
                // Only acknowledgments from base-view members count
                // towards the quorum.
                if !base.is_empty() && !base.contains(&acker) {
                    false
                } else if acks.insert(acker) {
                    self.stats.write().acks_received += 1;
                    acks.len() >= base.quorum_size()
                } else {
                    false
                }
            }
            // Late acks for a finished or superseded round are ignored.
            _ => false,
        };

        if quorum_reached {
            if let RoundState::Proposing { proposal, acks, .. } =
                std::mem::replace(&mut self.round, RoundState::Idle)
            {
                self.round = RoundState::Committing {
                    proposal,
                    acked_by: acks.into_iter().collect(),
                };
                out.merge(self.commit_current_round());
            }
        }
        out
    }

    fn handle_commit(
        &mut self,
        from: NodeId,
        view_id: u64,
        members: Vec<NodeId>,
        proposer_id: NodeId,
    ) -> StepOutput {
        let mut out = StepOutput::default();
        if self.poisoned {
            return out;
        }

        let snapshot = ClusterView::new(view_id, members);
        match self.store.commit(snapshot, vec![proposer_id]) {
            Ok(committed) => {
                self.stats.write().commits_applied += 1;
                self.note_progress(committed.view_id());
                out.committed = Some(committed);
                // Any local round was built on an older base view.
                self.abort_round(&mut out, "superseded by commit");
            }
            Err(CommitError::StaleCommit { .. }) => {
                self.stats.write().duplicate_commits += 1;
            }
            Err(CommitError::ViewGap { .. }) => {
                out.merge(self.request_resync(from));
            }
            Err(CommitError::ConsistencyViolation { view_id }) => {
                self.poison(&mut out, view_id);
            }
            Err(CommitError::Halted) => {
                self.poison(&mut out, view_id);
            }
        }
        out
    }

    fn handle_resync_request(&mut self, from: NodeId, from_view_id: u64) -> StepOutput {
        let mut out = StepOutput::default();
        if self.poisoned {
            return out;
        }
        let snapshots = self.store.history_from(from_view_id);
        debug!(%from, from_view_id, supplied = snapshots.len(), "serving resync request");
        self.stats.write().resyncs_served += 1;
        out.outbound.push(Outbound {
            to: from,
            message: ProtocolMessage::ResyncResponse { snapshots },
        });
        out
    }

    fn handle_resync_response(&mut self, from: NodeId, snapshots: Vec<ClusterView>) -> StepOutput {
        let mut out = StepOutput::default();
        if self.poisoned {
            return out;
        }

        let mut advanced = false;
        for snapshot in snapshots {
            match self.store.commit(snapshot, Vec::new()) {
                Ok(committed) => {
                    advanced = true;
                    self.stats.write().commits_applied += 1;
                    out.committed = Some(committed);
                    self.abort_round(&mut out, "superseded by resynced commit");
                }
                Err(CommitError::StaleCommit { .. }) => continue,
                Err(CommitError::ViewGap { .. }) => break,
                Err(CommitError::ConsistencyViolation { view_id }) => {
                    self.poison(&mut out, view_id);
                    return out;
                }
                Err(CommitError::Halted) => {
                    self.poison(&mut out, self.store.current().view_id());
                    return out;
                }
            }
        }

        if advanced {
            self.note_progress(self.store.current().view_id());
            info!(current = self.store.current().view_id(), "resynced from peer");
        } else {
            // Unhelpful response; ask someone else while attempts remain.
            let current = self.store.current();
            let peers: Vec<NodeId> = current
                .members()
                .iter()
                .copied()
                .filter(|member| *member != self.local && *member != from)
                .collect();
            let target = if peers.is_empty() {
                from
            } else {
                peers[rand::thread_rng().gen_range(0..peers.len())]
            };
            out.merge(self.request_resync(target));
        }
        out
    }

    fn request_resync(&mut self, peer: NodeId) -> StepOutput {
        let mut out = StepOutput::default();
        let current = self.store.current().view_id();
        if self.resync_attempts >= self.config.resync_max_attempts {
            if !self.desynchronized {
                self.desynchronized = true;
                warn!(
                    current,
                    attempts = self.resync_attempts,
                    "no peer supplied the missing views; marking node desynchronized"
                );
                self.abort_round(&mut out, "desynchronized");
            }
            return out;
        }
        self.resync_attempts += 1;
        self.stats.write().resync_requests_sent += 1;
        debug!(%peer, from_view_id = current + 1, "requesting resync");
        out.outbound.push(Outbound {
            to: peer,
            message: ProtocolMessage::ResyncRequest {
                from_view_id: current + 1,
            },
        });
        out
    }

    /// Commit the round held in `Committing`, broadcast the result to the
    /// new view's members, and return to `Idle`
    fn commit_current_round(&mut self) -> StepOutput {
        let mut out = StepOutput::default();
        let RoundState::Committing { proposal, acked_by } =
            std::mem::replace(&mut self.round, RoundState::Idle)
        else {
            return out;
        };

        let new_view = ClusterView::new(proposal.base_view_id + 1, proposal.proposed_members);
        match self.store.commit(new_view, acked_by) {
            Ok(committed) => {
                self.stats.write().proposals_committed += 1;
                self.stats.write().commits_applied += 1;
                self.note_progress(committed.view_id());
                info!(
                    view_id = committed.view_id(),
                    epoch = proposal.epoch,
                    "proposal reached quorum and committed"
                );
                for member in committed.members() {
                    if *member != self.local {
                        out.outbound.push(Outbound {
                            to: *member,
                            message: ProtocolMessage::Commit {
                                view_id: committed.view_id(),
                                members: committed.members().to_vec(),
                                proposer_id: proposal.proposer_id,
                                epoch: proposal.epoch,
                            },
                        });
                    }
                }
                out.committed = Some(committed);
                out.round_finished = Some(RoundOutcome::Committed);
            }
            Err(CommitError::ConsistencyViolation { view_id }) => {
                self.poison(&mut out, view_id);
                out.round_finished = Some(RoundOutcome::Aborted);
            }
            Err(CommitError::Halted) => {
                self.poison(&mut out, self.store.current().view_id());
                out.round_finished = Some(RoundOutcome::Aborted);
            }
            Err(_) => {
                // A competing commit raced past quorum detection.
                self.stats.write().proposals_aborted += 1;
                out.round_finished = Some(RoundOutcome::Aborted);
            }
        }
        out
    }

    fn abort_round(&mut self, out: &mut StepOutput, reason: &str) {
        if matches!(
            self.round,
            RoundState::Proposing { .. } | RoundState::Committing { .. }
        ) {
            debug!(reason, "proposal round aborted");
            self.round = RoundState::Aborted;
            self.stats.write().proposals_aborted += 1;
            out.round_finished = Some(RoundOutcome::Aborted);
        }
    }

    fn poison(&mut self, out: &mut StepOutput, view_id: u64) {
        if !self.poisoned {
            error!(
                view_id,
                "cluster consistency violation: refusing to commit further views"
            );
            self.poisoned = true;
            self.stats.write().consistency_violations += 1;
            self.abort_round(out, "consistency violation");
        }
        out.fatal = Some(ConveneError::ClusterConsistencyViolation { view_id });
    }

    /// Bookkeeping common to every successfully applied commit
    fn note_progress(&mut self, committed_view_id: u64) {
        self.consecutive_timeouts = 0;
        self.resync_attempts = 0;
        self.desynchronized = false;
        if let Some((acked_base, _, _)) = self.acked {
            if acked_base < committed_view_id {
                self.acked = None;
            }
        }
    }

    fn record_own_ack(&mut self, proposal: &Proposal) {
        let candidate = precedence(proposal.epoch, proposal.proposer_id);
        match self.acked {
            Some((base, epoch, proposer))
                if base == proposal.base_view_id && precedence(epoch, proposer) >= candidate => {}
            _ => {
                self.acked = Some((
                    proposal.base_view_id,
                    proposal.epoch,
                    proposal.proposer_id,
                ));
            }
        }
    }
}

impl std::fmt::Debug for AgreementCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgreementCoordinator")
            .field("local", &self.local)
            .field("round", &self.round)
            .field("desynchronized", &self.desynchronized)
            .field("poisoned", &self.poisoned)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::StoreConfig;

    fn node(n: u128) -> NodeId {
        NodeId::from_u128(n)
    }

    fn seeded(view_id: u64, members: &[NodeId]) -> Arc<ViewStore> {
        Arc::new(ViewStore::with_initial(
            ClusterView::new(view_id, members.to_vec()),
            StoreConfig::default(),
        ))
    }

    fn coordinator(local: NodeId, store: Arc<ViewStore>) -> AgreementCoordinator {
        AgreementCoordinator::new(local, CoordinatorConfig::default(), store)
    }

    fn proposal(base: u64, members: Vec<NodeId>, proposer: NodeId, epoch: u64) -> Proposal {
        Proposal {
            base_view_id: base,
            proposed_members: members,
            proposer_id: proposer,
            epoch,
        }
    }

    fn sent_kinds(out: &StepOutput) -> Vec<&'static str> {
        out.outbound.iter().map(|o| o.message.kind()).collect()
    }

    #[test]
    fn bootstrap_proposal_self_commits() {
        let a = node(1);
        let store = Arc::new(ViewStore::new(StoreConfig::default()));
        let mut coord = coordinator(a, store.clone());

        let out = coord.start_round(proposal(0, vec![a], a, 1), Instant::now());

        assert_eq!(out.round_finished, Some(RoundOutcome::Committed));
        let committed = out.committed.expect("bootstrap commit");
        assert_eq!(committed.view_id(), 1);
        assert_eq!(committed.members(), &[a]);
        // No other member to notify.
        assert!(out.outbound.is_empty());
        assert_eq!(store.current().view_id(), 1);
        assert!(coord.can_start_round());
    }

    #[test]
    fn quorum_of_base_view_commits_and_broadcasts() {
        let (a, b, c, d) = (node(1), node(2), node(3), node(4));
        let store = seeded(3, &[a, b, c]);
        let mut coord = coordinator(a, store.clone());

        let out = coord.start_round(proposal(3, vec![a, b, c, d], a, 1), Instant::now());
        assert_eq!(sent_kinds(&out), vec!["propose", "propose"]);
        assert!(out.committed.is_none());

        // Self ack plus one peer is a strict majority of three.
        let ack = ProtocolMessage::Ack {
            base_view_id: 3,
            proposer_id: a,
            epoch: 1,
            acker: b,
        };
        let out = coord.handle_message(b, ack, Instant::now());

        assert_eq!(out.round_finished, Some(RoundOutcome::Committed));
        let committed = out.committed.expect("quorum commit");
        assert_eq!(committed.view_id(), 4);
        assert_eq!(committed.members(), &[a, b, c, d]);
        // Commit goes to every new-view member except the committer.
        let targets: Vec<NodeId> = out.outbound.iter().map(|o| o.to).collect();
        assert_eq!(targets, vec![b, c, d]);
        assert!(out.outbound.iter().all(|o| o.message.kind() == "commit"));
    }

    #[test]
    fn ack_from_non_member_does_not_count() {
        let (a, b, c, outsider) = (node(1), node(2), node(3), node(9));
        let store = seeded(1, &[a, b, c]);
        let mut coord = coordinator(a, store);

        coord.start_round(proposal(1, vec![a, b, c], a, 1), Instant::now());
        let ack = ProtocolMessage::Ack {
            base_view_id: 1,
            proposer_id: a,
            epoch: 1,
            acker: outsider,
        };
        let out = coord.handle_message(outsider, ack, Instant::now());

        assert!(out.committed.is_none());
        assert!(matches!(coord.round(), RoundState::Proposing { .. }));
    }

    #[test]
    fn higher_epoch_proposal_supersedes_local_round() {
        let (a, b, c) = (node(1), node(2), node(3));
        let store = seeded(2, &[a, b, c]);
        let mut coord = coordinator(a, store);

        coord.start_round(proposal(2, vec![a, b], a, 5), Instant::now());
        let competing = ProtocolMessage::Propose {
            base_view_id: 2,
            proposed_members: vec![a, b, c],
            proposer_id: b,
            epoch: 7,
        };
        let out = coord.handle_message(b, competing, Instant::now());

        assert_eq!(out.round_finished, Some(RoundOutcome::Aborted));
        assert_eq!(sent_kinds(&out), vec!["ack"]);
        match &out.outbound[0].message {
            ProtocolMessage::Ack { epoch, proposer_id, .. } => {
                assert_eq!(*epoch, 7);
                assert_eq!(*proposer_id, b);
            }
            other => panic!("expected ack, got {other:?}"),
        }
    }

    #[test]
    fn losing_epoch_proposal_is_discarded() {
        let (a, b, c) = (node(1), node(2), node(3));
        let store = seeded(2, &[a, b, c]);
        let mut coord = coordinator(a, store);

        coord.start_round(proposal(2, vec![a, b], a, 7), Instant::now());
        let competing = ProtocolMessage::Propose {
            base_view_id: 2,
            proposed_members: vec![a, b, c],
            proposer_id: b,
            epoch: 5,
        };
        let out = coord.handle_message(b, competing, Instant::now());

        assert!(out.outbound.is_empty());
        assert!(out.round_finished.is_none());
        assert!(matches!(coord.round(), RoundState::Proposing { .. }));
    }

    #[test]
    fn equal_epoch_tie_goes_to_lower_node_id() {
        let (a, b, c) = (node(1), node(2), node(3));
        let store = seeded(2, &[a, b, c]);

        // The lower id keeps its round.
        let mut low = coordinator(a, store.clone());
        low.start_round(proposal(2, vec![a, b], a, 5), Instant::now());
        let from_high = ProtocolMessage::Propose {
            base_view_id: 2,
            proposed_members: vec![a, c],
            proposer_id: b,
            epoch: 5,
        };
        let out = low.handle_message(b, from_high, Instant::now());
        assert!(out.outbound.is_empty());
        assert!(matches!(low.round(), RoundState::Proposing { .. }));

        // The higher id yields and acks.
        let mut high = coordinator(b, seeded(2, &[a, b, c]));
        high.start_round(proposal(2, vec![a, c], b, 5), Instant::now());
        let from_low = ProtocolMessage::Propose {
            base_view_id: 2,
            proposed_members: vec![a, b],
            proposer_id: a,
            epoch: 5,
        };
        let out = high.handle_message(a, from_low, Instant::now());
        assert_eq!(out.round_finished, Some(RoundOutcome::Aborted));
        assert_eq!(sent_kinds(&out), vec!["ack"]);
    }

    #[test]
    fn follower_reacks_only_higher_precedence() {
        let (a, b, c, d) = (node(1), node(2), node(3), node(4));
        let store = seeded(2, &[a, b, c, d]);
        let mut coord = coordinator(c, store);

        let propose = |proposer: NodeId, epoch: u64| ProtocolMessage::Propose {
            base_view_id: 2,
            proposed_members: vec![a, b, c, d],
            proposer_id: proposer,
            epoch,
        };

        let out = coord.handle_message(a, propose(a, 5), Instant::now());
        assert_eq!(sent_kinds(&out), vec!["ack"]);

        let out = coord.handle_message(b, propose(b, 7), Instant::now());
        assert_eq!(sent_kinds(&out), vec!["ack"]);

        // Lower than what was already acknowledged.
        let out = coord.handle_message(d, propose(d, 6), Instant::now());
        assert!(out.outbound.is_empty());
    }

    #[test]
    fn round_times_out_and_aborts() {
        let (a, b, c) = (node(1), node(2), node(3));
        let store = seeded(1, &[a, b, c]);
        let mut coord = AgreementCoordinator::new(
            a,
            CoordinatorConfig {
                proposal_timeout: std::time::Duration::from_millis(50),
                ..Default::default()
            },
            store,
        );

        let started = Instant::now();
        coord.start_round(proposal(1, vec![a, b], a, 1), started);

        let out = coord.handle_tick(started + std::time::Duration::from_millis(10));
        assert!(out.round_finished.is_none());

        let out = coord.handle_tick(started + std::time::Duration::from_millis(60));
        assert_eq!(out.round_finished, Some(RoundOutcome::Aborted));
        assert_eq!(coord.consecutive_timeouts(), 1);
        assert!(coord.can_start_round());
    }

    #[test]
    fn commit_applies_and_duplicate_is_ignored() {
        let (a, b) = (node(1), node(2));
        let store = seeded(1, &[a, b]);
        let mut coord = coordinator(b, store.clone());

        let commit = ProtocolMessage::Commit {
            view_id: 2,
            members: vec![a, b],
            proposer_id: a,
            epoch: 1,
        };
        let out = coord.handle_message(a, commit.clone(), Instant::now());
        assert_eq!(out.committed.unwrap().view_id(), 2);

        let out = coord.handle_message(a, commit, Instant::now());
        assert!(out.committed.is_none());
        assert!(out.fatal.is_none());
        assert_eq!(coord.stats_handle().read().duplicate_commits, 1);
        assert_eq!(store.current().view_id(), 2);
    }

    #[test]
    fn view_gap_triggers_resync_request() {
        let (a, b) = (node(1), node(2));
        let store = seeded(1, &[a, b]);
        let mut coord = coordinator(b, store);

        let commit = ProtocolMessage::Commit {
            view_id: 4,
            members: vec![a, b],
            proposer_id: a,
            epoch: 3,
        };
        let out = coord.handle_message(a, commit, Instant::now());

        assert!(out.committed.is_none());
        match &out.outbound[..] {
            [Outbound {
                to,
                message: ProtocolMessage::ResyncRequest { from_view_id },
            }] => {
                assert_eq!(*to, a);
                assert_eq!(*from_view_id, 2);
            }
            other => panic!("expected resync request, got {other:?}"),
        }
    }

    #[test]
    fn resync_exhaustion_marks_desynchronized() {
        let (a, b) = (node(1), node(2));
        let store = seeded(1, &[a, b]);
        let mut coord = AgreementCoordinator::new(
            b,
            CoordinatorConfig {
                resync_max_attempts: 2,
                ..Default::default()
            },
            store,
        );

        // Each empty response burns one attempt and re-asks.
        let out = coord.handle_message(
            a,
            ProtocolMessage::ResyncResponse { snapshots: vec![] },
            Instant::now(),
        );
        assert_eq!(sent_kinds(&out), vec!["resync-request"]);
        let out = coord.handle_message(
            a,
            ProtocolMessage::ResyncResponse { snapshots: vec![] },
            Instant::now(),
        );
        assert_eq!(sent_kinds(&out), vec!["resync-request"]);

        let out = coord.handle_message(
            a,
            ProtocolMessage::ResyncResponse { snapshots: vec![] },
            Instant::now(),
        );
        assert!(out.outbound.is_empty());
        assert!(coord.is_desynchronized());
        assert!(!coord.can_start_round());
    }

    #[test]
    fn resync_response_fills_gap_and_clears_desync_counters() {
        let (a, b) = (node(1), node(2));
        let store = seeded(1, &[a, b]);
        let mut coord = coordinator(b, store.clone());

        let snapshots = vec![
            ClusterView::new(2, vec![a, b]),
            ClusterView::new(3, vec![a]),
        ];
        let out = coord.handle_message(
            a,
            ProtocolMessage::ResyncResponse { snapshots },
            Instant::now(),
        );

        assert_eq!(out.committed.unwrap().view_id(), 3);
        assert_eq!(store.current().view_id(), 3);
        assert!(!coord.is_desynchronized());
    }

    #[test]
    fn resync_request_served_from_history() {
        let (a, b) = (node(1), node(2));
        let store = Arc::new(ViewStore::new(StoreConfig::default()));
        store.commit(ClusterView::new(1, vec![a]), vec![a]).unwrap();
        store.commit(ClusterView::new(2, vec![a, b]), vec![a, b]).unwrap();
        store.commit(ClusterView::new(3, vec![a]), vec![a]).unwrap();
        let mut coord = coordinator(a, store);

        let out = coord.handle_message(
            b,
            ProtocolMessage::ResyncRequest { from_view_id: 2 },
            Instant::now(),
        );

        match &out.outbound[..] {
            [Outbound {
                to,
                message: ProtocolMessage::ResyncResponse { snapshots },
            }] => {
                assert_eq!(*to, b);
                let ids: Vec<u64> = snapshots.iter().map(|s| s.view_id()).collect();
                assert_eq!(ids, vec![2, 3]);
            }
            other => panic!("expected resync response, got {other:?}"),
        }
    }

    #[test]
    fn conflicting_commit_poisons_the_node() {
        let (a, b, c) = (node(1), node(2), node(3));
        let store = seeded(2, &[a, b]);
        let mut coord = coordinator(b, store.clone());

        let conflicting = ProtocolMessage::Commit {
            view_id: 2,
            members: vec![a, c],
            proposer_id: a,
            epoch: 1,
        };
        let out = coord.handle_message(a, conflicting, Instant::now());

        assert!(matches!(
            out.fatal,
            Some(ConveneError::ClusterConsistencyViolation { view_id: 2 })
        ));
        assert!(coord.is_poisoned());
        assert!(store.is_halted());
        assert!(!coord.can_start_round());

        // A poisoned node no longer participates.
        let out = coord.handle_message(
            a,
            ProtocolMessage::ResyncRequest { from_view_id: 1 },
            Instant::now(),
        );
        assert!(out.outbound.is_empty());
    }

    #[test]
    fn stale_propose_gets_latest_commit_back() {
        let (a, b, c) = (node(1), node(2), node(3));
        let store = seeded(5, &[a, b, c]);
        let mut coord = coordinator(a, store);

        let stale = ProtocolMessage::Propose {
            base_view_id: 3,
            proposed_members: vec![b, c],
            proposer_id: b,
            epoch: 2,
        };
        let out = coord.handle_message(b, stale, Instant::now());

        match &out.outbound[..] {
            [Outbound {
                to,
                message: ProtocolMessage::Commit { view_id, members, .. },
            }] => {
                assert_eq!(*to, b);
                assert_eq!(*view_id, 5);
                assert_eq!(members, &[a, b, c]);
            }
            other => panic!("expected courtesy commit, got {other:?}"),
        }
    }

    #[test]
    fn propose_ahead_of_us_triggers_resync() {
        let (a, b) = (node(1), node(2));
        let store = seeded(1, &[a, b]);
        let mut coord = coordinator(b, store);

        let ahead = ProtocolMessage::Propose {
            base_view_id: 3,
            proposed_members: vec![a, b],
            proposer_id: a,
            epoch: 4,
        };
        let out = coord.handle_message(a, ahead, Instant::now());
        assert_eq!(sent_kinds(&out), vec!["resync-request"]);
    }

    #[test]
    fn peer_commit_aborts_in_flight_round() {
        let (a, b, c) = (node(1), node(2), node(3));
        let store = seeded(1, &[a, b, c]);
        let mut coord = coordinator(a, store.clone());

        coord.start_round(proposal(1, vec![a, b], a, 1), Instant::now());
        let commit = ProtocolMessage::Commit {
            view_id: 2,
            members: vec![a, b, c],
            proposer_id: b,
            epoch: 2,
        };
        let out = coord.handle_message(b, commit, Instant::now());

        assert_eq!(out.round_finished, Some(RoundOutcome::Aborted));
        assert_eq!(store.current().view_id(), 2);
        assert!(coord.can_start_round());
    }
}
