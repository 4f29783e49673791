//! Cluster node: wires the store, detector, proposer, coordinator and
//! disseminator into one event-driven actor
//!
//! All protocol state lives inside a single worker task fed by one event
//! queue, so proposal rounds, inbound messages and timeouts are handled
//! strictly one at a time. The public handle stays cheap to share: reads
//! go through the lock-free store snapshot, writes go through the queue.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::coordinator::{AgreementCoordinator, CoordinatorStats, RoundOutcome, StepOutput};
use crate::detector::{ChangeDetector, ChangeEvent, ChangeKind};
use crate::disseminator::{DisseminatorStats, ViewDisseminator};
use crate::error::{ConveneError, ConveneResult};
use crate::messages::ProtocolMessage;
use crate::persist::ViewJournal;
use crate::proposer::{ChangeRejection, ViewProposer};
use crate::store::{SubscriptionId, ViewStore};
use crate::transport::{Envelope, Transport};
use crate::types::{NodeConfig, NodeHealth, NodeId};
use crate::view::ClusterView;

/// Control events for the worker task
#[derive(Debug)]
enum NodeEvent {
    Change(ChangeEvent),
    Shutdown,
}

/// Point-in-time summary of a node's protocol state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeStats {
    pub node_id: NodeId,
    pub view_id: u64,
    pub member_count: usize,
    pub health: NodeHealth,
    pub coordinator: CoordinatorStats,
    pub dissemination: DisseminatorStats,
}

/// A membership agreement participant.
///
/// Create it with a transport, call [`start`](Self::start), then feed it
/// membership signals via the `report_*` methods and peer messages via
/// [`inbound_sender`](Self::inbound_sender).
pub struct ClusterNode {
    config: NodeConfig,
    store: Arc<ViewStore>,
    health: Arc<RwLock<NodeHealth>>,
    coordinator_stats: Arc<RwLock<CoordinatorStats>>,
    disseminator_stats: Arc<RwLock<DisseminatorStats>>,
    events_tx: mpsc::Sender<NodeEvent>,
    inbound_tx: mpsc::Sender<Envelope>,
    rejections_rx: Option<mpsc::UnboundedReceiver<ChangeRejection>>,
    worker: Option<Worker>,
    worker_handle: Option<JoinHandle<()>>,
    running: Arc<AtomicBool>,
}

impl ClusterNode {
    /// Build a node over the given transport. When a persist path is
    /// configured, the last committed view is loaded from it; an explicit
    /// `initial_view` in the config overrides the journal.
    pub fn new(config: NodeConfig, transport: Arc<dyn Transport>) -> ConveneResult<Self> {
        let journal = config.persist_path.clone().map(ViewJournal::new);
        let seed = match (&config.initial_view, &journal) {
            (Some(view), _) => Some(view.clone()),
            (None, Some(journal)) => journal.load()?,
            (None, None) => None,
        };
        let store = Arc::new(match seed {
            Some(view) => ViewStore::with_initial(view, config.store.clone()),
            None => ViewStore::new(config.store.clone()),
        });

        let (events_tx, events_rx) = mpsc::channel(config.event_queue_capacity);
        let (inbound_tx, inbound_rx) = mpsc::channel(config.event_queue_capacity);
        let (rejections_tx, rejections_rx) = mpsc::unbounded_channel();

        let health = Arc::new(RwLock::new(NodeHealth::Healthy));
        let coordinator = AgreementCoordinator::new(
            config.node_id,
            config.coordinator.clone(),
            store.clone(),
        );
        let disseminator = ViewDisseminator::new(config.disseminator.clone(), transport);
        let coordinator_stats = coordinator.stats_handle();
        let disseminator_stats = disseminator.stats_handle();

        let worker = Worker {
            local: config.node_id,
            store: store.clone(),
            detector: ChangeDetector::new(config.detector.clone()),
            proposer: ViewProposer::new(config.node_id, config.proposer.clone()),
            coordinator,
            disseminator,
            journal,
            health: health.clone(),
            rejections_tx,
            events_rx,
            inbound_rx,
            tick_interval: config.tick_interval,
        };

        Ok(Self {
            config,
            store,
            health,
            coordinator_stats,
            disseminator_stats,
            events_tx,
            inbound_tx,
            rejections_rx: Some(rejections_rx),
            worker: Some(worker),
            worker_handle: None,
            running: Arc::new(AtomicBool::new(false)),
        })
    }

    /// This node's identifier
    pub fn node_id(&self) -> NodeId {
        self.config.node_id
    }

    /// The latest committed view
    pub fn current_view(&self) -> Arc<ClusterView> {
        self.store.current()
    }

    /// The underlying view store, for history queries
    pub fn store(&self) -> &Arc<ViewStore> {
        &self.store
    }

    /// Register a callback invoked with each committed view in order
    pub fn subscribe<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&ClusterView) + Send + Sync + 'static,
    {
        self.store.subscribe(callback)
    }

    /// Remove a subscription
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.store.unsubscribe(id)
    }

    /// Current health classification
    pub fn health(&self) -> NodeHealth {
        *self.health.read()
    }

    /// Snapshot of the node's protocol counters
    pub fn stats(&self) -> NodeStats {
        let current = self.store.current();
        NodeStats {
            node_id: self.config.node_id,
            view_id: current.view_id(),
            member_count: current.len(),
            health: self.health(),
            coordinator: self.coordinator_stats.read().clone(),
            dissemination: self.disseminator_stats.read().clone(),
        }
    }

    /// Sender for inbound peer messages; hand this to the transport's
    /// receive side
    pub fn inbound_sender(&self) -> mpsc::Sender<Envelope> {
        self.inbound_tx.clone()
    }

    /// Receiver for membership changes that exhausted their proposal
    /// attempts. Can be taken once.
    pub fn take_rejections(&mut self) -> Option<mpsc::UnboundedReceiver<ChangeRejection>> {
        self.rejections_rx.take()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Spawn the worker task
    pub async fn start(&mut self) -> ConveneResult<()> {
        let worker = self.worker.take().ok_or(ConveneError::AlreadyStarted)?;
        info!(node_id = %self.config.node_id, view_id = self.store.current().view_id(), "starting cluster node");
        self.running.store(true, Ordering::Release);
        let running = self.running.clone();
        self.worker_handle = Some(tokio::spawn(async move {
            worker.run().await;
            running.store(false, Ordering::Release);
        }));
        Ok(())
    }

    /// Stop the worker task and wait for it to drain
    pub async fn stop(&mut self) -> ConveneResult<()> {
        if self.worker_handle.is_none() {
            return Err(ConveneError::NotRunning);
        }
        let _ = self.events_tx.send(NodeEvent::Shutdown).await;
        if let Some(handle) = self.worker_handle.take() {
            let _ = handle.await;
        }
        self.running.store(false, Ordering::Release);
        info!(node_id = %self.config.node_id, "cluster node stopped");
        Ok(())
    }

    /// Signal that a node joined the cluster
    pub async fn report_joined(&self, address: NodeId) -> ConveneResult<()> {
        self.report(ChangeKind::Joined, address).await
    }

    /// Signal that a node left gracefully
    pub async fn report_left(&self, address: NodeId) -> ConveneResult<()> {
        self.report(ChangeKind::Left, address).await
    }

    /// Signal that the failure detector suspects a node
    pub async fn report_suspected(&self, address: NodeId) -> ConveneResult<()> {
        self.report(ChangeKind::Suspected, address).await
    }

    /// Signal that a previously suspected node recovered
    pub async fn report_recovered(&self, address: NodeId) -> ConveneResult<()> {
        self.report(ChangeKind::Joined, address).await
    }

    async fn report(&self, kind: ChangeKind, address: NodeId) -> ConveneResult<()> {
        self.events_tx
            .send(NodeEvent::Change(ChangeEvent { kind, address }))
            .await
            .map_err(|_| ConveneError::NotRunning)
    }
}

impl std::fmt::Debug for ClusterNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterNode")
            .field("node_id", &self.config.node_id)
            .field("view_id", &self.store.current().view_id())
            .field("running", &self.is_running())
            .finish()
    }
}

/// Owns all mutable protocol state; runs on a single task
struct Worker {
    local: NodeId,
    store: Arc<ViewStore>,
    detector: ChangeDetector,
    proposer: ViewProposer,
    coordinator: AgreementCoordinator,
    disseminator: ViewDisseminator,
    journal: Option<ViewJournal>,
    health: Arc<RwLock<NodeHealth>>,
    rejections_tx: mpsc::UnboundedSender<ChangeRejection>,
    events_rx: mpsc::Receiver<NodeEvent>,
    inbound_rx: mpsc::Receiver<Envelope>,
    tick_interval: std::time::Duration,
}

impl Worker {
    async fn run(mut self) {
        let mut ticker = tokio::time::interval(self.tick_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                event = self.events_rx.recv() => match event {
                    Some(NodeEvent::Change(change)) => self.on_change(change),
                    Some(NodeEvent::Shutdown) | None => break,
                },
                envelope = self.inbound_rx.recv() => match envelope {
                    Some(envelope) => self.on_envelope(envelope),
                    None => break,
                },
                _ = ticker.tick() => self.on_tick(),
            }
        }
        debug!(node_id = %self.local, "worker loop exited");
    }

    fn on_change(&mut self, change: ChangeEvent) {
        let now = Instant::now();
        if let Some(event) = self.detector.observe(change.kind, change.address, now) {
            debug!(node_id = %self.local, ?event, "membership change accepted");
            self.proposer.enqueue(event);
        }
        self.try_propose(now);
    }

    fn on_envelope(&mut self, envelope: Envelope) {
        let now = Instant::now();
        if let Some(epoch) = message_epoch(&envelope.message) {
            self.proposer.note_epoch(epoch);
        }
        let out = self
            .coordinator
            .handle_message(envelope.from, envelope.message, now);
        self.apply(out, now);
        self.try_propose(now);
    }

    fn on_tick(&mut self) {
        let now = Instant::now();
        let out = self.coordinator.handle_tick(now);
        self.apply(out, now);
        self.try_propose(now);
    }

    fn try_propose(&mut self, now: Instant) {
        if !self.coordinator.can_start_round() {
            return;
        }
        let current = self.store.current();
        if let Some(proposal) = self.proposer.next_proposal(&current, now) {
            let out = self.coordinator.start_round(proposal, now);
            self.apply(out, now);
        }
    }

    fn apply(&mut self, out: StepOutput, now: Instant) {
        if let Some(view) = &out.committed {
            self.proposer.on_view_committed(view);
            if let Some(journal) = &self.journal {
                if let Err(err) = journal.save(view) {
                    warn!(node_id = %self.local, %err, "failed to persist committed view");
                }
            }
        }
        if let Some(outcome) = out.round_finished {
            let committed = outcome == RoundOutcome::Committed;
            if let Some(rejection) = self.proposer.round_finished(committed, now) {
                warn!(
                    node_id = %self.local,
                    error = %rejection.error,
                    event = ?rejection.event,
                    "membership change dropped after repeated proposal failures"
                );
                let _ = self.rejections_tx.send(rejection);
            }
        }
        if let Some(fatal) = &out.fatal {
            error!(node_id = %self.local, %fatal, "halting agreement participation");
        }
        self.disseminator.dispatch(out.outbound);
        self.update_health();
    }

    fn update_health(&self) {
        let health = if self.coordinator.is_poisoned() {
            NodeHealth::Poisoned
        } else if self.coordinator.is_desynchronized() {
            NodeHealth::Desynchronized
        } else if self.coordinator.consecutive_timeouts() > 0 || self.proposer.attempts() > 0 {
            NodeHealth::Degraded
        } else {
            NodeHealth::Healthy
        };
        let mut slot = self.health.write();
        if *slot != health {
            info!(node_id = %self.local, ?health, "node health changed");
        }
        *slot = health;
    }
}

fn message_epoch(message: &ProtocolMessage) -> Option<u64> {
    match message {
        ProtocolMessage::Propose { epoch, .. }
        | ProtocolMessage::Ack { epoch, .. }
        | ProtocolMessage::Commit { epoch, .. } => Some(*epoch),
        ProtocolMessage::ResyncRequest { .. } | ProtocolMessage::ResyncResponse { .. } => None,
    }
}
