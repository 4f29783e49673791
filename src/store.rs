//! View store: the single owner of the committed view
//!
//! Holds the current committed snapshot behind an atomically swapped
//! `Arc`, a bounded history of commit records for resync catch-up, and the
//! local subscriber registry. Commits are serialized, so subscribers see
//! views in strictly increasing order with no gaps.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, error, info};

use crate::error::CommitError;
use crate::types::{NodeId, StoreConfig};
use crate::view::{ClusterView, CommitRecord};

/// Handle returned by [`ViewStore::subscribe`]
pub type SubscriptionId = u64;

type Subscriber = Box<dyn Fn(&ClusterView) + Send + Sync>;

/// Owner of the current committed view and its bounded history.
///
/// `current()` never blocks on a commit in progress: readers clone an
/// `Arc` to an immutable snapshot that is swapped as a whole. Subscriber
/// callbacks run on the committing thread, in commit order; they must not
/// call `subscribe`/`unsubscribe` reentrantly.
pub struct ViewStore {
    /// Serializes commits; never held while `current` readers run
    commit_lock: Mutex<()>,
    current: RwLock<Arc<ClusterView>>,
    history: RwLock<VecDeque<CommitRecord>>,
    subscribers: RwLock<Vec<(SubscriptionId, Subscriber)>>,
    next_subscription: AtomicU64,
    halted: AtomicBool,
    config: StoreConfig,
}

impl ViewStore {
    /// Create a store holding the empty sentinel view
    pub fn new(config: StoreConfig) -> Self {
        Self {
            commit_lock: Mutex::new(()),
            current: RwLock::new(Arc::new(ClusterView::EMPTY)),
            history: RwLock::new(VecDeque::new()),
            subscribers: RwLock::new(Vec::new()),
            next_subscription: AtomicU64::new(1),
            halted: AtomicBool::new(false),
            config,
        }
    }

    /// Create a store seeded with an already-committed view, e.g. loaded
    /// from persisted state at startup. Seeding is not a commit: no
    /// subscribers are notified.
    pub fn with_initial(initial: ClusterView, config: StoreConfig) -> Self {
        let store = Self::new(config);
        if initial.view_id() > 0 {
            *store.current.write() = Arc::new(initial.clone());
            store
                .history
                .write()
                .push_back(CommitRecord::new(initial, Vec::new()));
        }
        store
    }

    /// The latest committed view. Never blocks; defaults to the empty
    /// sentinel before any commit.
    pub fn current(&self) -> Arc<ClusterView> {
        self.current.read().clone()
    }

    /// Apply a committed snapshot.
    ///
    /// Accepts only the direct successor of the current view; returns
    /// `StaleCommit` for anything at or behind it (duplicates included)
    /// and `ViewGap` when the snapshot skips ahead. A snapshot that
    /// disagrees with an already-committed view of the same id is a fatal
    /// consistency violation: the store halts and refuses further commits.
    pub fn commit(
        &self,
        snapshot: ClusterView,
        acked_by: Vec<NodeId>,
    ) -> Result<Arc<ClusterView>, CommitError> {
        let _guard = self.commit_lock.lock();

        if self.halted.load(Ordering::Acquire) {
            return Err(CommitError::Halted);
        }

        let current = self.current();
        let proposed = snapshot.view_id();

        if proposed <= current.view_id() {
            if self.conflicts_with_history(&snapshot) {
                error!(
                    view_id = proposed,
                    "conflicting membership for an already-committed view; halting store"
                );
                self.halted.store(true, Ordering::Release);
                return Err(CommitError::ConsistencyViolation { view_id: proposed });
            }
            debug!(view_id = proposed, current = current.view_id(), "stale commit ignored");
            return Err(CommitError::StaleCommit {
                proposed,
                current: current.view_id(),
            });
        }

        if proposed > current.view_id() + 1 {
            return Err(CommitError::ViewGap {
                proposed,
                current: current.view_id(),
            });
        }

        let committed = Arc::new(snapshot);
        *self.current.write() = committed.clone();

        {
            let mut history = self.history.write();
            history.push_back(CommitRecord::new((*committed).clone(), acked_by));
            while history.len() > self.config.history_retention {
                history.pop_front();
            }
        }

        info!(view_id = proposed, members = committed.len(), "committed view");

        let subscribers = self.subscribers.read();
        for (_, subscriber) in subscribers.iter() {
            subscriber(&committed);
        }

        Ok(committed)
    }

    /// Register a callback invoked with each newly committed view, in
    /// commit order
    pub fn subscribe<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&ClusterView) + Send + Sync + 'static,
    {
        let id = self.next_subscription.fetch_add(1, Ordering::Relaxed);
        self.subscribers.write().push((id, Box::new(callback)));
        id
    }

    /// Remove a subscriber; returns whether the handle was known
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscribers = self.subscribers.write();
        let before = subscribers.len();
        subscribers.retain(|(sid, _)| *sid != id);
        subscribers.len() != before
    }

    /// Contiguous committed views from `from_view_id` through the current
    /// view, for answering a resync request. Empty when the range is no
    /// longer retained (or nothing is missing).
    pub fn history_from(&self, from_view_id: u64) -> Vec<ClusterView> {
        let history = self.history.read();
        let snapshots: Vec<ClusterView> = history
            .iter()
            .filter(|record| record.snapshot.view_id() >= from_view_id)
            .map(|record| record.snapshot.clone())
            .collect();

        // The range must start exactly at the requested id, otherwise the
        // requester would still be left with a gap.
        match snapshots.first() {
            Some(first) if first.view_id() == from_view_id => snapshots,
            _ => Vec::new(),
        }
    }

    /// The most recent commit record, if any view has been committed
    pub fn latest_record(&self) -> Option<CommitRecord> {
        self.history.read().back().cloned()
    }

    /// Whether the store halted after a consistency violation
    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::Acquire)
    }

    fn conflicts_with_history(&self, snapshot: &ClusterView) -> bool {
        // View id 0 is the reserved sentinel, never an agreed commit.
        if snapshot.view_id() == 0 {
            return false;
        }
        let current = self.current();
        if snapshot.view_id() == current.view_id() {
            return snapshot != current.as_ref();
        }
        self.history
            .read()
            .iter()
            .find(|record| record.snapshot.view_id() == snapshot.view_id())
            .map(|record| record.snapshot != *snapshot)
            .unwrap_or(false)
    }
}

impl std::fmt::Debug for ViewStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ViewStore")
            .field("current", &self.current())
            .field("halted", &self.is_halted())
            .finish()
    }
}
