//! Outbound message dispatch
//!
//! Commits are the only messages whose loss stalls a peer, so they get a
//! bounded number of redelivery attempts per target. Everything else is
//! fire-and-forget: a lost proposal or ack surfaces as a round timeout and
//! the proposer retries with a fresh epoch.

use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::coordinator::Outbound;
use crate::messages::ProtocolMessage;
use crate::transport::Transport;
use crate::types::{DisseminatorConfig, NodeId};

/// Delivery counters
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct DisseminatorStats {
    pub messages_sent: u64,
    pub commit_redeliveries: u64,
    pub failed_deliveries: u64,
}

/// Fans protocol messages out to peers over the node's transport
pub struct ViewDisseminator {
    config: DisseminatorConfig,
    transport: Arc<dyn Transport>,
    stats: Arc<RwLock<DisseminatorStats>>,
}

impl ViewDisseminator {
    pub fn new(config: DisseminatorConfig, transport: Arc<dyn Transport>) -> Self {
        Self {
            config,
            transport,
            stats: Arc::new(RwLock::new(DisseminatorStats::default())),
        }
    }

    /// Shared handle to the delivery counters
    pub fn stats_handle(&self) -> Arc<RwLock<DisseminatorStats>> {
        self.stats.clone()
    }

    /// Dispatch one protocol step's outbound messages. Each delivery runs
    /// on its own task so a slow peer never blocks the event loop.
    pub fn dispatch(&self, outbound: Vec<Outbound>) {
        for Outbound { to, message } in outbound {
            match message {
                ProtocolMessage::Commit { .. } => self.deliver_with_retry(to, message),
                _ => self.deliver_once(to, message),
            }
        }
    }

    fn deliver_once(&self, to: NodeId, message: ProtocolMessage) {
        let transport = self.transport.clone();
        let stats = self.stats.clone();
        tokio::spawn(async move {
            stats.write().messages_sent += 1;
            if let Err(err) = transport.send(to, message).await {
                stats.write().failed_deliveries += 1;
                debug!(%to, %err, "message delivery failed");
            }
        });
    }

    fn deliver_with_retry(&self, to: NodeId, message: ProtocolMessage) {
        let transport = self.transport.clone();
        let stats = self.stats.clone();
        let attempts = self.config.retry_attempts.max(1);
        let backoff = self.config.retry_backoff;
        tokio::spawn(async move {
            for attempt in 1..=attempts {
                stats.write().messages_sent += 1;
                match transport.send(to, message.clone()).await {
                    Ok(()) => return,
                    Err(err) => {
                        if attempt == attempts {
                            stats.write().failed_deliveries += 1;
                            warn!(
                                %to,
                                attempts,
                                %err,
                                "giving up on commit delivery; peer must resync"
                            );
                            return;
                        }
                        stats.write().commit_redeliveries += 1;
                        debug!(%to, attempt, %err, "commit delivery failed, retrying");
                        tokio::time::sleep(backoff * attempt as u32).await;
                    }
                }
            }
        });
    }
}

impl std::fmt::Debug for ViewDisseminator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ViewDisseminator")
            .field("config", &self.config)
            .finish()
    }
}
