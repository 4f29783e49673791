//! Fault tolerance tests for the membership agreement protocol
//!
//! Covers quorum loss under partition, convergence after healing,
//! concurrent competing proposers, exhausted change retries, and the
//! consistency-violation halt.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use convene::{
    ClusterNode, ClusterView, CoordinatorConfig, DetectorConfig, Envelope, InMemoryHub,
    NodeConfig, NodeHealth, NodeId, ProposalError, ProposerConfig, ProtocolMessage,
};

fn node_id(n: u128) -> NodeId {
    NodeId::from_u128(n)
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn test_config(id: NodeId, initial: Option<ClusterView>) -> NodeConfig {
    NodeConfig {
        node_id: id,
        initial_view: initial,
        tick_interval: Duration::from_millis(5),
        detector: DetectorConfig {
            debounce_window: Duration::from_millis(1),
        },
        proposer: ProposerConfig {
            max_attempts: 50,
            backoff_base: Duration::from_millis(10),
            backoff_max: Duration::from_millis(100),
            ..Default::default()
        },
        coordinator: CoordinatorConfig {
            proposal_timeout: Duration::from_millis(150),
            ..Default::default()
        },
        ..Default::default()
    }
}

async fn spawn_node(hub: &Arc<InMemoryHub>, config: NodeConfig) -> ClusterNode {
    init_tracing();
    let (tx, mut rx) = mpsc::channel(256);
    let transport = Arc::new(hub.register(config.node_id, tx));
    let mut node = ClusterNode::new(config, transport).unwrap();
    let inbound = node.inbound_sender();
    tokio::spawn(async move {
        while let Some(envelope) = rx.recv().await {
            if inbound.send(envelope).await.is_err() {
                break;
            }
        }
    });
    node.start().await.unwrap();
    node
}

async fn wait_for<F: Fn() -> bool>(what: &str, predicate: F) {
    for _ in 0..600 {
        if predicate() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("timed out waiting for {what}");
}

#[tokio::test]
async fn majority_side_commits_while_minority_stalls() {
    let hub = InMemoryHub::new();
    let a = node_id(1);
    let b = node_id(2);
    let c = node_id(3);
    let seed = ClusterView::new(1, vec![a, b, c]);

    let mut node_a = spawn_node(&hub, test_config(a, Some(seed.clone()))).await;
    let mut node_b = spawn_node(&hub, test_config(b, Some(seed.clone()))).await;
    let mut node_c = spawn_node(&hub, test_config(c, Some(seed))).await;

    hub.partition(&[c], &[a, b]);

    // The majority side removes the unreachable member: two of three base
    // members ack, so the new view commits.
    node_a.report_suspected(c).await.unwrap();
    let store_a = node_a.store().clone();
    let store_b = node_b.store().clone();
    wait_for("majority commits view 2", || {
        store_a.current().view_id() == 2 && store_b.current().view_id() == 2
    })
    .await;
    assert_eq!(node_a.current_view().members(), &[a, b]);

    // The isolated node can propose but never reach quorum; its rounds
    // time out and it reports itself degraded without committing anything.
    node_c.report_suspected(a).await.unwrap();
    wait_for("minority node degrades", || {
        node_c.health() == NodeHealth::Degraded
    })
    .await;
    assert_eq!(node_c.current_view().view_id(), 1);

    node_a.stop().await.unwrap();
    node_b.stop().await.unwrap();
    node_c.stop().await.unwrap();
}

#[tokio::test]
async fn healed_minority_converges_to_the_majority_view() {
    let hub = InMemoryHub::new();
    let a = node_id(1);
    let b = node_id(2);
    let c = node_id(3);
    let seed = ClusterView::new(1, vec![a, b, c]);

    let mut node_a = spawn_node(&hub, test_config(a, Some(seed.clone()))).await;
    let mut node_b = spawn_node(&hub, test_config(b, Some(seed.clone()))).await;
    let mut node_c = spawn_node(&hub, test_config(c, Some(seed))).await;

    hub.partition(&[c], &[a, b]);

    node_a.report_suspected(c).await.unwrap();
    let store_a = node_a.store().clone();
    wait_for("majority commits view 2", || store_a.current().view_id() == 2).await;

    // The minority keeps retrying a proposal built on the stale view.
    node_c.report_suspected(a).await.unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(node_c.current_view().view_id(), 1);

    // After healing, the stale proposal reaches a majority member which
    // answers with its latest commit, converging the laggard.
    hub.heal();
    let store_c = node_c.store().clone();
    wait_for("healed node converges", || store_c.current().view_id() == 2).await;
    assert_eq!(node_c.current_view().members(), &[a, b]);

    node_a.stop().await.unwrap();
    node_b.stop().await.unwrap();
    node_c.stop().await.unwrap();
}

#[tokio::test]
async fn concurrent_proposals_settle_into_one_view_sequence() {
    let hub = InMemoryHub::new();
    let a = node_id(1);
    let b = node_id(2);
    let c = node_id(3);
    let d = node_id(4);
    let seed = ClusterView::new(1, vec![a, b, c]);

    let mut node_a = spawn_node(&hub, test_config(a, Some(seed.clone()))).await;
    let mut node_b = spawn_node(&hub, test_config(b, Some(seed.clone()))).await;
    let mut node_c = spawn_node(&hub, test_config(c, Some(seed))).await;
    let mut node_d = spawn_node(&hub, test_config(d, None)).await;

    // Two members race: one removes c, the other adds d. Exactly one
    // proposal wins each round, so both changes land as separate views.
    node_a.report_suspected(c).await.unwrap();
    node_b.report_joined(d).await.unwrap();

    let store_a = node_a.store().clone();
    let store_b = node_b.store().clone();
    let store_d = node_d.store().clone();
    wait_for("both changes applied", || {
        [&store_a, &store_b, &store_d]
            .iter()
            .all(|s| s.current().view_id() == 3)
    })
    .await;

    // Whichever change committed first, the end state is the same.
    assert_eq!(node_a.current_view().members(), &[a, b, d]);
    assert_eq!(node_b.current_view().members(), &[a, b, d]);
    assert_eq!(node_d.current_view().members(), &[a, b, d]);

    node_a.stop().await.unwrap();
    node_b.stop().await.unwrap();
    node_c.stop().await.unwrap();
    node_d.stop().await.unwrap();
}

#[tokio::test]
async fn change_is_rejected_after_exhausted_attempts() {
    let hub = InMemoryHub::new();
    let a = node_id(1);
    let b = node_id(2);
    // b is in the seeded view but never comes up, so no quorum exists.
    let seed = ClusterView::new(1, vec![a, b]);

    let mut config = test_config(a, Some(seed));
    config.proposer.max_attempts = 3;
    let mut node = spawn_node(&hub, config).await;
    let mut rejections = node.take_rejections().expect("rejections receiver");

    node.report_joined(node_id(3)).await.unwrap();

    let rejection = tokio::time::timeout(Duration::from_secs(10), rejections.recv())
        .await
        .expect("rejection within timeout")
        .expect("rejection");
    assert_eq!(
        rejection.error,
        ProposalError::ChangeNotApplied { attempts: 3 }
    );
    assert_eq!(rejection.event.address, node_id(3));
    assert_eq!(node.current_view().view_id(), 1);

    node.stop().await.unwrap();
}

#[tokio::test]
async fn conflicting_commit_for_a_known_view_poisons_the_node() {
    let hub = InMemoryHub::new();
    let a = node_id(1);
    let b = node_id(2);
    let c = node_id(3);
    let seed = ClusterView::new(5, vec![a, b]);

    let mut node = spawn_node(&hub, test_config(b, Some(seed))).await;

    // A commit claiming different members for an already-committed view id
    // can only mean divergent histories. The node must halt rather than
    // pick a side.
    node.inbound_sender()
        .send(Envelope {
            from: a,
            message: ProtocolMessage::Commit {
                view_id: 5,
                members: vec![a, c],
                proposer_id: a,
                epoch: 9,
            },
        })
        .await
        .unwrap();

    wait_for("node poisons itself", || node.health() == NodeHealth::Poisoned).await;
    assert!(node.store().is_halted());
    assert_eq!(node.current_view().members(), &[a, b]);

    // Poisoned nodes ignore further protocol traffic.
    node.inbound_sender()
        .send(Envelope {
            from: a,
            message: ProtocolMessage::Commit {
                view_id: 6,
                members: vec![a, b, c],
                proposer_id: a,
                epoch: 10,
            },
        })
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(node.current_view().view_id(), 5);

    node.stop().await.unwrap();
}
