//! Shared helpers for cluster integration tests.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use menagerie::cluster::{
    single_data_center, Address, ClusterNode, InProcessTransport, PeerTransport,
};
use menagerie::zk::mock::{MockClient, MockClientFactory, MockCoordination};
use menagerie::zk::ClientFactory;
use menagerie::CoordinatorConfig;
use tokio::time::sleep;

pub const SEGMENTS: u32 = 8;

pub fn test_config() -> CoordinatorConfig {
    CoordinatorConfig {
        segments: SEGMENTS,
        latch_wait: Duration::from_millis(50),
        latch_retry_delay: Duration::from_millis(20),
        ..CoordinatorConfig::default()
    }
}

pub struct TestCluster {
    pub service: Arc<MockCoordination>,
    pub transport: Arc<InProcessTransport>,
    pub nodes: Vec<ClusterNode>,
    /// Session handles, index-aligned with `nodes`, for expiry injection.
    pub sessions: Vec<Arc<MockClient>>,
}

impl TestCluster {
    pub fn addr(i: usize) -> Address {
        Address::new(format!("10.0.0.{}", i + 1), 10_000)
    }

    /// Index of the node the cluster currently agrees is the leader.
    pub async fn leader_index(&self) -> Option<usize> {
        let leader = self.nodes.first()?.query_leadership().await.ok()??;
        self.nodes.iter().position(|n| *n.address() == leader)
    }
}

/// Start `n` nodes against one shared in-memory coordination service.
pub async fn start_cluster(n: usize) -> TestCluster {
    let service = MockCoordination::new();
    let transport = Arc::new(InProcessTransport::new());
    let mut nodes = Vec::with_capacity(n);
    let mut sessions = Vec::with_capacity(n);

    for i in 0..n {
        let addr = TestCluster::addr(i);
        let client = service.client();
        sessions.push(Arc::clone(&client));
        let factory: Arc<dyn ClientFactory> =
            Arc::new(MockClientFactory::new(Arc::clone(&service)));
        let node = ClusterNode::start(
            test_config(),
            addr.clone(),
            client,
            Arc::clone(&transport) as Arc<dyn PeerTransport>,
            Some(factory),
            single_data_center(),
        )
        .await
        .expect("node starts");
        transport.register(addr, node.mailboxes());
        nodes.push(node);
    }

    TestCluster { service, transport, nodes, sessions }
}

/// Poll `check` until it returns true, panicking after five seconds.
pub async fn eventually<F, Fut>(what: &str, check: F)
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if check().await {
            return;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("timed out waiting for: {what}");
        }
        sleep(Duration::from_millis(25)).await;
    }
}

/// Wait until every node agrees on one leader; returns its index.
pub async fn await_single_leader(cluster: &TestCluster) -> usize {
    eventually("a single agreed leader", || async {
        let mut agreed: Option<Address> = None;
        for node in &cluster.nodes {
            match node.query_leadership().await {
                Ok(Some(leader)) => match &agreed {
                    None => agreed = Some(leader),
                    Some(previous) if *previous == leader => {}
                    Some(_) => return false,
                },
                _ => return false,
            }
        }
        agreed.is_some()
    })
    .await;
    cluster.leader_index().await.expect("leader is a cluster member")
}
