//! Public handle over one process's cluster components.
//!
//! [`ClusterNode::start`] idempotently creates the persistent tree layout,
//! seeds the FSM from a blocking read of the `/segments` tree, spawns the
//! three component tasks plus the partition-event bridge, and (when given a
//! [`ClientFactory`]) the session supervisor. The handle exposes the FSM's
//! message surface as plain async methods with generated correlation tags.
//!
//! Queries are fire-and-forget underneath: a reply may never arrive (for
//! example while no leader is known), so callers wanting a bound should wrap
//! the await in their own timeout.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use backon::Retryable;
use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::info;

use super::fsm::ClusterFsm;
use super::membership::MembershipMonitor;
use super::messages::{
    ClusterMessage, ClusterReply, MembershipMessage, PartitionEvent, PartitionMessage, Recipient,
};
use super::partitions::PartitionManager;
use super::rebalance::DataCenterAware;
use super::transport::PeerTransport;
use super::{Address, DataCenterResolver, MemberSet, PartitionKey, PartitionMap};
use crate::config::CoordinatorConfig;
use crate::error::{Error, Result};
use crate::retry;
use crate::zk::{
    self, ClientFactory, ClientSink, Coordination, CoordinationError, CreateMode,
    SessionSupervisor,
};

/// A node's component mailboxes, as registered with a peer transport.
#[derive(Clone)]
pub struct NodeMailboxes {
    pub cluster: mpsc::UnboundedSender<ClusterMessage>,
    pub partitions: mpsc::UnboundedSender<PartitionMessage>,
}

/// A partition lookup/creation result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionInfo {
    pub key: PartitionKey,
    /// Stable primary-first member order; index 0 is the primary.
    pub members: Vec<Address>,
    pub path: String,
    pub tag: u64,
}

/// Handle to a running cluster member.
pub struct ClusterNode {
    addr: Address,
    cluster_tx: mpsc::UnboundedSender<ClusterMessage>,
    partitions_tx: mpsc::UnboundedSender<PartitionMessage>,
    membership_tx: mpsc::UnboundedSender<MembershipMessage>,
    next_tag: AtomicU64,
    component_tasks: Vec<JoinHandle<()>>,
    aux_tasks: Vec<JoinHandle<()>>,
}

impl ClusterNode {
    /// Bootstrap the tree layout and start this process's components.
    ///
    /// The caller remains responsible for registering the node's
    /// [`NodeMailboxes`] with its transport. Passing no `factory` disables
    /// client reconstruction on session loss.
    pub async fn start(
        config: CoordinatorConfig,
        self_addr: Address,
        client: Arc<dyn Coordination>,
        transport: Arc<dyn PeerTransport>,
        factory: Option<Arc<dyn ClientFactory>>,
        resolver: DataCenterResolver,
    ) -> Result<Self> {
        config.validate()?;

        bootstrap_layout(&client, config.segments).await?;
        let initial = load_partition_tree(&client).await?;
        info!(
            member = %self_addr,
            partitions = initial.len(),
            segments = config.segments,
            "starting cluster node"
        );

        let (cluster_tx, cluster_rx) = mpsc::unbounded_channel();
        let (partitions_tx, partitions_rx) = mpsc::unbounded_channel();
        let (membership_tx, membership_rx) = mpsc::unbounded_channel();

        // Bridge partition events into the FSM's own mailbox.
        let (self_subscription, mut events_rx) = Recipient::<PartitionEvent>::channel();
        let bridge_tx = cluster_tx.clone();
        let bridge = tokio::spawn(async move {
            while let Some(event) = events_rx.recv().await {
                if bridge_tx.send(ClusterMessage::PartitionEvent(event)).is_err() {
                    break;
                }
            }
        });

        let policy = Arc::new(DataCenterAware::new(config.spare_leader, resolver));
        let fsm = ClusterFsm::new(
            self_addr.clone(),
            Arc::clone(&client),
            config.segments,
            initial,
            partitions_tx.clone(),
            Arc::clone(&transport),
            policy,
            self_subscription,
        );
        let manager = PartitionManager::new(
            self_addr.clone(),
            Arc::clone(&client),
            config.segments,
            Arc::clone(&transport),
            partitions_tx.clone(),
        );
        let monitor = MembershipMonitor::new(
            self_addr.clone(),
            Arc::clone(&client),
            cluster_tx.clone(),
            membership_tx.clone(),
            config.latch_wait,
            config.latch_retry_delay,
        );

        let component_tasks = vec![
            tokio::spawn(fsm.run(cluster_rx)),
            tokio::spawn(manager.run(partitions_rx)),
            tokio::spawn(monitor.run(membership_rx)),
        ];

        let mut aux_tasks = vec![bridge];
        if let Some(factory) = factory {
            let (session_tx, session_rx) = mpsc::unbounded_channel();
            client.subscribe_session(session_tx).await;
            let sinks: Vec<ClientSink> = vec![
                sink(membership_tx.clone(), MembershipMessage::ClientUpdated),
                sink(partitions_tx.clone(), PartitionMessage::ClientUpdated),
                sink(cluster_tx.clone(), ClusterMessage::ClientUpdated),
            ];
            let supervisor = SessionSupervisor::new(factory, sinks, session_rx);
            aux_tasks.push(tokio::spawn(supervisor.run()));
        }

        Ok(Self {
            addr: self_addr,
            cluster_tx,
            partitions_tx,
            membership_tx,
            next_tag: AtomicU64::new(1),
            component_tasks,
            aux_tasks,
        })
    }

    pub fn address(&self) -> &Address {
        &self.addr
    }

    /// Mailboxes for transport registration.
    pub fn mailboxes(&self) -> NodeMailboxes {
        NodeMailboxes {
            cluster: self.cluster_tx.clone(),
            partitions: self.partitions_tx.clone(),
        }
    }

    /// Current live members, as this node observes them.
    pub async fn query_membership(&self) -> Result<MemberSet> {
        let (reply, mut rx) = Recipient::channel();
        self.send_cluster(ClusterMessage::QueryMembership { reply })?;
        match rx.recv().await {
            Some(ClusterReply::Members(members)) => Ok(members),
            _ => Err(Error::Stopped),
        }
    }

    /// Current leader, if this node knows one.
    pub async fn query_leadership(&self) -> Result<Option<Address>> {
        let (reply, mut rx) = Recipient::channel();
        self.send_cluster(ClusterMessage::QueryLeadership { reply })?;
        match rx.recv().await {
            Some(ClusterReply::Leader(leader)) => Ok(leader),
            _ => Err(Error::Stopped),
        }
    }

    /// Look up a partition; with `size`, create it if absent with that
    /// required replication factor and `props` as its opaque properties.
    pub async fn query_partition(
        &self,
        key: PartitionKey,
        size: Option<u32>,
        props: Bytes,
    ) -> Result<PartitionInfo> {
        let tag = self.next_tag.fetch_add(1, Ordering::Relaxed);
        let (reply, mut rx) = Recipient::channel();
        self.send_cluster(ClusterMessage::QueryPartition { key, tag, size, props, reply })?;
        match rx.recv().await {
            Some(ClusterReply::Partition { key, members, path, tag }) => {
                Ok(PartitionInfo { key, members, path, tag })
            }
            _ => Err(Error::Stopped),
        }
    }

    /// All partition keys whose assignment contains `member`.
    pub async fn list_partitions(&self, member: Address) -> Result<Vec<PartitionKey>> {
        let (reply, mut rx) = Recipient::channel();
        self.send_cluster(ClusterMessage::ListPartitions { member, reply })?;
        match rx.recv().await {
            Some(ClusterReply::Partitions(keys)) => Ok(keys),
            _ => Err(Error::Stopped),
        }
    }

    /// Change a partition's required replication factor. Fire-and-forget;
    /// convergence is observable through partition events.
    pub fn resize_partition(&self, key: PartitionKey, size: u32) -> Result<()> {
        self.send_cluster(ClusterMessage::ResizePartition { key, size })
    }

    /// Delete a partition. Fire-and-forget.
    pub fn remove_partition(&self, key: PartitionKey) -> Result<()> {
        self.send_cluster(ClusterMessage::RemovePartition { key })
    }

    /// Subscribe to partition diffs and removals.
    pub fn monitor_partitions(&self, subscriber: Recipient<PartitionEvent>) -> Result<()> {
        self.send_cluster(ClusterMessage::MonitorPartition { subscriber })
    }

    /// Unsubscribe from partition diffs and removals.
    pub fn stop_monitor_partitions(&self, subscriber: Recipient<PartitionEvent>) -> Result<()> {
        self.send_cluster(ClusterMessage::StopMonitorPartition { subscriber })
    }

    /// Subscribe to replacement-client broadcasts.
    pub fn monitor_client(&self, observer: Recipient<Arc<dyn Coordination>>) -> Result<()> {
        self.send_cluster(ClusterMessage::MonitorClient { observer })
    }

    /// Stop the component tasks and the auxiliary plumbing.
    pub async fn shutdown(mut self) {
        let _ = self.cluster_tx.send(ClusterMessage::Shutdown);
        let _ = self.partitions_tx.send(PartitionMessage::Shutdown);
        let _ = self.membership_tx.send(MembershipMessage::Shutdown);
        for task in self.component_tasks.drain(..) {
            let _ = tokio::time::timeout(Duration::from_secs(1), task).await;
        }
        for task in self.aux_tasks.drain(..) {
            task.abort();
        }
        info!(member = %self.addr, "cluster node stopped");
    }

    fn send_cluster(&self, msg: ClusterMessage) -> Result<()> {
        self.cluster_tx.send(msg).map_err(|_| Error::Stopped)
    }
}

/// Wrap a component mailbox as a session-supervisor sink.
fn sink<M: Send + 'static>(
    tx: mpsc::UnboundedSender<M>,
    wrap: fn(Arc<dyn Coordination>) -> M,
) -> ClientSink {
    Box::new(move |client| {
        let _ = tx.send(wrap(client));
    })
}

/// Idempotently create the persistent layout.
async fn bootstrap_layout(client: &Arc<dyn Coordination>, segments: u32) -> Result<()> {
    let attempt = || {
        let client = Arc::clone(client);
        async move {
            client.guarantee(zk::MEMBERS_PATH, Bytes::new(), CreateMode::Persistent).await?;
            client
                .guarantee(zk::LEADERSHIP_PATH, Bytes::new(), CreateMode::Persistent)
                .await?;
            client.guarantee(zk::SEGMENTS_PATH, Bytes::new(), CreateMode::Persistent).await?;
            for i in 0..segments {
                let path = zk::segment_path(&format!("segment-{i}"));
                client.guarantee(&path, Bytes::new(), CreateMode::Persistent).await?;
            }
            Ok::<_, CoordinationError>(())
        }
    };
    attempt.retry(retry::bootstrap_policy()).await?;
    Ok(())
}

/// Blocking read of the `/segments` tree: every known partition key, all
/// with empty assignee sets until the partition manager fills them in.
async fn load_partition_tree(client: &Arc<dyn Coordination>) -> Result<PartitionMap> {
    let mut initial = PartitionMap::new();
    for segment in client.children(zk::SEGMENTS_PATH, None).await? {
        let names = match client.children(&zk::segment_path(&segment), None).await {
            Ok(names) => names,
            Err(CoordinationError::NoNode(_)) => continue,
            Err(error) => return Err(error.into()),
        };
        for name in names {
            if let Ok(raw) = zk::path_to_key(&name) {
                initial.insert(PartitionKey::from(raw), MemberSet::new());
            }
        }
    }
    Ok(initial)
}
