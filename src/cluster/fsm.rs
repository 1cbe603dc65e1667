//! Cluster FSM: the state machine coordinating membership, leadership and
//! partition assignment.
//!
//! # States
//!
//! ```text
//! Uninitialized ──LeaderElected(other)──► Follower ◄──LeaderElected(other)──┐
//!       │                                    │                              │
//!       └───────LeaderElected(self)──────►  Leader ──────────────────────────┘
//!                                        (rebalances)
//! ```
//!
//! Until a leader is known the FSM stashes everything except membership and
//! leadership events plus the mandatory queries; the stash replays in
//! arrival order on the first transition out of `Uninitialized`. As a
//! follower it tracks the external snapshot by subscribing to the partition
//! manager's diffs and forwards leader-only operations; as the leader it
//! unsubscribes (the plan is its own source of truth), recomputes the
//! assignment on every relevant change and broadcasts it.
//!
//! The leader never waits for acknowledgement of a plan: convergence is
//! re-established when each member's onboard/dropoff trips the partition
//! watches and the diffs flow back around.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::messages::{
    ClusterMessage, ClusterReply, PartitionEvent, PartitionMessage, Recipient,
};
use super::partitions::order_by_age;
use super::rebalance::{RebalanceContext, RebalancePolicy};
use super::transport::PeerTransport;
use super::{Address, MemberSet, PartitionKey, PartitionMap};
use crate::zk::{self, Coordination, CreateMode};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Uninitialized,
    Follower,
    Leader,
}

pub(crate) struct ClusterFsm {
    self_addr: Address,
    client: Arc<dyn Coordination>,
    segments: u32,
    role: Role,
    leader: Option<Address>,
    members: MemberSet,
    partitions: PartitionMap,
    stash: VecDeque<ClusterMessage>,
    /// Replayed ahead of fresh mailbox messages after leaving
    /// `Uninitialized`.
    pending: VecDeque<ClusterMessage>,
    observers: Vec<Recipient<Arc<dyn Coordination>>>,
    partitions_tx: mpsc::UnboundedSender<PartitionMessage>,
    transport: Arc<dyn PeerTransport>,
    policy: Arc<dyn RebalancePolicy>,
    /// This FSM's own subscription handle for partition diffs.
    self_subscription: Recipient<PartitionEvent>,
}

impl ClusterFsm {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        self_addr: Address,
        client: Arc<dyn Coordination>,
        segments: u32,
        initial_partitions: PartitionMap,
        partitions_tx: mpsc::UnboundedSender<PartitionMessage>,
        transport: Arc<dyn PeerTransport>,
        policy: Arc<dyn RebalancePolicy>,
        self_subscription: Recipient<PartitionEvent>,
    ) -> Self {
        Self {
            self_addr,
            client,
            segments,
            role: Role::Uninitialized,
            leader: None,
            members: MemberSet::new(),
            partitions: initial_partitions,
            stash: VecDeque::new(),
            pending: VecDeque::new(),
            observers: Vec::new(),
            partitions_tx,
            transport,
            policy,
            self_subscription,
        }
    }

    pub(crate) async fn run(mut self, mut rx: mpsc::UnboundedReceiver<ClusterMessage>) {
        loop {
            let msg = match self.pending.pop_front() {
                Some(msg) => msg,
                None => match rx.recv().await {
                    Some(msg) => msg,
                    None => break,
                },
            };
            if !self.handle(msg).await {
                break;
            }
        }
    }

    /// Returns false on shutdown.
    async fn handle(&mut self, msg: ClusterMessage) -> bool {
        match msg {
            ClusterMessage::Shutdown => return false,

            // Mandatory handling, identical in every state.
            ClusterMessage::ClientUpdated(client) => {
                self.client = Arc::clone(&client);
                self.observers.retain(|observer| observer.send(Arc::clone(&client)));
            }
            ClusterMessage::MonitorClient { observer } => self.observers.push(observer),
            ClusterMessage::QueryMembership { reply } => {
                reply.send(ClusterReply::Members(self.members.clone()));
            }
            ClusterMessage::MonitorPartition { subscriber } => {
                let _ = self.partitions_tx.send(PartitionMessage::Monitor { subscriber });
            }
            ClusterMessage::StopMonitorPartition { subscriber } => {
                let _ = self.partitions_tx.send(PartitionMessage::StopMonitor { subscriber });
            }
            ClusterMessage::ListPartitions { member, reply } => {
                let keys: Vec<PartitionKey> = self
                    .partitions
                    .iter()
                    .filter(|(_, assigned)| assigned.contains(&member))
                    .map(|(key, _)| key.clone())
                    .collect();
                reply.send(ClusterReply::Partitions(keys));
            }

            other => match self.role {
                Role::Uninitialized => self.handle_uninitialized(other).await,
                Role::Follower => self.handle_follower(other).await,
                Role::Leader => self.handle_leader(other).await,
            },
        }
        true
    }

    async fn handle_uninitialized(&mut self, msg: ClusterMessage) {
        match msg {
            ClusterMessage::LeaderElected(leader) => {
                self.leader = leader.clone();
                match leader {
                    Some(addr) if addr == self.self_addr => {
                        info!(member = %self.self_addr, "elected leader");
                        self.role = Role::Leader;
                        self.rebalance_now().await;
                        self.unstash();
                    }
                    Some(addr) => {
                        info!(member = %self.self_addr, leader = %addr, "following");
                        self.role = Role::Follower;
                        self.unstash();
                        let _ = self.partitions_tx.send(PartitionMessage::Monitor {
                            subscriber: self.self_subscription.clone(),
                        });
                    }
                    None => {}
                }
            }
            ClusterMessage::MembersChanged(members) => self.members = members,
            other => self.stash.push_back(other),
        }
    }

    async fn handle_follower(&mut self, msg: ClusterMessage) {
        match msg {
            ClusterMessage::LeaderElected(Some(addr)) if addr == self.self_addr => {
                info!(member = %self.self_addr, "promoted to leader");
                self.leader = Some(addr);
                self.role = Role::Leader;
                let _ = self.partitions_tx.send(PartitionMessage::StopMonitor {
                    subscriber: self.self_subscription.clone(),
                });
                self.rebalance_now().await;
            }
            ClusterMessage::LeaderElected(leader) => self.leader = leader,
            ClusterMessage::MembersChanged(members) => self.members = members,
            ClusterMessage::QueryLeadership { reply } => {
                reply.send(ClusterReply::Leader(self.leader.clone()));
            }
            ClusterMessage::PartitionEvent(PartitionEvent::Diff { changes, .. }) => {
                for (key, ordered) in changes {
                    self.partitions.insert(key, ordered.into_iter().collect());
                }
            }
            ClusterMessage::PartitionEvent(PartitionEvent::Removed { key }) => {
                self.partitions.remove(&key);
            }
            ClusterMessage::QueryPartition { key, tag, size, props, reply } => {
                let locally_known = size.is_none()
                    && self.partitions.get(&key).is_some_and(|m| !m.is_empty());
                if locally_known {
                    let members = self.partitions.get(&key).cloned().unwrap_or_default();
                    let ordered =
                        order_by_age(&*self.client, &key, &members, self.segments).await;
                    let path = key.zk_path(self.segments);
                    reply.send(ClusterReply::Partition { key, members: ordered, path, tag });
                } else {
                    self.forward_to_leader(ClusterMessage::QueryPartition {
                        key,
                        tag,
                        size,
                        props,
                        reply,
                    })
                    .await;
                }
            }
            msg @ (ClusterMessage::ResizePartition { .. }
            | ClusterMessage::RemovePartition { .. }) => {
                self.forward_to_leader(msg).await;
            }
            _ => {}
        }
    }

    async fn handle_leader(&mut self, msg: ClusterMessage) {
        match msg {
            ClusterMessage::LeaderElected(Some(addr)) if addr == self.self_addr => {}
            ClusterMessage::LeaderElected(leader) => {
                info!(member = %self.self_addr, ?leader, "demoted to follower");
                self.leader = leader;
                self.role = Role::Follower;
                let _ = self.partitions_tx.send(PartitionMessage::Monitor {
                    subscriber: self.self_subscription.clone(),
                });
            }
            ClusterMessage::MembersChanged(members) => {
                let departed: Vec<Address> =
                    self.members.difference(&members).cloned().collect();
                if !departed.is_empty() {
                    debug!(count = departed.len(), "filtering departed members from assignments");
                    for assigned in self.partitions.values_mut() {
                        for gone in &departed {
                            assigned.remove(gone);
                        }
                    }
                }
                self.members = members;
                self.rebalance_now().await;
            }
            ClusterMessage::QueryLeadership { reply } => {
                reply.send(ClusterReply::Leader(self.leader.clone()));
            }
            ClusterMessage::QueryPartition { key, tag, size: Some(size), props, reply } => {
                self.create_partition(key, tag, size, props, reply).await;
            }
            ClusterMessage::QueryPartition { key, tag, size: None, reply, .. } => {
                let members = self.partitions.get(&key).cloned().unwrap_or_default();
                let ordered = order_by_age(&*self.client, &key, &members, self.segments).await;
                let path = key.zk_path(self.segments);
                reply.send(ClusterReply::Partition { key, members: ordered, path, tag });
            }
            ClusterMessage::ResizePartition { key, size } => {
                let path = zk::size_path(key.as_bytes(), self.segments);
                match self
                    .client
                    .guarantee(&path, zk::encode_size(size), CreateMode::Persistent)
                    .await
                {
                    Ok(()) => {
                        debug!(partition = %key, size, "required size updated");
                        self.rebalance_now().await;
                    }
                    Err(error) => warn!(%error, partition = %key, "failed to update required size"),
                }
            }
            ClusterMessage::RemovePartition { key } => {
                // The leader is unsubscribed from partition events, so evict
                // the key here or the next rebalance would resurrect it.
                self.partitions.remove(&key);
                let _ = self.partitions_tx.send(PartitionMessage::Remove { key });
            }
            ClusterMessage::PartitionEvent(_) => {}
            _ => {}
        }
    }

    /// Leader-side create-if-absent, then rebalance and reply.
    async fn create_partition(
        &mut self,
        key: PartitionKey,
        tag: u64,
        size: u32,
        props: Bytes,
        reply: Recipient<ClusterReply>,
    ) {
        let path = key.zk_path(self.segments);
        if let Err(error) = self.client.guarantee(&path, props, CreateMode::Persistent).await {
            warn!(%error, partition = %key, "failed to ensure partition node");
            return;
        }
        let size_path = zk::size_path(key.as_bytes(), self.segments);
        if let Err(error) = self
            .client
            .guarantee(&size_path, zk::encode_size(size), CreateMode::Persistent)
            .await
        {
            warn!(%error, partition = %key, "failed to ensure required-size node");
            return;
        }

        self.partitions.entry(key.clone()).or_default();
        self.rebalance_now().await;

        let members = self.partitions.get(&key).cloned().unwrap_or_default();
        let ordered = order_by_age(&*self.client, &key, &members, self.segments).await;
        reply.send(ClusterReply::Partition { key, members: ordered, path, tag });
    }

    /// Recompute the assignment from current state and broadcast it.
    async fn rebalance_now(&mut self) {
        let required = self.read_required_sizes().await;
        let plan = self.policy.plan(RebalanceContext {
            current: &self.partitions,
            members: &self.members,
            required: &required,
            leader: self.leader.as_ref(),
        });
        debug!(partitions = plan.len(), members = self.members.len(), "rebalance plan computed");
        self.partitions = plan.clone();
        let _ = self.partitions_tx.send(PartitionMessage::Rebalance { plan });
    }

    /// Required replication factors, read on demand and cached per plan.
    async fn read_required_sizes(&self) -> BTreeMap<PartitionKey, u32> {
        let mut required = BTreeMap::new();
        for key in self.partitions.keys() {
            let path = zk::size_path(key.as_bytes(), self.segments);
            let size = match self.client.get_data(&path, None).await {
                Ok(Some(data)) => match zk::decode_size(&data) {
                    Some(size) => size,
                    None => {
                        warn!(partition = %key, "malformed required-size node; assuming 1");
                        1
                    }
                },
                Ok(None) => {
                    debug!(partition = %key, "missing required-size node; assuming 1");
                    1
                }
                Err(error) => {
                    warn!(%error, partition = %key, "failed to read required size; assuming 1");
                    1
                }
            };
            required.insert(key.clone(), size);
        }
        required
    }

    async fn forward_to_leader(&self, msg: ClusterMessage) {
        match &self.leader {
            Some(leader) => {
                if let Err(error) = self.transport.forward_to_cluster(leader, msg).await {
                    warn!(%error, leader = %leader, "failed to forward to leader");
                }
            }
            None => warn!("dropping leader-bound message; no leader known"),
        }
    }

    fn unstash(&mut self) {
        if !self.stash.is_empty() {
            debug!(count = self.stash.len(), "replaying stashed messages");
        }
        self.pending.extend(self.stash.drain(..));
    }
}
