//! Typed messages exchanged between the cluster components.
//!
//! Each component is a single-threaded event loop over one of these enums;
//! all inter-component communication goes through mailboxes, never shared
//! mutable state. Queries carry a [`Recipient`] for the reply and an opaque
//! `tag` echoed unmodified, so callers can correlate fire-and-forget
//! responses and apply their own timeouts.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use super::{Address, MemberSet, PartitionKey, PartitionMap};
use crate::zk::{Coordination, WatchEvent};

static NEXT_RECIPIENT_ID: AtomicU64 = AtomicU64::new(1);

/// Identity-comparable handle to somebody's mailbox.
///
/// Cloning preserves identity, so a subscriber registered via one clone can
/// be unregistered via another. Sends never block; a send to a dropped
/// mailbox is reported but not an error, matching fire-and-forget delivery.
pub struct Recipient<T> {
    id: u64,
    tx: mpsc::UnboundedSender<T>,
}

impl<T> Recipient<T> {
    /// Wrap an existing mailbox sender under a fresh identity.
    pub fn new(tx: mpsc::UnboundedSender<T>) -> Self {
        Self { id: NEXT_RECIPIENT_ID.fetch_add(1, Ordering::Relaxed), tx }
    }

    /// Fresh mailbox plus its receiving end.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<T>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(tx), rx)
    }

    /// Deliver a message. Returns false when the mailbox is gone.
    pub fn send(&self, msg: T) -> bool {
        self.tx.send(msg).is_ok()
    }

    pub fn id(&self) -> u64 {
        self.id
    }
}

impl<T> Clone for Recipient<T> {
    fn clone(&self) -> Self {
        Self { id: self.id, tx: self.tx.clone() }
    }
}

impl<T> PartialEq for Recipient<T> {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl<T> Eq for Recipient<T> {}

impl<T> std::fmt::Debug for Recipient<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Recipient").field(&self.id).finish()
    }
}

/// Replies produced by the cluster FSM and the partition manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClusterReply {
    /// Current live members.
    Members(MemberSet),
    /// Current leader, if known.
    Leader(Option<Address>),
    /// A partition lookup or creation result. `members` is in stable
    /// primary-first order; `tag` echoes the query's correlation value.
    Partition {
        key: PartitionKey,
        members: Vec<Address>,
        path: String,
        tag: u64,
    },
    /// Partition keys assigned to the queried member.
    Partitions(Vec<PartitionKey>),
}

/// Notifications delivered to partition subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PartitionEvent {
    /// The effective assignment changed. Onboarded keys map to their members
    /// in stable primary-first order; dropped keys map to an empty sequence.
    /// `paths` carries each key's znode path.
    Diff {
        changes: BTreeMap<PartitionKey, Vec<Address>>,
        paths: BTreeMap<PartitionKey, String>,
    },
    /// The partition was deleted outright.
    Removed { key: PartitionKey },
}

/// How much of a segment one watch refresh observed.
///
/// A segment-level refresh lists the whole segment, so locally known
/// partitions missing from its change map were deleted. A partition-level
/// refresh re-reads exactly the partition whose watch fired; its siblings
/// are simply not observed and must be left untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshScope {
    /// Complete segment listing.
    Segment,
    /// Single-partition re-read.
    Partition,
}

/// Onboard/dropoff instructions exchanged between partition managers,
/// addressed by member [`Address`]. This is the only inter-process message
/// shape, hence the serde derives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PartitionCommand {
    /// Accept the partition: create its persistent node if absent, then
    /// register this process's ephemeral child under it.
    Onboard { key: PartitionKey, path: String },
    /// Release the partition: remove this process's ephemeral child.
    Dropoff { key: PartitionKey, path: String },
}

/// Mailbox of the cluster FSM — the public message surface.
pub enum ClusterMessage {
    /// A leader was observed in `/leader` (or the node's data was cleared).
    LeaderElected(Option<Address>),
    /// The `/members` children changed.
    MembersChanged(MemberSet),
    /// Forwarded partition notification (the FSM subscribes itself while it
    /// is a follower).
    PartitionEvent(PartitionEvent),
    /// Replacement client after a rebuilt session.
    ClientUpdated(Arc<dyn Coordination>),
    /// Subscribe to future `ClientUpdated` broadcasts.
    MonitorClient { observer: Recipient<Arc<dyn Coordination>> },
    /// Reply with the current member set.
    QueryMembership { reply: Recipient<ClusterReply> },
    /// Reply with the current leader if known.
    QueryLeadership { reply: Recipient<ClusterReply> },
    /// With `size`: create-if-absent with the requested replication factor,
    /// then reply. Without: lookup only.
    QueryPartition {
        key: PartitionKey,
        tag: u64,
        size: Option<u32>,
        props: Bytes,
        reply: Recipient<ClusterReply>,
    },
    /// Reply with all partition keys whose member set contains `member`.
    ListPartitions { member: Address, reply: Recipient<ClusterReply> },
    /// Change a partition's required replication factor.
    ResizePartition { key: PartitionKey, size: u32 },
    /// Delete a partition.
    RemovePartition { key: PartitionKey },
    /// Subscribe to `PartitionEvent`s.
    MonitorPartition { subscriber: Recipient<PartitionEvent> },
    /// Unsubscribe from `PartitionEvent`s.
    StopMonitorPartition { subscriber: Recipient<PartitionEvent> },
    /// Stop the component task.
    Shutdown,
}

/// Mailbox of the partition manager.
pub enum PartitionMessage {
    /// Replacement client; triggers a full watch/snapshot re-seed.
    ClientUpdated(Arc<dyn Coordination>),
    /// A segment- or partition-level watch fired.
    Watch(WatchEvent),
    /// Fresh observed state within one segment, produced by a watch
    /// refresh; `scope` says whether the observation covered the whole
    /// segment or a single partition.
    PartitionsChanged { segment: String, scope: RefreshScope, change: PartitionMap },
    /// Leader-computed target assignment to diff against local state.
    Rebalance { plan: PartitionMap },
    /// Onboard/dropoff instruction for this process.
    Command(PartitionCommand),
    /// Recursively delete the partition and notify subscribers.
    Remove { key: PartitionKey },
    /// Reply with the local snapshot's view of one partition.
    Query { key: PartitionKey, tag: u64, reply: Recipient<ClusterReply> },
    /// Add a subscriber to the notify set.
    Monitor { subscriber: Recipient<PartitionEvent> },
    /// Remove one occurrence of a subscriber from the notify set.
    StopMonitor { subscriber: Recipient<PartitionEvent> },
    /// Stop the component task.
    Shutdown,
}

/// Mailbox of the membership monitor.
pub enum MembershipMessage {
    /// Replacement client; rebuilds the latch, watches and presence.
    ClientUpdated(Arc<dyn Coordination>),
    /// Poll the leader latch and reflect a win into `/leader`.
    AcquireLeadership,
    /// The `/leader` data watch or `/members` child watch fired.
    Watch(WatchEvent),
    /// Stop the component task.
    Shutdown,
}
