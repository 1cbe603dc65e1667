//! Cluster membership and partition assignment coordination.
//!
//! This module hosts the distributed state machine: three long-lived
//! components per process, each a single tokio task draining a typed
//! mailbox, sharing a handle to the coordination service.
//!
//! # Architecture
//!
//! ```text
//!   coordination service (watches, latch, ephemerals)
//!        │                         │
//!        ▼                         ▼
//!  ┌──────────────┐        ┌──────────────────┐
//!  │ Membership   │        │ Partition        │──── onboard/dropoff ───► peers
//!  │ Monitor      │        │ Manager          │◄─── onboard/dropoff ──── peers
//!  └──────┬───────┘        └───┬──────────┬───┘
//!         │ LeaderElected       │ diffs    ▲
//!         │ MembersChanged      ▼          │ Rebalance(plan)
//!         │              subscribers       │
//!         │                    │           │
//!         ▼                    ▼           │
//!  ┌─────────────────────────────────────┐ │
//!  │ Cluster FSM                         │─┘
//!  │ {Uninitialized, Follower, Leader}   │◄── queries (membership,
//!  └─────────────────────────────────────┘    leadership, partitions)
//! ```
//!
//! The Membership Monitor maintains the process's liveness registration and
//! observes `/leader` and `/members`. The Partition Manager keeps a local
//! snapshot of partition-to-member assignments via segmented watches and
//! executes onboard/dropoff instructions. The Cluster FSM coordinates both,
//! applies rebalance plans when it is the leader, and serves queries.
//!
//! External processes interact through [`ClusterNode`], which owns the
//! mailboxes and the component tasks.

mod address;
mod fsm;
mod membership;
mod messages;
mod node;
mod partitions;
mod rebalance;
mod transport;

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::zk;

pub use address::{single_data_center, Address, DataCenterResolver};
pub use messages::{
    ClusterMessage, ClusterReply, MembershipMessage, PartitionCommand, PartitionEvent,
    PartitionMessage, Recipient, RefreshScope,
};
pub use node::{ClusterNode, NodeMailboxes, PartitionInfo};
pub use rebalance::{DataCenterAware, RebalanceContext, RebalancePolicy};
pub use transport::{InProcessTransport, PeerTransport, TransportError};

/// Stable identity of a partition: an opaque, immutable byte string.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PartitionKey(Bytes);

impl PartitionKey {
    pub fn new(raw: impl Into<Bytes>) -> Self {
        Self(raw.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Segment this key belongs to, for a cluster with `segments` buckets.
    pub fn segment(&self, segments: u32) -> String {
        zk::segment_of(&self.0, segments)
    }

    /// Path of this partition's znode.
    pub fn zk_path(&self, segments: u32) -> String {
        zk::partition_path(&self.0, segments)
    }
}

impl fmt::Debug for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PartitionKey({self})")
    }
}

impl fmt::Display for PartitionKey {
    /// Printable keys render as text, anything else as hex.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match std::str::from_utf8(&self.0) {
            Ok(s) if s.chars().all(|c| !c.is_control()) => f.write_str(s),
            _ => {
                write!(f, "0x")?;
                for b in self.0.iter() {
                    write!(f, "{b:02x}")?;
                }
                Ok(())
            }
        }
    }
}

impl From<&str> for PartitionKey {
    fn from(s: &str) -> Self {
        Self(Bytes::copy_from_slice(s.as_bytes()))
    }
}

impl From<&[u8]> for PartitionKey {
    fn from(b: &[u8]) -> Self {
        Self(Bytes::copy_from_slice(b))
    }
}

impl From<Vec<u8>> for PartitionKey {
    fn from(b: Vec<u8>) -> Self {
        Self(Bytes::from(b))
    }
}

impl From<Bytes> for PartitionKey {
    fn from(b: Bytes) -> Self {
        Self(b)
    }
}

/// Set of member addresses, ordered for deterministic iteration.
pub type MemberSet = BTreeSet<Address>;

/// Partition-to-members assignment map.
pub type PartitionMap = BTreeMap<PartitionKey, MemberSet>;
