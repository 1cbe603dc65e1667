//! Peer messaging, addressed by member [`Address`].
//!
//! The leader's partition manager instructs peers to onboard or drop off
//! partitions, and followers forward leader-only queries; both go through
//! [`PeerTransport`] so the components stay decoupled from the hosting
//! runtime's messaging. [`InProcessTransport`] is the in-process binding
//! used by tests and single-process clusters; a networked binding delivers
//! the serializable [`PartitionCommand`] shape instead.

use async_trait::async_trait;
use dashmap::DashMap;
use thiserror::Error;

use super::messages::{ClusterMessage, PartitionCommand, PartitionMessage};
use super::node::NodeMailboxes;
use super::Address;

/// Peer delivery failures.
///
/// Delivery is fire-and-forget end to end; callers log these and move on,
/// relying on the next rebalance to re-drive the instruction.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("unknown peer {0}")]
    UnknownPeer(Address),
    #[error("peer {0} mailbox closed")]
    Closed(Address),
}

/// Delivers component messages to a peer identified by address.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Deliver an onboard/dropoff instruction to a peer's partition manager.
    async fn send_partition_command(
        &self,
        to: &Address,
        command: PartitionCommand,
    ) -> Result<(), TransportError>;

    /// Forward a query to a peer's cluster FSM, preserving the embedded
    /// reply recipient so the peer answers the original caller directly.
    async fn forward_to_cluster(
        &self,
        to: &Address,
        message: ClusterMessage,
    ) -> Result<(), TransportError>;
}

/// Address-keyed registry of co-located nodes.
#[derive(Default)]
pub struct InProcessTransport {
    routes: DashMap<Address, NodeMailboxes>,
}

impl InProcessTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a node's mailboxes under its address.
    pub fn register(&self, addr: Address, mailboxes: NodeMailboxes) {
        self.routes.insert(addr, mailboxes);
    }

    /// Remove a node from the registry.
    pub fn deregister(&self, addr: &Address) {
        self.routes.remove(addr);
    }
}

#[async_trait]
impl PeerTransport for InProcessTransport {
    async fn send_partition_command(
        &self,
        to: &Address,
        command: PartitionCommand,
    ) -> Result<(), TransportError> {
        let route = self
            .routes
            .get(to)
            .ok_or_else(|| TransportError::UnknownPeer(to.clone()))?;
        route
            .partitions
            .send(PartitionMessage::Command(command))
            .map_err(|_| TransportError::Closed(to.clone()))
    }

    async fn forward_to_cluster(
        &self,
        to: &Address,
        message: ClusterMessage,
    ) -> Result<(), TransportError> {
        let route = self
            .routes
            .get(to)
            .ok_or_else(|| TransportError::UnknownPeer(to.clone()))?;
        route
            .cluster
            .send(message)
            .map_err(|_| TransportError::Closed(to.clone()))
    }
}
