//! Crate level errors.
//!
//! The crate uses a two-layer error hierarchy:
//!
//! ## Coordination Layer (`crate::zk`)
//!
//! - [`CoordinationError`]: errors surfaced by the coordination-service
//!   client (missing nodes, lost connections, malformed node data)
//! - Carried in [`ZkResult`](crate::zk::ZkResult)
//!
//! ## Crate Layer (`crate::error`)
//!
//! - [`Error`]: configuration, address parsing, transport and node lifecycle
//!   errors, plus coordination errors propagating out of the public API
//!
//! ## Conversion
//!
//! [`CoordinationError`] and [`TransportError`] convert into [`Error`] via
//! `From` impls, so component code can use `?` against either layer.
//!
//! No error in this hierarchy is fatal to a running node: the components are
//! designed to degrade into stale-but-consistent snapshots and recover on
//! reconnect. `Error` values escape only through the public `ClusterNode`
//! API and the bootstrap path.
//!
//! [`CoordinationError`]: crate::zk::CoordinationError
//! [`TransportError`]: crate::cluster::TransportError

use std::result;

use thiserror::Error as ThisError;

use crate::cluster::TransportError;
use crate::zk::CoordinationError;

pub type Result<T> = result::Result<T, Error>;

/// Top-level coordinator errors.
#[derive(Debug, ThisError)]
pub enum Error {
    /// Coordination-service failure that survived the client's retry policy.
    #[error("coordination error: {0}")]
    Coordination(#[from] CoordinationError),

    /// Peer message could not be delivered.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// A member address could not be parsed.
    #[error("invalid address: {0}")]
    Address(String),

    /// The node's component tasks have stopped; no reply will arrive.
    #[error("cluster node is stopped")]
    Stopped,
}
