//! Coordination-service client abstraction.
//!
//! The cluster components never talk to a concrete coordination service;
//! they hold an `Arc<dyn Coordination>` capturing exactly the primitives the
//! distributed state machine needs: idempotent create-or-set (`guarantee`),
//! ephemeral/persistent nodes, one-shot watches, a leader latch, and session
//! state notification.
//!
//! # Available Implementations
//!
//! - [`MockCoordination`](crate::zk::mock::MockCoordination): in-memory
//!   service for tests (behind the `test-utilities` feature)
//! - Production backends bind this trait to a retrying, namespaced client;
//!   transient failures are expected to be retried inside the client, so
//!   errors that surface here have already exhausted its policy.
//!
//! # Watch Semantics
//!
//! Watches are one-shot, matching the coordination service's contract: a
//! [`Watcher`] registered by `get_data` or `children` fires at most once and
//! must be re-armed by the read that extracts the new state. Callbacks run
//! on the client's dispatch context and must not block; every watcher in
//! this crate only enqueues a mailbox message.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tokio::sync::mpsc;

/// Result type for coordination-service operations.
pub type ZkResult<T> = Result<T, CoordinationError>;

/// Errors surfaced by a coordination-service client.
///
/// The taxonomy is deliberately narrow: callers need to distinguish
/// "node absent" (routinely ignored), "node present" (idempotent creates)
/// and connection-level failures from everything else.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CoordinationError {
    /// The node does not exist.
    #[error("no node: {0}")]
    NoNode(String),

    /// The node already exists.
    #[error("node already exists: {0}")]
    NodeExists(String),

    /// The node has children and cannot be deleted non-recursively.
    #[error("node not empty: {0}")]
    NotEmpty(String),

    /// The connection to the coordination service was lost mid-operation.
    #[error("connection lost")]
    ConnectionLoss,

    /// The client's session has expired; a new client must be constructed.
    #[error("session expired")]
    SessionExpired,

    /// Node data or a path segment could not be decoded.
    #[error("malformed data at {path}: {reason}")]
    MalformedData { path: String, reason: String },

    /// Backend-specific failure.
    #[error("backend error: {0}")]
    Backend(String),
}

/// Node creation mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateMode {
    /// Survives the creator's session.
    Persistent,
    /// Deleted automatically when the creator's session ends.
    Ephemeral,
}

/// Subset of node metadata the coordinator consumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeStat {
    /// Transaction id of the create; monotonically increasing service-wide,
    /// so it totally orders node creations.
    pub czxid: u64,
    /// Owning session for ephemeral nodes.
    pub ephemeral_owner: Option<u64>,
}

/// Watch event types delivered to a [`Watcher`].
///
/// Components act only on `NodeCreated`, `NodeDataChanged` and
/// `NodeChildrenChanged`; everything else is ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchKind {
    NodeCreated,
    NodeDataChanged,
    NodeDeleted,
    NodeChildrenChanged,
}

/// A fired watch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    pub kind: WatchKind,
    pub path: String,
}

/// One-shot watch callback. Must not block: implementations enqueue a
/// message and return.
pub type Watcher = Arc<dyn Fn(WatchEvent) + Send + Sync>;

/// Client session lifecycle, as reported to session listeners.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Session established or re-established.
    Connected,
    /// Connection interrupted; the session may still recover.
    Suspended,
    /// Session expired. Ephemerals are gone; the client must be rebuilt.
    Lost,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Connected => write!(f, "connected"),
            SessionState::Suspended => write!(f, "suspended"),
            SessionState::Lost => write!(f, "lost"),
        }
    }
}

/// Leader-latch participation handle.
///
/// Exactly one participant per latch path holds leadership cluster-wide at
/// any time; leadership moves when the holder closes the latch or its
/// session expires.
#[async_trait]
pub trait LeaderLatch: Send + Sync {
    /// Wait up to `wait` for this participant to hold leadership.
    ///
    /// Returns immediately with `true` for the current holder.
    async fn acquire(&self, wait: Duration) -> ZkResult<bool>;

    /// Whether this participant currently holds leadership.
    fn has_leadership(&self) -> bool;

    /// Leave the latch, releasing leadership if held.
    async fn close(&self) -> ZkResult<()>;
}

/// Namespaced coordination-service client.
///
/// All paths are relative to the client's namespace. The client is
/// internally thread-safe and shared by reference between components.
#[async_trait]
pub trait Coordination: Send + Sync {
    /// Create a node, failing with [`CoordinationError::NodeExists`] if it
    /// already exists. Missing ancestors are created as empty persistent
    /// nodes.
    async fn create(&self, path: &str, data: Bytes, mode: CreateMode) -> ZkResult<()>;

    /// Create the node if absent; if present and its data differs,
    /// overwrite the data. Missing ancestors are created as empty
    /// persistent nodes. Idempotent.
    async fn guarantee(&self, path: &str, data: Bytes, mode: CreateMode) -> ZkResult<()>;

    /// Replace a node's data.
    async fn set_data(&self, path: &str, data: Bytes) -> ZkResult<()>;

    /// Read a node's data; `Ok(None)` when the node does not exist.
    ///
    /// A supplied watcher is armed either way: on an absent node it fires
    /// on creation, otherwise on the next data change or deletion.
    async fn get_data(&self, path: &str, watch: Option<Watcher>) -> ZkResult<Option<Bytes>>;

    /// List a node's children, optionally arming a one-shot child watch
    /// that fires on the next create/delete beneath the node, or on the
    /// node's own deletion.
    async fn children(&self, path: &str, watch: Option<Watcher>) -> ZkResult<Vec<String>>;

    /// Read node metadata; `Ok(None)` when the node does not exist.
    async fn stat(&self, path: &str) -> ZkResult<Option<NodeStat>>;

    /// Delete a childless node.
    async fn delete(&self, path: &str) -> ZkResult<()>;

    /// Recursively delete a subtree, treating a missing node as success.
    async fn safely_discard(&self, path: &str) -> ZkResult<()>;

    /// Join the leader latch at `path`.
    async fn leader_latch(&self, path: &str) -> ZkResult<Box<dyn LeaderLatch>>;

    /// Register a session-state listener for this client's session.
    async fn subscribe_session(&self, listener: mpsc::UnboundedSender<SessionState>);
}

/// Constructs replacement clients after a session is lost.
///
/// The factory embeds the connection string, namespace and retry policy, so
/// the session supervisor can rebuild without knowing the backend.
#[async_trait]
pub trait ClientFactory: Send + Sync {
    async fn connect(&self) -> ZkResult<Arc<dyn Coordination>>;
}
