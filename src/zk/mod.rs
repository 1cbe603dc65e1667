//! Coordination-service abstraction: client trait, tree layout, session
//! supervision, and the in-memory test service.
//!
//! The distributed state machine in [`crate::cluster`] is written entirely
//! against [`Coordination`]; everything backend-specific stays behind that
//! trait.

mod client;
mod paths;
mod session;

#[cfg(any(test, feature = "test-utilities"))]
pub mod mock;

pub use client::{
    ClientFactory, Coordination, CoordinationError, CreateMode, LeaderLatch, NodeStat,
    SessionState, WatchEvent, WatchKind, Watcher, ZkResult,
};
pub use paths::{
    decode_size, encode_size, key_to_path, member_path, partition_path, path_to_key, segment_of,
    segment_path, size_path, LEADERSHIP_PATH, LEADER_PATH, MEMBERS_PATH, SEGMENTS_PATH, SIZE_CHILD,
};
pub use session::{ClientSink, SessionSupervisor};
