//! # Menagerie
//! Cluster membership and partition assignment coordination on a
//! ZooKeeper-like coordination service.
//!
//! Given a set of processes joining a logical cluster, the coordinator:
//! - tracks live membership through ephemeral presence nodes
//! - elects a single leader via a leader latch
//! - lets any member request that a named partition (an opaque byte-string
//!   key) be created with a requested replication factor
//! - has the leader compute a members-to-partitions assignment respecting
//!   data-center locality and an optional spare-leader policy
//! - propagates the plan to the members that must onboard or drop off
//! - notifies subscribers whenever the effective mapping changes
//!
//! The design is eventually consistent with the leader as the source of
//! truth for writes; followers serve reads from watch-maintained snapshots
//! that may briefly lag.
//!
//! # Goals
//! - Easy to understand code
//! - Leverage best in class libraries such as [Tokio](https://tokio.rs/)
//! - Survive coordination-service disconnects without corrupting the
//!   assignment
//!
//! ## Getting started
//!
//! The coordination-service client is a trait ([`zk::Coordination`]); bind
//! it to your backend, or use the bundled in-memory service for tests (the
//! `test-utilities` feature). A node starts like this:
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use menagerie::cluster::{
//!     single_data_center, Address, ClusterNode, InProcessTransport, PartitionKey,
//! };
//! use menagerie::CoordinatorConfig;
//!
//! # async fn example(client: Arc<dyn menagerie::zk::Coordination>) -> menagerie::Result<()> {
//! let transport = Arc::new(InProcessTransport::new());
//! let addr: Address = "10.0.0.1:10000".parse()?;
//!
//! let node = ClusterNode::start(
//!     CoordinatorConfig::default(),
//!     addr.clone(),
//!     client,
//!     transport.clone(),
//!     None,
//!     single_data_center(),
//! )
//! .await?;
//! transport.register(addr, node.mailboxes());
//!
//! let info = node
//!     .query_partition(PartitionKey::from("orders"), Some(2), bytes::Bytes::new())
//!     .await?;
//! println!("primary replica: {:?}", info.members.first());
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]

mod constants;

pub mod cluster;
pub mod config;
pub mod error;
pub mod retry;
pub mod telemetry;
pub mod zk;

pub use config::CoordinatorConfig;
pub use error::{Error, Result};
