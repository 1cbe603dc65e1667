//! Centralized configuration constants.
//!
//! This module consolidates the tunable values used throughout the
//! coordinator. Having them in one place makes it easier to:
//!
//! - Understand the timing relationships between components
//! - Update values consistently
//! - Document the rationale for each constant
//!
//! # Categories
//!
//! - **Layout Constants**: key-space segmentation
//! - **Leadership Constants**: latch polling cadence
//! - **Session Constants**: reconnect behavior

use std::time::Duration;

// =============================================================================
// Layout Constants
// =============================================================================

/// Default number of key-space segments.
///
/// Segments exist solely to bound watch fan-out: the partition manager keeps
/// one child watch per segment plus one per live partition, rather than one
/// per possible partition. 128 keeps the watch count small while still
/// spreading partitions widely enough that a single segment refresh stays
/// cheap.
pub const DEFAULT_SEGMENTS: u32 = 128;

// =============================================================================
// Leadership Constants
// =============================================================================

/// Bounded wait applied to each leader-latch poll.
///
/// This is the only in-handler blocking the membership monitor performs; its
/// mailbox tolerates the pause. Losers spend most of their acquire loop
/// inside this wait.
pub const LATCH_WAIT: Duration = Duration::from_secs(1);

/// Delay before the acquire loop reschedules itself after a poll.
///
/// The loop never terminates: the holder's `/leader` write is idempotent and
/// losers keep polling cheaply, so the next latch winner reflects itself into
/// `/leader` within roughly this delay once the previous holder's session
/// expires.
pub const LATCH_RETRY_DELAY: Duration = Duration::from_millis(100);

// =============================================================================
// Session Constants
// =============================================================================

/// Minimum backoff between client reconstruction attempts after a lost
/// session.
pub const SESSION_RETRY_MIN_DELAY: Duration = Duration::from_millis(100);

/// Maximum backoff between client reconstruction attempts.
pub const SESSION_RETRY_MAX_DELAY: Duration = Duration::from_secs(10);

/// Reconstruction attempts before the session supervisor gives up and leaves
/// the node degraded on its stale snapshot.
pub const SESSION_RETRY_MAX_TIMES: usize = 20;

/// Attempts for idempotent layout creation during node bootstrap.
pub const BOOTSTRAP_RETRY_MAX_TIMES: usize = 10;
