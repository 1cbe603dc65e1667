//! Unified retry policies for consistent backoff behavior.
//!
//! This module replaces ad-hoc retry loops with named policies built on the
//! `backon` crate. All policies include jitter to prevent thundering herd
//! when several nodes lose their session at once.
//!
//! # Available Policies
//!
//! | Policy | Min Delay | Max Delay | Retries | Use Case |
//! |--------|-----------|-----------|---------|----------|
//! | `session_policy` | 100ms | 10s | 20 | Client reconstruction after a lost session |
//! | `bootstrap_policy` | 50ms | 5s | 10 | Idempotent layout creation at startup |
//!
//! # Example
//!
//! ```rust,no_run
//! use backon::Retryable;
//! use menagerie::retry;
//!
//! async fn example() -> Result<(), std::io::Error> {
//!     (|| async {
//!         // your fallible operation
//!         Ok::<_, std::io::Error>(())
//!     })
//!     .retry(retry::bootstrap_policy())
//!     .await
//! }
//! ```

use backon::ExponentialBuilder;

use crate::constants::{
    BOOTSTRAP_RETRY_MAX_TIMES, SESSION_RETRY_MAX_DELAY, SESSION_RETRY_MAX_TIMES,
    SESSION_RETRY_MIN_DELAY,
};
use std::time::Duration;

/// Policy for rebuilding the coordination client after a lost session.
///
/// Characteristics:
/// - Moderate initial delay (100ms) so a flapping network settles
/// - Long max delay (10s) for full coordination-service outages
/// - Many retries (20); if exhausted the node stays up on its stale snapshot
/// - Includes jitter
pub fn session_policy() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(SESSION_RETRY_MIN_DELAY)
        .with_max_delay(SESSION_RETRY_MAX_DELAY)
        .with_max_times(SESSION_RETRY_MAX_TIMES)
        .with_jitter()
}

/// Policy for idempotent persistent-layout creation during bootstrap.
///
/// Characteristics:
/// - Short initial delay (50ms); bootstrap failures are usually transient
///   connection races
/// - Bounded max delay (5s) so startup either completes or fails visibly
/// - Includes jitter
pub fn bootstrap_policy() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(50))
        .with_max_delay(Duration::from_secs(5))
        .with_max_times(BOOTSTRAP_RETRY_MAX_TIMES)
        .with_jitter()
}
