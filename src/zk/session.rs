//! Session supervision and reconnect plumbing.
//!
//! The coordination client is shared by reference between components, so it
//! cannot be swapped by cross-thread mutation when a session dies. Instead
//! the supervisor owns the replacement flow: it listens for session-state
//! transitions, rebuilds the client through a [`ClientFactory`] when the
//! session is `Lost`, and pushes the fresh handle into every registered
//! sink. Each component re-seeds its watches and ephemeral presence when the
//! new handle arrives in its mailbox.
//!
//! In-memory rebalance state is deliberately not preserved across a rebuild:
//! the leader recomputes the plan once membership stabilizes under the new
//! session.

use std::sync::Arc;

use backon::Retryable;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::client::{ClientFactory, Coordination, SessionState};
use crate::retry;

/// Consumer of replacement client handles. Implementations wrap the handle
/// into a component's `ClientUpdated` mailbox message.
pub type ClientSink = Box<dyn Fn(Arc<dyn Coordination>) + Send + Sync>;

/// Rebuilds the coordination client on session loss and broadcasts the
/// replacement.
pub struct SessionSupervisor {
    factory: Arc<dyn ClientFactory>,
    sinks: Vec<ClientSink>,
    session_rx: mpsc::UnboundedReceiver<SessionState>,
}

impl SessionSupervisor {
    pub fn new(
        factory: Arc<dyn ClientFactory>,
        sinks: Vec<ClientSink>,
        session_rx: mpsc::UnboundedReceiver<SessionState>,
    ) -> Self {
        Self { factory, sinks, session_rx }
    }

    /// Drive the supervision loop until the session channel closes or
    /// reconstruction fails permanently.
    pub async fn run(mut self) {
        while let Some(state) = self.session_rx.recv().await {
            match state {
                SessionState::Connected => debug!("coordination session connected"),
                SessionState::Suspended => {
                    warn!("coordination session suspended; holding current snapshot");
                }
                SessionState::Lost => {
                    warn!("coordination session lost; reconstructing client");
                    match self.reconnect().await {
                        Ok(rx) => self.session_rx = rx,
                        Err(()) => {
                            error!(
                                "client reconstruction exhausted retries; \
                                 node continues on stale snapshot"
                            );
                            return;
                        }
                    }
                }
            }
        }
    }

    async fn reconnect(&self) -> Result<mpsc::UnboundedReceiver<SessionState>, ()> {
        let factory = Arc::clone(&self.factory);
        let client = (|| {
            let factory = Arc::clone(&factory);
            async move { factory.connect().await }
        })
        .retry(retry::session_policy())
        .notify(|err, delay| {
            warn!(error = %err, ?delay, "client reconstruction attempt failed");
        })
        .await
        .map_err(|err| {
            error!(error = %err, "client reconstruction failed");
        })?;

        let (session_tx, session_rx) = mpsc::unbounded_channel();
        client.subscribe_session(session_tx).await;
        info!("coordination client reconstructed; broadcasting to components");
        for sink in &self.sinks {
            sink(Arc::clone(&client));
        }
        Ok(session_rx)
    }
}
