//! Membership monitor: liveness registration and leadership observation.
//!
//! Responsibilities:
//! - Join the leader latch and keep polling it
//! - Reflect a latch win into `/leader` so non-participants observe it
//! - Maintain this process's ephemeral presence under `/members`
//! - Watch `/leader` and `/members`, feeding `LeaderElected` and
//!   `MembersChanged` into the cluster FSM
//!
//! The acquire loop never terminates: the holder's `/leader` write is
//! idempotent and losers keep polling cheaply, so after the holder's session
//! expires the next latch winner reflects itself into `/leader` within one
//! retry delay. The bounded latch wait is the only in-handler blocking this
//! component performs.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::messages::{ClusterMessage, MembershipMessage};
use super::{Address, MemberSet};
use crate::zk::{
    self, Coordination, CreateMode, LeaderLatch, WatchEvent, WatchKind, Watcher,
};

pub(crate) struct MembershipMonitor {
    self_addr: Address,
    client: Arc<dyn Coordination>,
    latch: Option<Box<dyn LeaderLatch>>,
    cluster_tx: mpsc::UnboundedSender<ClusterMessage>,
    self_tx: mpsc::UnboundedSender<MembershipMessage>,
    latch_wait: Duration,
    latch_retry_delay: Duration,
}

impl MembershipMonitor {
    pub(crate) fn new(
        self_addr: Address,
        client: Arc<dyn Coordination>,
        cluster_tx: mpsc::UnboundedSender<ClusterMessage>,
        self_tx: mpsc::UnboundedSender<MembershipMessage>,
        latch_wait: Duration,
        latch_retry_delay: Duration,
    ) -> Self {
        Self {
            self_addr,
            client,
            latch: None,
            cluster_tx,
            self_tx,
            latch_wait,
            latch_retry_delay,
        }
    }

    pub(crate) async fn run(mut self, mut rx: mpsc::UnboundedReceiver<MembershipMessage>) {
        self.initialize().await;
        while let Some(msg) = rx.recv().await {
            match msg {
                MembershipMessage::ClientUpdated(client) => {
                    info!(member = %self.self_addr, "membership monitor rebinding client");
                    self.client = client;
                    self.initialize().await;
                }
                MembershipMessage::AcquireLeadership => self.acquire_leadership().await,
                MembershipMessage::Watch(event) => self.handle_watch(event).await,
                MembershipMessage::Shutdown => break,
            }
        }
        if let Some(latch) = self.latch.take() {
            let _ = latch.close().await;
        }
    }

    /// One-shot watcher feeding back into this component's mailbox.
    fn watcher(&self) -> Watcher {
        let tx = self.self_tx.clone();
        Arc::new(move |event| {
            let _ = tx.send(MembershipMessage::Watch(event));
        })
    }

    async fn initialize(&mut self) {
        if let Some(latch) = self.latch.take() {
            let _ = latch.close().await;
        }
        match self.client.leader_latch(zk::LEADERSHIP_PATH).await {
            Ok(latch) => self.latch = Some(latch),
            Err(error) => warn!(%error, "failed to join leader latch"),
        }

        self.refresh_leader().await;

        let presence = zk::member_path(&self.self_addr.to_string());
        if let Err(error) = self
            .client
            .guarantee(&presence, Bytes::new(), CreateMode::Ephemeral)
            .await
        {
            warn!(%error, path = %presence, "failed to register member presence");
        }

        self.refresh_members().await;

        let _ = self.self_tx.send(MembershipMessage::AcquireLeadership);
    }

    /// Read `/leader` (re-arming the data watch) and report the result.
    async fn refresh_leader(&self) {
        let leader = match self.client.get_data(zk::LEADER_PATH, Some(self.watcher())).await {
            Ok(Some(data)) => match serde_json::from_slice::<Address>(&data) {
                Ok(addr) => Some(addr),
                Err(error) => {
                    warn!(%error, "unparseable leader node data");
                    None
                }
            },
            Ok(None) => None,
            Err(error) => {
                warn!(%error, "failed to read leader node");
                return;
            }
        };
        debug!(?leader, "observed leader");
        let _ = self.cluster_tx.send(ClusterMessage::LeaderElected(leader));
    }

    /// Read `/members` (re-arming the child watch) and report the result.
    async fn refresh_members(&self) {
        let names = match self.client.children(zk::MEMBERS_PATH, Some(self.watcher())).await {
            Ok(names) => names,
            Err(crate::zk::CoordinationError::NoNode(_)) => {
                debug!("members node absent; nothing to observe");
                return;
            }
            Err(error) => {
                warn!(%error, "failed to list members");
                return;
            }
        };
        let mut members = MemberSet::new();
        for name in names {
            match Address::from_path_segment(&name) {
                Ok(addr) => {
                    members.insert(addr);
                }
                Err(error) => warn!(%error, entry = %name, "skipping unparseable member entry"),
            }
        }
        debug!(count = members.len(), "observed members");
        let _ = self.cluster_tx.send(ClusterMessage::MembersChanged(members));
    }

    /// Poll the latch; a winner reflects itself into `/leader`. Always
    /// reschedules.
    async fn acquire_leadership(&self) {
        let acquired = match &self.latch {
            Some(latch) => match latch.acquire(self.latch_wait).await {
                Ok(acquired) => acquired,
                Err(error) => {
                    warn!(%error, "leader latch poll failed");
                    false
                }
            },
            None => false,
        };

        if acquired {
            match serde_json::to_vec(&self.self_addr) {
                Ok(data) => match self
                    .client
                    .guarantee(zk::LEADER_PATH, Bytes::from(data), CreateMode::Persistent)
                    .await
                {
                    Ok(()) => debug!(member = %self.self_addr, "holding leadership"),
                    Err(error) => warn!(%error, "failed to write leader node"),
                },
                Err(error) => warn!(%error, "failed to encode own address"),
            }
        }

        let tx = self.self_tx.clone();
        let delay = self.latch_retry_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(MembershipMessage::AcquireLeadership);
        });
    }

    async fn handle_watch(&self, event: WatchEvent) {
        if !matches!(
            event.kind,
            WatchKind::NodeCreated | WatchKind::NodeDataChanged | WatchKind::NodeChildrenChanged
        ) {
            return;
        }
        match event.path.as_str() {
            zk::LEADER_PATH => self.refresh_leader().await,
            zk::MEMBERS_PATH => self.refresh_members().await,
            other => debug!(path = %other, "ignoring unexpected watch path"),
        }
    }
}
