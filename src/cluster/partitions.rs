//! Partition manager: local snapshot, watch trees, onboard/dropoff
//! execution and subscriber notification.
//!
//! Responsibilities:
//! - Keep a per-segment child watch plus one child watch per live partition
//!   (exactly one pending watcher per znode)
//! - Reconcile the local partition-to-members snapshot with observed
//!   changes, notifying subscribers only when the effective mapping moved
//! - Execute the leader's rebalance plan by instructing peers (and itself)
//!   to onboard or drop off partitions
//! - Serve partition queries from the local snapshot
//!
//! Segmentation exists to bound watch fan-out, and refresh cost follows the
//! same rule: a segment-level fire re-lists the segment, while a
//! partition-level fire re-reads only the partition whose watch tripped —
//! one children call, not one per sibling.
//!
//! Refreshes are best-effort: an entry whose read fails with no-node is
//! dropped silently, anything else is logged and dropped for this pass. The
//! next watch round-trip repairs the snapshot.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use super::messages::{
    ClusterReply, PartitionCommand, PartitionEvent, PartitionMessage, Recipient, RefreshScope,
};
use super::transport::PeerTransport;
use super::{Address, MemberSet, PartitionKey, PartitionMap};
use crate::zk::{
    self, Coordination, CoordinationError, CreateMode, WatchEvent, WatchKind, Watcher,
};

/// Stable primary-first ordering of a partition's members.
///
/// Members sort by the creation order (`czxid`) of their per-member
/// ephemeral, tie-breaking on address; members whose stat read fails sort
/// last. The result is a pure function of observed state, so every process
/// computes the same order for the same key and member set, and index 0 can
/// be treated as the primary replica.
pub(crate) async fn order_by_age(
    client: &dyn Coordination,
    key: &PartitionKey,
    members: &MemberSet,
    segments: u32,
) -> Vec<Address> {
    let base = key.zk_path(segments);
    let mut scored = Vec::with_capacity(members.len());
    for addr in members {
        let child = format!("{base}/{}", addr.to_path_segment());
        let czxid = match client.stat(&child).await {
            Ok(Some(stat)) => stat.czxid,
            Ok(None) => u64::MAX,
            Err(error) => {
                debug!(%error, path = %child, "stat failed while ordering members");
                u64::MAX
            }
        };
        scored.push((czxid, addr.clone()));
    }
    scored.sort();
    scored.into_iter().map(|(_, addr)| addr).collect()
}

pub(crate) struct PartitionManager {
    self_addr: Address,
    client: Arc<dyn Coordination>,
    segments: u32,
    snapshot: PartitionMap,
    /// Partitions with a pending child watch.
    watched: BTreeSet<PartitionKey>,
    subscribers: Vec<Recipient<PartitionEvent>>,
    transport: Arc<dyn PeerTransport>,
    self_tx: mpsc::UnboundedSender<PartitionMessage>,
}

impl PartitionManager {
    pub(crate) fn new(
        self_addr: Address,
        client: Arc<dyn Coordination>,
        segments: u32,
        transport: Arc<dyn PeerTransport>,
        self_tx: mpsc::UnboundedSender<PartitionMessage>,
    ) -> Self {
        Self {
            self_addr,
            client,
            segments,
            snapshot: PartitionMap::new(),
            watched: BTreeSet::new(),
            subscribers: Vec::new(),
            transport,
            self_tx,
        }
    }

    pub(crate) async fn run(mut self, mut rx: mpsc::UnboundedReceiver<PartitionMessage>) {
        self.initialize().await;
        while let Some(msg) = rx.recv().await {
            match msg {
                PartitionMessage::ClientUpdated(client) => {
                    info!(member = %self.self_addr, "partition manager rebinding client");
                    self.client = client;
                    self.initialize().await;
                }
                PartitionMessage::Watch(event) => self.handle_watch(event).await,
                PartitionMessage::PartitionsChanged { segment, scope, change } => {
                    self.apply_change(&segment, scope, change).await;
                }
                PartitionMessage::Rebalance { plan } => self.execute_plan(plan).await,
                PartitionMessage::Command(command) => self.execute_command(command).await,
                PartitionMessage::Remove { key } => self.remove_partition(key).await,
                PartitionMessage::Query { key, tag, reply } => {
                    let members = self.snapshot.get(&key).cloned().unwrap_or_default();
                    let ordered =
                        order_by_age(&*self.client, &key, &members, self.segments).await;
                    let path = key.zk_path(self.segments);
                    reply.send(ClusterReply::Partition { key, members: ordered, path, tag });
                }
                PartitionMessage::Monitor { subscriber } => self.subscribers.push(subscriber),
                PartitionMessage::StopMonitor { subscriber } => {
                    if let Some(i) = self.subscribers.iter().position(|s| *s == subscriber) {
                        self.subscribers.remove(i);
                    }
                }
                PartitionMessage::Shutdown => break,
            }
        }
    }

    fn watcher(&self) -> Watcher {
        let tx = self.self_tx.clone();
        Arc::new(move |event| {
            let _ = tx.send(PartitionMessage::Watch(event));
        })
    }

    /// Rebuild watches and snapshot from scratch, without notifying
    /// subscribers: observers converge through subsequent watch rounds and
    /// the leader's next rebalance.
    async fn initialize(&mut self) {
        self.snapshot.clear();
        self.watched.clear();
        let segments = match self.client.children(zk::SEGMENTS_PATH, None).await {
            Ok(segments) => segments,
            Err(error) => {
                warn!(%error, "failed to list segments; snapshot left empty");
                return;
            }
        };
        for segment in segments {
            if let Some(change) = self.refresh_segment(&segment).await {
                self.snapshot.extend(change);
            }
        }
        debug!(partitions = self.snapshot.len(), "partition snapshot seeded");
    }

    /// Re-read one segment's partitions, re-arming the segment watch and
    /// arming partition watches for any untracked partition. Returns the
    /// segment's fresh partition-to-members map.
    async fn refresh_segment(&mut self, segment: &str) -> Option<PartitionMap> {
        let seg_path = zk::segment_path(segment);
        let names = match self.client.children(&seg_path, Some(self.watcher())).await {
            Ok(names) => names,
            Err(CoordinationError::NoNode(_)) => {
                debug!(segment, "segment vanished during refresh");
                Vec::new()
            }
            Err(error) => {
                warn!(%error, segment, "failed to refresh segment");
                return None;
            }
        };

        let mut change = PartitionMap::new();
        for name in names {
            let key = match zk::path_to_key(&name) {
                Ok(raw) => PartitionKey::from(raw),
                Err(error) => {
                    warn!(%error, entry = %name, "skipping undecodable partition entry");
                    continue;
                }
            };
            let arm = !self.watched.contains(&key);
            match self.read_partition_members(&key, arm).await {
                Ok(Some(members)) => {
                    if arm {
                        self.watched.insert(key.clone());
                    }
                    change.insert(key, members);
                }
                Ok(None) => {
                    debug!(partition = %key, "partition vanished during refresh");
                    self.watched.remove(&key);
                }
                Err(error) => {
                    warn!(%error, partition = %key, "failed to read partition; dropping entry");
                }
            }
        }
        Some(change)
    }

    /// Children of one partition node as a member set, skipping the `$size`
    /// sentinel and unparseable entries.
    async fn read_partition_members(
        &self,
        key: &PartitionKey,
        arm: bool,
    ) -> Result<Option<MemberSet>, CoordinationError> {
        let path = key.zk_path(self.segments);
        let watch = arm.then(|| self.watcher());
        match self.client.children(&path, watch).await {
            Ok(names) => {
                let mut members = MemberSet::new();
                for name in names.iter().filter(|n| n.as_str() != zk::SIZE_CHILD) {
                    match Address::from_path_segment(name) {
                        Ok(addr) => {
                            members.insert(addr);
                        }
                        Err(error) => {
                            warn!(%error, entry = %name, "skipping unparseable assignee entry");
                        }
                    }
                }
                Ok(Some(members))
            }
            Err(CoordinationError::NoNode(_)) => Ok(None),
            Err(error) => Err(error),
        }
    }

    async fn handle_watch(&mut self, event: WatchEvent) {
        if !matches!(
            event.kind,
            WatchKind::NodeCreated | WatchKind::NodeDataChanged | WatchKind::NodeChildrenChanged
        ) {
            return;
        }
        let Some(rest) = event
            .path
            .strip_prefix(zk::SEGMENTS_PATH)
            .and_then(|r| r.strip_prefix('/'))
        else {
            debug!(path = %event.path, "ignoring watch outside the segments tree");
            return;
        };

        let parts: Vec<&str> = rest.split('/').collect();
        match parts.as_slice() {
            [segment] => {
                let segment = segment.to_string();
                if let Some(change) = self.refresh_segment(&segment).await {
                    let _ = self.self_tx.send(PartitionMessage::PartitionsChanged {
                        segment,
                        scope: RefreshScope::Segment,
                        change,
                    });
                }
            }
            [segment, partition] => {
                let key = match zk::path_to_key(partition) {
                    Ok(raw) => PartitionKey::from(raw),
                    Err(error) => {
                        debug!(%error, entry = %partition, "ignoring undecodable partition watch");
                        return;
                    }
                };
                let segment = segment.to_string();
                if let Some(change) = self.refresh_partition(&key).await {
                    let _ = self.self_tx.send(PartitionMessage::PartitionsChanged {
                        segment,
                        scope: RefreshScope::Partition,
                        change,
                    });
                }
            }
            _ => debug!(path = %event.path, "ignoring watch at unexpected depth"),
        }
    }

    /// Re-read exactly one partition after its watch fired, re-arming the
    /// watch. Costs a single children call regardless of how many siblings
    /// share the segment. A vanished partition yields nothing; its removal
    /// arrives through the segment watcher's own refresh.
    async fn refresh_partition(&mut self, key: &PartitionKey) -> Option<PartitionMap> {
        // The fired watch is consumed; drop it so the read re-arms it.
        self.watched.remove(key);
        match self.read_partition_members(key, true).await {
            Ok(Some(members)) => {
                self.watched.insert(key.clone());
                Some(PartitionMap::from([(key.clone(), members)]))
            }
            Ok(None) => {
                debug!(partition = %key, "partition vanished during refresh");
                None
            }
            Err(error) => {
                warn!(%error, partition = %key, "failed to read partition; dropping entry");
                None
            }
        }
    }

    /// Reconcile a fresh observation with the snapshot. Subscribers are
    /// notified only when the effective mapping changed. Only a complete
    /// segment listing can prove a partition gone: under
    /// [`RefreshScope::Partition`] the change map covers a single key and
    /// its absent siblings are left untouched.
    async fn apply_change(&mut self, segment: &str, scope: RefreshScope, change: PartitionMap) {
        let dropoffs: Vec<PartitionKey> = match scope {
            RefreshScope::Segment => self
                .snapshot
                .keys()
                .filter(|k| k.segment(self.segments) == segment)
                .filter(|k| !change.contains_key(k))
                .cloned()
                .collect(),
            RefreshScope::Partition => Vec::new(),
        };
        let onboards: Vec<PartitionKey> = change
            .iter()
            .filter(|(k, members)| self.snapshot.get(*k) != Some(*members))
            .map(|(k, _)| k.clone())
            .collect();

        if dropoffs.is_empty() && onboards.is_empty() {
            trace!(segment, "observed state matches snapshot; suppressing notification");
            return;
        }

        let mut changes: BTreeMap<PartitionKey, Vec<Address>> = BTreeMap::new();
        let mut paths: BTreeMap<PartitionKey, String> = BTreeMap::new();
        for key in &onboards {
            let members = &change[key];
            let ordered = order_by_age(&*self.client, key, members, self.segments).await;
            paths.insert(key.clone(), key.zk_path(self.segments));
            changes.insert(key.clone(), ordered);
        }
        for key in &dropoffs {
            paths.insert(key.clone(), key.zk_path(self.segments));
            changes.insert(key.clone(), Vec::new());
        }

        for (key, members) in change {
            self.snapshot.insert(key, members);
        }
        for key in &dropoffs {
            self.snapshot.remove(key);
            self.watched.remove(key);
        }

        debug!(
            segment,
            onboards = onboards.len(),
            dropoffs = dropoffs.len(),
            "partition snapshot updated"
        );
        self.notify(PartitionEvent::Diff { changes, paths });
    }

    fn notify(&mut self, event: PartitionEvent) {
        self.subscribers.retain(|subscriber| {
            let delivered = subscriber.send(event.clone());
            if !delivered {
                debug!(subscriber = subscriber.id(), "dropping dead partition subscriber");
            }
            delivered
        });
    }

    /// Diff the leader's plan against the local snapshot and instruct every
    /// affected member. Delivery is fire-and-forget; the next plan re-drives
    /// anything that was missed.
    async fn execute_plan(&mut self, plan: PartitionMap) {
        for (key, desired) in plan {
            let current = self.snapshot.get(&key).cloned().unwrap_or_default();
            let path = key.zk_path(self.segments);
            for addr in desired.difference(&current) {
                let command =
                    PartitionCommand::Onboard { key: key.clone(), path: path.clone() };
                self.dispatch(addr, command).await;
            }
            for addr in current.difference(&desired) {
                let command =
                    PartitionCommand::Dropoff { key: key.clone(), path: path.clone() };
                self.dispatch(addr, command).await;
            }
        }
    }

    async fn dispatch(&self, to: &Address, command: PartitionCommand) {
        if *to == self.self_addr {
            let _ = self.self_tx.send(PartitionMessage::Command(command));
            return;
        }
        if let Err(error) = self.transport.send_partition_command(to, command).await {
            warn!(%error, peer = %to, "failed to deliver partition command");
        }
    }

    async fn execute_command(&mut self, command: PartitionCommand) {
        match command {
            PartitionCommand::Onboard { key, path } => {
                match self.client.create(&path, Bytes::new(), CreateMode::Persistent).await {
                    Ok(()) | Err(CoordinationError::NodeExists(_)) => {}
                    Err(error) => {
                        warn!(%error, partition = %key, "failed to ensure partition node");
                        return;
                    }
                }
                let child = format!("{path}/{}", self.self_addr.to_path_segment());
                match self
                    .client
                    .guarantee(&child, Bytes::new(), CreateMode::Ephemeral)
                    .await
                {
                    Ok(()) => debug!(partition = %key, "onboarded"),
                    Err(error) => warn!(%error, partition = %key, "failed to onboard"),
                }
            }
            PartitionCommand::Dropoff { key, path } => {
                let child = format!("{path}/{}", self.self_addr.to_path_segment());
                match self.client.safely_discard(&child).await {
                    Ok(()) => debug!(partition = %key, "dropped off"),
                    Err(error) => warn!(%error, partition = %key, "failed to drop off"),
                }
            }
        }
    }

    async fn remove_partition(&mut self, key: PartitionKey) {
        let path = key.zk_path(self.segments);
        if let Err(error) = self.client.safely_discard(&path).await {
            warn!(%error, partition = %key, "failed to delete partition subtree");
        }
        self.snapshot.remove(&key);
        self.watched.remove(&key);
        info!(partition = %key, "partition removed");
        self.notify(PartitionEvent::Removed { key });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::transport::InProcessTransport;
    use crate::zk::mock::MockCoordination;
    use tokio::time::{sleep, timeout, Duration};

    fn addr(n: u16) -> Address {
        Address::new(format!("10.0.0.{n}"), 9000)
    }

    struct Harness {
        tx: mpsc::UnboundedSender<PartitionMessage>,
        events: mpsc::UnboundedReceiver<PartitionEvent>,
        service: Arc<MockCoordination>,
        segments: u32,
    }

    async fn harness() -> Harness {
        let service = MockCoordination::new();
        let seed = service.client();
        for i in 0..8 {
            seed.guarantee(&format!("/segments/segment-{i}"), Bytes::new(), CreateMode::Persistent)
                .await
                .unwrap();
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let manager = PartitionManager::new(
            addr(1),
            service.client(),
            8,
            Arc::new(InProcessTransport::new()),
            tx.clone(),
        );
        tokio::spawn(manager.run(rx));

        let (subscriber, events) = Recipient::channel();
        tx.send(PartitionMessage::Monitor { subscriber }).unwrap();
        Harness { tx, events, service, segments: 8 }
    }

    async fn next_event(events: &mut mpsc::UnboundedReceiver<PartitionEvent>) -> PartitionEvent {
        timeout(Duration::from_secs(2), events.recv())
            .await
            .expect("event before timeout")
            .expect("subscriber channel open")
    }

    #[tokio::test]
    async fn onboard_creates_ephemeral_and_diff_reaches_subscribers() {
        let mut h = harness().await;
        let key = PartitionKey::from("orders");
        let path = key.zk_path(h.segments);

        h.tx.send(PartitionMessage::Command(PartitionCommand::Onboard {
            key: key.clone(),
            path: path.clone(),
        }))
        .unwrap();

        match next_event(&mut h.events).await {
            PartitionEvent::Diff { changes, paths } => {
                assert_eq!(changes[&key], vec![addr(1)]);
                assert_eq!(paths[&key], path);
            }
            other => panic!("expected diff, got {other:?}"),
        }
        assert!(h.service.node_exists(&format!("{path}/10.0.0.1:9000")));
    }

    #[tokio::test]
    async fn plan_drives_self_onboard_and_dropoff() {
        let mut h = harness().await;
        let key = PartitionKey::from("p");
        let path = key.zk_path(h.segments);

        let plan: PartitionMap = [(key.clone(), MemberSet::from([addr(1)]))].into();
        h.tx.send(PartitionMessage::Rebalance { plan }).unwrap();
        let _ = next_event(&mut h.events).await;
        assert!(h.service.node_exists(&format!("{path}/10.0.0.1:9000")));

        let plan: PartitionMap = [(key.clone(), MemberSet::new())].into();
        h.tx.send(PartitionMessage::Rebalance { plan }).unwrap();
        match next_event(&mut h.events).await {
            PartitionEvent::Diff { changes, .. } => assert_eq!(changes[&key], Vec::<Address>::new()),
            other => panic!("expected dropoff diff, got {other:?}"),
        }
        assert!(!h.service.node_exists(&format!("{path}/10.0.0.1:9000")));
    }

    #[tokio::test]
    async fn unchanged_observation_is_suppressed() {
        let mut h = harness().await;
        let key = PartitionKey::from("stable");
        let segment = key.segment(h.segments);

        let change: PartitionMap = [(key.clone(), MemberSet::from([addr(2)]))].into();
        h.tx.send(PartitionMessage::PartitionsChanged {
            segment: segment.clone(),
            scope: RefreshScope::Segment,
            change: change.clone(),
        })
        .unwrap();
        let _ = next_event(&mut h.events).await;

        // identical observation: no notification may follow
        h.tx.send(PartitionMessage::PartitionsChanged {
            segment,
            scope: RefreshScope::Segment,
            change,
        })
        .unwrap();
        sleep(Duration::from_millis(100)).await;
        assert!(
            h.events.try_recv().is_err(),
            "identical observation must not produce a diff"
        );
    }

    #[tokio::test]
    async fn partition_scoped_change_leaves_siblings_untouched() {
        let mut h = harness().await;

        // pigeonhole two keys into the same segment
        let mut by_segment: BTreeMap<String, Vec<PartitionKey>> = BTreeMap::new();
        for i in 0..64 {
            let key = PartitionKey::from(format!("bulk-{i}").as_bytes());
            by_segment.entry(key.segment(h.segments)).or_default().push(key);
        }
        let (segment, keys) = by_segment
            .into_iter()
            .find(|(_, keys)| keys.len() >= 2)
            .expect("64 keys across 8 segments must collide");
        let (first, sibling) = (keys[0].clone(), keys[1].clone());

        let change: PartitionMap = [
            (first.clone(), MemberSet::from([addr(2)])),
            (sibling.clone(), MemberSet::from([addr(3)])),
        ]
        .into();
        h.tx.send(PartitionMessage::PartitionsChanged {
            segment: segment.clone(),
            scope: RefreshScope::Segment,
            change,
        })
        .unwrap();
        let _ = next_event(&mut h.events).await;

        // a single-partition observation must not report the sibling at all
        let change: PartitionMap =
            [(first.clone(), MemberSet::from([addr(2), addr(4)]))].into();
        h.tx.send(PartitionMessage::PartitionsChanged {
            segment,
            scope: RefreshScope::Partition,
            change,
        })
        .unwrap();
        match next_event(&mut h.events).await {
            PartitionEvent::Diff { changes, .. } => {
                assert_eq!(changes.len(), 1, "only the observed partition may appear");
                assert!(changes.contains_key(&first));
            }
            other => panic!("expected diff, got {other:?}"),
        }

        // the sibling's assignment survives in the snapshot
        let (reply, mut rx) = Recipient::channel();
        h.tx.send(PartitionMessage::Query { key: sibling.clone(), tag: 1, reply }).unwrap();
        match timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap() {
            ClusterReply::Partition { members, .. } => assert_eq!(members, vec![addr(3)]),
            other => panic!("unexpected reply {other:?}"),
        }
    }

    #[tokio::test]
    async fn remove_notifies_and_deletes_subtree() {
        let mut h = harness().await;
        let key = PartitionKey::from("doomed");
        let path = key.zk_path(h.segments);

        h.tx.send(PartitionMessage::Command(PartitionCommand::Onboard {
            key: key.clone(),
            path: path.clone(),
        }))
        .unwrap();
        let _ = next_event(&mut h.events).await;

        h.tx.send(PartitionMessage::Remove { key: key.clone() }).unwrap();
        match next_event(&mut h.events).await {
            PartitionEvent::Removed { key: removed } => assert_eq!(removed, key),
            other => panic!("expected removal, got {other:?}"),
        }
        assert!(!h.service.node_exists(&path));
    }

    #[tokio::test]
    async fn order_by_age_is_creation_ordered_and_deterministic() {
        let service = MockCoordination::new();
        let client = service.client();
        let key = PartitionKey::from("ordered");
        let path = key.zk_path(8);

        // b joins before a: creation order must win over address order
        client
            .create(&format!("{path}/{}", addr(2).to_path_segment()), Bytes::new(), CreateMode::Ephemeral)
            .await
            .unwrap();
        client
            .create(&format!("{path}/{}", addr(1).to_path_segment()), Bytes::new(), CreateMode::Ephemeral)
            .await
            .unwrap();

        let members = MemberSet::from([addr(1), addr(2)]);
        let first = order_by_age(&*client, &key, &members, 8).await;
        let second = order_by_age(&*client, &key, &members, 8).await;
        assert_eq!(first, vec![addr(2), addr(1)]);
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn query_replies_from_local_snapshot() {
        let h = harness().await;
        let key = PartitionKey::from("queried");
        let segment = key.segment(h.segments);
        let change: PartitionMap = [(key.clone(), MemberSet::from([addr(3)]))].into();
        h.tx.send(PartitionMessage::PartitionsChanged {
            segment,
            scope: RefreshScope::Segment,
            change,
        })
        .unwrap();

        let (reply, mut rx) = Recipient::channel();
        h.tx.send(PartitionMessage::Query { key: key.clone(), tag: 7, reply }).unwrap();
        match timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap() {
            ClusterReply::Partition { key: k, members, path, tag } => {
                assert_eq!(k, key);
                assert_eq!(members, vec![addr(3)]);
                assert_eq!(path, key.zk_path(h.segments));
                assert_eq!(tag, 7);
            }
            other => panic!("unexpected reply {other:?}"),
        }
    }
}
