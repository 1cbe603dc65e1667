//! In-memory coordination service for testing.
//!
//! This provides a full-featured in-memory implementation of the
//! [`Coordination`] trait for comprehensive testing without an external
//! coordination service: a shared znode tree, per-session ephemeral
//! ownership, one-shot watches with the real fan-out rules, a global
//! creation counter (`czxid`) and leader-latch handover. Sessions can be
//! expired explicitly to exercise failover paths.
//!
//! # Usage
//!
//! This module is available when the `test-utilities` feature is enabled,
//! or during unit tests:
//!
//! ```toml
//! [dev-dependencies]
//! menagerie = { path = ".", features = ["test-utilities"] }
//! ```
//!
//! Every [`MockCoordination::client`] call opens a new session on the same
//! shared tree, so a multi-node cluster is simulated by handing each node
//! its own client.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use super::client::{
    ClientFactory, Coordination, CoordinationError, CreateMode, LeaderLatch, NodeStat,
    SessionState, WatchEvent, WatchKind, Watcher, ZkResult,
};

const LATCH_POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Clone)]
struct NodeRecord {
    data: Bytes,
    /// Owning session for ephemerals; `None` for persistent nodes.
    owner: Option<u64>,
    czxid: u64,
}

struct LatchEntry {
    seq: u64,
    session: u64,
}

#[derive(Default)]
struct MockState {
    nodes: BTreeMap<String, NodeRecord>,
    data_watches: HashMap<String, Vec<Watcher>>,
    child_watches: HashMap<String, Vec<Watcher>>,
    latches: HashMap<String, Vec<LatchEntry>>,
    listeners: HashMap<u64, Vec<mpsc::UnboundedSender<SessionState>>>,
    next_zxid: u64,
    next_session: u64,
}

/// A watcher together with the event it must receive once the state lock is
/// released.
type Fired = Vec<(Watcher, WatchEvent)>;

fn parent_of(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) | None => "",
        Some(i) => &path[..i],
    }
}

fn leaf_of(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

impl MockState {
    fn next_zxid(&mut self) -> u64 {
        self.next_zxid += 1;
        self.next_zxid
    }

    fn exists(&self, path: &str) -> bool {
        path.is_empty() || self.nodes.contains_key(path)
    }

    fn drain_data_watches(&mut self, path: &str, kind: WatchKind, fired: &mut Fired) {
        if let Some(watchers) = self.data_watches.remove(path) {
            let event = WatchEvent { kind, path: path.to_string() };
            fired.extend(watchers.into_iter().map(|w| (w, event.clone())));
        }
    }

    fn drain_child_watches(&mut self, path: &str, kind: WatchKind, fired: &mut Fired) {
        if let Some(watchers) = self.child_watches.remove(path) {
            let event = WatchEvent { kind, path: path.to_string() };
            fired.extend(watchers.into_iter().map(|w| (w, event.clone())));
        }
    }

    /// Insert one node, assuming ancestors exist. Fires the creation events.
    fn insert(&mut self, path: &str, record: NodeRecord, fired: &mut Fired) {
        self.nodes.insert(path.to_string(), record);
        self.drain_data_watches(path, WatchKind::NodeCreated, fired);
        let parent = parent_of(path);
        if !parent.is_empty() {
            self.drain_child_watches(parent, WatchKind::NodeChildrenChanged, fired);
        }
    }

    /// Create missing ancestors as empty persistent nodes.
    fn materialize_ancestors(&mut self, path: &str, fired: &mut Fired) {
        let mut prefix = String::new();
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            prefix.push('/');
            prefix.push_str(segment);
            if prefix == path || self.nodes.contains_key(&prefix) {
                continue;
            }
            let record = NodeRecord {
                data: Bytes::new(),
                owner: None,
                czxid: self.next_zxid(),
            };
            self.insert(&prefix, record, fired);
        }
    }

    fn remove(&mut self, path: &str, fired: &mut Fired) {
        if self.nodes.remove(path).is_none() {
            return;
        }
        self.drain_data_watches(path, WatchKind::NodeDeleted, fired);
        self.drain_child_watches(path, WatchKind::NodeDeleted, fired);
        let parent = parent_of(path);
        if !parent.is_empty() && self.exists(parent) {
            self.drain_child_watches(parent, WatchKind::NodeChildrenChanged, fired);
        }
    }

    fn child_names(&self, path: &str) -> Vec<String> {
        let prefix = format!("{path}/");
        self.nodes
            .range(prefix.clone()..)
            .take_while(|(p, _)| p.starts_with(&prefix))
            .filter(|(p, _)| !p[prefix.len()..].contains('/'))
            .map(|(p, _)| leaf_of(p).to_string())
            .collect()
    }

    fn subtree(&self, path: &str) -> Vec<String> {
        let prefix = format!("{path}/");
        let mut paths: Vec<String> = self
            .nodes
            .range(prefix.clone()..)
            .take_while(|(p, _)| p.starts_with(&prefix))
            .map(|(p, _)| p.clone())
            .collect();
        if self.nodes.contains_key(path) {
            paths.push(path.to_string());
        }
        // deepest first
        paths.sort_by_key(|p| std::cmp::Reverse(p.matches('/').count()));
        paths
    }

    fn latch_holder(&self, path: &str) -> Option<u64> {
        self.latches
            .get(path)
            .and_then(|entries| entries.iter().min_by_key(|e| e.seq))
            .map(|e| e.seq)
    }
}

/// Shared in-memory coordination service.
///
/// Clone the `Arc` freely; all clients observe the same tree.
#[derive(Default)]
pub struct MockCoordination {
    state: Arc<Mutex<MockState>>,
}

impl MockCoordination {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Open a new session on the shared tree.
    pub fn client(self: &Arc<Self>) -> Arc<MockClient> {
        let session = {
            let mut state = self.state.lock().unwrap();
            state.next_session += 1;
            state.next_session
        };
        Arc::new(MockClient { state: Arc::clone(&self.state), session })
    }

    /// Expire a session: ephemeral nodes vanish, latch participation is
    /// withdrawn, and the session's listeners observe `Lost`.
    pub fn expire_session(&self, session: u64) {
        let (fired, listeners) = {
            let mut state = self.state.lock().unwrap();
            let mut fired = Fired::new();
            for entries in state.latches.values_mut() {
                entries.retain(|e| e.session != session);
            }
            let owned: Vec<String> = state
                .nodes
                .iter()
                .filter(|(_, n)| n.owner == Some(session))
                .map(|(p, _)| p.clone())
                .collect();
            for path in owned {
                state.remove(&path, &mut fired);
            }
            let listeners = state.listeners.remove(&session).unwrap_or_default();
            (fired, listeners)
        };
        deliver(fired);
        for listener in listeners {
            let _ = listener.send(SessionState::Lost);
        }
    }

    /// Number of live nodes, for test assertions.
    pub fn node_count(&self) -> usize {
        self.state.lock().unwrap().nodes.len()
    }

    /// Raw node data, for test assertions.
    pub fn node_data(&self, path: &str) -> Option<Bytes> {
        self.state.lock().unwrap().nodes.get(path).map(|n| n.data.clone())
    }

    /// Whether a node exists, for test assertions.
    pub fn node_exists(&self, path: &str) -> bool {
        self.state.lock().unwrap().nodes.contains_key(path)
    }
}

fn deliver(fired: Fired) {
    for (watcher, event) in fired {
        watcher(event);
    }
}

/// One session on a [`MockCoordination`] tree.
pub struct MockClient {
    state: Arc<Mutex<MockState>>,
    session: u64,
}

impl MockClient {
    pub fn session_id(&self) -> u64 {
        self.session
    }
}

#[async_trait]
impl Coordination for MockClient {
    async fn create(&self, path: &str, data: Bytes, mode: CreateMode) -> ZkResult<()> {
        let fired = {
            let mut state = self.state.lock().unwrap();
            if state.nodes.contains_key(path) {
                return Err(CoordinationError::NodeExists(path.to_string()));
            }
            let mut fired = Fired::new();
            state.materialize_ancestors(path, &mut fired);
            let record = NodeRecord {
                data,
                owner: (mode == CreateMode::Ephemeral).then_some(self.session),
                czxid: state.next_zxid(),
            };
            state.insert(path, record, &mut fired);
            fired
        };
        deliver(fired);
        Ok(())
    }

    async fn guarantee(&self, path: &str, data: Bytes, mode: CreateMode) -> ZkResult<()> {
        let fired = {
            let mut state = self.state.lock().unwrap();
            let mut fired = Fired::new();
            match state.nodes.get(path).map(|n| n.data == data) {
                Some(true) => {}
                Some(false) => {
                    if let Some(node) = state.nodes.get_mut(path) {
                        node.data = data;
                    }
                    state.drain_data_watches(path, WatchKind::NodeDataChanged, &mut fired);
                }
                None => {
                    state.materialize_ancestors(path, &mut fired);
                    let record = NodeRecord {
                        data,
                        owner: (mode == CreateMode::Ephemeral).then_some(self.session),
                        czxid: state.next_zxid(),
                    };
                    state.insert(path, record, &mut fired);
                }
            }
            fired
        };
        deliver(fired);
        Ok(())
    }

    async fn set_data(&self, path: &str, data: Bytes) -> ZkResult<()> {
        let fired = {
            let mut state = self.state.lock().unwrap();
            let Some(node) = state.nodes.get_mut(path) else {
                return Err(CoordinationError::NoNode(path.to_string()));
            };
            node.data = data;
            let mut fired = Fired::new();
            state.drain_data_watches(path, WatchKind::NodeDataChanged, &mut fired);
            fired
        };
        deliver(fired);
        Ok(())
    }

    async fn get_data(&self, path: &str, watch: Option<Watcher>) -> ZkResult<Option<Bytes>> {
        let mut state = self.state.lock().unwrap();
        if let Some(watcher) = watch {
            state.data_watches.entry(path.to_string()).or_default().push(watcher);
        }
        Ok(state.nodes.get(path).map(|n| n.data.clone()))
    }

    async fn children(&self, path: &str, watch: Option<Watcher>) -> ZkResult<Vec<String>> {
        let mut state = self.state.lock().unwrap();
        if !state.exists(path) {
            return Err(CoordinationError::NoNode(path.to_string()));
        }
        if let Some(watcher) = watch {
            state.child_watches.entry(path.to_string()).or_default().push(watcher);
        }
        Ok(state.child_names(path))
    }

    async fn stat(&self, path: &str) -> ZkResult<Option<NodeStat>> {
        let state = self.state.lock().unwrap();
        Ok(state.nodes.get(path).map(|n| NodeStat {
            czxid: n.czxid,
            ephemeral_owner: n.owner,
        }))
    }

    async fn delete(&self, path: &str) -> ZkResult<()> {
        let fired = {
            let mut state = self.state.lock().unwrap();
            if !state.nodes.contains_key(path) {
                return Err(CoordinationError::NoNode(path.to_string()));
            }
            if !state.child_names(path).is_empty() {
                return Err(CoordinationError::NotEmpty(path.to_string()));
            }
            let mut fired = Fired::new();
            state.remove(path, &mut fired);
            fired
        };
        deliver(fired);
        Ok(())
    }

    async fn safely_discard(&self, path: &str) -> ZkResult<()> {
        let fired = {
            let mut state = self.state.lock().unwrap();
            let mut fired = Fired::new();
            for doomed in state.subtree(path) {
                state.remove(&doomed, &mut fired);
            }
            fired
        };
        deliver(fired);
        Ok(())
    }

    async fn leader_latch(&self, path: &str) -> ZkResult<Box<dyn LeaderLatch>> {
        let seq = {
            let mut state = self.state.lock().unwrap();
            let seq = state.next_zxid();
            state
                .latches
                .entry(path.to_string())
                .or_default()
                .push(LatchEntry { seq, session: self.session });
            seq
        };
        Ok(Box::new(MockLatch {
            state: Arc::clone(&self.state),
            path: path.to_string(),
            seq,
            closed: AtomicBool::new(false),
        }))
    }

    async fn subscribe_session(&self, listener: mpsc::UnboundedSender<SessionState>) {
        let mut state = self.state.lock().unwrap();
        state.listeners.entry(self.session).or_default().push(listener);
    }
}

struct MockLatch {
    state: Arc<Mutex<MockState>>,
    path: String,
    seq: u64,
    closed: AtomicBool,
}

#[async_trait]
impl LeaderLatch for MockLatch {
    async fn acquire(&self, wait: Duration) -> ZkResult<bool> {
        let deadline = Instant::now() + wait;
        loop {
            if self.closed.load(Ordering::Acquire) {
                return Ok(false);
            }
            if self.has_leadership() {
                return Ok(true);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(false);
            }
            tokio::time::sleep(remaining.min(LATCH_POLL_INTERVAL)).await;
        }
    }

    fn has_leadership(&self) -> bool {
        let state = self.state.lock().unwrap();
        state.latch_holder(&self.path) == Some(self.seq)
    }

    async fn close(&self) -> ZkResult<()> {
        self.closed.store(true, Ordering::Release);
        let mut state = self.state.lock().unwrap();
        if let Some(entries) = state.latches.get_mut(&self.path) {
            entries.retain(|e| e.seq != self.seq);
        }
        Ok(())
    }
}

/// [`ClientFactory`] over a shared mock service: each `connect` opens a
/// fresh session, mirroring client reconstruction after a lost session.
pub struct MockClientFactory {
    service: Arc<MockCoordination>,
}

impl MockClientFactory {
    pub fn new(service: Arc<MockCoordination>) -> Self {
        Self { service }
    }
}

#[async_trait]
impl ClientFactory for MockClientFactory {
    async fn connect(&self) -> ZkResult<Arc<dyn Coordination>> {
        Ok(self.service.client() as Arc<dyn Coordination>)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counting_watcher() -> (Watcher, Arc<AtomicUsize>) {
        let count = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&count);
        let watcher: Watcher = Arc::new(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        });
        (watcher, count)
    }

    #[tokio::test]
    async fn guarantee_is_idempotent() {
        let service = MockCoordination::new();
        let client = service.client();
        client.guarantee("/a/b", Bytes::from_static(b"x"), CreateMode::Persistent).await.unwrap();
        client.guarantee("/a/b", Bytes::from_static(b"x"), CreateMode::Persistent).await.unwrap();
        assert_eq!(client.get_data("/a/b", None).await.unwrap(), Some(Bytes::from_static(b"x")));
        // overwrite on differing data
        client.guarantee("/a/b", Bytes::from_static(b"y"), CreateMode::Persistent).await.unwrap();
        assert_eq!(client.get_data("/a/b", None).await.unwrap(), Some(Bytes::from_static(b"y")));
    }

    #[tokio::test]
    async fn create_fails_on_existing_node() {
        let service = MockCoordination::new();
        let client = service.client();
        client.create("/n", Bytes::new(), CreateMode::Persistent).await.unwrap();
        let err = client.create("/n", Bytes::new(), CreateMode::Persistent).await.unwrap_err();
        assert_eq!(err, CoordinationError::NodeExists("/n".to_string()));
    }

    #[tokio::test]
    async fn child_watch_fires_once_per_arm() {
        let service = MockCoordination::new();
        let client = service.client();
        client.create("/parent", Bytes::new(), CreateMode::Persistent).await.unwrap();
        let (watcher, count) = counting_watcher();
        client.children("/parent", Some(watcher)).await.unwrap();

        client.create("/parent/a", Bytes::new(), CreateMode::Persistent).await.unwrap();
        client.create("/parent/b", Bytes::new(), CreateMode::Persistent).await.unwrap();
        // one-shot: second create must not re-fire
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn data_watch_on_absent_node_fires_on_creation() {
        let service = MockCoordination::new();
        let client = service.client();
        let (watcher, count) = counting_watcher();
        assert_eq!(client.get_data("/later", Some(watcher)).await.unwrap(), None);
        client.create("/later", Bytes::from_static(b"v"), CreateMode::Persistent).await.unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn expire_session_removes_ephemerals_and_fires_watches() {
        let service = MockCoordination::new();
        let a = service.client();
        let b = service.client();
        a.create("/members/a", Bytes::new(), CreateMode::Ephemeral).await.unwrap();

        let (watcher, count) = counting_watcher();
        b.children("/members", Some(watcher)).await.unwrap();

        service.expire_session(a.session_id());
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(!service.node_exists("/members/a"));
    }

    #[tokio::test]
    async fn latch_hands_over_on_expiry() {
        let service = MockCoordination::new();
        let a = service.client();
        let b = service.client();
        let latch_a = a.leader_latch("/leadership").await.unwrap();
        let latch_b = b.leader_latch("/leadership").await.unwrap();

        assert!(latch_a.acquire(Duration::from_millis(50)).await.unwrap());
        assert!(!latch_b.acquire(Duration::from_millis(50)).await.unwrap());

        service.expire_session(a.session_id());
        assert!(latch_b.acquire(Duration::from_millis(200)).await.unwrap());
    }

    #[tokio::test]
    async fn czxid_orders_creations() {
        let service = MockCoordination::new();
        let client = service.client();
        client.create("/first", Bytes::new(), CreateMode::Persistent).await.unwrap();
        client.create("/second", Bytes::new(), CreateMode::Persistent).await.unwrap();
        let first = client.stat("/first").await.unwrap().unwrap();
        let second = client.stat("/second").await.unwrap().unwrap();
        assert!(first.czxid < second.czxid);
    }

    #[tokio::test]
    async fn safely_discard_is_recursive_and_forgiving() {
        let service = MockCoordination::new();
        let client = service.client();
        client.create("/t/a/b", Bytes::new(), CreateMode::Persistent).await.unwrap();
        client.safely_discard("/t").await.unwrap();
        assert!(!service.node_exists("/t"));
        // missing node is not an error
        client.safely_discard("/t").await.unwrap();
    }

    #[tokio::test]
    async fn session_listener_observes_lost() {
        let service = MockCoordination::new();
        let client = service.client();
        let (tx, mut rx) = mpsc::unbounded_channel();
        client.subscribe_session(tx).await;
        service.expire_session(client.session_id());
        assert_eq!(rx.recv().await, Some(SessionState::Lost));
    }
}
