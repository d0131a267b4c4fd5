//! In-process coordination store.
//!
//! A [`MemoryCluster`] is the shared tree; every [`MemoryStore`] obtained from
//! it is an independent session. Suitable for tests and single-process
//! deployments. All state is lost when the cluster is dropped.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info};

use super::{
    CoordinationStore, Ensured, Stat, StoreError, StoreResult, Version, WatchId, WatchKind,
    WatchMode,
};
use crate::event::{EventBus, EventKind, SessionState, WatchEvent};
use crate::path;

pub type SessionId = u64;

/// Version assigned to a freshly created node.
const INITIAL_VERSION: Version = 1;

#[derive(Debug)]
struct MemNode {
    data: Vec<u8>,
    version: Version,
    owner: Option<SessionId>,
    next_sequence: u64,
}

impl MemNode {
    fn new(data: Vec<u8>, owner: Option<SessionId>) -> Self {
        Self {
            data,
            version: INITIAL_VERSION,
            owner,
            next_sequence: 0,
        }
    }

    fn stat(&self) -> Stat {
        Stat {
            version: self.version,
            ephemeral: self.owner.is_some(),
        }
    }
}

#[derive(Debug)]
struct WatchEntry {
    id: WatchId,
    session: SessionId,
    path: String,
    kind: WatchKind,
    mode: WatchMode,
}

#[derive(Debug)]
struct ClusterState {
    nodes: BTreeMap<String, MemNode>,
    sessions: HashMap<SessionId, EventBus>,
    watches: Vec<WatchEntry>,
    next_session: SessionId,
    next_watch: WatchId,
}

impl ClusterState {
    fn new() -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert("/".to_string(), MemNode::new(Vec::new(), None));
        Self {
            nodes,
            sessions: HashMap::new(),
            watches: Vec::new(),
            next_session: 1,
            next_watch: 1,
        }
    }

    fn children(&self, path: &str) -> Vec<String> {
        let prefix = path::children_prefix(path);
        self.nodes
            .range(prefix.clone()..)
            .take_while(|(key, _)| key.starts_with(&prefix))
            .filter_map(|(key, _)| {
                let rest = &key[prefix.len()..];
                (!rest.is_empty() && !rest.contains('/')).then(|| rest.to_string())
            })
            .collect()
    }

    fn has_children(&self, path: &str) -> bool {
        !self.children(path).is_empty()
    }

    /// Deliver `kind` for `path` to matching watches and drop fired one-shots.
    fn fire(&mut self, path: &str, kind: EventKind) {
        let parent = path::parent(path);
        let mut deliveries = Vec::new();

        self.watches.retain(|watch| {
            let event = match watch.kind {
                WatchKind::Node if watch.path == path => Some((path.to_string(), kind)),
                WatchKind::Children
                    if Some(watch.path.as_str()) == parent
                        && matches!(kind, EventKind::Created | EventKind::Deleted) =>
                {
                    Some((watch.path.clone(), EventKind::ChildrenChanged))
                }
                _ => None,
            };
            match event {
                Some(event) => {
                    deliveries.push((watch.session, event));
                    watch.mode == WatchMode::Persistent
                }
                None => true,
            }
        });

        for (session, (event_path, event_kind)) in deliveries {
            if let Some(bus) = self.sessions.get(&session) {
                bus.publish(event_path, event_kind);
            }
        }
    }

    /// Tear down a session: drop its ephemerals and watches, then report
    /// `state` to it.
    fn end_session(&mut self, id: SessionId, state: SessionState) {
        let Some(bus) = self.sessions.remove(&id) else {
            return;
        };
        self.watches.retain(|watch| watch.session != id);

        let owned: Vec<String> = self
            .nodes
            .iter()
            .filter(|(_, node)| node.owner == Some(id))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &owned {
            self.nodes.remove(key);
            self.fire(key, EventKind::Deleted);
        }

        debug!("Removed {} ephemeral nodes of session {}", owned.len(), id);
        bus.transition(state);
    }
}

/// Shared in-memory tree.
#[derive(Debug, Clone)]
pub struct MemoryCluster {
    state: Arc<Mutex<ClusterState>>,
}

impl MemoryCluster {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(ClusterState::new())),
        }
    }

    /// Open a new session against the cluster.
    pub async fn connect(&self) -> MemoryStore {
        let mut state = self.state.lock().await;
        let id = state.next_session;
        state.next_session += 1;

        let bus = EventBus::new();
        state.sessions.insert(id, bus.clone());
        info!("Opened in-memory session {}", id);

        MemoryStore {
            id,
            cluster: self.clone(),
            bus,
        }
    }

    /// Simulate a session whose heartbeat lapsed past its timeout.
    pub async fn expire_session(&self, id: SessionId) {
        let mut state = self.state.lock().await;
        info!("Expiring in-memory session {}", id);
        state.end_session(id, SessionState::Expired);
    }

    /// Number of watches installed across all sessions.
    pub async fn watch_count(&self) -> usize {
        self.state.lock().await.watches.len()
    }

    /// Every path currently in the tree, including `/`.
    pub async fn paths(&self) -> Vec<String> {
        self.state.lock().await.nodes.keys().cloned().collect()
    }
}

impl Default for MemoryCluster {
    fn default() -> Self {
        Self::new()
    }
}

/// One session on a [`MemoryCluster`].
#[derive(Debug)]
pub struct MemoryStore {
    id: SessionId,
    cluster: MemoryCluster,
    bus: EventBus,
}

impl MemoryStore {
    pub fn session_id(&self) -> SessionId {
        self.id
    }

    pub fn cluster(&self) -> &MemoryCluster {
        &self.cluster
    }

    fn ensure_live(&self, state: &ClusterState) -> StoreResult<()> {
        if state.sessions.contains_key(&self.id) {
            return Ok(());
        }
        match self.bus.state() {
            SessionState::Expired => Err(StoreError::SessionExpired),
            _ => Err(StoreError::SessionClosed),
        }
    }
}

fn no_node(path: &str) -> StoreError {
    StoreError::NoNode {
        path: path.to_string(),
    }
}

#[async_trait]
impl CoordinationStore for MemoryStore {
    async fn exists(&self, path: &str) -> StoreResult<Option<Stat>> {
        path::validate(path)?;
        let state = self.cluster.state.lock().await;
        self.ensure_live(&state)?;
        Ok(state.nodes.get(path).map(MemNode::stat))
    }

    async fn ensure_persistent_path(&self, path: &str) -> StoreResult<Ensured> {
        path::validate(path)?;
        let mut state = self.cluster.state.lock().await;
        self.ensure_live(&state)?;

        if state.nodes.contains_key(path) {
            return Ok(Ensured::AlreadyExisted);
        }
        let parent = path::parent(path).ok_or_else(|| no_node(path))?;
        match state.nodes.get(parent) {
            None => return Err(no_node(parent)),
            Some(node) if node.owner.is_some() => {
                return Err(StoreError::NoChildrenForEphemerals {
                    path: parent.to_string(),
                })
            }
            Some(_) => {}
        }

        state
            .nodes
            .insert(path.to_string(), MemNode::new(Vec::new(), None));
        state.fire(path, EventKind::Created);
        debug!("Created persistent node {}", path);
        Ok(Ensured::Created)
    }

    async fn create_protected_ephemeral_sequential(
        &self,
        parent: &str,
        payload: &[u8],
    ) -> StoreResult<String> {
        path::validate(parent)?;
        let token = path::new_protection_token();
        let mut state = self.cluster.state.lock().await;
        self.ensure_live(&state)?;

        let parent_node = state.nodes.get_mut(parent).ok_or_else(|| no_node(parent))?;
        if parent_node.owner.is_some() {
            return Err(StoreError::NoChildrenForEphemerals {
                path: parent.to_string(),
            });
        }
        let sequence = parent_node.next_sequence;
        parent_node.next_sequence += 1;

        let assigned = path::join(parent, &path::protected_child_name(&token, sequence));
        state
            .nodes
            .insert(assigned.clone(), MemNode::new(payload.to_vec(), Some(self.id)));
        state.fire(&assigned, EventKind::Created);
        debug!("Created ephemeral node {} in session {}", assigned, self.id);
        Ok(assigned)
    }

    async fn list_children(&self, path: &str) -> StoreResult<Vec<String>> {
        path::validate(path)?;
        let state = self.cluster.state.lock().await;
        self.ensure_live(&state)?;

        if !state.nodes.contains_key(path) {
            return Err(no_node(path));
        }
        Ok(state.children(path))
    }

    async fn get(&self, path: &str) -> StoreResult<(Vec<u8>, Stat)> {
        path::validate(path)?;
        let state = self.cluster.state.lock().await;
        self.ensure_live(&state)?;

        let node = state.nodes.get(path).ok_or_else(|| no_node(path))?;
        Ok((node.data.clone(), node.stat()))
    }

    async fn set_if_version(
        &self,
        path: &str,
        data: &[u8],
        expected: Version,
    ) -> StoreResult<Stat> {
        path::validate(path)?;
        let mut state = self.cluster.state.lock().await;
        self.ensure_live(&state)?;

        let node = state.nodes.get_mut(path).ok_or_else(|| no_node(path))?;
        if node.version != expected {
            return Err(StoreError::BadVersion {
                path: path.to_string(),
                expected,
                actual: node.version,
            });
        }
        node.data = data.to_vec();
        node.version += 1;
        let stat = node.stat();

        state.fire(path, EventKind::DataChanged);
        Ok(stat)
    }

    async fn delete_if_version(&self, path: &str, expected: Version) -> StoreResult<()> {
        path::validate(path)?;
        if path == "/" {
            return Err(StoreError::InvalidPath {
                path: path.to_string(),
                reason: "cannot delete the root".to_string(),
            });
        }
        let mut state = self.cluster.state.lock().await;
        self.ensure_live(&state)?;

        let node = state.nodes.get(path).ok_or_else(|| no_node(path))?;
        if node.version != expected {
            return Err(StoreError::BadVersion {
                path: path.to_string(),
                expected,
                actual: node.version,
            });
        }
        if state.has_children(path) {
            return Err(StoreError::NotEmpty {
                path: path.to_string(),
            });
        }

        state.nodes.remove(path);
        state.fire(path, EventKind::Deleted);
        Ok(())
    }

    async fn watch(&self, path: &str, kind: WatchKind, mode: WatchMode) -> StoreResult<WatchId> {
        path::validate(path)?;
        let mut state = self.cluster.state.lock().await;
        self.ensure_live(&state)?;

        if kind == WatchKind::Children && !state.nodes.contains_key(path) {
            return Err(no_node(path));
        }
        let id = state.next_watch;
        state.next_watch += 1;
        state.watches.push(WatchEntry {
            id,
            session: self.id,
            path: path.to_string(),
            kind,
            mode,
        });
        Ok(id)
    }

    async fn unwatch(&self, id: WatchId) -> StoreResult<()> {
        let mut state = self.cluster.state.lock().await;
        self.ensure_live(&state)?;
        state
            .watches
            .retain(|watch| !(watch.id == id && watch.session == self.id));
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<WatchEvent> {
        self.bus.subscribe()
    }

    fn session_state(&self) -> SessionState {
        self.bus.state()
    }

    async fn close(&self) -> StoreResult<()> {
        let mut state = self.cluster.state.lock().await;
        state.end_session(self.id, SessionState::Closed);
        info!("Closed in-memory session {}", self.id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_err, assert_ok};

    #[tokio::test]
    async fn test_ensure_persistent_path_is_idempotent() {
        let cluster = MemoryCluster::new();
        let store = cluster.connect().await;

        assert_eq!(store.ensure_persistent_path("/api").await.unwrap(), Ensured::Created);
        assert_eq!(
            store.ensure_persistent_path("/api").await.unwrap(),
            Ensured::AlreadyExisted
        );
    }

    #[tokio::test]
    async fn test_ensure_requires_parent() {
        let cluster = MemoryCluster::new();
        let store = cluster.connect().await;

        let err = store.ensure_persistent_path("/a/b").await.unwrap_err();
        assert!(matches!(err, StoreError::NoNode { path } if path == "/a"));
    }

    #[tokio::test]
    async fn test_sequence_is_per_parent() {
        let cluster = MemoryCluster::new();
        let store = cluster.connect().await;
        assert_ok!(store.ensure_persistent_path("/a").await);
        assert_ok!(store.ensure_persistent_path("/b").await);

        let a0 = store.create_protected_ephemeral_sequential("/a", b"x").await.unwrap();
        let a1 = store.create_protected_ephemeral_sequential("/a", b"y").await.unwrap();
        let b0 = store.create_protected_ephemeral_sequential("/b", b"z").await.unwrap();

        let seq = |p: &str| path::parse_protected(path::basename(p)).unwrap().sequence;
        assert_eq!(seq(&a0), 0);
        assert_eq!(seq(&a1), 1);
        assert_eq!(seq(&b0), 0);
    }

    #[tokio::test]
    async fn test_ephemeral_cannot_have_children() {
        let cluster = MemoryCluster::new();
        let store = cluster.connect().await;
        assert_ok!(store.ensure_persistent_path("/a").await);
        let child = store.create_protected_ephemeral_sequential("/a", b"").await.unwrap();

        let err = store.create_protected_ephemeral_sequential(&child, b"").await.unwrap_err();
        assert!(matches!(err, StoreError::NoChildrenForEphemerals { .. }));
    }

    #[tokio::test]
    async fn test_list_children_is_direct_and_sorted() {
        let cluster = MemoryCluster::new();
        let store = cluster.connect().await;
        for p in ["/a", "/a/z", "/a/m", "/a/m/deep", "/ab"] {
            assert_ok!(store.ensure_persistent_path(p).await);
        }

        assert_eq!(store.list_children("/a").await.unwrap(), vec!["m", "z"]);
        assert_eq!(store.list_children("/").await.unwrap(), vec!["a", "ab"]);
        assert_err!(store.list_children("/missing").await);
    }

    #[tokio::test]
    async fn test_versioned_set_and_delete() {
        let cluster = MemoryCluster::new();
        let store = cluster.connect().await;
        assert_ok!(store.ensure_persistent_path("/a").await);

        let (_, stat) = store.get("/a").await.unwrap();
        assert_eq!(stat.version, INITIAL_VERSION);

        let stat = store.set_if_version("/a", b"v2", stat.version).await.unwrap();
        assert_eq!(stat.version, INITIAL_VERSION + 1);

        let err = store.set_if_version("/a", b"v3", INITIAL_VERSION).await.unwrap_err();
        assert!(matches!(err, StoreError::BadVersion { actual: 2, .. }));

        let err = store.delete_if_version("/a", INITIAL_VERSION).await.unwrap_err();
        assert!(matches!(err, StoreError::BadVersion { .. }));
        assert_ok!(store.delete_if_version("/a", stat.version).await);
        assert!(store.exists("/a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_delete_with_children_fails() {
        let cluster = MemoryCluster::new();
        let store = cluster.connect().await;
        assert_ok!(store.ensure_persistent_path("/a").await);
        assert_ok!(store.ensure_persistent_path("/a/b").await);

        let err = store.delete_if_version("/a", INITIAL_VERSION).await.unwrap_err();
        assert!(matches!(err, StoreError::NotEmpty { .. }));
    }

    #[tokio::test]
    async fn test_close_removes_ephemerals_and_blocks_session() {
        let cluster = MemoryCluster::new();
        let owner = cluster.connect().await;
        let reader = cluster.connect().await;
        assert_ok!(owner.ensure_persistent_path("/a").await);
        assert_ok!(owner.create_protected_ephemeral_sequential("/a", b"x").await);

        assert_ok!(owner.close().await);

        assert!(reader.list_children("/a").await.unwrap().is_empty());
        assert!(reader.exists("/a").await.unwrap().is_some());
        assert!(matches!(
            owner.get("/a").await.unwrap_err(),
            StoreError::SessionClosed
        ));
        assert_eq!(owner.session_state(), SessionState::Closed);
        // closing twice is a no-op
        assert_ok!(owner.close().await);
    }

    #[tokio::test]
    async fn test_expired_session_reports_expiry() {
        let cluster = MemoryCluster::new();
        let store = cluster.connect().await;
        let mut events = store.subscribe();

        cluster.expire_session(store.session_id()).await;

        assert_eq!(
            events.recv().await.unwrap(),
            WatchEvent::session(SessionState::Expired)
        );
        assert!(matches!(
            store.exists("/").await.unwrap_err(),
            StoreError::SessionExpired
        ));
    }

    #[tokio::test]
    async fn test_one_shot_node_watch_fires_once() {
        let cluster = MemoryCluster::new();
        let store = cluster.connect().await;
        let mut events = store.subscribe();

        assert_ok!(store.watch("/a", WatchKind::Node, WatchMode::OneShot).await);
        assert_ok!(store.ensure_persistent_path("/a").await);
        assert_ok!(store.set_if_version("/a", b"x", INITIAL_VERSION).await);

        let event = events.recv().await.unwrap();
        assert_eq!(event.path, "/a");
        assert_eq!(event.kind, EventKind::Created);
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_persistent_children_watch() {
        let cluster = MemoryCluster::new();
        let watcher = cluster.connect().await;
        let writer = cluster.connect().await;
        assert_ok!(writer.ensure_persistent_path("/a").await);

        let mut events = watcher.subscribe();
        assert_ok!(
            watcher
                .watch("/a", WatchKind::Children, WatchMode::Persistent)
                .await
        );

        assert_ok!(writer.create_protected_ephemeral_sequential("/a", b"1").await);
        assert_ok!(writer.close().await);

        for _ in 0..2 {
            let event = events.recv().await.unwrap();
            assert_eq!(event.path, "/a");
            assert_eq!(event.kind, EventKind::ChildrenChanged);
        }
    }

    #[tokio::test]
    async fn test_unwatch_stops_delivery() {
        let cluster = MemoryCluster::new();
        let store = cluster.connect().await;
        let other = cluster.connect().await;
        assert_ok!(store.ensure_persistent_path("/a").await);
        let mut events = store.subscribe();

        let id = store
            .watch("/a", WatchKind::Children, WatchMode::Persistent)
            .await
            .unwrap();
        assert_eq!(cluster.watch_count().await, 1);

        // another session cannot remove it
        assert_ok!(other.unwatch(id).await);
        assert_eq!(cluster.watch_count().await, 1);

        assert_ok!(store.unwatch(id).await);
        assert_ok!(store.unwatch(id).await);
        assert_eq!(cluster.watch_count().await, 0);

        assert_ok!(store.create_protected_ephemeral_sequential("/a", b"1").await);
        assert!(events.try_recv().is_err());
    }
}
