use std::collections::HashMap;

use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::RegistryConfig;
use crate::error::{RegistryError, Result};
use crate::event::{EventKind, SessionState, WatchEvent};
use crate::path;
use crate::service::ServiceNode;
use crate::store::{
    CoordinationStore, EtcdStore, Ensured, StoreError, Version, WatchId, WatchKind, WatchMode,
};

/// ServiceRegistry registers and discovers service endpoints stored as
/// ephemeral nodes under a namespace root:
///
/// ```text
/// /<root>                          persistent, empty
/// /<root>/<service>                persistent, empty
/// /<root>/<service>/_c_<token>-n<seq>   ephemeral, JSON ServiceNode
/// ```
///
/// Endpoints live as long as the registry's session. Closing the registry
/// (or losing the session) deregisters every endpoint it created.
pub struct ServiceRegistry<S = EtcdStore> {
    store: S,
    root: String,
    service_watches: Mutex<HashMap<String, ServiceWatch>>,
}

/// One children watch per service path, shared by every holder.
struct ServiceWatch {
    id: WatchId,
    holders: usize,
}

impl ServiceRegistry<EtcdStore> {
    /// Connect to etcd and prepare the namespace root.
    pub async fn connect(config: &RegistryConfig) -> Result<Self> {
        config.validate()?;
        let store = EtcdStore::connect(config).await?;
        Self::with_store(store, config.root_path.clone()).await
    }
}

impl<S: CoordinationStore> ServiceRegistry<S> {
    /// Wrap an open store session. The root (and each of its ancestors) is
    /// created if missing; on failure the session is closed.
    pub async fn with_store(store: S, root: impl Into<String>) -> Result<Self> {
        let root = root.into();
        path::validate(&root)?;

        let registry = Self {
            store,
            root,
            service_watches: Mutex::new(HashMap::new()),
        };
        if let Err(e) = registry.initialize().await {
            if let Err(close_err) = registry.store.close().await {
                warn!("Failed to close session after init error: {}", close_err);
            }
            return Err(e);
        }
        Ok(registry)
    }

    async fn initialize(&self) -> Result<()> {
        for ancestor in path::lineage(&self.root) {
            self.ensure_path(&ancestor).await?;
        }
        info!("Service registry ready at {}", self.root);
        Ok(())
    }

    async fn ensure_path(&self, path: &str) -> Result<()> {
        match self.store.ensure_persistent_path(path).await? {
            Ensured::Created => debug!("Created {}", path),
            Ensured::AlreadyExisted => debug!("{} already exists", path),
        }
        Ok(())
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn session_state(&self) -> SessionState {
        self.store.session_state()
    }

    /// Path of the parent node holding every endpoint of `name`.
    pub fn service_path(&self, name: &str) -> Result<String> {
        path::validate_name(name)?;
        Ok(path::join(&self.root, name))
    }

    /// Resolve a caller path: absolute paths must lie below the root,
    /// relative ones are taken from the root.
    pub fn resolve(&self, target: &str) -> Result<String> {
        let full = if target.starts_with('/') {
            target.to_string()
        } else {
            path::join(&self.root, target)
        };
        path::validate(&full)?;

        if full == self.root || !full.starts_with(&path::children_prefix(&self.root)) {
            return Err(RegistryError::InvalidPath {
                path: full,
                reason: format!("not below {}", self.root),
            });
        }
        Ok(full)
    }

    /// Register an endpoint, returning its assigned path.
    ///
    /// Each call creates a new entry, even for an identical node.
    pub async fn register(&self, node: &ServiceNode) -> Result<String> {
        let service_path = self.service_path(&node.name)?;
        self.ensure_path(&service_path).await?;

        let payload = node.to_bytes()?;
        let assigned = self
            .store
            .create_protected_ephemeral_sequential(&service_path, &payload)
            .await?;

        info!(
            "Service {} registered at {} ({}:{})",
            node.name, assigned, node.host, node.port
        );
        Ok(assigned)
    }

    /// Child names under the service path. A service nobody registered yet
    /// has no children.
    pub async fn get_children(&self, name: &str) -> Result<Vec<String>> {
        let service_path = self.service_path(name)?;
        match self.store.list_children(&service_path).await {
            Ok(children) => Ok(children),
            Err(StoreError::NoNode { .. }) => {
                debug!("No providers registered for {}", name);
                Ok(Vec::new())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Every live endpoint of `name`, in child order.
    pub async fn get_nodes(&self, name: &str) -> Result<Vec<ServiceNode>> {
        let service_path = self.service_path(name)?;
        let children = self.get_children(name).await?;

        let mut nodes = Vec::with_capacity(children.len());
        for child in children {
            let child_path = path::join(&service_path, &child);
            match self.store.get(&child_path).await {
                Ok((data, _)) => nodes.push(ServiceNode::from_bytes(&data)?),
                Err(StoreError::NoNode { .. }) => {
                    debug!("{} deregistered while listing", child_path);
                }
                Err(e) => return Err(e.into()),
            }
        }

        info!("Found {} instances of service {}", nodes.len(), name);
        Ok(nodes)
    }

    /// Read one endpoint and its current version.
    pub async fn get_node(&self, target: &str) -> Result<(ServiceNode, Version)> {
        let full = self.resolve(target)?;
        let (data, stat) = self.store.get(&full).await?;
        Ok((ServiceNode::from_bytes(&data)?, stat.version))
    }

    /// Replace an endpoint's record at whatever version is current.
    ///
    /// A concurrent writer between the read and the write makes this fail
    /// with [`RegistryError::VersionConflict`]; it is not retried.
    pub async fn modify(&self, target: &str, node: &ServiceNode) -> Result<Version> {
        let full = self.resolve(target)?;
        let (_, stat) = self.store.get(&full).await?;
        self.write_node(&full, node, stat.version).await
    }

    /// Replace an endpoint's record only if it is still at `expected`.
    pub async fn modify_if_version(
        &self,
        target: &str,
        node: &ServiceNode,
        expected: Version,
    ) -> Result<Version> {
        let full = self.resolve(target)?;
        self.write_node(&full, node, expected).await
    }

    async fn write_node(&self, full: &str, node: &ServiceNode, expected: Version) -> Result<Version> {
        let payload = node.to_bytes()?;
        let stat = self.store.set_if_version(full, &payload, expected).await?;
        debug!("Modified {} (version {} -> {})", full, expected, stat.version);
        Ok(stat.version)
    }

    /// Delete an endpoint or an empty service path at its current version.
    pub async fn delete(&self, target: &str) -> Result<()> {
        let full = self.resolve(target)?;
        let (_, stat) = self.store.get(&full).await?;
        self.store.delete_if_version(&full, stat.version).await?;
        info!("Deleted {}", full);
        Ok(())
    }

    /// Install a watch on a path below the root.
    pub async fn watch(&self, target: &str, kind: WatchKind, mode: WatchMode) -> Result<WatchId> {
        let full = self.resolve(target)?;
        Ok(self.store.watch(&full, kind, mode).await?)
    }

    pub async fn unwatch(&self, id: WatchId) -> Result<()> {
        self.store.unwatch(id).await?;
        Ok(())
    }

    /// Watch the endpoint list of `name`. The receiver carries every event of
    /// this session; the ones for this service have the service path.
    ///
    /// Calls for the same service share one store watch. Each call must be
    /// paired with [`unwatch_service`](Self::unwatch_service).
    pub async fn watch_service(&self, name: &str) -> Result<broadcast::Receiver<WatchEvent>> {
        let service_path = self.service_path(name)?;
        self.ensure_path(&service_path).await?;

        let events = self.store.subscribe();
        let mut watches = self.service_watches.lock().await;
        match watches.get_mut(&service_path) {
            Some(watch) => {
                watch.holders += 1;
                debug!("Service {} already watched ({} holders)", name, watch.holders);
            }
            None => {
                let id = self
                    .store
                    .watch(&service_path, WatchKind::Children, WatchMode::Persistent)
                    .await?;
                watches.insert(service_path, ServiceWatch { id, holders: 1 });
                info!("Watching service: {}", name);
            }
        }
        Ok(events)
    }

    /// Release one [`watch_service`](Self::watch_service) hold on `name`. The
    /// store watch goes away with the last holder.
    pub async fn unwatch_service(&self, name: &str) -> Result<()> {
        let service_path = self.service_path(name)?;
        let mut watches = self.service_watches.lock().await;
        let Some(watch) = watches.get_mut(&service_path) else {
            return Ok(());
        };
        watch.holders -= 1;
        if watch.holders > 0 {
            return Ok(());
        }

        let id = watch.id;
        watches.remove(&service_path);
        self.store.unwatch(id).await?;
        info!("Stopped watching service: {}", name);
        Ok(())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WatchEvent> {
        self.store.subscribe()
    }

    /// Run `handler` for every event of this session on a background task.
    /// The task ends once the session is closed or expired.
    ///
    /// Handlers share one delivery task and should hand long work off.
    pub fn on_change<F>(&self, handler: F) -> JoinHandle<()>
    where
        F: Fn(&WatchEvent) + Send + Sync + 'static,
    {
        let mut events = self.store.subscribe();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => {
                        let done = event.kind == EventKind::Session && event.state.is_terminal();
                        handler(&event);
                        if done {
                            break;
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("Change handler lagged, {} events dropped", skipped);
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }

    /// End the session. Every endpoint registered through it disappears.
    pub async fn close(&self) -> Result<()> {
        info!("Closing service registry at {}", self.root);
        self.service_watches.lock().await.clear();
        self.store.close().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryCluster, MemoryStore, Stat, StoreResult};
    use async_trait::async_trait;
    use tokio_test::assert_ok;

    async fn registry(root: &str) -> ServiceRegistry<MemoryStore> {
        let cluster = MemoryCluster::new();
        ServiceRegistry::with_store(cluster.connect().await, root)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_nested_root_is_created_level_by_level() {
        let registry = registry("/a/b/c").await;
        let paths = registry.store().cluster().paths().await;
        for p in ["/a", "/a/b", "/a/b/c"] {
            assert!(paths.contains(&p.to_string()), "missing {p}");
        }
    }

    #[tokio::test]
    async fn test_invalid_root_is_rejected() {
        let cluster = MemoryCluster::new();
        let result = ServiceRegistry::with_store(cluster.connect().await, "api").await;
        assert!(matches!(result, Err(RegistryError::InvalidPath { .. })));
    }

    #[tokio::test]
    async fn test_resolve() {
        let registry = registry("/api").await;

        assert_eq!(registry.resolve("db").unwrap(), "/api/db");
        assert_eq!(registry.resolve("db/_c_x-n0000000001").unwrap(), "/api/db/_c_x-n0000000001");
        assert_eq!(registry.resolve("/api/db").unwrap(), "/api/db");

        assert!(registry.resolve("/api").is_err());
        assert!(registry.resolve("/apix/db").is_err());
        assert!(registry.resolve("/other/db").is_err());
        assert!(registry.resolve("db/").is_err());
    }

    #[tokio::test]
    async fn test_register_returns_protected_path() {
        let registry = registry("/api").await;
        let assigned = registry
            .register(&ServiceNode::new("db", "127.0.0.1", 4000))
            .await
            .unwrap();

        assert_eq!(path::parent(&assigned), Some("/api/db"));
        let parsed = path::parse_protected(path::basename(&assigned)).unwrap();
        assert_eq!(parsed.sequence, 0);
    }

    #[tokio::test]
    async fn test_service_name_must_be_single_component() {
        let registry = registry("/api").await;
        let err = registry
            .register(&ServiceNode::new("db/x", "127.0.0.1", 4000))
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::InvalidPath { .. }));
    }

    #[tokio::test]
    async fn test_modify_missing_node() {
        let registry = registry("/api").await;
        let err = registry
            .modify("db/nothing", &ServiceNode::new("db", "h", 1))
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::PathMissing { .. }));
    }

    #[tokio::test]
    async fn test_malformed_record_is_surfaced() {
        let registry = registry("/api").await;
        assert_ok!(registry.store().ensure_persistent_path("/api/db").await);
        // a persistent child with empty content is not a ServiceNode
        assert_ok!(registry.store().ensure_persistent_path("/api/db/stray").await);

        let err = registry.get_nodes("db").await.unwrap_err();
        assert!(matches!(err, RegistryError::SerializationError(_)));
    }

    #[tokio::test]
    async fn test_service_watch_is_shared_between_holders() {
        let registry = registry("/api").await;
        let cluster = registry.store().cluster().clone();

        assert_ok!(registry.watch_service("db").await);
        assert_ok!(registry.watch_service("db").await);
        assert_ok!(registry.watch_service("img").await);
        assert_eq!(cluster.watch_count().await, 2);

        assert_ok!(registry.unwatch_service("db").await);
        assert_eq!(cluster.watch_count().await, 2);
        assert_ok!(registry.unwatch_service("db").await);
        assert_eq!(cluster.watch_count().await, 1);

        // releasing a service nobody watches is a no-op
        assert_ok!(registry.unwatch_service("db").await);
        assert_eq!(cluster.watch_count().await, 1);
    }

    #[tokio::test]
    async fn test_unwatch_removes_path_watch() {
        let registry = registry("/api").await;
        let cluster = registry.store().cluster().clone();
        let assigned = registry
            .register(&ServiceNode::new("db", "127.0.0.1", 4000))
            .await
            .unwrap();

        let id = registry
            .watch(&assigned, WatchKind::Node, WatchMode::Persistent)
            .await
            .unwrap();
        assert_eq!(cluster.watch_count().await, 1);
        assert_ok!(registry.unwatch(id).await);
        assert_eq!(cluster.watch_count().await, 0);
    }

    /// Reports one child as gone on read, as if it was deregistered between
    /// listing and reading, and can fail every call with a chosen error.
    struct RacingStore {
        inner: MemoryStore,
        vanished: std::sync::Mutex<Option<String>>,
        fail_reads_expired: bool,
    }

    #[async_trait]
    impl CoordinationStore for RacingStore {
        async fn exists(&self, path: &str) -> StoreResult<Option<Stat>> {
            self.inner.exists(path).await
        }

        async fn ensure_persistent_path(&self, path: &str) -> StoreResult<Ensured> {
            self.inner.ensure_persistent_path(path).await
        }

        async fn create_protected_ephemeral_sequential(
            &self,
            parent: &str,
            payload: &[u8],
        ) -> StoreResult<String> {
            self.inner
                .create_protected_ephemeral_sequential(parent, payload)
                .await
        }

        async fn list_children(&self, path: &str) -> StoreResult<Vec<String>> {
            if self.fail_reads_expired {
                return Err(StoreError::SessionExpired);
            }
            self.inner.list_children(path).await
        }

        async fn get(&self, path: &str) -> StoreResult<(Vec<u8>, Stat)> {
            let vanished = self.vanished.lock().unwrap().clone();
            if vanished.as_deref() == Some(path) {
                return Err(StoreError::NoNode {
                    path: path.to_string(),
                });
            }
            self.inner.get(path).await
        }

        async fn set_if_version(
            &self,
            path: &str,
            data: &[u8],
            expected: Version,
        ) -> StoreResult<Stat> {
            self.inner.set_if_version(path, data, expected).await
        }

        async fn delete_if_version(&self, path: &str, expected: Version) -> StoreResult<()> {
            self.inner.delete_if_version(path, expected).await
        }

        async fn watch(
            &self,
            path: &str,
            kind: WatchKind,
            mode: WatchMode,
        ) -> StoreResult<WatchId> {
            self.inner.watch(path, kind, mode).await
        }

        async fn unwatch(&self, id: WatchId) -> StoreResult<()> {
            self.inner.unwatch(id).await
        }

        fn subscribe(&self) -> broadcast::Receiver<WatchEvent> {
            self.inner.subscribe()
        }

        fn session_state(&self) -> SessionState {
            self.inner.session_state()
        }

        async fn close(&self) -> StoreResult<()> {
            self.inner.close().await
        }
    }

    #[tokio::test]
    async fn test_child_vanishing_during_listing_is_skipped() {
        let cluster = MemoryCluster::new();
        let store = RacingStore {
            inner: cluster.connect().await,
            vanished: std::sync::Mutex::new(None),
            fail_reads_expired: false,
        };
        let registry = ServiceRegistry::with_store(store, "/api").await.unwrap();

        let gone = registry
            .register(&ServiceNode::new("db", "127.0.0.1", 4000))
            .await
            .unwrap();
        assert_ok!(
            registry
                .register(&ServiceNode::new("db", "127.0.0.1", 4001))
                .await
        );
        *registry.store().vanished.lock().unwrap() = Some(gone);

        let nodes = registry.get_nodes("db").await.unwrap();
        assert_eq!(nodes, vec![ServiceNode::new("db", "127.0.0.1", 4001)]);
    }

    #[tokio::test]
    async fn test_only_missing_path_is_suppressed_on_list() {
        let cluster = MemoryCluster::new();
        let store = RacingStore {
            inner: cluster.connect().await,
            vanished: std::sync::Mutex::new(None),
            fail_reads_expired: true,
        };
        let registry = ServiceRegistry::with_store(store, "/api").await.unwrap();

        let err = registry.get_nodes("db").await.unwrap_err();
        assert!(matches!(err, RegistryError::SessionExpired));
        assert!(err.is_session_lost());
    }

    #[tokio::test]
    async fn test_on_change_stops_after_close() {
        let registry = registry("/api").await;
        let seen = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = seen.clone();

        let handle = registry.on_change(move |event| sink.lock().unwrap().push(event.clone()));
        assert_ok!(registry.close().await);
        assert_ok!(handle.await);

        let seen = seen.lock().unwrap();
        assert_eq!(seen.last(), Some(&WatchEvent::session(SessionState::Closed)));
    }
}
