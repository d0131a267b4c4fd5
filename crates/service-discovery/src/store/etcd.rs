//! etcd v3 backend.
//!
//! The hierarchical node model maps onto etcd as follows:
//! - every node is a key equal to its path, `/` itself is implicit
//! - the session is a lease; ephemeral nodes are put with that lease
//! - versions are etcd key versions (1 right after creation)
//! - sequence counters live under [`SEQUENCE_KEY_PREFIX`], outside the `/`
//!   namespace, and are advanced in the same transaction as the child put

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use etcd_client::{
    Client, Compare, CompareOp, ConnectOptions, EventType, GetOptions, KeyValue, LeaseKeepAliveStream,
    LeaseKeeper, PutOptions, Txn, TxnOp, TxnOpResponse, WatchOptions, WatchStream, Watcher,
};
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tonic::Code;
use tracing::{debug, error, info, warn};

use super::{
    CoordinationStore, Ensured, Stat, StoreError, StoreResult, Version, WatchId, WatchKind,
    WatchMode,
};
use crate::config::RegistryConfig;
use crate::event::{EventBus, EventKind, SessionState, WatchEvent};
use crate::path;

pub const SEQUENCE_KEY_PREFIX: &str = "__seq__";

/// Attempts at a protected create before a lost response is returned.
const PROTECTED_CREATE_ATTEMPTS: usize = 3;

fn sequence_key(parent: &str) -> String {
    format!("{SEQUENCE_KEY_PREFIX}{parent}")
}

fn stat_of(kv: &KeyValue) -> Stat {
    Stat {
        version: kv.version(),
        ephemeral: kv.lease() != 0,
    }
}

fn first_kv(resp: Option<TxnOpResponse>) -> Option<KeyValue> {
    match resp {
        Some(TxnOpResponse::Get(mut get)) => get.take_kvs().into_iter().next(),
        _ => None,
    }
}

fn no_node(path: &str) -> StoreError {
    StoreError::NoNode {
        path: path.to_string(),
    }
}

/// Name of `key` relative to `prefix` when it is a direct child.
fn direct_child<'a>(prefix: &str, key: &'a str) -> Option<&'a str> {
    let rest = key.strip_prefix(prefix)?;
    (!rest.is_empty() && !rest.contains('/')).then_some(rest)
}

/// Whether a request may have been applied even though it failed: the
/// connection dropped or the deadline passed before the response arrived.
fn is_lost_response(err: &StoreError) -> bool {
    match err {
        StoreError::Backend(etcd_client::Error::TransportError(_)) => true,
        StoreError::Backend(etcd_client::Error::GRpcStatus(status)) => matches!(
            status.code(),
            Code::Unavailable | Code::Cancelled | Code::DeadlineExceeded | Code::Unknown
        ),
        _ => false,
    }
}

/// A session on an etcd cluster.
pub struct EtcdStore {
    client: Client,
    lease_id: i64,
    bus: EventBus,
    keep_alive: JoinHandle<()>,
    watches: Mutex<HashMap<WatchId, JoinHandle<()>>>,
    next_watch: AtomicU64,
}

impl EtcdStore {
    /// Connect and open a session whose lease TTL is the configured session
    /// timeout, rounded up to whole seconds.
    pub async fn connect(config: &RegistryConfig) -> StoreResult<Self> {
        info!("Connecting to etcd at endpoints: {:?}", config.endpoints);

        let options = ConnectOptions::new()
            .with_connect_timeout(config.connect_timeout)
            .with_timeout(config.request_timeout);
        let mut client = Client::connect(config.endpoints.clone(), Some(options))
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;

        let ttl = config.session_timeout.as_secs_f64().ceil().max(1.0) as i64;
        let lease = client
            .lease_grant(ttl, None)
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;
        let lease_id = lease.id();

        info!("Opened session lease {} with TTL {} seconds", lease_id, lease.ttl());

        let bus = EventBus::new();
        let interval = Duration::from_secs(ttl as u64) / 3;
        let keep_alive = tokio::spawn(keep_session_alive(
            client.clone(),
            lease_id,
            interval,
            bus.clone(),
        ));

        Ok(Self {
            client,
            lease_id,
            bus,
            keep_alive,
            watches: Mutex::new(HashMap::new()),
            next_watch: AtomicU64::new(1),
        })
    }

    /// The lease backing this session.
    pub fn lease_id(&self) -> i64 {
        self.lease_id
    }

    fn ensure_live(&self) -> StoreResult<()> {
        match self.bus.state() {
            SessionState::Expired => Err(StoreError::SessionExpired),
            SessionState::Closed => Err(StoreError::SessionClosed),
            _ => Ok(()),
        }
    }

    async fn get_kv(&self, key: &str) -> StoreResult<Option<KeyValue>> {
        let mut client = self.client.clone();
        let mut resp = client.get(key, None).await?;
        Ok(resp.take_kvs().into_iter().next())
    }

    /// Fail unless `parent` exists and can hold children.
    async fn check_parent(&self, parent: &str) -> StoreResult<()> {
        if parent == "/" {
            return Ok(());
        }
        match self.get_kv(parent).await? {
            None => Err(no_node(parent)),
            Some(kv) if kv.lease() != 0 => Err(StoreError::NoChildrenForEphemerals {
                path: parent.to_string(),
            }),
            Some(_) => Ok(()),
        }
    }

    fn parent_exists(parent: &str) -> Option<Compare> {
        (parent != "/").then(|| Compare::create_revision(parent, CompareOp::Greater, 0))
    }

    async fn try_create_sequential(
        &self,
        parent: &str,
        token: &str,
        payload: &[u8],
    ) -> StoreResult<String> {
        let counter_key = sequence_key(parent);
        let mut client = self.client.clone();

        loop {
            self.check_parent(parent).await?;

            let (sequence, counter_version) = match self.get_kv(&counter_key).await? {
                None => (0, 0),
                Some(kv) => {
                    let sequence = std::str::from_utf8(kv.value())
                        .ok()
                        .and_then(|raw| raw.parse::<u64>().ok())
                        .ok_or_else(|| StoreError::Corrupt {
                            key: counter_key.clone(),
                            reason: "sequence counter is not a number".to_string(),
                        })?;
                    (sequence, kv.version())
                }
            };

            let child = path::join(parent, &path::protected_child_name(token, sequence));
            let mut compares = vec![Compare::version(
                counter_key.as_str(),
                CompareOp::Equal,
                counter_version,
            )];
            compares.extend(Self::parent_exists(parent));

            let txn = Txn::new().when(compares).and_then(vec![
                TxnOp::put(counter_key.as_str(), (sequence + 1).to_string(), None),
                TxnOp::put(
                    child.as_str(),
                    payload.to_vec(),
                    Some(PutOptions::new().with_lease(self.lease_id)),
                ),
            ]);

            if client.txn(txn).await?.succeeded() {
                return Ok(child);
            }
            debug!("Sequence {} under {} moved or parent vanished, retrying", sequence, parent);
        }
    }
}

impl Drop for EtcdStore {
    fn drop(&mut self) {
        self.keep_alive.abort();
        for (_, handle) in self.watches.get_mut().drain() {
            handle.abort();
        }
    }
}

async fn refresh_lease(
    keeper: &mut LeaseKeeper,
    stream: &mut LeaseKeepAliveStream,
) -> StoreResult<i64> {
    keeper.keep_alive().await?;
    match stream.message().await? {
        Some(resp) => Ok(resp.ttl()),
        None => Err(StoreError::Connection(
            "lease keep-alive stream closed".to_string(),
        )),
    }
}

/// Refresh the session lease every `interval` until it is reported gone.
async fn keep_session_alive(mut client: Client, lease_id: i64, interval: Duration, bus: EventBus) {
    let mut ticker = tokio::time::interval(interval);
    let mut channel: Option<(LeaseKeeper, LeaseKeepAliveStream)> = None;

    loop {
        ticker.tick().await;

        if channel.is_none() {
            match client.lease_keep_alive(lease_id).await {
                Ok(opened) => channel = Some(opened),
                Err(e) => {
                    warn!("Failed to open keep-alive for lease {}: {}", lease_id, e);
                    bus.transition(SessionState::Disconnected);
                    continue;
                }
            }
        }
        let Some((keeper, stream)) = channel.as_mut() else {
            continue;
        };

        let refreshed = refresh_lease(keeper, stream).await;
        match refreshed {
            Ok(ttl) if ttl > 0 => {
                debug!("Lease {} kept alive, TTL: {}", lease_id, ttl);
                bus.transition(SessionState::Connected);
            }
            Ok(_) => {
                error!("Session lease {} expired", lease_id);
                bus.transition(SessionState::Expired);
                break;
            }
            Err(e) => {
                warn!("Failed to keep lease {} alive: {}", lease_id, e);
                bus.transition(SessionState::Disconnected);
                channel = None;
            }
        }
    }
}

/// Map an etcd event on `key` (at `version` after the event) to what a
/// watch of `kind` reports. Children watches only see direct children
/// appearing or disappearing.
fn classify(
    kind: WatchKind,
    prefix: &str,
    event_type: EventType,
    key: &str,
    version: Version,
) -> Option<EventKind> {
    match kind {
        WatchKind::Node => Some(match event_type {
            EventType::Delete => EventKind::Deleted,
            EventType::Put if version == 1 => EventKind::Created,
            EventType::Put => EventKind::DataChanged,
        }),
        WatchKind::Children => {
            direct_child(prefix, key)?;
            match event_type {
                EventType::Delete => Some(EventKind::ChildrenChanged),
                EventType::Put if version == 1 => Some(EventKind::ChildrenChanged),
                EventType::Put => None,
            }
        }
    }
}

async fn forward_watch_events(
    mut watcher: Watcher,
    mut stream: WatchStream,
    path: String,
    kind: WatchKind,
    mode: WatchMode,
    bus: EventBus,
) {
    let prefix = path::children_prefix(&path);

    loop {
        let resp = match stream.message().await {
            Ok(Some(resp)) => resp,
            Ok(None) => break,
            Err(e) => {
                warn!("Watch on {} failed: {}", path, e);
                break;
            }
        };
        if resp.canceled() {
            break;
        }

        for event in resp.events() {
            let Some(kv) = event.kv() else {
                continue;
            };
            let Ok(key) = kv.key_str() else {
                continue;
            };
            let Some(event_kind) = classify(kind, &prefix, event.event_type(), key, kv.version())
            else {
                continue;
            };

            bus.publish(path.as_str(), event_kind);
            if mode == WatchMode::OneShot {
                if let Err(e) = watcher.cancel().await {
                    debug!("Failed to cancel watch on {}: {}", path, e);
                }
                return;
            }
        }
    }
    debug!("Watch on {} ended", path);
}

#[async_trait]
impl CoordinationStore for EtcdStore {
    async fn exists(&self, path: &str) -> StoreResult<Option<Stat>> {
        path::validate(path)?;
        self.ensure_live()?;
        if path == "/" {
            return Ok(Some(Stat {
                version: 0,
                ephemeral: false,
            }));
        }
        Ok(self.get_kv(path).await?.as_ref().map(stat_of))
    }

    async fn ensure_persistent_path(&self, path: &str) -> StoreResult<Ensured> {
        path::validate(path)?;
        self.ensure_live()?;
        let Some(parent) = path::parent(path) else {
            return Ok(Ensured::AlreadyExisted);
        };
        self.check_parent(parent).await?;

        let mut compares = vec![Compare::create_revision(path, CompareOp::Equal, 0)];
        compares.extend(Self::parent_exists(parent));
        let txn = Txn::new()
            .when(compares)
            .and_then(vec![TxnOp::put(path, Vec::<u8>::new(), None)])
            .or_else(vec![TxnOp::get(path, None)]);

        let mut client = self.client.clone();
        let resp = client.txn(txn).await?;
        if resp.succeeded() {
            debug!("Created persistent node {}", path);
            return Ok(Ensured::Created);
        }
        match first_kv(resp.op_responses().into_iter().next()) {
            Some(_) => Ok(Ensured::AlreadyExisted),
            None => Err(no_node(parent)),
        }
    }

    async fn create_protected_ephemeral_sequential(
        &self,
        parent: &str,
        payload: &[u8],
    ) -> StoreResult<String> {
        path::validate(parent)?;
        self.ensure_live()?;
        let token = path::new_protection_token();

        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.try_create_sequential(parent, &token, payload).await {
                Ok(assigned) => {
                    debug!("Created ephemeral node {} on lease {}", assigned, self.lease_id);
                    return Ok(assigned);
                }
                Err(e) if is_lost_response(&e) => {
                    warn!(
                        "Create under {} lost its response (attempt {}): {}",
                        parent, attempt, e
                    );
                    // the put may have landed before the connection dropped
                    if let Ok(children) = self.list_children(parent).await {
                        if let Some(child) = path::find_protected_child(&children, &token) {
                            info!("Recovered protected node {} under {}", child, parent);
                            return Ok(path::join(parent, &child));
                        }
                    }
                    if attempt >= PROTECTED_CREATE_ATTEMPTS {
                        return Err(e);
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn list_children(&self, path: &str) -> StoreResult<Vec<String>> {
        path::validate(path)?;
        self.ensure_live()?;
        if path != "/" && self.get_kv(path).await?.is_none() {
            return Err(no_node(path));
        }

        let prefix = path::children_prefix(path);
        let mut client = self.client.clone();
        let resp = client
            .get(
                prefix.as_str(),
                Some(GetOptions::new().with_prefix().with_keys_only()),
            )
            .await?;

        let mut children = Vec::new();
        for kv in resp.kvs() {
            if let Some(child) = direct_child(&prefix, kv.key_str()?) {
                children.push(child.to_string());
            }
        }
        children.sort();
        Ok(children)
    }

    async fn get(&self, path: &str) -> StoreResult<(Vec<u8>, Stat)> {
        path::validate(path)?;
        self.ensure_live()?;
        if path == "/" {
            return Ok((
                Vec::new(),
                Stat {
                    version: 0,
                    ephemeral: false,
                },
            ));
        }
        let kv = self.get_kv(path).await?.ok_or_else(|| no_node(path))?;
        Ok((kv.value().to_vec(), stat_of(&kv)))
    }

    async fn set_if_version(
        &self,
        path: &str,
        data: &[u8],
        expected: Version,
    ) -> StoreResult<Stat> {
        path::validate(path)?;
        self.ensure_live()?;

        let txn = Txn::new()
            .when(vec![
                Compare::create_revision(path, CompareOp::Greater, 0),
                Compare::version(path, CompareOp::Equal, expected),
            ])
            .and_then(vec![
                TxnOp::put(path, data.to_vec(), Some(PutOptions::new().with_ignore_lease())),
                TxnOp::get(path, None),
            ])
            .or_else(vec![TxnOp::get(path, None)]);

        let mut client = self.client.clone();
        let resp = client.txn(txn).await?;
        let succeeded = resp.succeeded();
        let mut ops = resp.op_responses().into_iter();

        if succeeded {
            let current = first_kv(ops.nth(1)).ok_or_else(|| no_node(path))?;
            return Ok(stat_of(&current));
        }
        match first_kv(ops.next()) {
            None => Err(no_node(path)),
            Some(kv) => Err(StoreError::BadVersion {
                path: path.to_string(),
                expected,
                actual: kv.version(),
            }),
        }
    }

    async fn delete_if_version(&self, path: &str, expected: Version) -> StoreResult<()> {
        path::validate(path)?;
        if path == "/" {
            return Err(StoreError::InvalidPath {
                path: path.to_string(),
                reason: "cannot delete the root".to_string(),
            });
        }
        self.ensure_live()?;

        let current = self.get_kv(path).await?.ok_or_else(|| no_node(path))?;
        if current.version() != expected {
            return Err(StoreError::BadVersion {
                path: path.to_string(),
                expected,
                actual: current.version(),
            });
        }

        let mut client = self.client.clone();
        let children = client
            .get(
                path::children_prefix(path),
                Some(GetOptions::new().with_prefix().with_count_only()),
            )
            .await?;
        if children.count() > 0 {
            return Err(StoreError::NotEmpty {
                path: path.to_string(),
            });
        }

        let txn = Txn::new()
            .when(vec![
                Compare::create_revision(path, CompareOp::Greater, 0),
                Compare::version(path, CompareOp::Equal, expected),
            ])
            .and_then(vec![
                TxnOp::delete(path, None),
                TxnOp::delete(sequence_key(path), None),
            ])
            .or_else(vec![TxnOp::get(path, None)]);

        let resp = client.txn(txn).await?;
        if resp.succeeded() {
            debug!("Deleted {}", path);
            return Ok(());
        }
        match first_kv(resp.op_responses().into_iter().next()) {
            None => Err(no_node(path)),
            Some(kv) => Err(StoreError::BadVersion {
                path: path.to_string(),
                expected,
                actual: kv.version(),
            }),
        }
    }

    async fn watch(&self, path: &str, kind: WatchKind, mode: WatchMode) -> StoreResult<WatchId> {
        path::validate(path)?;
        self.ensure_live()?;
        if kind == WatchKind::Children && path != "/" && self.get_kv(path).await?.is_none() {
            return Err(no_node(path));
        }

        let (key, options) = match kind {
            WatchKind::Node => (path.to_string(), None),
            WatchKind::Children => (
                path::children_prefix(path),
                Some(WatchOptions::new().with_prefix()),
            ),
        };

        let mut client = self.client.clone();
        let (watcher, stream) = client.watch(key, options).await?;
        debug!("Watching {} ({:?}, {:?})", path, kind, mode);

        let handle = tokio::spawn(forward_watch_events(
            watcher,
            stream,
            path.to_string(),
            kind,
            mode,
            self.bus.clone(),
        ));

        let id = self.next_watch.fetch_add(1, Ordering::Relaxed);
        let mut watches = self.watches.lock().await;
        watches.retain(|_, h| !h.is_finished());
        watches.insert(id, handle);
        Ok(id)
    }

    async fn unwatch(&self, id: WatchId) -> StoreResult<()> {
        self.ensure_live()?;
        // dropping the forwarding task drops its etcd watch stream
        if let Some(handle) = self.watches.lock().await.remove(&id) {
            handle.abort();
            debug!("Removed watch {}", id);
        }
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<WatchEvent> {
        self.bus.subscribe()
    }

    fn session_state(&self) -> SessionState {
        self.bus.state()
    }

    async fn close(&self) -> StoreResult<()> {
        let state = self.bus.state();
        if state == SessionState::Closed {
            return Ok(());
        }

        self.keep_alive.abort();
        for (_, handle) in self.watches.lock().await.drain() {
            handle.abort();
        }

        let revoked = if state == SessionState::Expired {
            Ok(())
        } else {
            let mut client = self.client.clone();
            client.lease_revoke(self.lease_id).await.map(|_| ())
        };
        self.bus.transition(SessionState::Closed);

        match revoked {
            Ok(()) => {
                info!("Closed session lease {}", self.lease_id);
                Ok(())
            }
            Err(e) => {
                warn!("Failed to revoke lease {}: {}", self.lease_id, e);
                Err(e.into())
            }
        }
    }
}
