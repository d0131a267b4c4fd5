//! Coordination store adapter
//!
//! The registry talks to the store only through [`CoordinationStore`]. A store
//! handle is one session: ephemeral nodes created through it live exactly as
//! long as the session does.
//!
//! Two backends are provided:
//! - [`EtcdStore`]: etcd v3, the session is a lease kept alive in the background
//! - [`MemoryCluster`]: in-process store for tests and local development

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::broadcast;

use crate::event::{SessionState, WatchEvent};

pub mod etcd;
pub mod memory;

pub use etcd::EtcdStore;
pub use memory::{MemoryCluster, MemoryStore};

/// Per-node version used for compare-and-swap writes.
pub type Version = i64;

/// Identifies an installed watch within its session.
pub type WatchId = u64;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("node already exists: {path}")]
    NodeExists { path: String },

    #[error("no node: {path}")]
    NoNode { path: String },

    #[error("bad version for {path}: expected {expected}, found {actual}")]
    BadVersion {
        path: String,
        expected: Version,
        actual: Version,
    },

    #[error("node has children: {path}")]
    NotEmpty { path: String },

    #[error("ephemeral node cannot have children: {path}")]
    NoChildrenForEphemerals { path: String },

    #[error("invalid path {path}: {reason}")]
    InvalidPath { path: String, reason: String },

    #[error("session expired")]
    SessionExpired,

    #[error("session closed")]
    SessionClosed,

    #[error("connection error: {0}")]
    Connection(String),

    #[error("corrupt store data at {key}: {reason}")]
    Corrupt { key: String, reason: String },

    #[error("etcd error: {0}")]
    Backend(#[from] etcd_client::Error),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Node metadata returned alongside reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stat {
    pub version: Version,
    pub ephemeral: bool,
}

/// Outcome of [`CoordinationStore::ensure_persistent_path`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ensured {
    Created,
    /// Another session (or an earlier call) created it first.
    AlreadyExisted,
}

/// What a watch observes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WatchKind {
    /// Creation, deletion and data changes of the path itself.
    Node,
    /// Direct children appearing or disappearing under the path.
    Children,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WatchMode {
    /// Removed after delivering its first event.
    OneShot,
    Persistent,
}

#[async_trait]
pub trait CoordinationStore: Send + Sync {
    /// Metadata of `path`, or `None` if it does not exist.
    async fn exists(&self, path: &str) -> StoreResult<Option<Stat>>;

    /// Create `path` as a persistent node with empty content. The parent must
    /// already exist.
    async fn ensure_persistent_path(&self, path: &str) -> StoreResult<Ensured>;

    /// Create an ephemeral, sequential, protected child of `parent` holding
    /// `payload`, returning the full assigned path.
    async fn create_protected_ephemeral_sequential(
        &self,
        parent: &str,
        payload: &[u8],
    ) -> StoreResult<String>;

    /// Names of the direct children of `path`, sorted ascending.
    async fn list_children(&self, path: &str) -> StoreResult<Vec<String>>;

    async fn get(&self, path: &str) -> StoreResult<(Vec<u8>, Stat)>;

    async fn set_if_version(
        &self,
        path: &str,
        data: &[u8],
        expected: Version,
    ) -> StoreResult<Stat>;

    async fn delete_if_version(&self, path: &str, expected: Version) -> StoreResult<()>;

    /// Install a watch. Its events are published to every [`subscribe`]r
    /// until it fires (one-shot) or is removed with [`unwatch`].
    ///
    /// [`subscribe`]: CoordinationStore::subscribe
    /// [`unwatch`]: CoordinationStore::unwatch
    async fn watch(&self, path: &str, kind: WatchKind, mode: WatchMode) -> StoreResult<WatchId>;

    /// Remove a watch. Removing one that already fired or was removed is a
    /// no-op.
    async fn unwatch(&self, id: WatchId) -> StoreResult<()>;

    fn subscribe(&self) -> broadcast::Receiver<WatchEvent>;

    fn session_state(&self) -> SessionState;

    /// End the session. All ephemeral nodes it owns are removed.
    async fn close(&self) -> StoreResult<()>;
}
