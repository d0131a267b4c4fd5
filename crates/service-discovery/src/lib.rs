//! Service discovery on top of a coordination store.
//!
//! Providers [`register`](ServiceRegistry::register) endpoints as ephemeral,
//! sequential, protected nodes under `/<root>/<service>`; they vanish with
//! the provider's session. Consumers list them with
//! [`get_nodes`](ServiceRegistry::get_nodes) or follow them with a
//! [`ServiceWatcher`], and pick one with a [`Balancer`].

pub mod balancer;
pub mod config;
pub mod error;
pub mod event;
pub mod path;
pub mod registry;
pub mod service;
pub mod store;
pub mod watcher;

pub use balancer::{Balancer, Strategy};
pub use config::RegistryConfig;
pub use error::{RegistryError, Result};
pub use event::{EventKind, SessionState, WatchEvent};
pub use registry::ServiceRegistry;
pub use service::ServiceNode;
pub use store::{
    CoordinationStore, EtcdStore, MemoryCluster, MemoryStore, StoreError, Version, WatchId,
    WatchKind, WatchMode,
};
pub use watcher::ServiceWatcher;
