//! Locally cached endpoint list kept fresh by change notifications.

use std::sync::Arc;

use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::event::EventKind;
use crate::registry::ServiceRegistry;
use crate::service::ServiceNode;
use crate::store::CoordinationStore;

/// Follows one service and keeps its current endpoints in memory.
///
/// The list is reloaded whenever the service's children change. Reload
/// failures keep the previous list. The watcher stops when the registry's
/// session ends, on [`stop`](Self::stop), or when it is dropped; it then
/// releases its hold on the service watch.
pub struct ServiceWatcher {
    name: String,
    nodes: watch::Receiver<Vec<ServiceNode>>,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl ServiceWatcher {
    pub async fn start<S>(registry: Arc<ServiceRegistry<S>>, name: impl Into<String>) -> Result<Self>
    where
        S: CoordinationStore + 'static,
    {
        let name = name.into();
        let service_path = registry.service_path(&name)?;
        let mut events = registry.watch_service(&name).await?;
        let initial = match registry.get_nodes(&name).await {
            Ok(nodes) => nodes,
            Err(e) => {
                if let Err(release) = registry.unwatch_service(&name).await {
                    debug!("Failed to release watch on {}: {}", name, release);
                }
                return Err(e);
            }
        };
        let (tx, rx) = watch::channel(initial);
        let (shutdown, mut shutdown_rx) = oneshot::channel();

        let service = name.clone();
        let task = tokio::spawn(async move {
            loop {
                let received = tokio::select! {
                    _ = &mut shutdown_rx => break,
                    received = events.recv() => received,
                };
                match received {
                    Ok(event) if event.kind == EventKind::Session => {
                        if event.state.is_terminal() {
                            info!("Session {:?}, stopping watcher for {}", event.state, service);
                            break;
                        }
                        continue;
                    }
                    Ok(event)
                        if event.path == service_path
                            && matches!(
                                event.kind,
                                EventKind::ChildrenChanged | EventKind::Created | EventKind::Deleted
                            ) => {}
                    Ok(_) => continue,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("Watcher for {} lagged by {} events, reloading", service, skipped);
                    }
                    Err(RecvError::Closed) => break,
                }

                match registry.get_nodes(&service).await {
                    Ok(nodes) => {
                        let updated = tx.send_if_modified(|current| {
                            if *current == nodes {
                                return false;
                            }
                            *current = nodes;
                            true
                        });
                        debug!("Reloaded {} (changed: {})", service, updated);
                    }
                    Err(e) => warn!("Failed to reload endpoints of {}: {}", service, e),
                }
            }

            // fails harmlessly once the session is gone
            if let Err(e) = registry.unwatch_service(&service).await {
                debug!("Failed to release watch on {}: {}", service, e);
            }
            debug!("Watcher for {} stopped", service);
        });

        Ok(Self {
            name,
            nodes: rx,
            shutdown: Some(shutdown),
            task,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Snapshot of the current endpoints.
    pub fn nodes(&self) -> Vec<ServiceNode> {
        self.nodes.borrow().clone()
    }

    /// Wait for the endpoint list to change. Returns `false` once the watcher
    /// has stopped.
    pub async fn changed(&mut self) -> bool {
        self.nodes.changed().await.is_ok()
    }

    /// Stop following the service and wait until its watch is released.
    pub async fn stop(mut self) {
        self.signal_shutdown();
        if let Err(e) = (&mut self.task).await {
            warn!("Watcher task for {} failed: {}", self.name, e);
        }
    }

    fn signal_shutdown(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            // the task may already have ended with its session
            let _ = shutdown.send(());
        }
    }
}

impl Drop for ServiceWatcher {
    fn drop(&mut self) {
        self.signal_shutdown();
    }
}
