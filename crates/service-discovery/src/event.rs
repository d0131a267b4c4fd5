//! Change notifications
//!
//! Store backends publish [`WatchEvent`]s on an [`EventBus`]; any number of
//! consumers hold their own receiver.

use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

/// Per-subscriber queue depth. A subscriber that falls further behind loses
/// the oldest events.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventKind {
    Created,
    Deleted,
    DataChanged,
    ChildrenChanged,
    /// Session state transition, not tied to a path.
    Session,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    Connected,
    Disconnected,
    Expired,
    Closed,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Expired | Self::Closed)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchEvent {
    pub path: String,
    pub kind: EventKind,
    pub state: SessionState,
}

impl WatchEvent {
    pub fn new(path: impl Into<String>, kind: EventKind, state: SessionState) -> Self {
        Self {
            path: path.into(),
            kind,
            state,
        }
    }

    pub fn session(state: SessionState) -> Self {
        Self::new(String::new(), EventKind::Session, state)
    }
}

/// Broadcast channel plus the session state it reports.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<WatchEvent>,
    state: Arc<RwLock<SessionState>>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            tx,
            state: Arc::new(RwLock::new(SessionState::Connected)),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WatchEvent> {
        self.tx.subscribe()
    }

    pub fn state(&self) -> SessionState {
        match self.state.read() {
            Ok(state) => *state,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    /// Publish a path event stamped with the current session state.
    pub fn publish(&self, path: impl Into<String>, kind: EventKind) {
        self.send(WatchEvent::new(path, kind, self.state()));
    }

    /// Move to `state` and tell subscribers. Terminal states are sticky.
    pub fn transition(&self, state: SessionState) {
        {
            let mut current = match self.state.write() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            if current.is_terminal() || *current == state {
                return;
            }
            *current = state;
        }
        self.send(WatchEvent::session(state));
    }

    fn send(&self, event: WatchEvent) {
        // no receivers is fine
        if self.tx.send(event).is_err() {
            debug!("No subscribers for watch event");
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
