use serde::Serialize;
use tokio::sync::broadcast;

use crate::error::ErrorKind;

/// Client lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ClientState {
    /// Nothing to do
    Idle,
    /// Local changes await upload
    Pending,
    /// A sync tick is in flight
    Syncing,
}

/// Events observable by embedders, in occurrence order per client.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    StateChange(ClientState),
    SyncStart { was_pending: bool },
    SyncComplete,
    SyncError { kind: ErrorKind, message: String },
}

/// Broadcast event bus. Dropping a receiver unsubscribes it.
pub struct EventBus {
    sender: broadcast::Sender<ClientEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(256);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.sender.subscribe()
    }

    pub fn emit(&self, event: ClientEvent) {
        // Nobody listening is fine
        let _ = self.sender.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
