//! Observer surface.
//!
//! UI and embedders subscribe to a single event stream covering peer
//! lifecycle, transfer lifecycle, and the open-transfer-UI request. Events
//! are emitted after the owning lock is released, so a callback may call
//! back into the service without deadlocking.

use crate::peer::PeerSnapshot;
use crate::transfer::TransferSnapshot;
use std::sync::{Arc, RwLock};

/// One observer notification
#[derive(Debug, Clone)]
pub enum ServiceEvent {
    /// A peer was discovered and registered
    PeerAdded(PeerSnapshot),
    /// A peer's status or display fields changed
    PeerUpdated(PeerSnapshot),
    /// A peer was dropped from the registry
    PeerRemoved {
        /// Instance id of the dropped peer
        peer_id: String,
    },
    /// The number of known hosts changed
    HostCountChanged(usize),
    /// A transfer was registered
    TransferAdded(TransferSnapshot),
    /// A transfer's status or progress changed
    TransferUpdated(TransferSnapshot),
    /// A finished transfer was acknowledged and removed
    TransferRemoved {
        /// Id of the removed transfer
        transfer_id: u64,
    },
    /// An incoming request should surface the transfer UI
    OpenTransferUi {
        /// Peer the request came from
        peer_id: String,
        /// Transfer awaiting permission
        transfer_id: u64,
    },
}

/// Observer callback
pub type EventCallback = Arc<dyn Fn(&ServiceEvent) + Send + Sync>;

/// Fan-out bus for [`ServiceEvent`] notifications
#[derive(Clone, Default)]
pub struct EventBus {
    subscribers: Arc<RwLock<Vec<EventCallback>>>,
}

impl EventBus {
    /// Create an empty bus
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an observer callback
    pub fn subscribe(&self, callback: EventCallback) {
        self.subscribers
            .write()
            .expect("event bus lock poisoned")
            .push(callback);
    }

    /// Deliver an event to every subscriber
    ///
    /// Callbacks run outside the subscriber lock.
    pub fn emit(&self, event: ServiceEvent) {
        let subscribers = self
            .subscribers
            .read()
            .expect("event bus lock poisoned")
            .clone();
        for subscriber in subscribers {
            subscriber(&event);
        }
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let count = self.subscribers.read().map(|s| s.len()).unwrap_or(0);
        f.debug_struct("EventBus")
            .field("subscribers", &count)
            .finish()
    }
}
