//! Peer registry.
//!
//! Owns the map of known peers and the one connection task per peer.
//! Discovery announcements flow in through [`PeerRegistry::on_announced`]
//! and [`PeerRegistry::on_withdrawn`]; flush placeholders, malformed
//! announcements, and our own reflected announcement never create entries.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::task::JoinHandle;

use crate::config::ConnectionConfig;
use crate::discovery::ServiceAnnouncement;
use crate::event::{EventBus, ServiceEvent};
use crate::peer::handler::ConnectionHandler;
use crate::peer::record::{PeerKey, PeerRecord, PeerSnapshot};
use crate::rpc::{CallerIdentity, PeerConnector};

struct PeerEntry {
    record: Arc<PeerRecord>,
    task: JoinHandle<()>,
}

struct RegistryInner {
    peers: Mutex<HashMap<PeerKey, PeerEntry>>,
    connector: Arc<dyn PeerConnector>,
    config: ConnectionConfig,
    events: EventBus,
    local: CallerIdentity,
}

/// Registry of discovered peers and their connection tasks
#[derive(Clone)]
pub struct PeerRegistry {
    inner: Arc<RegistryInner>,
}

impl PeerRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new(
        connector: Arc<dyn PeerConnector>,
        config: ConnectionConfig,
        events: EventBus,
        local: CallerIdentity,
    ) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                peers: Mutex::new(HashMap::new()),
                connector,
                config,
                events,
                local,
            }),
        }
    }

    /// Feed one discovery announcement into the registry
    ///
    /// A fresh announcement for a known peer refreshes its endpoint and
    /// nudges its connection task; if the task has already exited (a lost
    /// generation-1 session) a new one is spawned.
    pub fn on_announced(&self, announcement: &ServiceAnnouncement) {
        if !announcement.is_real() {
            tracing::trace!(instance = %announcement.instance_id, "ignoring non-real announcement");
            return;
        }
        if announcement.instance_id == self.inner.local.id
            || announcement.hostname.as_deref() == Some(self.inner.local.hostname.as_str())
        {
            tracing::trace!("ignoring our own announcement");
            return;
        }

        let key = PeerKey::from_announcement(announcement);
        let mut peers = self.inner.peers.lock().unwrap();
        if let Some(entry) = peers.get_mut(&key) {
            entry.record.set_announced(true);
            entry.record.refresh_endpoint(announcement);
            if entry.task.is_finished() {
                tracing::debug!(peer = %key, "respawning connection task");
                entry.task = self.spawn_handler(entry.record.clone());
            } else {
                entry.record.stop().wake();
            }
            return;
        }

        let record = PeerRecord::new(announcement);
        let task = self.spawn_handler(record.clone());
        peers.insert(key.clone(), PeerEntry { record: record.clone(), task });
        let count = peers.len();
        drop(peers);

        tracing::info!(peer = %key, "peer registered");
        self.inner.events.emit(ServiceEvent::PeerAdded(record.snapshot()));
        self.inner.events.emit(ServiceEvent::HostCountChanged(count));
    }

    /// Feed one discovery withdrawal into the registry
    ///
    /// Only clears the presence flag and nudges the connection task; the
    /// task decides when to exit (a peer with transfers still running rides
    /// out the withdrawal) and the entry is reaped once it does.
    pub fn on_withdrawn(&self, key: &PeerKey) {
        let peers = self.inner.peers.lock().unwrap();
        let Some(entry) = peers.get(key) else {
            return;
        };
        tracing::debug!(peer = %key, "announcement withdrawn");
        entry.record.set_announced(false);
        entry.record.stop().wake();
    }

    /// Drop a peer whose connection task has exited while unannounced
    fn reap(&self, key: &PeerKey) {
        let mut peers = self.inner.peers.lock().unwrap();
        match peers.get(key) {
            // Re-announced in the meantime; the next announcement respawns.
            Some(entry) if entry.record.is_announced() => return,
            Some(_) => {}
            None => return,
        }
        let entry = peers.remove(key);
        let count = peers.len();
        drop(peers);

        if let Some(entry) = entry {
            tracing::info!(peer = %key, "peer withdrawn");
            self.inner.events.emit(ServiceEvent::PeerRemoved {
                peer_id: entry.record.instance_id().to_owned(),
            });
            self.inner.events.emit(ServiceEvent::HostCountChanged(count));
        }
    }

    /// Look up a peer by key
    #[must_use]
    pub fn get(&self, key: &PeerKey) -> Option<Arc<PeerRecord>> {
        self.inner.peers.lock().unwrap().get(key).map(|e| e.record.clone())
    }

    /// Look up a peer by hostname
    #[must_use]
    pub fn lookup_hostname(&self, hostname: &str) -> Option<Arc<PeerRecord>> {
        self.inner
            .peers
            .lock()
            .unwrap()
            .values()
            .find(|e| e.record.hostname() == hostname)
            .map(|e| e.record.clone())
    }

    /// Look up a peer by announced instance id
    #[must_use]
    pub fn lookup_instance(&self, instance_id: &str) -> Option<Arc<PeerRecord>> {
        self.inner
            .peers
            .lock()
            .unwrap()
            .values()
            .find(|e| e.record.instance_id() == instance_id)
            .map(|e| e.record.clone())
    }

    /// Snapshots of all peers currently fit for a picker
    #[must_use]
    pub fn visible_peers(&self) -> Vec<PeerSnapshot> {
        self.inner
            .peers
            .lock()
            .unwrap()
            .values()
            .filter(|e| e.record.is_visible())
            .map(|e| e.record.snapshot())
            .collect()
    }

    /// Number of known peers, visible or not
    #[must_use]
    pub fn peer_count(&self) -> usize {
        self.inner.peers.lock().unwrap().len()
    }

    /// Stop every connection task and wait for all of them to exit
    pub async fn shutdown(&self) {
        let entries: Vec<PeerEntry> = {
            let mut peers = self.inner.peers.lock().unwrap();
            peers.drain().map(|(_, entry)| entry).collect()
        };
        for entry in &entries {
            entry.record.set_announced(false);
            entry.record.stop().trigger();
        }
        for entry in entries {
            if let Err(error) = entry.task.await {
                tracing::warn!(%error, "connection task panicked during shutdown");
            }
        }
        tracing::debug!("peer registry drained");
    }

    fn spawn_handler(&self, record: Arc<PeerRecord>) -> JoinHandle<()> {
        let handler = ConnectionHandler::new(
            record.clone(),
            self.inner.connector.clone(),
            self.inner.config.clone(),
            self.inner.events.clone(),
            self.inner.local.clone(),
        );
        let registry = self.clone();
        let key = record.key().clone();
        tokio::spawn(async move {
            handler.run().await;
            registry.reap(&key);
        })
    }
}

impl std::fmt::Debug for PeerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerRegistry").field("peers", &self.peer_count()).finish()
    }
}
