//! Service facade.
//!
//! One [`Service`] value wires the peer registry, the transfer manager, and
//! the observer bus together around explicit collaborator handles. The
//! embedding transport feeds discovery announcements and inbound RPCs into
//! it; UIs subscribe to the event bus and call the operation surface.

use std::path::PathBuf;
use std::sync::Arc;

use crate::config::ServiceConfig;
use crate::discovery::{ServiceAnnouncement, SERVICE_TYPE_REAL};
use crate::error::{CoreError, Result};
use crate::event::{EventBus, EventCallback};
use crate::peer::{PeerKey, PeerRegistry, PeerSnapshot};
use crate::policy::{DefaultStoragePolicy, OutputRootResolver, PathResolver, StoragePolicy};
use crate::rpc::{
    CallerIdentity, ChunkStream, PeerConnector, RemoteMachineInfo, TransferOffer,
};
use crate::transfer::{TransferManager, TransferSnapshot};

/// Identity and presentation of the local machine
#[derive(Debug, Clone)]
pub struct LocalIdentity {
    /// Stable instance identifier, unique per install
    pub id: String,
    /// Hostname announced over discovery
    pub hostname: String,
    /// Full display name served to peers
    pub display_name: String,
    /// Short account-style name served to peers
    pub short_name: String,
    /// Operating system label announced over discovery
    pub os: String,
    /// Avatar image served to peers
    pub avatar: Option<Vec<u8>>,
    /// Transfer port announced over discovery
    pub port: u16,
    /// Certificate bootstrap port announced over discovery
    pub auth_port: u16,
}

impl LocalIdentity {
    fn caller(&self) -> CallerIdentity {
        CallerIdentity {
            id: self.id.clone(),
            hostname: self.hostname.clone(),
        }
    }
}

struct ServiceInner {
    local: LocalIdentity,
    events: EventBus,
    registry: PeerRegistry,
    transfers: TransferManager,
}

/// The peer-to-peer transfer service
#[derive(Clone)]
pub struct Service {
    inner: Arc<ServiceInner>,
}

impl Service {
    /// Create a service with the default storage policy and path resolver
    #[must_use]
    pub fn new(
        config: ServiceConfig,
        local: LocalIdentity,
        connector: Arc<dyn PeerConnector>,
    ) -> Self {
        let policy = Arc::new(DefaultStoragePolicy {
            auto_confirm_overwrite: !config.transfer.require_overwrite_confirmation,
        });
        let resolver = Arc::new(OutputRootResolver::new(config.transfer.output_dir.clone()));
        Self::with_collaborators(config, local, connector, policy, resolver)
    }

    /// Create a service with explicit policy and resolver collaborators
    #[must_use]
    pub fn with_collaborators(
        config: ServiceConfig,
        local: LocalIdentity,
        connector: Arc<dyn PeerConnector>,
        policy: Arc<dyn StoragePolicy>,
        resolver: Arc<dyn PathResolver>,
    ) -> Self {
        let events = EventBus::new();
        let caller = local.caller();
        let registry = PeerRegistry::new(
            connector,
            config.connection.clone(),
            events.clone(),
            caller.clone(),
        );
        let transfers = TransferManager::new(config, events.clone(), policy, resolver, caller);
        Self {
            inner: Arc::new(ServiceInner {
                local,
                events,
                registry,
                transfers,
            }),
        }
    }

    /// Register an observer callback
    pub fn subscribe(&self, callback: EventCallback) {
        self.inner.events.subscribe(callback);
    }

    /// The announcement the discovery transport should publish for us
    #[must_use]
    pub fn announcement(&self) -> ServiceAnnouncement {
        ServiceAnnouncement {
            instance_id: self.inner.local.id.clone(),
            port: self.inner.local.port,
            ipv4: None,
            ipv6: None,
            hostname: Some(self.inner.local.hostname.clone()),
            kind: Some(SERVICE_TYPE_REAL.into()),
            os: Some(self.inner.local.os.clone()),
            api_version: Some("2".into()),
            auth_port: Some(self.inner.local.auth_port),
        }
    }

    /// Local identity
    #[must_use]
    pub fn local(&self) -> &LocalIdentity {
        &self.inner.local
    }

    // ---- discovery surface -----------------------------------------------

    /// Feed a discovery announcement into the registry
    pub fn on_peer_announced(&self, announcement: &ServiceAnnouncement) {
        self.inner.registry.on_announced(announcement);
    }

    /// Feed a discovery withdrawal into the registry
    pub fn on_peer_withdrawn(&self, key: &PeerKey) {
        self.inner.registry.on_withdrawn(key);
    }

    /// Snapshots of peers fit for a picker
    #[must_use]
    pub fn visible_peers(&self) -> Vec<PeerSnapshot> {
        self.inner.registry.visible_peers()
    }

    /// Number of known peers
    #[must_use]
    pub fn peer_count(&self) -> usize {
        self.inner.registry.peer_count()
    }

    // ---- transfer surface ------------------------------------------------

    /// Offer the given paths to the named peer
    pub fn send_to(&self, hostname: &str, paths: Vec<PathBuf>) -> Result<u64> {
        let peer = self
            .inner
            .registry
            .lookup_hostname(hostname)
            .ok_or_else(|| CoreError::invalid_state("unknown peer"))?;
        self.inner.transfers.send(peer, paths)
    }

    /// Accept an incoming transfer waiting for permission
    pub async fn accept_transfer(&self, transfer_id: u64) -> Result<()> {
        self.inner.transfers.decide(transfer_id, true).await
    }

    /// Decline an incoming transfer waiting for permission
    pub async fn decline_transfer(&self, transfer_id: u64) -> Result<()> {
        self.inner.transfers.decide(transfer_id, false).await
    }

    /// Pause an active transfer
    pub fn pause_transfer(&self, transfer_id: u64) -> Result<()> {
        self.inner.transfers.pause(transfer_id)
    }

    /// Resume a paused transfer
    pub fn resume_transfer(&self, transfer_id: u64) -> Result<()> {
        self.inner.transfers.resume(transfer_id)
    }

    /// Stop or withdraw a transfer
    pub async fn stop_transfer(&self, transfer_id: u64) -> Result<()> {
        self.inner.transfers.stop(transfer_id).await
    }

    /// Drop a terminal transfer from the table
    pub fn remove_transfer(&self, transfer_id: u64) -> Result<()> {
        self.inner.transfers.remove(transfer_id)
    }

    /// Snapshots of every known transfer
    #[must_use]
    pub fn transfers(&self) -> Vec<TransferSnapshot> {
        self.inner.transfers.transfers()
    }

    // ---- inbound RPC surface ---------------------------------------------

    /// Whether the caller is a peer we have registered ourselves
    ///
    /// This is the duplex answer: the connection is duplex once both sides
    /// know each other.
    #[must_use]
    pub fn knows_peer(&self, caller: &CallerIdentity) -> bool {
        self.inner.registry.lookup_instance(&caller.id).is_some()
            || self.inner.registry.lookup_hostname(&caller.hostname).is_some()
    }

    /// Display metadata served to peers
    #[must_use]
    pub fn machine_info(&self) -> RemoteMachineInfo {
        RemoteMachineInfo {
            display_name: self.inner.local.display_name.clone(),
            short_name: self.inner.local.short_name.clone(),
        }
    }

    /// Avatar image served to peers
    #[must_use]
    pub fn machine_avatar(&self) -> Vec<u8> {
        self.inner.local.avatar.clone().unwrap_or_default()
    }

    /// A peer announced an incoming transfer
    pub fn handle_transfer_request(
        &self,
        caller: &CallerIdentity,
        offer: TransferOffer,
    ) -> Result<u64> {
        let peer = self
            .lookup_caller(caller)
            .ok_or_else(|| CoreError::invalid_state("offer from unknown peer"))?;
        Ok(self.inner.transfers.handle_transfer_request(peer, offer))
    }

    /// A peer accepted our offer and wants the chunk stream
    pub fn handle_start_transfer(
        &self,
        caller: &CallerIdentity,
        op_id: u64,
    ) -> Result<ChunkStream> {
        let peer = self
            .lookup_caller(caller)
            .ok_or_else(|| CoreError::invalid_state("start from unknown peer"))?;
        self.inner.transfers.handle_start_transfer(&peer, op_id)
    }

    /// A peer withdrew or declined a pending offer
    pub fn handle_cancel_request(&self, caller: &CallerIdentity, op_id: u64) {
        if let Some(peer) = self.lookup_caller(caller) {
            self.inner.transfers.handle_cancel_request(&peer, op_id);
        }
    }

    /// A peer stopped an active transfer
    pub fn handle_remote_stop(&self, caller: &CallerIdentity, op_id: u64, error: bool) {
        if let Some(peer) = self.lookup_caller(caller) {
            self.inner.transfers.handle_remote_stop(&peer, op_id, error);
        }
    }

    // ---- lifecycle -------------------------------------------------------

    /// Stop every transfer and connection task and wait for them
    pub async fn shutdown(&self) {
        tracing::info!("service shutting down");
        self.inner.transfers.shutdown().await;
        self.inner.registry.shutdown().await;
    }

    fn lookup_caller(&self, caller: &CallerIdentity) -> Option<Arc<crate::peer::PeerRecord>> {
        self.inner
            .registry
            .lookup_instance(&caller.id)
            .or_else(|| self.inner.registry.lookup_hostname(&caller.hostname))
    }
}

impl std::fmt::Debug for Service {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Service")
            .field("hostname", &self.inner.local.hostname)
            .field("peers", &self.peer_count())
            .finish()
    }
}
