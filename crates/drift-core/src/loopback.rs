//! In-process loopback transport.
//!
//! Wires multiple [`Service`] instances together inside one process: the
//! connector and channel implementations call straight into the target
//! service's inbound surface. Discovery announcements are fanned out on
//! join. This is the transport behind the demo command and the integration
//! tests; a real deployment plugs in an mDNS/RPC transport instead.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::watch;

use crate::error::CoreError;
use crate::peer::PeerKey;
use crate::rpc::{
    CallerIdentity, ChannelState, ChunkStream, PeerChannel, PeerConnector, PeerEndpoint,
    RemoteMachineInfo, RpcError, RpcResult, TransferOffer,
};
use crate::service::Service;

const LOOPBACK_CERT: &[u8] = b"loopback";

#[derive(Default)]
struct NetworkState {
    services: HashMap<String, Service>,
    channels: Vec<(String, watch::Sender<ChannelState>)>,
}

/// A process-local network of services
#[derive(Clone, Default)]
pub struct LoopbackNetwork {
    state: Arc<Mutex<NetworkState>>,
}

impl LoopbackNetwork {
    /// Create an empty network
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Connector to hand to services joining this network
    #[must_use]
    pub fn connector(&self) -> Arc<dyn PeerConnector> {
        Arc::new(LoopbackConnector { network: self.clone() })
    }

    /// Add a service and exchange announcements with everyone present
    pub fn join(&self, service: &Service) {
        let hostname = service.local().hostname.clone();
        let peers: Vec<Service> = {
            let mut state = self.state.lock().unwrap();
            state.services.insert(hostname.clone(), service.clone());
            state.services.values().filter(|s| s.local().hostname != hostname).cloned().collect()
        };
        tracing::debug!(%hostname, peers = peers.len(), "service joined loopback network");
        for peer in peers {
            peer.on_peer_announced(&service.announcement());
            service.on_peer_announced(&peer.announcement());
        }
    }

    /// Remove a service and withdraw it from everyone else
    pub fn leave(&self, hostname: &str) {
        let (removed, peers): (Option<Service>, Vec<Service>) = {
            let mut state = self.state.lock().unwrap();
            let removed = state.services.remove(hostname);
            state.channels.retain(|(target, _)| target != hostname);
            (removed, state.services.values().cloned().collect())
        };
        let Some(removed) = removed else {
            return;
        };
        tracing::debug!(%hostname, "service left loopback network");
        let key = PeerKey::from_announcement(&removed.announcement());
        for peer in peers {
            peer.on_peer_withdrawn(&key);
        }
    }

    /// Withdraw a service's announcement without taking it off the network
    ///
    /// Simulates a discovery flap: the announcement disappears while the
    /// host stays reachable.
    pub fn withdraw_announcement(&self, hostname: &str) {
        let (target, peers): (Option<Service>, Vec<Service>) = {
            let state = self.state.lock().unwrap();
            (
                state.services.get(hostname).cloned(),
                state.services.values().filter(|s| s.local().hostname != hostname).cloned().collect(),
            )
        };
        let Some(target) = target else {
            return;
        };
        let key = PeerKey::from_announcement(&target.announcement());
        for peer in peers {
            peer.on_peer_withdrawn(&key);
        }
    }

    /// Mark every open channel toward `hostname` as failed
    ///
    /// Simulates a dropped network link without withdrawing the discovery
    /// announcement.
    pub fn break_channels_to(&self, hostname: &str) {
        let state = self.state.lock().unwrap();
        for (target, sender) in &state.channels {
            if target == hostname {
                let _ = sender.send(ChannelState::Failure);
            }
        }
    }

    fn lookup(&self, hostname: &str) -> Option<Service> {
        self.state.lock().unwrap().services.get(hostname).cloned()
    }

    fn register_channel(&self, hostname: &str, sender: watch::Sender<ChannelState>) {
        let mut state = self.state.lock().unwrap();
        state.channels.retain(|(_, s)| !s.is_closed());
        state.channels.push((hostname.to_owned(), sender));
    }
}

impl std::fmt::Debug for LoopbackNetwork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock().unwrap();
        f.debug_struct("LoopbackNetwork")
            .field("services", &state.services.len())
            .finish()
    }
}

struct LoopbackConnector {
    network: LoopbackNetwork,
}

#[async_trait]
impl PeerConnector for LoopbackConnector {
    async fn fetch_certificate_v1(&self, endpoint: &PeerEndpoint) -> RpcResult<Vec<u8>> {
        self.network
            .lookup(&endpoint.hostname)
            .map(|_| LOOPBACK_CERT.to_vec())
            .ok_or(RpcError::unavailable("no such host"))
    }

    async fn fetch_certificate_v2(
        &self,
        endpoint: &PeerEndpoint,
        _caller: &CallerIdentity,
    ) -> RpcResult<Vec<u8>> {
        self.fetch_certificate_v1(endpoint).await
    }

    async fn open_channel(
        &self,
        endpoint: &PeerEndpoint,
        certificate: &[u8],
    ) -> RpcResult<Arc<dyn PeerChannel>> {
        if certificate != LOOPBACK_CERT {
            return Err(RpcError::Remote("certificate rejected".into()));
        }
        let target = self
            .network
            .lookup(&endpoint.hostname)
            .ok_or(RpcError::unavailable("no such host"))?;
        let (state, _) = watch::channel(ChannelState::Ready);
        self.network.register_channel(&endpoint.hostname, state.clone());
        Ok(Arc::new(LoopbackChannel {
            network: self.network.clone(),
            hostname: endpoint.hostname.clone(),
            target,
            state,
        }))
    }
}

struct LoopbackChannel {
    network: LoopbackNetwork,
    hostname: String,
    target: Service,
    state: watch::Sender<ChannelState>,
}

impl LoopbackChannel {
    fn check_alive(&self) -> RpcResult<()> {
        if *self.state.borrow() != ChannelState::Ready {
            return Err(RpcError::Closed);
        }
        if self.network.lookup(&self.hostname).is_none() {
            return Err(RpcError::unavailable("host left the network"));
        }
        Ok(())
    }
}

#[async_trait]
impl PeerChannel for LoopbackChannel {
    async fn ping(&self, _caller: &CallerIdentity) -> RpcResult<()> {
        self.check_alive()
    }

    async fn check_duplex(&self, caller: &CallerIdentity) -> RpcResult<bool> {
        self.check_alive()?;
        Ok(self.target.knows_peer(caller))
    }

    async fn wait_for_duplex(&self, caller: &CallerIdentity) -> RpcResult<bool> {
        self.check_duplex(caller).await
    }

    async fn machine_info(&self, _caller: &CallerIdentity) -> RpcResult<RemoteMachineInfo> {
        self.check_alive()?;
        Ok(self.target.machine_info())
    }

    async fn machine_avatar(&self, _caller: &CallerIdentity) -> RpcResult<Vec<u8>> {
        self.check_alive()?;
        Ok(self.target.machine_avatar())
    }

    async fn request_transfer(&self, offer: TransferOffer) -> RpcResult<()> {
        self.check_alive()?;
        let caller = offer.sender.clone();
        self.target
            .handle_transfer_request(&caller, offer)
            .map(|_| ())
            .map_err(remote)
    }

    async fn start_transfer(
        &self,
        caller: &CallerIdentity,
        op_id: u64,
    ) -> RpcResult<ChunkStream> {
        self.check_alive()?;
        self.target.handle_start_transfer(caller, op_id).map_err(remote)
    }

    async fn cancel_transfer_request(
        &self,
        caller: &CallerIdentity,
        op_id: u64,
    ) -> RpcResult<()> {
        self.check_alive()?;
        self.target.handle_cancel_request(caller, op_id);
        Ok(())
    }

    async fn stop_transfer(
        &self,
        caller: &CallerIdentity,
        op_id: u64,
        error: bool,
    ) -> RpcResult<()> {
        self.check_alive()?;
        self.target.handle_remote_stop(caller, op_id, error);
        Ok(())
    }

    fn state_changes(&self) -> watch::Receiver<ChannelState> {
        self.state.subscribe()
    }
}

fn remote(error: CoreError) -> RpcError {
    RpcError::Remote(error.to_string())
}
