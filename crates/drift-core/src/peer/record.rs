//! Shared per-peer state.
//!
//! A [`PeerRecord`] is the single shared handle for one discovered machine.
//! The registry owns the map of records, the connection task drives the
//! record's status, and the transfer manager reads the channel slot off it.
//! Everything here is plain interior mutability; the record itself never
//! spawns or blocks.

use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::discovery::ServiceAnnouncement;
use crate::rpc::{PeerChannel, PeerEndpoint};
use crate::sync::StopSignal;

/// Which handshake and session style a peer speaks.
///
/// Generation 1 registers over a datagram exchange and is kept alive by
/// polling pings; generation 2 registers over an RPC call and is watched
/// through channel state transitions. Announced versions outside the known
/// range clamp to the nearest supported generation, and a missing or
/// unparseable version field means generation 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProtocolGeneration {
    /// Datagram registration, polled liveness
    V1,
    /// RPC registration, event-driven liveness
    V2,
}

impl ProtocolGeneration {
    /// Map an announced api version onto a supported generation
    #[must_use]
    pub fn from_announced(api_version: u32) -> Self {
        if api_version >= 2 { Self::V2 } else { Self::V1 }
    }

    /// Parse the `api-version` TXT field of an announcement
    #[must_use]
    pub fn from_announcement(announcement: &ServiceAnnouncement) -> Self {
        let version = announcement
            .api_version
            .as_deref()
            .and_then(|v| v.trim().parse::<u32>().ok())
            .unwrap_or(1);
        Self::from_announced(version)
    }
}

impl fmt::Display for ProtocolGeneration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::V1 => write!(f, "v1"),
            Self::V2 => write!(f, "v2"),
        }
    }
}

/// Connection lifecycle phase of a peer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    /// No live session; nothing in flight
    Offline,
    /// Handshake in progress
    Registration,
    /// Handshake failed; backing off before another attempt
    Unreachable,
    /// We reach the peer but it cannot yet reach us back
    AwaitingDuplex,
    /// Fully connected in both directions
    Online,
}

impl ConnectionStatus {
    /// True once the peer can accept transfer traffic
    #[must_use]
    pub fn is_online(self) -> bool {
        matches!(self, Self::Online)
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Offline => "offline",
            Self::Registration => "registering",
            Self::Unreachable => "unreachable",
            Self::AwaitingDuplex => "awaiting duplex",
            Self::Online => "online",
        };
        f.write_str(label)
    }
}

/// Identity a peer is registered under
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PeerKey {
    /// Announced hostname
    pub hostname: String,
    /// IPv4 address, when announced
    pub ipv4: Option<Ipv4Addr>,
    /// IPv6 address, when announced
    pub ipv6: Option<Ipv6Addr>,
}

impl PeerKey {
    /// Build a key from a discovery announcement
    #[must_use]
    pub fn from_announcement(announcement: &ServiceAnnouncement) -> Self {
        Self {
            hostname: announcement.hostname.clone().unwrap_or_default(),
            ipv4: announcement.ipv4,
            ipv6: announcement.ipv6,
        }
    }
}

impl fmt::Display for PeerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.hostname)
    }
}

#[derive(Debug, Default)]
struct DisplayInfo {
    display_name: String,
    short_name: String,
    avatar: Option<Vec<u8>>,
}

/// Read-only view of a peer for event consumers
#[derive(Debug, Clone)]
pub struct PeerSnapshot {
    /// Registry key
    pub key: PeerKey,
    /// Human-readable name, when fetched
    pub display_name: String,
    /// Short account-style name, when fetched
    pub short_name: String,
    /// Announced operating system
    pub os: String,
    /// Protocol generation in use
    pub generation: ProtocolGeneration,
    /// Current lifecycle phase
    pub status: ConnectionStatus,
    /// Whether the peer should be shown in pickers
    pub visible: bool,
    /// Number of transfers currently running against this peer
    pub active_transfers: usize,
}

/// Shared state for one remote machine
///
/// Mutable fields sit behind std mutexes: every critical section is a short
/// synchronous read or write, and no guard is ever held across an await.
pub struct PeerRecord {
    key: PeerKey,
    instance_id: String,
    os: String,
    generation: ProtocolGeneration,
    endpoint: Mutex<PeerEndpoint>,
    status: Mutex<ConnectionStatus>,
    display: Mutex<DisplayInfo>,
    channel: Mutex<Option<Arc<dyn PeerChannel>>>,
    visible: AtomicBool,
    announced: AtomicBool,
    active_transfers: AtomicUsize,
    stop: StopSignal,
}

impl PeerRecord {
    /// Create a record from a discovery announcement
    #[must_use]
    pub fn new(announcement: &ServiceAnnouncement) -> Arc<Self> {
        let key = PeerKey::from_announcement(announcement);
        Arc::new(Self {
            endpoint: Mutex::new(endpoint_of(&key, announcement)),
            key,
            instance_id: announcement.instance_id.clone(),
            os: announcement.os.clone().unwrap_or_default(),
            generation: ProtocolGeneration::from_announcement(announcement),
            status: Mutex::new(ConnectionStatus::Offline),
            display: Mutex::new(DisplayInfo::default()),
            channel: Mutex::new(None),
            visible: AtomicBool::new(false),
            announced: AtomicBool::new(true),
            active_transfers: AtomicUsize::new(0),
            stop: StopSignal::new(),
        })
    }

    /// Registry key
    #[must_use]
    pub fn key(&self) -> &PeerKey {
        &self.key
    }

    /// Announced hostname
    #[must_use]
    pub fn hostname(&self) -> &str {
        &self.key.hostname
    }

    /// Stable instance id the peer announced
    #[must_use]
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Protocol generation the peer announced
    #[must_use]
    pub fn generation(&self) -> ProtocolGeneration {
        self.generation
    }

    /// Stop signal for the connection task
    #[must_use]
    pub fn stop(&self) -> &StopSignal {
        &self.stop
    }

    /// Current endpoint, refreshed on each announcement
    #[must_use]
    pub fn endpoint(&self) -> PeerEndpoint {
        self.endpoint.lock().unwrap().clone()
    }

    /// Absorb a fresh announcement for an already-known peer
    pub fn refresh_endpoint(&self, announcement: &ServiceAnnouncement) {
        *self.endpoint.lock().unwrap() = endpoint_of(&self.key, announcement);
    }

    /// Current lifecycle phase
    #[must_use]
    pub fn status(&self) -> ConnectionStatus {
        *self.status.lock().unwrap()
    }

    /// Move to a new lifecycle phase, reporting whether anything changed
    pub fn set_status(&self, status: ConnectionStatus) -> bool {
        let mut slot = self.status.lock().unwrap();
        if *slot == status {
            return false;
        }
        tracing::debug!(peer = %self.key, from = %slot, to = %status, "peer status change");
        *slot = status;
        true
    }

    /// Store fetched display names
    pub fn set_display_names(&self, display_name: String, short_name: String) {
        let mut display = self.display.lock().unwrap();
        display.display_name = display_name;
        display.short_name = short_name;
    }

    /// Store a fetched avatar image
    pub fn set_avatar(&self, avatar: Option<Vec<u8>>) {
        self.display.lock().unwrap().avatar = avatar;
    }

    /// Fetched avatar image, if any
    #[must_use]
    pub fn avatar(&self) -> Option<Vec<u8>> {
        self.display.lock().unwrap().avatar.clone()
    }

    /// Install the live channel for this peer
    pub fn set_channel(&self, channel: Option<Arc<dyn PeerChannel>>) {
        *self.channel.lock().unwrap() = channel;
    }

    /// Live channel, if the connection task has established one
    #[must_use]
    pub fn channel(&self) -> Option<Arc<dyn PeerChannel>> {
        self.channel.lock().unwrap().clone()
    }

    /// Whether the peer should appear in pickers
    #[must_use]
    pub fn is_visible(&self) -> bool {
        self.visible.load(Ordering::Acquire)
    }

    /// Flip picker visibility, reporting whether anything changed
    pub fn set_visible(&self, visible: bool) -> bool {
        self.visible.swap(visible, Ordering::AcqRel) != visible
    }

    /// Whether discovery currently claims this peer is present
    #[must_use]
    pub fn is_announced(&self) -> bool {
        self.announced.load(Ordering::Acquire)
    }

    /// Record an announcement or withdrawal from discovery
    pub fn set_announced(&self, announced: bool) {
        self.announced.store(announced, Ordering::Release);
    }

    /// Mark the start of a transfer against this peer
    ///
    /// While any transfer is active the liveness loop stays quiet so it does
    /// not compete with streaming traffic.
    pub fn transfer_begin(&self) {
        self.active_transfers.fetch_add(1, Ordering::AcqRel);
    }

    /// Mark the end of a transfer against this peer
    pub fn transfer_end(&self) {
        self.active_transfers.fetch_sub(1, Ordering::AcqRel);
    }

    /// Whether any transfer is currently running against this peer
    #[must_use]
    pub fn is_busy(&self) -> bool {
        self.active_transfers.load(Ordering::Acquire) > 0
    }

    /// Snapshot for event consumers
    #[must_use]
    pub fn snapshot(&self) -> PeerSnapshot {
        let display = self.display.lock().unwrap();
        PeerSnapshot {
            key: self.key.clone(),
            display_name: display.display_name.clone(),
            short_name: display.short_name.clone(),
            os: self.os.clone(),
            generation: self.generation,
            status: self.status(),
            visible: self.is_visible(),
            active_transfers: self.active_transfers.load(Ordering::Acquire),
        }
    }
}

impl fmt::Debug for PeerRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerRecord")
            .field("key", &self.key)
            .field("generation", &self.generation)
            .field("status", &self.status())
            .field("visible", &self.is_visible())
            .finish_non_exhaustive()
    }
}

fn endpoint_of(key: &PeerKey, announcement: &ServiceAnnouncement) -> PeerEndpoint {
    PeerEndpoint {
        hostname: key.hostname.clone(),
        ipv4: announcement.ipv4,
        ipv6: announcement.ipv6,
        port: announcement.port,
        auth_port: announcement.auth_port.unwrap_or(announcement.port),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn announcement() -> ServiceAnnouncement {
        ServiceAnnouncement {
            instance_id: "abc123".into(),
            port: 42000,
            ipv4: Some(Ipv4Addr::new(192, 168, 10, 7)),
            ipv6: None,
            hostname: Some("workshop".into()),
            kind: Some(crate::discovery::SERVICE_TYPE_REAL.into()),
            os: Some("Linux".into()),
            api_version: Some("2".into()),
            auth_port: Some(42001),
        }
    }

    #[test]
    fn generation_clamps_to_supported_range() {
        assert_eq!(ProtocolGeneration::from_announced(0), ProtocolGeneration::V1);
        assert_eq!(ProtocolGeneration::from_announced(1), ProtocolGeneration::V1);
        assert_eq!(ProtocolGeneration::from_announced(2), ProtocolGeneration::V2);
        assert_eq!(ProtocolGeneration::from_announced(17), ProtocolGeneration::V2);
    }

    #[test]
    fn unparseable_version_falls_back_to_v1() {
        let mut ann = announcement();
        ann.api_version = Some("banana".into());
        assert_eq!(ProtocolGeneration::from_announcement(&ann), ProtocolGeneration::V1);
        ann.api_version = None;
        assert_eq!(ProtocolGeneration::from_announcement(&ann), ProtocolGeneration::V1);
    }

    #[test]
    fn status_change_reports_transitions_only() {
        let record = PeerRecord::new(&announcement());
        assert_eq!(record.status(), ConnectionStatus::Offline);
        assert!(record.set_status(ConnectionStatus::Registration));
        assert!(!record.set_status(ConnectionStatus::Registration));
        assert!(record.set_status(ConnectionStatus::Online));
        assert!(record.status().is_online());
    }

    #[test]
    fn busy_tracks_nested_transfers() {
        let record = PeerRecord::new(&announcement());
        assert!(!record.is_busy());
        record.transfer_begin();
        record.transfer_begin();
        record.transfer_end();
        assert!(record.is_busy());
        record.transfer_end();
        assert!(!record.is_busy());
    }

    #[test]
    fn refresh_updates_endpoint_ports() {
        let record = PeerRecord::new(&announcement());
        let mut updated = announcement();
        updated.port = 43000;
        updated.auth_port = Some(43001);
        record.refresh_endpoint(&updated);
        let endpoint = record.endpoint();
        assert_eq!(endpoint.port, 43000);
        assert_eq!(endpoint.auth_port, 43001);
    }

    #[test]
    fn auth_port_defaults_to_transfer_port() {
        let mut ann = announcement();
        ann.auth_port = None;
        let record = PeerRecord::new(&ann);
        assert_eq!(record.endpoint().auth_port, 42000);
    }

    #[test]
    fn snapshot_reflects_display_names() {
        let record = PeerRecord::new(&announcement());
        record.set_display_names("Work Shop".into(), "shop".into());
        let snapshot = record.snapshot();
        assert_eq!(snapshot.display_name, "Work Shop");
        assert_eq!(snapshot.short_name, "shop");
        assert_eq!(snapshot.generation, ProtocolGeneration::V2);
    }
}
