//! RPC transport boundary.
//!
//! The RPC library itself is an external collaborator; this module defines
//! the surface the orchestration layer calls through. A [`PeerConnector`]
//! dials peers and performs the certificate bootstrap; an open
//! [`PeerChannel`] carries the versioned method set exposed to peers.
//! Chunk streams are ordinary bounded mpsc channels so backpressure from a
//! slow receiver stalls the sender naturally.

use async_trait::async_trait;
use drift_files::ChunkRecord;
use std::borrow::Cow;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, watch};

/// RPC-level errors surfaced by the transport collaborator
#[derive(Debug, Error, Clone)]
pub enum RpcError {
    /// The peer could not be reached
    #[error("peer unavailable: {0}")]
    Unavailable(Cow<'static, str>),

    /// The call exceeded its deadline
    #[error("rpc deadline exceeded: {0}")]
    Timeout(Cow<'static, str>),

    /// The peer answered with an error
    #[error("remote error: {0}")]
    Remote(String),

    /// The channel was torn down mid-call
    #[error("channel closed")]
    Closed,
}

impl RpcError {
    /// Create an unavailable error with static context
    #[must_use]
    pub const fn unavailable(context: &'static str) -> Self {
        RpcError::Unavailable(Cow::Borrowed(context))
    }
}

/// Result type for boundary calls
pub type RpcResult<T> = std::result::Result<T, RpcError>;

/// Stream of chunks for one transfer, in manifest order
pub type ChunkStream = mpsc::Receiver<RpcResult<ChunkRecord>>;

/// Producing half of a chunk stream
pub type ChunkSink = mpsc::Sender<RpcResult<ChunkRecord>>;

/// Buffered chunks in flight per transfer stream
pub const CHUNK_STREAM_DEPTH: usize = 8;

/// Observable state of an open channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// Channel is connecting or reconnecting
    Connecting,
    /// Channel is established and usable
    Ready,
    /// Channel failed and will not recover on its own
    Failure,
}

/// Identity presented by the caller on every RPC
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallerIdentity {
    /// Stable instance identifier
    pub id: String,
    /// Caller hostname
    pub hostname: String,
}

/// Display metadata fetched from a peer after the handshake
#[derive(Debug, Clone, Default)]
pub struct RemoteMachineInfo {
    /// Full display name
    pub display_name: String,
    /// Short name
    pub short_name: String,
}

/// Address material needed to dial one peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerEndpoint {
    /// Announced hostname
    pub hostname: String,
    /// IPv4 address, if announced
    pub ipv4: Option<Ipv4Addr>,
    /// IPv6 address, if announced
    pub ipv6: Option<Ipv6Addr>,
    /// Transfer port
    pub port: u16,
    /// Certificate bootstrap port
    pub auth_port: u16,
}

/// Announcement of an incoming transfer, sent for approval before any chunk
/// flows
#[derive(Debug, Clone)]
pub struct TransferOffer {
    /// Sender-side operation id; quoted back in `start_transfer`
    pub op_id: u64,

    /// Who is offering the transfer
    pub sender: CallerIdentity,

    /// Total payload bytes
    pub total_size: u64,

    /// Total manifest entries
    pub element_count: u64,

    /// Top-level basenames, for the approval summary
    pub top_level_basenames: Vec<String>,

    /// Name of the single element for the 1-item case
    pub single_name: Option<String>,

    /// MIME type of the single element for the 1-item case
    pub single_mime: Option<String>,

    /// Whether chunk payloads will be compressed
    pub compress: bool,
}

/// Versioned method set every peer exposes
#[async_trait]
pub trait PeerChannel: Send + Sync {
    /// Liveness probe
    async fn ping(&self, caller: &CallerIdentity) -> RpcResult<()>;

    /// Generation-1 duplex probe: does the callee consider the connection
    /// duplex-confirmed right now?
    async fn check_duplex(&self, caller: &CallerIdentity) -> RpcResult<bool>;

    /// Generation-2 duplex wait: blocks server-side until the callee can
    /// open an inbound connection back to the caller
    async fn wait_for_duplex(&self, caller: &CallerIdentity) -> RpcResult<bool>;

    /// Fetch display metadata
    async fn machine_info(&self, caller: &CallerIdentity) -> RpcResult<RemoteMachineInfo>;

    /// Fetch the avatar image, concatenated from the byte stream
    async fn machine_avatar(&self, caller: &CallerIdentity) -> RpcResult<Vec<u8>>;

    /// Announce an outgoing transfer for approval
    async fn request_transfer(&self, offer: TransferOffer) -> RpcResult<()>;

    /// Ask the offering side to start streaming chunks for an accepted
    /// transfer
    async fn start_transfer(&self, caller: &CallerIdentity, op_id: u64)
        -> RpcResult<ChunkStream>;

    /// Withdraw or decline a transfer still awaiting permission
    async fn cancel_transfer_request(
        &self,
        caller: &CallerIdentity,
        op_id: u64,
    ) -> RpcResult<()>;

    /// Stop an active transfer; `error` distinguishes failure from a user
    /// stop
    async fn stop_transfer(
        &self,
        caller: &CallerIdentity,
        op_id: u64,
        error: bool,
    ) -> RpcResult<()>;

    /// Watch channel-state transitions
    fn state_changes(&self) -> watch::Receiver<ChannelState>;
}

/// Dialer and certificate bootstrap for the RPC transport
#[async_trait]
pub trait PeerConnector: Send + Sync {
    /// Generation-1 certificate exchange: one UDP request/response attempt
    /// against the peer's auth port
    async fn fetch_certificate_v1(&self, endpoint: &PeerEndpoint) -> RpcResult<Vec<u8>>;

    /// Generation-2 certificate request: unary RPC against the peer's auth
    /// port
    async fn fetch_certificate_v2(
        &self,
        endpoint: &PeerEndpoint,
        caller: &CallerIdentity,
    ) -> RpcResult<Vec<u8>>;

    /// Open a secured channel to the peer using the locked certificate blob
    async fn open_channel(
        &self,
        endpoint: &PeerEndpoint,
        certificate: &[u8],
    ) -> RpcResult<Arc<dyn PeerChannel>>;
}
