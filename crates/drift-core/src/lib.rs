//! # Drift Core
//!
//! Orchestration layer of the drift LAN file-transfer service: peer
//! registry and per-peer connection lifecycle, transfer lifecycle and
//! chunked streaming, and the observer event surface.
//!
//! This crate provides:
//! - Peer registry with one connection task per discovered peer
//! - Two connection generations (polled v1, channel-watched v2)
//! - Transfer manager covering offer, permission, streaming, pause, stop
//! - Chunk sender/receiver with compression and permission stamping
//! - Speed/ETA estimation and throttled progress events
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                         Service                                  │
//! │   (facade: discovery feed, operation surface, event bus)        │
//! ├─────────────────────────────────────────────────────────────────┤
//! │        PeerRegistry              TransferManager                 │
//! │   (connection task per peer)  (record + stream task per op)    │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                    PeerConnector / PeerChannel                   │
//! │   (pluggable transport boundary; loopback impl included)       │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod discovery;
pub mod error;
pub mod event;
pub mod loopback;
pub mod peer;
pub mod policy;
pub mod rpc;
pub mod service;
pub mod sync;
pub mod transfer;

pub use config::{ConnectionConfig, CrawlConfig, ServiceConfig, TransferConfig};
pub use discovery::{ServiceAnnouncement, SERVICE_TYPE_FLUSH, SERVICE_TYPE_REAL};
pub use error::{CoreError, Result};
pub use event::{EventBus, EventCallback, ServiceEvent};
pub use loopback::LoopbackNetwork;
pub use peer::{ConnectionStatus, PeerKey, PeerRecord, PeerRegistry, PeerSnapshot, ProtocolGeneration};
pub use policy::{DefaultStoragePolicy, OutputRootResolver, PathResolver, StoragePolicy};
pub use rpc::{
    CallerIdentity, ChannelState, ChunkSink, ChunkStream, PeerChannel, PeerConnector,
    PeerEndpoint, RemoteMachineInfo, RpcError, RpcResult, TransferOffer,
};
pub use service::{LocalIdentity, Service};
pub use sync::{GateResolution, PauseGate, StopSignal};
pub use transfer::{
    SpeedEstimator, TransferDirection, TransferManager, TransferRecord, TransferSnapshot,
    TransferStatus,
};
