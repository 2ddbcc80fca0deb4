//! Peer registry and per-peer connection lifecycle.

mod handler;
mod record;
mod registry;

pub use record::{ConnectionStatus, PeerKey, PeerRecord, PeerSnapshot, ProtocolGeneration};
pub use registry::PeerRegistry;
