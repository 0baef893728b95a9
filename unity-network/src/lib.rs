//! The §4.4 peer layer: wire-level message framing (`messages`), the
//! transport-agnostic `PeerRegistry` surface (`registry`), and its
//! libp2p-backed implementation (`libp2p_registry`).

use thiserror::Error;

pub mod libp2p_registry;
pub mod messages;
pub mod registry;

pub use libp2p_registry::{Libp2pPeerRegistry, NetworkConfig};
pub use messages::{Envelope, GossipMessage, MessageType};
pub use registry::{PeerEvent, PeerHandle, PeerRegistry, Topic};

#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("message envelope truncated")]
    Truncated,
    #[error("unknown wire message type {0}")]
    UnknownMessageType(u16),
    #[error("json encode/decode error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("invalid multiaddr: {0}")]
    BadMultiaddr(String),
    #[error("peer registry's event loop has shut down")]
    RegistryShutDown,
}
