//! The §4.4.1 transport-binding redesign: `PeerRegistry` owns every
//! `PeerHandle`; a handle carries only a `PeerId`, never a back-pointer
//! into the registry, so there is no cyclic peer↔delegate reference to
//! manage. Inbound activity is posted as `PeerEvent`s onto an `mpsc`
//! channel the registry's owner polls, rather than invoked through a
//! callback trait object.

use async_trait::async_trait;
use libp2p::PeerId;

use crate::messages::GossipMessage;
use crate::NetworkError;

/// The four gossipsub topics this core publishes/subscribes to, one
/// per message category.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum Topic {
    Inv,
    Headers,
    Blocks,
    Proposals,
}

impl Topic {
    pub fn as_str(&self) -> &'static str {
        match self {
            Topic::Inv => "unity-inv",
            Topic::Headers => "unity-headers",
            Topic::Blocks => "unity-blocks",
            Topic::Proposals => "unity-proposals",
        }
    }

    /// Which topic a given message belongs on.
    pub fn for_message(message: &GossipMessage) -> Topic {
        match message {
            GossipMessage::Inv { .. } => Topic::Inv,
            GossipMessage::GetHeaders { .. } | GossipMessage::Headers { .. } => Topic::Headers,
            GossipMessage::GetBlock { .. }
            | GossipMessage::Block { .. }
            | GossipMessage::GetNameHeader { .. }
            | GossipMessage::NameHeader { .. }
            | GossipMessage::BlockIndex { .. } => Topic::Blocks,
            GossipMessage::Proposal { .. } | GossipMessage::Blob { .. } | GossipMessage::GetBlob { .. } => Topic::Proposals,
        }
    }
}

/// A slot key into the owning registry; cheap to clone, carries no
/// shared state of its own.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct PeerHandle(pub PeerId);

impl PeerHandle {
    pub fn peer_id(&self) -> PeerId {
        self.0
    }
}

/// Everything the owning event loop needs to know about peer activity,
/// posted instead of invoked (the "callbacks become explicit events"
/// redesign).
#[derive(Clone, Debug)]
pub enum PeerEvent {
    Subscribed { peer: PeerHandle, topic: &'static str },
    Gossip { peer: PeerHandle, message: GossipMessage },
    Disconnected { peer: PeerHandle },
}

/// The transport-agnostic surface `unity-node` programs against;
/// `Libp2pPeerRegistry` is the only implementation in this workspace.
#[async_trait]
pub trait PeerRegistry: Send + Sync {
    fn local_peer_id(&self) -> PeerId;
    fn peers(&self) -> Vec<PeerHandle>;
    async fn broadcast(&self, message: GossipMessage) -> Result<(), NetworkError>;
}
