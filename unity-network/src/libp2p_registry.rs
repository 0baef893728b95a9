//! The concrete `PeerRegistry` transport (§4.4.1), grounded directly in
//! `dxid-network::Libp2pNetwork`'s swarm construction: TCP + noise +
//! yamux, gossipsub for pubsub, identify + mdns for discovery. The
//! difference from the teacher is what rides on top of gossipsub: one
//! topic per message category instead of one topic per payload type,
//! and inbound activity posted as `PeerEvent`s on a channel instead of
//! being handled inline.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use libp2p::gossipsub::{self, IdentTopic, MessageAuthenticity, MessageId, ValidationMode};
use libp2p::identity::Keypair;
use libp2p::swarm::{NetworkBehaviour, Swarm, SwarmBuilder, SwarmEvent};
use libp2p::{identify, mdns, noise, tcp, yamux, Multiaddr, PeerId, Transport};
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::messages::{Envelope, GossipMessage};
use crate::registry::{PeerEvent, PeerHandle, PeerRegistry, Topic};
use crate::NetworkError;

#[derive(Debug, Clone)]
pub struct NetworkConfig {
    pub listen_addr: String,
    pub seed_nodes: Vec<String>,
}

#[derive(NetworkBehaviour)]
struct UnityBehaviour {
    gossipsub: gossipsub::Behaviour,
    identify: identify::Behaviour,
    mdns: mdns::tokio::Behaviour,
}

const PROTOCOL_VERSION: &str = "/unity/0.1";

const TOPICS: [Topic; 4] = [Topic::Inv, Topic::Headers, Topic::Blocks, Topic::Proposals];

enum Command {
    Broadcast(GossipMessage),
}

/// Owns the libp2p swarm on a dedicated task; cheap handles
/// (`PeerHandle`) and this struct itself are freely cloned/shared
/// (`Arc`) by callers that never touch the swarm directly.
pub struct Libp2pPeerRegistry {
    local_peer_id: PeerId,
    peers: Arc<RwLock<HashSet<PeerId>>>,
    cmd_tx: mpsc::UnboundedSender<Command>,
}

impl Libp2pPeerRegistry {
    /// Builds the swarm, subscribes to every topic, and spawns the
    /// event loop that owns it. `events_tx` receives every `PeerEvent`;
    /// the caller (`unity-node`) owns the corresponding receiver.
    pub fn spawn(
        config: &NetworkConfig,
        events_tx: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Arc<Libp2pPeerRegistry>, NetworkError> {
        let local_key = Keypair::generate_ed25519();
        let local_peer_id = PeerId::from(local_key.public());

        let transport = tcp::tokio::Transport::new(tcp::Config::default().nodelay(true))
            .upgrade(libp2p::core::upgrade::Version::V1)
            .authenticate(noise::Config::new(&local_key).map_err(|e| NetworkError::Transport(e.to_string()))?)
            .multiplex(yamux::Config::default())
            .boxed();

        let message_id_fn = |m: &gossipsub::Message| MessageId::from(blake3::hash(&m.data).to_hex().to_string());
        let gossipsub_config = gossipsub::ConfigBuilder::default()
            .message_id_fn(message_id_fn)
            .validation_mode(ValidationMode::Strict)
            .build()
            .map_err(|e| NetworkError::Transport(e.to_string()))?;
        let mut gossipsub =
            gossipsub::Behaviour::new(MessageAuthenticity::Signed(local_key.clone()), gossipsub_config)
                .map_err(|e| NetworkError::Transport(e.to_string()))?;
        for topic in TOPICS {
            gossipsub
                .subscribe(&IdentTopic::new(topic.as_str()))
                .map_err(|e| NetworkError::Transport(e.to_string()))?;
        }

        let identify = identify::Behaviour::new(identify::Config::new(PROTOCOL_VERSION.into(), local_key.public()));
        let mdns = mdns::tokio::Behaviour::new(mdns::Config::default(), local_peer_id)
            .map_err(|e| NetworkError::Transport(e.to_string()))?;

        let behaviour = UnityBehaviour { gossipsub, identify, mdns };
        let mut swarm = SwarmBuilder::with_tokio_executor(transport, behaviour, local_peer_id).build();

        let listen_addr: Multiaddr =
            config.listen_addr.parse().map_err(|_| NetworkError::BadMultiaddr(config.listen_addr.clone()))?;
        swarm.listen_on(listen_addr).map_err(|e| NetworkError::Transport(e.to_string()))?;
        for addr in &config.seed_nodes {
            let ma: Multiaddr = addr.parse().map_err(|_| NetworkError::BadMultiaddr(addr.clone()))?;
            swarm.dial(ma).map_err(|e| NetworkError::Transport(e.to_string()))?;
        }

        let peers = Arc::new(RwLock::new(HashSet::new()));
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();

        tokio::spawn(run_event_loop(swarm, peers.clone(), cmd_rx, events_tx));

        Ok(Arc::new(Libp2pPeerRegistry { local_peer_id, peers, cmd_tx }))
    }
}

async fn run_event_loop(
    mut swarm: Swarm<UnityBehaviour>,
    peers: Arc<RwLock<HashSet<PeerId>>>,
    mut cmd_rx: mpsc::UnboundedReceiver<Command>,
    events_tx: mpsc::UnboundedSender<PeerEvent>,
) {
    loop {
        tokio::select! {
            event = swarm.select_next_some() => handle_swarm_event(&mut swarm, &peers, &events_tx, event),
            cmd = cmd_rx.recv() => match cmd {
                Some(Command::Broadcast(message)) => publish(&mut swarm, message),
                None => return,
            },
        }
    }
}

fn publish(swarm: &mut Swarm<UnityBehaviour>, message: GossipMessage) {
    let topic = Topic::for_message(&message);
    let envelope = match Envelope::wrap(&message) {
        Ok(e) => e,
        Err(e) => {
            warn!("failed to encode outbound message: {e}");
            return;
        }
    };
    if let Err(e) = swarm.behaviour_mut().gossipsub.publish(IdentTopic::new(topic.as_str()), envelope.encode()) {
        warn!("gossipsub publish on {} failed: {e}", topic.as_str());
    }
}

fn handle_swarm_event(
    swarm: &mut Swarm<UnityBehaviour>,
    peers: &Arc<RwLock<HashSet<PeerId>>>,
    events_tx: &mpsc::UnboundedSender<PeerEvent>,
    event: SwarmEvent<UnityBehaviourEvent>,
) {
    match event {
        SwarmEvent::Behaviour(UnityBehaviourEvent::Gossipsub(gossipsub::Event::Message {
            propagation_source,
            message,
            ..
        })) => match Envelope::decode_message(&message.data) {
            Ok(decoded) => {
                let _ = events_tx.send(PeerEvent::Gossip { peer: PeerHandle(propagation_source), message: decoded });
            }
            Err(e) => warn!("dropping malformed message from {propagation_source}: {e}"),
        },
        SwarmEvent::Behaviour(UnityBehaviourEvent::Gossipsub(gossipsub::Event::Subscribed { peer_id, topic })) => {
            let _ = events_tx.send(PeerEvent::Subscribed {
                peer: PeerHandle(peer_id),
                topic: topic_name(topic.as_str()),
            });
        }
        SwarmEvent::Behaviour(UnityBehaviourEvent::Mdns(mdns::Event::Discovered(list))) => {
            for (peer, addr) in list {
                swarm.behaviour_mut().gossipsub.add_explicit_peer(&peer);
                peers.write().insert(peer);
                debug!("mdns discovered {peer} at {addr}");
            }
        }
        SwarmEvent::Behaviour(UnityBehaviourEvent::Mdns(mdns::Event::Expired(list))) => {
            for (peer, _addr) in list {
                peers.write().remove(&peer);
                let _ = events_tx.send(PeerEvent::Disconnected { peer: PeerHandle(peer) });
            }
        }
        SwarmEvent::NewListenAddr { address, .. } => info!("listening on {address}"),
        SwarmEvent::ConnectionEstablished { peer_id, .. } => {
            peers.write().insert(peer_id);
            info!("peer connected {peer_id}");
        }
        SwarmEvent::ConnectionClosed { peer_id, .. } => {
            peers.write().remove(&peer_id);
            let _ = events_tx.send(PeerEvent::Disconnected { peer: PeerHandle(peer_id) });
        }
        _ => {}
    }
}

/// `IdentTopic::as_str` doesn't give back a `&'static str`; the
/// registry of topics this core publishes to is small and fixed, so
/// map back to one rather than threading an owned `String` through
/// `PeerEvent`.
fn topic_name(s: &str) -> &'static str {
    TOPICS.iter().map(|t| t.as_str()).find(|name| *name == s).unwrap_or("unknown")
}

#[async_trait]
impl PeerRegistry for Libp2pPeerRegistry {
    fn local_peer_id(&self) -> PeerId {
        self.local_peer_id
    }

    fn peers(&self) -> Vec<PeerHandle> {
        self.peers.read().iter().copied().map(PeerHandle).collect()
    }

    async fn broadcast(&self, message: GossipMessage) -> Result<(), NetworkError> {
        self.cmd_tx.send(Command::Broadcast(message)).map_err(|_| NetworkError::RegistryShutDown)
    }
}
