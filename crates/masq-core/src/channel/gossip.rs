//! Rendezvous over iroh-gossip
//!
//! Each channel name maps to a gossip topic. A device advertising a name
//! subscribes to the topic; as soon as the first neighbor shows up the
//! whole swarm is handed to the caller as a single broadcast [`Link`].

use iroh::discovery::static_provider::StaticProvider;
use iroh::protocol::Router;
use iroh::{Endpoint, EndpointAddr, EndpointId, SecretKey};
use iroh_gossip::net::{Gossip, GOSSIP_ALPN};
use iroh_gossip::proto::TopicId;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::{Link, Rendezvous};
use crate::error::{MasqError, MasqResult};

/// Gossip frames carry whole database batches; raise the 4KB default.
const MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// Gossip topic for a channel name.
pub fn topic_for(channel: &str) -> TopicId {
    TopicId::from_bytes(blake3::derive_key(
        "masq 2024 rendezvous topic",
        channel.as_bytes(),
    ))
}

/// Network rendezvous backed by an iroh endpoint with gossip.
#[derive(Debug)]
pub struct GossipRendezvous {
    endpoint: Endpoint,
    gossip: Gossip,
    router: Router,
    /// Static discovery provider for out-of-band peer addresses
    static_provider: StaticProvider,
    bootstrap: Vec<EndpointId>,
}

impl GossipRendezvous {
    /// Bind an endpoint and spawn the gossip protocol.
    ///
    /// `bootstrap` peers are dialed for every channel; they are how two
    /// devices on different networks find the same swarm.
    pub async fn new(secret_key: Option<SecretKey>, bootstrap: Vec<EndpointId>) -> MasqResult<Self> {
        let secret_key = secret_key.unwrap_or_else(|| SecretKey::generate(&mut rand::rng()));
        let static_provider = StaticProvider::new();

        let endpoint = Endpoint::builder()
            .secret_key(secret_key)
            .alpns(vec![GOSSIP_ALPN.to_vec()])
            .discovery(static_provider.clone())
            .bind()
            .await
            .map_err(|e| MasqError::Network(format!("Failed to bind endpoint: {}", e)))?;

        let endpoint_id = endpoint.id();
        info!(%endpoint_id, bootstrap = bootstrap.len(), "Endpoint bound");

        let gossip = Gossip::builder()
            .max_message_size(MAX_MESSAGE_SIZE)
            .spawn(endpoint.clone());

        let router = Router::builder(endpoint.clone())
            .accept(GOSSIP_ALPN, gossip.clone())
            .spawn();

        Ok(Self {
            endpoint,
            gossip,
            router,
            static_provider,
            bootstrap,
        })
    }

    /// This node's endpoint ID (what other devices put in `bootstrap_peers`)
    pub fn endpoint_id(&self) -> EndpointId {
        self.endpoint.id()
    }

    pub fn endpoint_addr(&self) -> EndpointAddr {
        self.endpoint.addr()
    }

    /// Make a peer's address known without DNS-based discovery.
    pub fn add_peer_addr(&self, endpoint_addr: EndpointAddr) {
        info!(
            peer = %endpoint_addr.id,
            addrs = endpoint_addr.addrs.len(),
            "Adding peer address to static discovery"
        );
        self.static_provider.add_endpoint_info(endpoint_addr);
    }

    pub async fn shutdown(&self) {
        info!("Shutting down gossip rendezvous");
        if let Err(e) = self.router.shutdown().await {
            warn!(error = ?e, "Failed to shutdown router cleanly");
        }
        self.endpoint.close().await;
    }
}

impl Rendezvous for GossipRendezvous {
    fn advertise(&self, channel: &str) -> MasqResult<mpsc::UnboundedReceiver<Link>> {
        let (links_tx, links_rx) = mpsc::unbounded_channel();
        let gossip = self.gossip.clone();
        let bootstrap = self.bootstrap.clone();
        let topic_id = topic_for(channel);
        let channel = channel.to_string();

        tokio::spawn(async move {
            use iroh_gossip::api::Event;
            use n0_future::StreamExt;

            let topic = match gossip.subscribe(topic_id, bootstrap).await {
                Ok(topic) => topic,
                Err(e) => {
                    warn!(%channel, error = %e, "Failed to subscribe");
                    return;
                }
            };
            info!(%channel, ?topic_id, "Subscribed to rendezvous topic");
            let (sender, mut receiver) = topic.split();

            let (local, remote) = Link::pair();
            let (remote_tx, mut remote_rx) = remote.split();
            let mut unannounced = Some(local);

            loop {
                tokio::select! {
                    _ = links_tx.closed() => break,
                    frame = remote_rx.recv(), if unannounced.is_none() => {
                        let Some(frame) = frame else { break };
                        if let Err(e) = sender.broadcast(frame.into()).await {
                            warn!(%channel, error = %e, "Failed to broadcast");
                        }
                    }
                    event = receiver.try_next() => match event {
                        Ok(Some(Event::NeighborUp(peer))) => {
                            info!(%channel, ?peer, "Neighbor joined");
                            if let Some(link) = unannounced.take() {
                                if links_tx.send(link).is_err() {
                                    break;
                                }
                            }
                        }
                        Ok(Some(Event::Received(msg))) => {
                            debug!(%channel, from = ?msg.delivered_from, len = msg.content.len(), "Received frame");
                            if remote_tx.send(msg.content.to_vec()).is_err() {
                                break;
                            }
                        }
                        Ok(Some(Event::NeighborDown(peer))) => {
                            info!(%channel, ?peer, "Neighbor left");
                        }
                        Ok(Some(Event::Lagged)) => {
                            warn!(%channel, "Lagged behind on topic");
                        }
                        Ok(None) => break,
                        Err(e) => {
                            warn!(%channel, error = ?e, "Error receiving from topic");
                            break;
                        }
                    }
                }
            }
            debug!(%channel, "Rendezvous subscription ended");
        });

        Ok(links_rx)
    }
}
