//! Symmetric-key channel over a rendezvous

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{Link, LinkSender, Rendezvous};
use crate::crypto::{ChannelKey, SecretBox};
use crate::error::{MasqError, MasqResult};
use crate::identity::DiscoveryKey;

/// Frames queued while no peer is connected; older frames are dropped
/// beyond this.
const MAX_BACKLOG: usize = 4096;

/// Plaintext of a sealed channel frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChannelFrame {
    /// Application payload for `recv`
    Message(Vec<u8>),
    /// Replication traffic for the database with this discovery key
    Replicate {
        discovery: DiscoveryKey,
        payload: Vec<u8>,
    },
}

struct Peer {
    id: u64,
    tx: LinkSender,
}

struct ChannelInner {
    name: String,
    secret_box: SecretBox,
    peers: Mutex<Vec<Peer>>,
    backlog: Mutex<VecDeque<Vec<u8>>>,
    next_peer_id: AtomicU64,
    messages_tx: mpsc::UnboundedSender<Vec<u8>>,
    messages_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
    replication: Mutex<HashMap<DiscoveryKey, mpsc::UnboundedSender<Vec<u8>>>>,
    peer_count: watch::Sender<usize>,
    dropped: AtomicU64,
    cancel: CancellationToken,
}

impl ChannelInner {
    fn add_peer(self: &Arc<Self>, link: Link) {
        let id = self.next_peer_id.fetch_add(1, Ordering::Relaxed);
        let (tx, mut rx) = link.split();

        let count = {
            let mut peers = self.peers.lock();
            let mut backlog = self.backlog.lock();
            for frame in backlog.drain(..) {
                let _ = tx.send(frame);
            }
            peers.push(Peer { id, tx });
            peers.len()
        };
        self.peer_count.send_replace(count);
        info!(channel = %self.name, peer = id, peers = count, "Peer connected");

        let inner = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = inner.cancel.cancelled() => break,
                    frame = rx.recv() => match frame {
                        Some(frame) => inner.handle_frame(&frame),
                        None => break,
                    }
                }
            }
            let count = {
                let mut peers = inner.peers.lock();
                peers.retain(|p| p.id != id);
                peers.len()
            };
            inner.peer_count.send_replace(count);
            debug!(channel = %inner.name, peer = id, "Peer disconnected");
        });
    }

    fn handle_frame(&self, sealed: &[u8]) {
        let plain = match self.secret_box.open(sealed) {
            Ok(plain) => plain,
            Err(_) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(
                    channel = %self.name,
                    dropped,
                    error = %MasqError::ChannelDecryptFailure,
                    "Dropping frame"
                );
                return;
            }
        };

        match postcard::from_bytes::<ChannelFrame>(&plain) {
            Ok(ChannelFrame::Message(payload)) => {
                let _ = self.messages_tx.send(payload);
            }
            Ok(ChannelFrame::Replicate { discovery, payload }) => {
                let mut sessions = self.replication.lock();
                match sessions.get(&discovery) {
                    Some(session) => {
                        if session.send(payload).is_err() {
                            sessions.remove(&discovery);
                        }
                    }
                    None => debug!(channel = %self.name, %discovery, "No replication session"),
                }
            }
            Err(e) => warn!(channel = %self.name, error = %e, "Malformed frame"),
        }
    }

    fn send_frame(&self, frame: &ChannelFrame) -> MasqResult<()> {
        if self.cancel.is_cancelled() {
            return Err(MasqError::ChannelClosed);
        }
        let sealed = self.secret_box.seal(&postcard::to_allocvec(frame)?)?;

        let mut peers = self.peers.lock();
        peers.retain(|p| !p.tx.is_closed());
        if peers.is_empty() {
            let mut backlog = self.backlog.lock();
            if backlog.len() >= MAX_BACKLOG {
                backlog.pop_front();
            }
            backlog.push_back(sealed);
            return Ok(());
        }
        for peer in peers.iter() {
            let _ = peer.tx.send(sealed.clone());
        }
        Ok(())
    }

    async fn recv(&self) -> MasqResult<Vec<u8>> {
        let mut rx = self.messages_rx.lock().await;
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(MasqError::ChannelClosed),
            msg = rx.recv() => msg.ok_or(MasqError::ChannelClosed),
        }
    }
}

/// A rendezvous channel whose frames are sealed with a pre-shared key.
///
/// Frames that fail to decrypt are dropped and counted; they never close
/// the channel. Dropping the handle closes the channel.
pub struct SecureChannel {
    inner: Arc<ChannelInner>,
}

impl SecureChannel {
    /// Advertise `name` on the rendezvous and start accepting peers.
    ///
    /// Returns immediately; peers are linked in as they are discovered.
    pub fn join(rendezvous: &dyn Rendezvous, name: &str, key: &ChannelKey) -> MasqResult<Self> {
        let mut links = rendezvous.advertise(name)?;
        let (messages_tx, messages_rx) = mpsc::unbounded_channel();
        let (peer_count, _) = watch::channel(0);

        let inner = Arc::new(ChannelInner {
            name: name.to_string(),
            secret_box: key.secret_box(),
            peers: Mutex::new(Vec::new()),
            backlog: Mutex::new(VecDeque::new()),
            next_peer_id: AtomicU64::new(0),
            messages_tx,
            messages_rx: tokio::sync::Mutex::new(messages_rx),
            replication: Mutex::new(HashMap::new()),
            peer_count,
            dropped: AtomicU64::new(0),
            cancel: CancellationToken::new(),
        });

        let accept = inner.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = accept.cancel.cancelled() => break,
                    link = links.recv() => match link {
                        Some(link) => accept.add_peer(link),
                        None => break,
                    }
                }
            }
        });

        info!(channel = name, "Joined channel");
        Ok(Self { inner })
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Send a payload to every connected peer.
    ///
    /// With no peer connected yet, the frame is held and delivered to the
    /// first peer that connects.
    pub fn send(&self, payload: Vec<u8>) -> MasqResult<()> {
        self.inner.send_frame(&ChannelFrame::Message(payload))
    }

    /// Next payload from any peer. Fails with `ChannelClosed` after `close`.
    pub async fn recv(&self) -> MasqResult<Vec<u8>> {
        self.inner.recv().await
    }

    /// Deliver every received payload to `callback` on a background task.
    ///
    /// Consumes the same queue as [`SecureChannel::recv`].
    pub fn on_message<F>(&self, mut callback: F) -> tokio::task::JoinHandle<()>
    where
        F: FnMut(Vec<u8>) + Send + 'static,
    {
        let inner = self.inner.clone();
        tokio::spawn(async move {
            while let Ok(payload) = inner.recv().await {
                callback(payload);
            }
        })
    }

    /// Wait until at least one peer is connected.
    pub async fn wait_for_peer(&self, timeout: Duration) -> MasqResult<()> {
        let mut count = self.inner.peer_count.subscribe();
        let wait = async {
            tokio::select! {
                _ = self.inner.cancel.cancelled() => Err(MasqError::ChannelClosed),
                result = count.wait_for(|n| *n > 0) => {
                    result.map(|_| ()).map_err(|_| MasqError::ChannelClosed)
                }
            }
        };
        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| MasqError::PeerNotFound(self.inner.name.clone()))?
    }

    pub fn peer_count(&self) -> usize {
        *self.inner.peer_count.borrow()
    }

    /// Frames dropped because they did not decrypt.
    pub fn dropped_frames(&self) -> u64 {
        self.inner.dropped.load(Ordering::Relaxed)
    }

    /// Carry replication traffic for one database over this channel.
    ///
    /// The returned link stays usable until the channel closes. Opening the
    /// same database twice replaces the earlier session.
    pub fn open_replication(&self, discovery: DiscoveryKey) -> Link {
        let (to_db_tx, to_db_rx) = mpsc::unbounded_channel();
        let (from_db_tx, mut from_db_rx) = mpsc::unbounded_channel::<Vec<u8>>();
        self.inner.replication.lock().insert(discovery, to_db_tx);

        let inner = self.inner.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = inner.cancel.cancelled() => break,
                    payload = from_db_rx.recv() => {
                        let Some(payload) = payload else { break };
                        let frame = ChannelFrame::Replicate { discovery, payload };
                        if let Err(e) = inner.send_frame(&frame) {
                            debug!(channel = %inner.name, error = %e, "Replication frame not sent");
                            break;
                        }
                    }
                }
            }
        });

        Link::new(from_db_tx, to_db_rx)
    }

    /// Tear down every peer link. Idempotent.
    pub fn close(&self) {
        if self.inner.cancel.is_cancelled() {
            return;
        }
        self.inner.cancel.cancel();
        self.inner.peers.lock().clear();
        self.inner.backlog.lock().clear();
        self.inner.replication.lock().clear();
        self.inner.peer_count.send_replace(0);
        info!(channel = %self.inner.name, "Channel closed");
    }

    pub fn is_closed(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }
}

impl Drop for SecureChannel {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for SecureChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecureChannel")
            .field("name", &self.inner.name)
            .field("peers", &self.peer_count())
            .field("closed", &self.is_closed())
            .finish()
    }
}
