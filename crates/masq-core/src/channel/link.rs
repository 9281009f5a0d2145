//! Framed duplex byte transport

use tokio::sync::mpsc;

use crate::error::{MasqError, MasqResult};

/// One end of a bidirectional frame stream.
///
/// A link is what a rendezvous hands out per discovered peer (or per swarm,
/// for broadcast transports). Frames are opaque bytes; a link carries no
/// security of its own.
#[derive(Debug)]
pub struct Link {
    tx: LinkSender,
    rx: mpsc::UnboundedReceiver<Vec<u8>>,
}

/// Sending half of a [`Link`]. Cloneable.
#[derive(Debug, Clone)]
pub struct LinkSender {
    tx: mpsc::UnboundedSender<Vec<u8>>,
}

impl LinkSender {
    pub fn send(&self, frame: Vec<u8>) -> MasqResult<()> {
        self.tx.send(frame).map_err(|_| MasqError::ChannelClosed)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

impl Link {
    /// Build a link from raw channel halves.
    pub fn new(tx: mpsc::UnboundedSender<Vec<u8>>, rx: mpsc::UnboundedReceiver<Vec<u8>>) -> Self {
        Self {
            tx: LinkSender { tx },
            rx,
        }
    }

    /// Two links connected to each other.
    pub fn pair() -> (Link, Link) {
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();
        (Link::new(a_tx, b_rx), Link::new(b_tx, a_rx))
    }

    pub fn send(&self, frame: Vec<u8>) -> MasqResult<()> {
        self.tx.send(frame)
    }

    /// Next frame, or `None` once the other end is gone.
    pub async fn recv(&mut self) -> Option<Vec<u8>> {
        self.rx.recv().await
    }

    /// Next frame if one is already queued.
    pub fn try_recv(&mut self) -> Option<Vec<u8>> {
        self.rx.try_recv().ok()
    }

    pub fn split(self) -> (LinkSender, mpsc::UnboundedReceiver<Vec<u8>>) {
        (self.tx, self.rx)
    }
}
