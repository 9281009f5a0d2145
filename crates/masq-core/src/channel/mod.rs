//! Secure pairing channel
//!
//! ## Layers
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │  SecureChannel     send / recv / open_replication / close   │
//! │                    every frame sealed with the ChannelKey   │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Rendezvous        advertise(name) -> stream of Links       │
//! │                    MemoryHub (in-process) | GossipRendezvous│
//! ├─────────────────────────────────────────────────────────────┤
//! │  Link              framed duplex bytes, untrusted           │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! The rendezvous and the links below it are "secure enough but not
//! trusted": anything that reads or forges frames without the channel key
//! gets nothing but dropped frames.

mod gossip;
mod hub;
mod link;
mod secure;

pub use gossip::{topic_for, GossipRendezvous};
pub use hub::MemoryHub;
pub use link::{Link, LinkSender};
pub use secure::{ChannelFrame, SecureChannel};

use tokio::sync::mpsc;

use crate::error::MasqResult;

/// Signaling collaborator: finds peers advertising the same channel name.
///
/// The returned receiver yields one [`Link`] per discovered peer and stays
/// open for as long as the caller keeps it; dropping it withdraws the
/// advertisement. Implementations must be called inside a tokio runtime.
pub trait Rendezvous: Send + Sync {
    fn advertise(&self, channel: &str) -> MasqResult<mpsc::UnboundedReceiver<Link>>;
}
