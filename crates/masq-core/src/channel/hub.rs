//! In-process rendezvous

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::debug;

use super::{Link, Rendezvous};
use crate::error::MasqResult;

/// Rendezvous where every advertiser of a channel name is linked directly
/// to every other advertiser of the same name.
///
/// Used to run several devices inside one process (tests, local demos) and
/// as the offline rendezvous of the CLI.
#[derive(Clone, Default)]
pub struct MemoryHub {
    rooms: Arc<Mutex<HashMap<String, Vec<mpsc::UnboundedSender<Link>>>>>,
}

impl MemoryHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live advertisers on `channel`.
    pub fn members(&self, channel: &str) -> usize {
        let mut rooms = self.rooms.lock();
        match rooms.get_mut(channel) {
            Some(members) => {
                members.retain(|m| !m.is_closed());
                members.len()
            }
            None => 0,
        }
    }
}

impl Rendezvous for MemoryHub {
    fn advertise(&self, channel: &str) -> MasqResult<mpsc::UnboundedReceiver<Link>> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut rooms = self.rooms.lock();
        let members = rooms.entry(channel.to_string()).or_default();
        members.retain(|m| !m.is_closed());

        for member in members.iter() {
            let (theirs, ours) = Link::pair();
            if member.send(theirs).is_ok() {
                let _ = tx.send(ours);
            }
        }
        debug!(channel, peers = members.len(), "Advertised on memory hub");
        members.push(tx);
        Ok(rx)
    }
}
