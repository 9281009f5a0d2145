//! Feed exchange between two replicas
//!
//! ## Message Flow
//!
//! ```text
//! Replica A                          Replica B
//!   |                                   |
//!   |--- Have {heads: A's lengths} ---->|
//!   |<-- Have {heads: B's lengths} -----|
//!   |                                   |
//!   |    (each side sends what the      |
//!   |     other's heads are missing)    |
//!   |                                   |
//!   |--- Entries {…} ------------------>|
//!   |<-- Entries {…} -------------------|
//!   |                                   |
//!   |    (any later change re-announces)|
//!   |--- Have {…} --------------------->|
//! ```
//!
//! A side answers a `Have` with its own `Have` only when it is missing
//! something, so a session goes quiet once both replicas are equal.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use super::database::ReplicatedDb;
use super::entry::Entry;
use crate::channel::Link;
use crate::error::MasqResult;
use crate::identity::{DiscoveryKey, WriterId};

/// Messages exchanged by a replication session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ReplicationMessage {
    /// Feed lengths of the sender
    Have {
        discovery: DiscoveryKey,
        heads: Vec<(WriterId, u64)>,
    },
    /// Entries the receiver was missing
    Entries {
        discovery: DiscoveryKey,
        entries: Vec<Entry>,
    },
}

/// Versioned wrapper so the session protocol can evolve.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ReplicationWire {
    V1(ReplicationMessage),
}

impl ReplicationMessage {
    pub fn encode(&self) -> MasqResult<Vec<u8>> {
        Ok(postcard::to_allocvec(&ReplicationWire::V1(self.clone()))?)
    }

    pub fn decode(data: &[u8]) -> MasqResult<Self> {
        let ReplicationWire::V1(msg) = postcard::from_bytes(data)?;
        Ok(msg)
    }

    fn discovery(&self) -> &DiscoveryKey {
        match self {
            ReplicationMessage::Have { discovery, .. }
            | ReplicationMessage::Entries { discovery, .. } => discovery,
        }
    }
}

/// Counters for a finished session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplicationStats {
    pub sent_entries: usize,
    pub received_entries: usize,
    pub bad_frames: usize,
}

fn have(db: &ReplicatedDb) -> ReplicationMessage {
    ReplicationMessage::Have {
        discovery: db.discovery_key(),
        heads: db.heads(),
    }
}

/// Replicate `db` over `link` until the link closes.
///
/// Any number of sessions may run against the same database at once.
/// Malformed or foreign frames are skipped; only storage faults end the
/// session with an error.
pub async fn replicate(db: ReplicatedDb, link: Link) -> MasqResult<ReplicationStats> {
    let discovery = db.discovery_key();
    let mut events = db.subscribe();
    let (tx, mut rx) = link.split();
    let mut stats = ReplicationStats::default();

    debug!(db = db.name(), %discovery, "Replication started");
    if tx.send(have(&db).encode()?).is_err() {
        return Ok(stats);
    }

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {
                    if tx.send(have(&db).encode()?).is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            frame = rx.recv() => {
                let Some(frame) = frame else { break };
                let msg = match ReplicationMessage::decode(&frame) {
                    Ok(msg) => msg,
                    Err(e) => {
                        warn!(db = db.name(), error = %e, "Bad replication frame");
                        stats.bad_frames += 1;
                        continue;
                    }
                };
                if *msg.discovery() != discovery {
                    debug!(db = db.name(), "Frame for another database");
                    stats.bad_frames += 1;
                    continue;
                }

                match msg {
                    ReplicationMessage::Have { heads, .. } => {
                        let entries = db.entries_after(&heads);
                        if !entries.is_empty() {
                            stats.sent_entries += entries.len();
                            let reply = ReplicationMessage::Entries { discovery, entries };
                            if tx.send(reply.encode()?).is_err() {
                                break;
                            }
                        }
                        if db.lacks(&heads) && tx.send(have(&db).encode()?).is_err() {
                            break;
                        }
                    }
                    ReplicationMessage::Entries { entries, .. } => {
                        let report = db.ingest(entries)?;
                        stats.received_entries += report.applied;
                    }
                }
            }
        }
    }

    debug!(db = db.name(), ?stats, "Replication ended");
    Ok(stats)
}
