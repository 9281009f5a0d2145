//! Per-writer append-only feed with hash chain
//!
//! ```text
//! ┌─────────────┐    ┌─────────────┐    ┌─────────────┐
//! │  Entry 0    │───▶│  Entry 1    │───▶│  Entry 2    │
//! │  seq: 0     │    │  seq: 1     │    │  seq: 2     │
//! │  prev: 0x0  │    │  prev: H(0) │    │  prev: H(1) │
//! └─────────────┘    └─────────────┘    └─────────────┘
//! ```
//!
//! Unlike a general log, a feed never holds gaps: an entry is only
//! appended when it directly extends the current head. Entries that arrive
//! early are kept aside by the database until the gap is filled.
//!
//! Two different entries claiming the same sequence is a fork. Forks are
//! reported and the newcomer is rejected; the first entry seen stays.

use super::entry::{Entry, GENESIS_HASH};
use crate::error::{MasqError, MasqResult};
use crate::identity::WriterId;

/// Outcome of offering an entry to a feed.
#[derive(Debug, Clone, PartialEq)]
pub enum Append {
    /// The entry extended the feed
    Appended,
    /// The feed already had this exact entry
    Duplicate,
    /// The entry is ahead of the head; earlier entries are missing
    Gap { expected: u64 },
    /// A different entry already holds this sequence
    Fork {
        seq: u64,
        existing_hash: [u8; 32],
        conflicting_hash: [u8; 32],
    },
}

/// Verified entries of a single writer, in sequence order.
#[derive(Debug, Clone)]
pub struct Feed {
    writer: WriterId,
    entries: Vec<Entry>,
    hashes: Vec<[u8; 32]>,
}

impl Feed {
    pub fn new(writer: WriterId) -> Self {
        Self {
            writer,
            entries: Vec::new(),
            hashes: Vec::new(),
        }
    }

    pub fn writer(&self) -> &WriterId {
        &self.writer
    }

    pub fn len(&self) -> u64 {
        self.entries.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Hash of the newest entry, or the genesis hash for an empty feed.
    pub fn head_hash(&self) -> [u8; 32] {
        self.hashes.last().copied().unwrap_or(GENESIS_HASH)
    }

    pub fn get(&self, seq: u64) -> Option<&Entry> {
        self.entries.get(seq as usize)
    }

    pub fn entries(&self) -> &[Entry] {
        &self.entries
    }

    /// Entries from `seq` (inclusive) to the head.
    pub fn entries_from(&self, seq: u64) -> &[Entry] {
        let start = (seq as usize).min(self.entries.len());
        &self.entries[start..]
    }

    /// Offer an entry to this feed.
    ///
    /// Signature and chain link are checked before anything is stored.
    /// Errors mean the entry is invalid and must be discarded.
    pub fn append(&mut self, entry: Entry) -> MasqResult<Append> {
        if entry.writer != self.writer {
            return Err(MasqError::InvalidEntry(format!(
                "entry by {} offered to feed of {}",
                entry.writer.short(),
                self.writer.short()
            )));
        }
        entry.verify()?;
        let hash = entry.hash()?;

        if let Some(existing) = self.hashes.get(entry.seq as usize) {
            if *existing == hash {
                return Ok(Append::Duplicate);
            }
            return Ok(Append::Fork {
                seq: entry.seq,
                existing_hash: *existing,
                conflicting_hash: hash,
            });
        }

        if entry.seq > self.len() {
            return Ok(Append::Gap {
                expected: self.len(),
            });
        }

        if entry.prev_hash != self.head_hash() {
            return Err(MasqError::InvalidEntry(format!(
                "hash chain broken at {}#{}: expected prev {}, got {}",
                self.writer.short(),
                entry.seq,
                hex::encode(self.head_hash()),
                hex::encode(entry.prev_hash)
            )));
        }

        self.entries.push(entry);
        self.hashes.push(hash);
        Ok(Append::Appended)
    }
}
