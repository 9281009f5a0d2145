//! Signed log entries
//!
//! An entry is one operation appended by one writer. Entries of a writer
//! form a hash chain (`prev_hash`), and each entry records the length of
//! every other feed its writer had seen (`clock`). The clock is what lets
//! readers tell causally ordered writes apart from concurrent ones.

use serde::{Deserialize, Serialize};

use crate::error::{MasqError, MasqResult};
use crate::identity::{WriterId, WriterKeypair};

/// Domain separation for entry signatures
const ENTRY_DOMAIN: &[u8] = b"masq-entry-v1";

/// Hash of the (nonexistent) entry before sequence 0
pub const GENESIS_HASH: [u8; 32] = [0u8; 32];

/// Operation carried by an entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Op {
    /// Set `path` to `value`
    Put { path: String, value: Vec<u8> },
    /// Remove `path`
    Delete { path: String },
    /// Add `writer` to the authorized-writer set
    Authorize { writer: WriterId },
}

impl Op {
    /// The path this operation writes, if any.
    pub fn path(&self) -> Option<&str> {
        match self {
            Op::Put { path, .. } | Op::Delete { path } => Some(path),
            Op::Authorize { .. } => None,
        }
    }
}

/// One signed, hash-chained operation in a writer's feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    pub writer: WriterId,
    pub seq: u64,
    pub prev_hash: [u8; 32],
    /// Lengths of the other feeds observed when this entry was written
    pub clock: Vec<(WriterId, u64)>,
    pub op: Op,
    pub signature: Vec<u8>,
}

#[derive(Serialize)]
struct SignedPart<'a> {
    domain: &'a [u8],
    writer: &'a WriterId,
    seq: u64,
    prev_hash: &'a [u8; 32],
    clock: &'a [(WriterId, u64)],
    op: &'a Op,
}

impl Entry {
    /// Create and sign a new entry.
    pub fn create(
        keypair: &WriterKeypair,
        seq: u64,
        prev_hash: [u8; 32],
        clock: Vec<(WriterId, u64)>,
        op: Op,
    ) -> MasqResult<Self> {
        let mut entry = Self {
            writer: keypair.public(),
            seq,
            prev_hash,
            clock,
            op,
            signature: Vec::new(),
        };
        entry.signature = keypair.sign(&entry.signed_bytes()?);
        Ok(entry)
    }

    fn signed_bytes(&self) -> MasqResult<Vec<u8>> {
        let part = SignedPart {
            domain: ENTRY_DOMAIN,
            writer: &self.writer,
            seq: self.seq,
            prev_hash: &self.prev_hash,
            clock: &self.clock,
            op: &self.op,
        };
        Ok(postcard::to_allocvec(&part)?)
    }

    /// Check the signature against the claimed writer.
    pub fn verify(&self) -> MasqResult<()> {
        self.writer
            .verify(&self.signed_bytes()?, &self.signature)
            .map_err(|_| {
                MasqError::InvalidEntry(format!(
                    "bad signature on {}#{}",
                    self.writer.short(),
                    self.seq
                ))
            })
    }

    /// Hash linking the next entry of the same feed to this one.
    pub fn hash(&self) -> MasqResult<[u8; 32]> {
        let mut hasher = blake3::Hasher::new();
        hasher.update(&self.signed_bytes()?);
        hasher.update(&self.signature);
        Ok(*hasher.finalize().as_bytes())
    }

    /// Length of `writer`'s feed this entry had observed.
    pub fn observed(&self, writer: &WriterId) -> u64 {
        self.clock
            .iter()
            .find(|(w, _)| w == writer)
            .map(|(_, len)| *len)
            .unwrap_or(0)
    }

    /// True if `other` was already in this entry's causal past.
    pub fn has_seen(&self, other: &Entry) -> bool {
        if other.writer == self.writer {
            return other.seq < self.seq;
        }
        self.observed(&other.writer) > other.seq
    }

    pub fn encode(&self) -> MasqResult<Vec<u8>> {
        Ok(postcard::to_allocvec(self)?)
    }

    pub fn decode(data: &[u8]) -> MasqResult<Self> {
        Ok(postcard::from_bytes(data)?)
    }
}
