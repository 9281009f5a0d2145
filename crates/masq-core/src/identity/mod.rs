//! Writer identities
//!
//! Every entry in a replicated database is signed by exactly one writer.
//! A writer is an Ed25519 keypair; its public half ([`WriterId`]) is what
//! gets authorized, recorded as a device's `localKey`, and used as the root
//! identity of a database it creates.
//!
//! The [`DiscoveryKey`] of a database is a one-way derivation of its root
//! identity, so peers can find each other without publishing the root.

mod keypair;

pub use keypair::WriterKeypair;

use std::fmt;
use std::str::FromStr;

use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{MasqError, MasqResult};

/// Public identity of a writer (Ed25519 public key).
///
/// Displays as 64 lowercase hex characters. Serializes as that hex string in
/// human-readable formats (JSON records) and as raw bytes otherwise.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WriterId([u8; 32]);

impl WriterId {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> MasqResult<Self> {
        let bytes = hex::decode(s.trim())
            .map_err(|e| MasqError::Identity(format!("Invalid writer id hex: {}", e)))?;
        let bytes: [u8; 32] = bytes.try_into().map_err(|v: Vec<u8>| {
            MasqError::Identity(format!("Writer id must be 32 bytes, got {}", v.len()))
        })?;
        Ok(Self(bytes))
    }

    /// First 8 hex characters, for log lines.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }

    /// Verify an Ed25519 signature made by this writer.
    pub fn verify(&self, message: &[u8], signature: &[u8]) -> MasqResult<()> {
        let key = VerifyingKey::from_bytes(&self.0)
            .map_err(|e| MasqError::Identity(format!("Invalid public key: {}", e)))?;
        let signature = Signature::from_slice(signature)
            .map_err(|e| MasqError::Identity(format!("Malformed signature: {}", e)))?;
        key.verify(message, &signature)
            .map_err(|_| MasqError::Identity(format!("Bad signature from {}", self.short())))
    }
}

impl fmt::Display for WriterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for WriterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "WriterId({})", self.short())
    }
}

impl FromStr for WriterId {
    type Err = MasqError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

impl Serialize for WriterId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        if serializer.is_human_readable() {
            serializer.serialize_str(&self.to_hex())
        } else {
            self.0.serialize(serializer)
        }
    }
}

impl<'de> Deserialize<'de> for WriterId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        if deserializer.is_human_readable() {
            let s = String::deserialize(deserializer)?;
            WriterId::from_hex(&s).map_err(D::Error::custom)
        } else {
            <[u8; 32]>::deserialize(deserializer).map(WriterId)
        }
    }
}

/// Public rendezvous fingerprint of a database.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DiscoveryKey([u8; 32]);

impl DiscoveryKey {
    pub fn from_root(root: &WriterId) -> Self {
        Self(blake3::derive_key("masq 2024 discovery key", root.as_bytes()))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for DiscoveryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for DiscoveryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DiscoveryKey({})", &self.to_hex()[..8])
    }
}
