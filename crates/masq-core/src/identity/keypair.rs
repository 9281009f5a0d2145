//! Ed25519 writer keypair

use ed25519_dalek::{Signer, SigningKey};

use super::WriterId;
use crate::error::{MasqError, MasqResult};

/// Signing half of a writer identity.
///
/// The secret never leaves the device: it is persisted in the database
/// metadata record of the replica that owns it and nowhere else.
#[derive(Clone)]
pub struct WriterKeypair {
    signing: SigningKey,
}

impl WriterKeypair {
    /// Generate a new random keypair
    pub fn generate() -> Self {
        // Seed from the OS rng directly to avoid rand_core version conflicts
        // with ed25519-dalek.
        let mut seed = [0u8; 32];
        rand::RngCore::fill_bytes(&mut rand::rng(), &mut seed);
        Self {
            signing: SigningKey::from_bytes(&seed),
        }
    }

    /// Rebuild a keypair from its 32-byte secret seed
    pub fn from_secret_bytes(bytes: &[u8]) -> MasqResult<Self> {
        let seed: [u8; 32] = bytes
            .try_into()
            .map_err(|_| MasqError::Identity("Writer secret must be 32 bytes".to_string()))?;
        Ok(Self {
            signing: SigningKey::from_bytes(&seed),
        })
    }

    pub fn secret_bytes(&self) -> [u8; 32] {
        self.signing.to_bytes()
    }

    pub fn public(&self) -> WriterId {
        WriterId::from_bytes(self.signing.verifying_key().to_bytes())
    }

    /// Sign a message, returning the 64-byte signature
    pub fn sign(&self, message: &[u8]) -> Vec<u8> {
        self.signing.sign(message).to_bytes().to_vec()
    }
}

impl std::fmt::Debug for WriterKeypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriterKeypair")
            .field("public", &self.public())
            .finish_non_exhaustive()
    }
}
