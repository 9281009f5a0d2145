//! Symmetric encryption and password key derivation
//!
//! - [`SecretBox`] seals channel frames and private profile fields with
//!   ChaCha20-Poly1305. Each sealed message carries its own random nonce.
//! - [`ChannelKey`] is the 32-byte pre-shared secret of a pairing channel.
//!   Its text form (base64) is what users copy between devices.
//! - [`derive_password_key`] stretches a profile password with Argon2id.

use std::fmt;
use std::str::FromStr;

use argon2::{Algorithm, Argon2, Params, Version};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Nonce,
};
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::error::{MasqError, MasqResult};
use crate::identity::WriterId;

/// Nonce size for ChaCha20-Poly1305 (12 bytes)
pub const NONCE_SIZE: usize = 12;

/// Size of the random salt stored with each profile
pub const SALT_SIZE: usize = 16;

/// Authenticated symmetric encryption with ChaCha20-Poly1305.
///
/// # Wire Format
///
/// Sealed data format: `[nonce (12 bytes)] + [ciphertext + auth_tag (16 bytes)]`
///
/// # Example
///
/// ```
/// use masq_core::crypto::SecretBox;
///
/// let key = SecretBox::generate_key();
/// let secret_box = SecretBox::new(&key);
///
/// let sealed = secret_box.seal(b"Hello, World!").unwrap();
/// let opened = secret_box.open(&sealed).unwrap();
///
/// assert_eq!(opened.as_slice(), b"Hello, World!");
/// ```
pub struct SecretBox {
    cipher: ChaCha20Poly1305,
}

impl SecretBox {
    /// Create a new SecretBox with the given 32-byte key.
    pub fn new(key: &[u8; 32]) -> Self {
        Self {
            cipher: ChaCha20Poly1305::new(key.into()),
        }
    }

    /// Generate a new random 32-byte key.
    pub fn generate_key() -> [u8; 32] {
        let mut key = [0u8; 32];
        rand::rng().fill_bytes(&mut key);
        key
    }

    /// Encrypt `plaintext`, prepending a fresh random nonce.
    pub fn seal(&self, plaintext: &[u8]) -> MasqResult<Vec<u8>> {
        let mut nonce_bytes = [0u8; NONCE_SIZE];
        rand::rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext)
            .map_err(|e| MasqError::Crypto(format!("Encryption failed: {}", e)))?;

        let mut result = nonce_bytes.to_vec();
        result.extend_from_slice(&ciphertext);
        Ok(result)
    }

    /// Decrypt data produced by [`SecretBox::seal`].
    ///
    /// Wrong key, tampered data and truncated input all fail the same way.
    pub fn open(&self, sealed: &[u8]) -> MasqResult<Vec<u8>> {
        if sealed.len() < NONCE_SIZE {
            return Err(MasqError::Crypto(
                "Data too short to contain nonce".to_string(),
            ));
        }

        let nonce = Nonce::from_slice(&sealed[..NONCE_SIZE]);
        self.cipher
            .decrypt(nonce, &sealed[NONCE_SIZE..])
            .map_err(|e| MasqError::Crypto(format!("Decryption failed: {}", e)))
    }
}

/// Pre-shared symmetric key of a pairing channel.
#[derive(Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelKey([u8; 32]);

impl ChannelKey {
    /// Generate a fresh random channel key.
    pub fn generate() -> Self {
        Self(SecretBox::generate_key())
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Key of the replication swarm for a database.
    ///
    /// Every replica knows the database root, so every replica derives the
    /// same key without another exchange.
    pub fn for_database(root: &WriterId) -> Self {
        Self(blake3::derive_key("masq 2024 database swarm key", root.as_bytes()))
    }

    /// Base64 text form used in links and on the command line.
    pub fn to_base64(&self) -> String {
        BASE64.encode(self.0)
    }

    /// Parse the base64 text form.
    pub fn from_base64(s: &str) -> MasqResult<Self> {
        let bytes = BASE64
            .decode(s.trim())
            .map_err(|e| MasqError::InvalidRequest(format!("Invalid channel key: {}", e)))?;
        let bytes: [u8; 32] = bytes.try_into().map_err(|v: Vec<u8>| {
            MasqError::InvalidRequest(format!("Channel key must be 32 bytes, got {}", v.len()))
        })?;
        Ok(Self(bytes))
    }

    pub(crate) fn secret_box(&self) -> SecretBox {
        SecretBox::new(&self.0)
    }
}

impl fmt::Debug for ChannelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ChannelKey(..)")
    }
}

impl FromStr for ChannelKey {
    type Err = MasqError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_base64(s)
    }
}

/// Argon2id cost parameters, stored alongside each profile so a profile
/// created with one setting still opens after the default changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KdfParams {
    /// Memory cost in KiB
    pub memory_kib: u32,
    /// Number of passes
    pub iterations: u32,
    /// Degree of parallelism
    pub parallelism: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            memory_kib: 19 * 1024,
            iterations: 2,
            parallelism: 1,
        }
    }
}

/// Upper bounds for parameters received from another device.
pub const MAX_KDF_MEMORY_KIB: u32 = 256 * 1024;
pub const MAX_KDF_ITERATIONS: u32 = 16;
pub const MAX_KDF_PARALLELISM: u32 = 8;

impl KdfParams {
    /// Reject parameters that would make a derivation unreasonably costly.
    pub fn check_limits(&self) -> MasqResult<()> {
        if self.memory_kib > MAX_KDF_MEMORY_KIB
            || self.iterations > MAX_KDF_ITERATIONS
            || self.parallelism > MAX_KDF_PARALLELISM
        {
            return Err(MasqError::Crypto(format!(
                "KDF parameters out of bounds: {} KiB, {} passes, {} lanes",
                self.memory_kib, self.iterations, self.parallelism
            )));
        }
        Ok(())
    }

    /// Cheapest parameters Argon2 accepts. Only for tests.
    pub fn insecure_fast() -> Self {
        Self {
            memory_kib: 8,
            iterations: 1,
            parallelism: 1,
        }
    }
}

/// Generate a random salt for [`derive_password_key`].
pub fn generate_salt() -> [u8; SALT_SIZE] {
    let mut salt = [0u8; SALT_SIZE];
    rand::rng().fill_bytes(&mut salt);
    salt
}

/// Derive a 32-byte key from a password with Argon2id.
pub fn derive_password_key(password: &str, salt: &[u8], params: &KdfParams) -> MasqResult<[u8; 32]> {
    let params = Params::new(
        params.memory_kib,
        params.iterations,
        params.parallelism,
        Some(32),
    )
    .map_err(|e| MasqError::Crypto(format!("Invalid KDF parameters: {}", e)))?;

    let mut key = [0u8; 32];
    Argon2::new(Algorithm::Argon2id, Version::V0x13, params)
        .hash_password_into(password.as_bytes(), salt, &mut key)
        .map_err(|e| MasqError::Crypto(format!("Key derivation failed: {}", e)))?;
    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seal_open() {
        let secret_box = SecretBox::new(&SecretBox::generate_key());
        let sealed = secret_box.seal(b"vault").unwrap();
        assert_eq!(sealed.len(), NONCE_SIZE + 5 + 16);
        assert_eq!(secret_box.open(&sealed).unwrap(), b"vault");
    }

    #[test]
    fn test_same_plaintext_different_ciphertext() {
        let secret_box = SecretBox::new(&SecretBox::generate_key());
        assert_ne!(
            secret_box.seal(b"same").unwrap(),
            secret_box.seal(b"same").unwrap()
        );
    }

    #[test]
    fn test_wrong_key_fails() {
        let sealed = SecretBox::new(&[1u8; 32]).seal(b"secret").unwrap();
        let result = SecretBox::new(&[2u8; 32]).open(&sealed);
        assert!(matches!(result, Err(MasqError::Crypto(_))));
    }

    #[test]
    fn test_truncated_input_fails() {
        let secret_box = SecretBox::new(&[7u8; 32]);
        assert!(secret_box.open(&[0u8; 4]).is_err());
    }

    #[test]
    fn test_tampered_data_fails() {
        let secret_box = SecretBox::new(&[7u8; 32]);
        let mut sealed = secret_box.seal(b"do not touch").unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0xff;
        assert!(secret_box.open(&sealed).is_err());
    }

    #[test]
    fn test_channel_key_base64() {
        let key = ChannelKey::generate();
        let text = key.to_base64();
        assert_eq!(ChannelKey::from_base64(&text).unwrap(), key);
        assert_eq!(text.parse::<ChannelKey>().unwrap(), key);
    }

    #[test]
    fn test_channel_key_rejects_bad_length() {
        let short = BASE64.encode([0u8; 8]);
        assert!(matches!(
            ChannelKey::from_base64(&short),
            Err(MasqError::InvalidRequest(_))
        ));
        assert!(ChannelKey::from_base64("not base64!!").is_err());
    }

    #[test]
    fn test_database_key_is_deterministic() {
        let root = WriterId::from_bytes([3u8; 32]);
        let other = WriterId::from_bytes([4u8; 32]);
        assert_eq!(ChannelKey::for_database(&root), ChannelKey::for_database(&root));
        assert_ne!(ChannelKey::for_database(&root), ChannelKey::for_database(&other));
    }

    #[test]
    fn test_password_key_derivation() {
        let salt = generate_salt();
        let params = KdfParams::insecure_fast();
        let a = derive_password_key("hunter2", &salt, &params).unwrap();
        let b = derive_password_key("hunter2", &salt, &params).unwrap();
        let c = derive_password_key("hunter3", &salt, &params).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);

        let other_salt = generate_salt();
        assert_ne!(a, derive_password_key("hunter2", &other_salt, &params).unwrap());
    }

    #[test]
    fn test_invalid_kdf_params() {
        let params = KdfParams {
            memory_kib: 8,
            iterations: 0,
            parallelism: 1,
        };
        assert!(derive_password_key("p", &generate_salt(), &params).is_err());
    }

    #[test]
    fn test_kdf_limits() {
        assert!(KdfParams::default().check_limits().is_ok());
        assert!(KdfParams::insecure_fast().check_limits().is_ok());
        let greedy = KdfParams {
            memory_kib: u32::MAX,
            ..KdfParams::default()
        };
        assert!(matches!(greedy.check_limits(), Err(MasqError::Crypto(_))));
        let slow = KdfParams {
            iterations: MAX_KDF_ITERATIONS + 1,
            ..KdfParams::default()
        };
        assert!(slow.check_limits().is_err());
    }
}
