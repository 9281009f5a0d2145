//! Error types for Masq

use thiserror::Error;

/// Main error type for Masq operations
#[derive(Error, Debug)]
pub enum MasqError {
    /// A writer that is not in the authorized-writer set tried to act as one
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// A channel frame could not be decrypted with the shared key
    #[error("Channel frame could not be decrypted")]
    ChannelDecryptFailure,

    /// No peer showed up on a rendezvous channel in time
    #[error("No peer found on channel {0}")]
    PeerNotFound(String),

    /// The supplied password does not unlock the profile
    #[error("Password does not match")]
    PasswordMismatch,

    /// A record update was submitted without its id
    #[error("Missing identifier")]
    MissingIdentifier,

    /// Profile was not found in local storage
    #[error("Profile not found: {0}")]
    ProfileNotFound(String),

    /// Device was not found in the profile database
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    /// An operation needs an open profile but none is open
    #[error("No profile is open")]
    NoOpenProfile,

    /// The peer closed the channel before the exchange finished
    #[error("Channel closed")]
    ChannelClosed,

    /// A handshake step did not complete in time
    #[error("Handshake timed out: {0}")]
    HandshakeTimeout(String),

    /// A malformed application request or link
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// A log entry failed validation
    #[error("Invalid entry: {0}")]
    InvalidEntry(String),

    /// Error during storage operations
    #[error("Storage error: {0}")]
    Storage(String),

    /// Database creation/opening error
    #[error("Database error: {0}")]
    Database(#[from] redb::DatabaseError),

    /// Transaction error
    #[error("Transaction error: {0}")]
    Transaction(#[from] redb::TransactionError),

    /// Table error
    #[error("Table error: {0}")]
    Table(#[from] redb::TableError),

    /// Storage operation error
    #[error("Storage operation error: {0}")]
    StorageOp(#[from] redb::StorageError),

    /// Commit error
    #[error("Commit error: {0}")]
    Commit(#[from] redb::CommitError),

    /// Error during serialization/deserialization
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Cryptographic operation failed
    #[error("Crypto error: {0}")]
    Crypto(String),

    /// Identity-related error (keys, signatures)
    #[error("Identity error: {0}")]
    Identity(String),

    /// Network-related error
    #[error("Network error: {0}")]
    Network(String),

    /// Configuration could not be read or parsed
    #[error("Config error: {0}")]
    Config(String),

    /// General I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid operation for current state
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),
}

impl From<postcard::Error> for MasqError {
    fn from(e: postcard::Error) -> Self {
        MasqError::Serialization(e.to_string())
    }
}

impl From<serde_json::Error> for MasqError {
    fn from(e: serde_json::Error) -> Self {
        MasqError::Serialization(e.to_string())
    }
}

/// Result type alias using MasqError
pub type MasqResult<T> = Result<T, MasqError>;
