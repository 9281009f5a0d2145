//! Pairing protocols run over a [`SecureChannel`]
//!
//! Both protocols exchange [`ProtocolMessage`]s as channel messages while
//! the database they concern replicates on the same channel.
//!
//! ## Profile push / pull
//!
//! ```text
//! Pusher (has profile)                    Puller (new device)
//!   |--- ProfilePush {profile, db_key} ----->|  check password, store record,
//!   |                                        |  open replica, replicate
//!   |<-- ProfilePullAck {writer, proof} -----|
//!   |    authorize(writer)                   |
//!   |    ...replication...                   |  wait until writer authorized
//!   |<-- ProfilePullDone --------------------|
//! ```
//!
//! ## App authorization
//!
//! ```text
//! Vault (grantor)                         App (requester)
//!   |--- AppKeyOffer {app_id, db_key} ------>|  open replica, replicate
//!   |<-- AppKeyGrant {app_id, writer, proof}-|
//!   |    authorize(writer), record grant     |
//!   |--- AppAuthorized {app_id} ------------>|
//! ```

pub mod app_auth;
pub mod profile_sync;

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::channel::SecureChannel;
use crate::error::{MasqError, MasqResult};
use crate::identity::WriterId;
use crate::types::Profile;

pub use app_auth::{grant_access, requested_db_name, AppRequest, AppRequestState, AppRequester};
pub use profile_sync::{complete_pull, push_profile, receive_push, replicate_over, PulledProfile};

/// Signature context of a [`ProtocolMessage::ProfilePullAck`] proof.
pub const PULL_ACK_CONTEXT: &[u8] = b"masq profile pull ack";
/// Signature context of a [`ProtocolMessage::AppKeyGrant`] proof.
pub const APP_GRANT_CONTEXT: &[u8] = b"masq app key grant";

/// Messages of the pairing protocols.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProtocolMessage {
    /// Public profile (already carrying the receiver's id) and the root
    /// identity of its database
    ProfilePush { profile: Profile, db_key: WriterId },
    /// The puller's writer for the profile database
    ProfilePullAck { writer: WriterId, proof: Vec<u8> },
    /// The puller saw its writer authorized
    ProfilePullDone,
    /// Root identity of the app database the vault opened for `app_id`
    AppKeyOffer { app_id: String, db_key: WriterId },
    /// The app's writer for the offered database
    AppKeyGrant {
        app_id: String,
        writer: WriterId,
        proof: Vec<u8>,
    },
    /// The vault authorized the app's writer
    AppAuthorized { app_id: String },
}

impl ProtocolMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            ProtocolMessage::ProfilePush { .. } => "profile_push",
            ProtocolMessage::ProfilePullAck { .. } => "profile_pull_ack",
            ProtocolMessage::ProfilePullDone => "profile_pull_done",
            ProtocolMessage::AppKeyOffer { .. } => "app_key_offer",
            ProtocolMessage::AppKeyGrant { .. } => "app_key_grant",
            ProtocolMessage::AppAuthorized { .. } => "app_authorized",
        }
    }
}

/// Versioned wrapper for protocol messages on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum WireMessage {
    /// Protocol version 1
    V1(ProtocolMessage),
}

impl WireMessage {
    pub fn new(msg: ProtocolMessage) -> Self {
        WireMessage::V1(msg)
    }

    pub fn encode(&self) -> MasqResult<Vec<u8>> {
        Ok(postcard::to_allocvec(self)?)
    }

    pub fn decode(data: &[u8]) -> MasqResult<Self> {
        Ok(postcard::from_bytes(data)?)
    }

    pub fn into_inner(self) -> ProtocolMessage {
        match self {
            WireMessage::V1(msg) => msg,
        }
    }

    pub fn version(&self) -> u8 {
        match self {
            WireMessage::V1(_) => 1,
        }
    }
}

/// Send one protocol message to every peer on `channel`.
pub fn send_message(channel: &SecureChannel, msg: ProtocolMessage) -> MasqResult<()> {
    debug!(channel = channel.name(), kind = msg.kind(), "Sending protocol message");
    channel.send(WireMessage::new(msg).encode()?)
}

/// Receive messages until `select` accepts one, or fail after `timeout`.
///
/// Payloads that do not decode and messages `select` declines are logged
/// and skipped.
pub async fn recv_matching<T, F>(
    channel: &SecureChannel,
    timeout: Duration,
    step: &str,
    mut select: F,
) -> MasqResult<T>
where
    F: FnMut(ProtocolMessage) -> Option<T>,
{
    let wait = async {
        loop {
            let payload = channel.recv().await?;
            let msg = match WireMessage::decode(&payload) {
                Ok(wire) => wire.into_inner(),
                Err(e) => {
                    warn!(channel = channel.name(), error = %e, "Ignoring undecodable message");
                    continue;
                }
            };
            let kind = msg.kind();
            match select(msg) {
                Some(value) => return Ok(value),
                None => debug!(channel = channel.name(), kind, step, "Ignoring message"),
            }
        }
    };
    tokio::time::timeout(timeout, wait)
        .await
        .map_err(|_| MasqError::HandshakeTimeout(format!("{} on {}", step, channel.name())))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::MemoryHub;
    use crate::crypto::ChannelKey;
    use crate::identity::WriterKeypair;

    #[test]
    fn test_wire_version() {
        let msg = ProtocolMessage::AppAuthorized {
            app_id: "id".to_string(),
        };
        let wire = WireMessage::new(msg.clone());
        assert_eq!(wire.version(), 1);
        let decoded = WireMessage::decode(&wire.encode().unwrap()).unwrap();
        assert_eq!(decoded.into_inner(), msg);
    }

    #[tokio::test]
    async fn test_recv_matching_skips_other_messages() {
        let hub = MemoryHub::new();
        let key = ChannelKey::generate();
        let a = SecureChannel::join(&hub, "proto", &key).unwrap();
        let b = SecureChannel::join(&hub, "proto", &key).unwrap();

        a.send(b"not a protocol message".to_vec()).unwrap();
        send_message(&a, ProtocolMessage::ProfilePullDone).unwrap();
        let writer = WriterKeypair::generate().public();
        send_message(
            &a,
            ProtocolMessage::AppKeyGrant {
                app_id: "id".to_string(),
                writer,
                proof: vec![],
            },
        )
        .unwrap();

        let got = recv_matching(&b, Duration::from_secs(5), "grant", |msg| match msg {
            ProtocolMessage::AppKeyGrant { writer, .. } => Some(writer),
            _ => None,
        })
        .await
        .unwrap();
        assert_eq!(got, writer);
    }

    #[tokio::test]
    async fn test_recv_matching_times_out() {
        let hub = MemoryHub::new();
        let a = SecureChannel::join(&hub, "quiet", &ChannelKey::generate()).unwrap();
        let result = recv_matching(&a, Duration::from_millis(50), "offer", |_| Some(())).await;
        assert!(matches!(result, Err(MasqError::HandshakeTimeout(_))));
    }
}
