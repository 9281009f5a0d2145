//! Cloning a profile onto a new device
//!
//! The pusher already holds the profile; the puller is a device that knows
//! the password and shares a channel key with the pusher out of band.
//! The profile database replicates over the pairing channel while the
//! handshake runs, so the puller leaves with a usable replica.

use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{info, warn};

use super::{recv_matching, send_message, ProtocolMessage, PULL_ACK_CONTEXT};
use crate::channel::SecureChannel;
use crate::db::{replicate, verify_writer_proof, ReplicatedDb};
use crate::error::{MasqError, MasqResult};
use crate::identity::WriterId;
use crate::types::Profile;

/// Payload of a profile push as seen by the puller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PulledProfile {
    pub profile: Profile,
    /// Root identity of the profile database
    pub db_key: WriterId,
}

/// Replicate `db` over `channel` until the channel closes or the returned
/// task is aborted.
pub fn replicate_over(channel: &SecureChannel, db: &ReplicatedDb) -> JoinHandle<()> {
    let link = channel.open_replication(db.discovery_key());
    let db = db.clone();
    tokio::spawn(async move {
        if let Err(e) = replicate(db.clone(), link).await {
            warn!(db = db.name(), error = %e, "Channel replication failed");
        }
    })
}

/// Push `profile` (already carrying the receiver's id) to the peer on
/// `channel` and authorize the writer it answers with.
///
/// Returns the authorized writer. Fails with `PeerNotFound` if nobody
/// shows up and `HandshakeTimeout` if no valid acknowledgement arrives;
/// in both cases nothing was authorized.
pub async fn push_profile(
    channel: &SecureChannel,
    profile_db: &ReplicatedDb,
    profile: &Profile,
    timeout: Duration,
) -> MasqResult<WriterId> {
    channel.wait_for_peer(timeout).await?;
    let session = replicate_over(channel, profile_db);

    let result = async {
        let root = profile_db.key();
        send_message(
            channel,
            ProtocolMessage::ProfilePush {
                profile: profile.clone(),
                db_key: root,
            },
        )?;
        info!(channel = channel.name(), profile = %profile.id, "Profile pushed");

        let writer = recv_matching(channel, timeout, "profile pull ack", |msg| match msg {
            ProtocolMessage::ProfilePullAck { writer, proof } => {
                match verify_writer_proof(&root, &writer, PULL_ACK_CONTEXT, &proof) {
                    Ok(()) => Some(writer),
                    Err(e) => {
                        warn!(writer = %writer.short(), error = %e, "Ack with invalid proof");
                        None
                    }
                }
            }
            _ => None,
        })
        .await?;

        profile_db.authorize(&writer)?;
        info!(db = profile_db.name(), writer = %writer.short(), "New device authorized");

        match recv_matching(channel, timeout, "profile pull done", |msg| {
            matches!(msg, ProtocolMessage::ProfilePullDone).then_some(())
        })
        .await
        {
            Ok(()) => {}
            // The grant is already in the log; the swarm delivers it later.
            Err(MasqError::HandshakeTimeout(step)) => {
                warn!(%step, "Puller did not confirm");
            }
            Err(e) => return Err(e),
        }
        Ok(writer)
    }
    .await;

    session.abort();
    result
}

/// Wait for a profile push on `channel`.
pub async fn receive_push(channel: &SecureChannel, timeout: Duration) -> MasqResult<PulledProfile> {
    let pulled = recv_matching(channel, timeout, "profile push", |msg| match msg {
        ProtocolMessage::ProfilePush { profile, db_key } => Some(PulledProfile { profile, db_key }),
        _ => None,
    })
    .await?;
    info!(channel = channel.name(), profile = %pulled.profile.id, "Profile received");
    Ok(pulled)
}

/// Finish a pull: announce the replica's writer and replicate until the
/// pusher has authorized it.
///
/// `profile_db` must be a replica of the pushed database.
pub async fn complete_pull(
    channel: &SecureChannel,
    profile_db: &ReplicatedDb,
    timeout: Duration,
) -> MasqResult<()> {
    let session = replicate_over(channel, profile_db);

    let result = async {
        send_message(
            channel,
            ProtocolMessage::ProfilePullAck {
                writer: profile_db.local_key(),
                proof: profile_db.prove_writer(PULL_ACK_CONTEXT),
            },
        )?;
        profile_db
            .wait_for(timeout, ReplicatedDb::is_writable)
            .await?;
        send_message(channel, ProtocolMessage::ProfilePullDone)?;
        info!(db = profile_db.name(), "Profile pull complete");
        Ok(())
    }
    .await;

    session.abort();
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::MemoryHub;
    use crate::crypto::{ChannelKey, KdfParams};
    use crate::storage::{LocalStore, MemoryStore};
    use crate::types::PrivateFields;
    use std::sync::Arc;

    const WAIT: Duration = Duration::from_secs(5);

    fn store() -> Arc<dyn LocalStore> {
        Arc::new(MemoryStore::new())
    }

    fn profile(id: &str) -> Profile {
        Profile::create(
            id,
            "alice",
            "pass",
            &PrivateFields::default(),
            KdfParams::insecure_fast(),
        )
        .unwrap()
        .0
    }

    #[tokio::test]
    async fn test_push_and_pull() {
        let hub = MemoryHub::new();
        let key = ChannelKey::generate();
        let pusher_channel = SecureChannel::join(&hub, "sync", &key).unwrap();
        let puller_channel = SecureChannel::join(&hub, "sync", &key).unwrap();

        let original = ReplicatedDb::open(store(), "profile-x", None).unwrap();
        original.put("/devices/d1", b"{}".to_vec()).unwrap();
        let pushed = profile("x").with_id("x-copy");

        let push = {
            let original = original.clone();
            let pushed = pushed.clone();
            tokio::spawn(async move {
                push_profile(&pusher_channel, &original, &pushed, WAIT).await
            })
        };

        let pulled = receive_push(&puller_channel, WAIT).await.unwrap();
        assert_eq!(pulled.profile, pushed);
        assert_eq!(pulled.db_key, original.key());

        let replica = ReplicatedDb::open(store(), "profile-x-copy", Some(pulled.db_key)).unwrap();
        complete_pull(&puller_channel, &replica, WAIT).await.unwrap();

        let writer = push.await.unwrap().unwrap();
        assert_eq!(writer, replica.local_key());
        assert_ne!(replica.local_key(), replica.key());
        assert!(replica.is_writable());
        assert_eq!(original.authorized().len(), 2);
        assert!(replica.get("/devices/d1").is_some());
    }

    #[tokio::test]
    async fn test_push_without_peer_authorizes_nothing() {
        let hub = MemoryHub::new();
        let channel = SecureChannel::join(&hub, "sync", &ChannelKey::generate()).unwrap();
        let db = ReplicatedDb::open(store(), "profile-x", None).unwrap();

        let result = push_profile(&channel, &db, &profile("x"), Duration::from_millis(50)).await;
        assert!(matches!(result, Err(MasqError::PeerNotFound(_))));
        assert_eq!(db.authorized().len(), 1);
    }

    #[tokio::test]
    async fn test_forged_ack_is_ignored() {
        let hub = MemoryHub::new();
        let key = ChannelKey::generate();
        let pusher_channel = SecureChannel::join(&hub, "sync", &key).unwrap();
        let rogue_channel = SecureChannel::join(&hub, "sync", &key).unwrap();
        let db = ReplicatedDb::open(store(), "profile-x", None).unwrap();

        let push = {
            let db = db.clone();
            tokio::spawn(async move {
                push_profile(&pusher_channel, &db, &profile("x"), Duration::from_millis(300)).await
            })
        };

        receive_push(&rogue_channel, WAIT).await.unwrap();
        let claimed = crate::identity::WriterKeypair::generate().public();
        send_message(
            &rogue_channel,
            ProtocolMessage::ProfilePullAck {
                writer: claimed,
                proof: vec![0u8; 64],
            },
        )
        .unwrap();

        let result = push.await.unwrap();
        assert!(matches!(result, Err(MasqError::HandshakeTimeout(_))));
        assert!(!db.is_authorized(&claimed));
    }
}
