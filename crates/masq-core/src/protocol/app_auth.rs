//! Two-phase app authorization
//!
//! An app asks for a database by handing the user a link that names a
//! rendezvous channel and its key. The vault joins the channel (the request
//! is then *offered*) and waits for the user. Nothing is created before the
//! user accepts; on accept the vault sends the app database's identity, the
//! app answers with its own writer, and only then is that writer
//! authorized.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::profile_sync::replicate_over;
use super::{recv_matching, send_message, ProtocolMessage, APP_GRANT_CONTEXT};
use crate::channel::SecureChannel;
use crate::crypto::ChannelKey;
use crate::db::{verify_writer_proof, DbArena, ReplicatedDb};
use crate::error::{MasqError, MasqResult};
use crate::identity::WriterId;
use crate::types::validate_app_id;

/// Marker preceding the encoded request in an app link.
const LINK_MARKER: &str = "#/link/";

/// Where a request stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AppRequestState {
    /// Received, channel not joined yet
    Pending,
    /// Channel joined, waiting for the user
    Offered,
    /// The user refused; nothing was created
    Refused,
    /// The app's writer is authorized
    Connected,
}

impl AppRequestState {
    /// Refused and Connected only change through `acknowledge`.
    pub fn is_settled(self) -> bool {
        matches!(self, AppRequestState::Refused | AppRequestState::Connected)
    }
}

impl fmt::Display for AppRequestState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AppRequestState::Pending => "pending",
            AppRequestState::Offered => "offered",
            AppRequestState::Refused => "refused",
            AppRequestState::Connected => "connected",
        };
        f.write_str(s)
    }
}

/// An app's request for a database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppRequest {
    pub app_id: String,
    /// Text shown to the user with the request
    pub message: String,
    /// Rendezvous channel the app waits on
    pub channel: String,
    pub key: ChannelKey,
}

impl AppRequest {
    pub fn new(
        app_id: impl Into<String>,
        message: impl Into<String>,
        channel: impl Into<String>,
        key: ChannelKey,
    ) -> MasqResult<Self> {
        let request = Self {
            app_id: app_id.into(),
            message: message.into(),
            channel: channel.into(),
            key,
        };
        if request.channel.is_empty() {
            return Err(MasqError::MissingIdentifier);
        }
        validate_app_id(&request.app_id)?;
        Ok(request)
    }

    /// Parse the request part of an app link
    /// (`…#/link/<base64 of ["appId","message","channel","key"]>`).
    ///
    /// A bare encoded payload is accepted too.
    pub fn from_link(link: &str) -> MasqResult<Self> {
        let encoded = match link.find(LINK_MARKER) {
            Some(pos) => &link[pos + LINK_MARKER.len()..],
            None => link,
        };
        let json = BASE64
            .decode(encoded.trim())
            .map_err(|e| MasqError::InvalidRequest(format!("Invalid link encoding: {}", e)))?;
        let (app_id, message, channel, key): (String, String, String, String) =
            serde_json::from_slice(&json)
                .map_err(|e| MasqError::InvalidRequest(format!("Invalid link payload: {}", e)))?;
        Self::new(app_id, message, channel, ChannelKey::from_base64(&key)?)
    }

    /// Encode as a link rooted at `base_url`.
    pub fn to_link(&self, base_url: &str) -> MasqResult<String> {
        let payload = serde_json::to_vec(&(
            &self.app_id,
            &self.message,
            &self.channel,
            self.key.to_base64(),
        ))?;
        Ok(format!("{}{}{}", base_url, LINK_MARKER, BASE64.encode(payload)))
    }
}

/// Vault side of an accepted request: offer `app_db` to the app on
/// `channel`, authorize the writer it proves, and confirm.
///
/// Replication of `app_db` keeps running over the channel until it closes.
/// On failure nothing is authorized and replication over the channel has
/// stopped when this returns.
pub async fn grant_access(
    channel: &SecureChannel,
    app_db: &ReplicatedDb,
    app_id: &str,
    timeout: Duration,
) -> MasqResult<WriterId> {
    let root = app_db.key();
    let session = replicate_over(channel, app_db);

    let result: MasqResult<WriterId> = async {
        send_message(
            channel,
            ProtocolMessage::AppKeyOffer {
                app_id: app_id.to_string(),
                db_key: root,
            },
        )?;
        info!(channel = channel.name(), app = app_id, "App database offered");

        let writer = recv_matching(channel, timeout, "app key grant", |msg| match msg {
            ProtocolMessage::AppKeyGrant {
                app_id: granted,
                writer,
                proof,
            } if granted == app_id => {
                match verify_writer_proof(&root, &writer, APP_GRANT_CONTEXT, &proof) {
                    Ok(()) => Some(writer),
                    Err(e) => {
                        warn!(
                            app = app_id,
                            writer = %writer.short(),
                            error = %e,
                            "Grant with invalid proof"
                        );
                        None
                    }
                }
            }
            _ => None,
        })
        .await?;

        app_db.authorize(&writer)?;
        send_message(
            channel,
            ProtocolMessage::AppAuthorized {
                app_id: app_id.to_string(),
            },
        )?;
        info!(app = app_id, writer = %writer.short(), "App writer authorized");
        Ok(writer)
    }
    .await;

    if result.is_err() {
        session.abort();
        let _ = session.await;
    }
    result
}

/// Name of the database an app keeps for the vault's grant.
pub fn requested_db_name(app_id: &str) -> String {
    format!("app-{}", app_id)
}

/// App side of the authorization protocol.
pub struct AppRequester {
    arena: Arc<DbArena>,
}

impl AppRequester {
    pub fn new(arena: Arc<DbArena>) -> Self {
        Self { arena }
    }

    /// Wait on the request's channel for the vault, then obtain write
    /// access to the database it offers.
    ///
    /// Returns the replica once its writer is authorized. A refusal shows
    /// up as a timeout since the vault only closes the channel.
    pub async fn request_access(
        &self,
        request: &AppRequest,
        timeout: Duration,
    ) -> MasqResult<ReplicatedDb> {
        let channel =
            SecureChannel::join(self.arena.rendezvous().as_ref(), &request.channel, &request.key)?;
        info!(channel = %request.channel, app = %request.app_id, "Waiting for the vault");

        let db_key = recv_matching(&channel, timeout, "app key offer", |msg| match msg {
            ProtocolMessage::AppKeyOffer { app_id, db_key } if app_id == request.app_id => {
                Some(db_key)
            }
            _ => None,
        })
        .await?;

        let db = self
            .arena
            .open(&requested_db_name(&request.app_id), Some(db_key))?;
        let session = replicate_over(&channel, &db);

        let result = async {
            send_message(
                &channel,
                ProtocolMessage::AppKeyGrant {
                    app_id: request.app_id.clone(),
                    writer: db.local_key(),
                    proof: db.prove_writer(APP_GRANT_CONTEXT),
                },
            )?;
            recv_matching(&channel, timeout, "app authorized", |msg| match msg {
                ProtocolMessage::AppAuthorized { app_id } if app_id == request.app_id => Some(()),
                _ => None,
            })
            .await?;
            db.wait_for(timeout, ReplicatedDb::is_writable).await
        }
        .await;

        session.abort();
        result?;
        info!(app = %request.app_id, db = db.name(), "App database writable");
        Ok(db)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::MemoryHub;
    use crate::storage::{LocalStore, MemoryStore};

    fn request() -> AppRequest {
        AppRequest::new("id", "Let me in", "c1", ChannelKey::generate()).unwrap()
    }

    #[test]
    fn test_link_round_trip() {
        let original = request();
        let link = original.to_link("https://masq.example").unwrap();
        assert!(link.starts_with("https://masq.example#/link/"));
        assert_eq!(AppRequest::from_link(&link).unwrap(), original);
    }

    #[test]
    fn test_bad_links() {
        assert!(matches!(
            AppRequest::from_link("https://x#/link/!!!"),
            Err(MasqError::InvalidRequest(_))
        ));
        let payload = BASE64.encode(br#"["id","msg"]"#);
        assert!(matches!(
            AppRequest::from_link(&payload),
            Err(MasqError::InvalidRequest(_))
        ));
        let key = ChannelKey::generate().to_base64();
        let payload = BASE64.encode(format!(r#"["","msg","c1","{}"]"#, key));
        assert!(matches!(
            AppRequest::from_link(&payload),
            Err(MasqError::MissingIdentifier)
        ));
        // An id may not reach into another database's records
        let payload = BASE64.encode(format!(r#"["id/feed","msg","c1","{}"]"#, key));
        assert!(matches!(
            AppRequest::from_link(&payload),
            Err(MasqError::InvalidRequest(_))
        ));
    }

    #[test]
    fn test_settled_states() {
        assert!(!AppRequestState::Pending.is_settled());
        assert!(!AppRequestState::Offered.is_settled());
        assert!(AppRequestState::Refused.is_settled());
        assert!(AppRequestState::Connected.is_settled());
        assert_eq!(AppRequestState::Offered.to_string(), "offered");
    }

    #[tokio::test]
    async fn test_grant_and_request() {
        let hub = MemoryHub::new();
        let store: Arc<dyn LocalStore> = Arc::new(MemoryStore::new());
        let vault_db = ReplicatedDb::open(store, "apps/p/id", None).unwrap();

        let app_arena = Arc::new(DbArena::new(
            Arc::new(MemoryStore::new()),
            Arc::new(hub.clone()),
        ));
        let req = request();
        let requester = AppRequester::new(app_arena.clone());
        let app_side = {
            let req = req.clone();
            tokio::spawn(async move { requester.request_access(&req, Duration::from_secs(5)).await })
        };

        let channel = SecureChannel::join(&hub, &req.channel, &req.key).unwrap();
        channel.wait_for_peer(Duration::from_secs(5)).await.unwrap();
        let writer = grant_access(&channel, &vault_db, "id", Duration::from_secs(5))
            .await
            .unwrap();

        let app_db = app_side.await.unwrap().unwrap();
        assert_eq!(app_db.local_key(), writer);
        assert_eq!(app_db.key(), vault_db.key());
        assert!(vault_db.is_authorized(&writer));
        assert_eq!(app_db.name(), "app-id");
    }

    #[tokio::test]
    async fn test_grant_times_out_without_app() {
        let hub = MemoryHub::new();
        let store: Arc<dyn LocalStore> = Arc::new(MemoryStore::new());
        let vault_db = ReplicatedDb::open(store, "apps/p/id", None).unwrap();
        let channel = SecureChannel::join(&hub, "c1", &ChannelKey::generate()).unwrap();

        let result = grant_access(&channel, &vault_db, "id", Duration::from_millis(50)).await;
        assert!(matches!(result, Err(MasqError::HandshakeTimeout(_))));
        assert_eq!(vault_db.authorized().len(), 1);
    }
}
