//! Arena of open databases, each with its replication swarm

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::database::ReplicatedDb;
use super::replication::replicate;
use crate::channel::{Rendezvous, SecureChannel};
use crate::crypto::ChannelKey;
use crate::error::MasqResult;
use crate::identity::{DiscoveryKey, WriterId};
use crate::storage::LocalStore;

/// Rendezvous name of a database's swarm.
pub fn swarm_channel_name(discovery: &DiscoveryKey) -> String {
    format!("masq-db-{}", discovery.to_hex())
}

struct Slot {
    db: ReplicatedDb,
    swarm: SecureChannel,
    session: JoinHandle<()>,
}

impl Drop for Slot {
    fn drop(&mut self) {
        self.session.abort();
        self.swarm.close();
    }
}

/// Databases open in this process, addressed by name or discovery key.
///
/// Opening a database joins its swarm: a secure channel keyed by the
/// database root, shared by every replica that has it open. A replication
/// session runs over the swarm until the database is closed.
pub struct DbArena {
    store: Arc<dyn LocalStore>,
    rendezvous: Arc<dyn Rendezvous>,
    open: Mutex<HashMap<String, Slot>>,
}

impl DbArena {
    pub fn new(store: Arc<dyn LocalStore>, rendezvous: Arc<dyn Rendezvous>) -> Self {
        Self {
            store,
            rendezvous,
            open: Mutex::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &Arc<dyn LocalStore> {
        &self.store
    }

    pub fn rendezvous(&self) -> &Arc<dyn Rendezvous> {
        &self.rendezvous
    }

    /// Open `name` (see [`ReplicatedDb::open`]) and start replicating it.
    ///
    /// An already open database is returned as is.
    pub fn open(&self, name: &str, root: Option<WriterId>) -> MasqResult<ReplicatedDb> {
        let mut open = self.open.lock();
        if let Some(slot) = open.get(name) {
            if root.map_or(true, |root| root == slot.db.key()) {
                return Ok(slot.db.clone());
            }
        }

        let db = ReplicatedDb::open(self.store.clone(), name, root)?;
        let discovery = db.discovery_key();
        let swarm = SecureChannel::join(
            self.rendezvous.as_ref(),
            &swarm_channel_name(&discovery),
            &ChannelKey::for_database(&db.key()),
        )?;

        let link = swarm.open_replication(discovery);
        let session_db = db.clone();
        let session = tokio::spawn(async move {
            if let Err(e) = replicate(session_db.clone(), link).await {
                warn!(db = session_db.name(), error = %e, "Swarm replication failed");
            }
        });

        info!(db = name, %discovery, "Database joined swarm");
        open.insert(
            name.to_string(),
            Slot {
                db: db.clone(),
                swarm,
                session,
            },
        );
        Ok(db)
    }

    pub fn get(&self, name: &str) -> Option<ReplicatedDb> {
        self.open.lock().get(name).map(|slot| slot.db.clone())
    }

    pub fn find(&self, discovery: &DiscoveryKey) -> Option<ReplicatedDb> {
        self.open
            .lock()
            .values()
            .find(|slot| slot.db.discovery_key() == *discovery)
            .map(|slot| slot.db.clone())
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.open.lock().keys().cloned().collect();
        names.sort();
        names
    }

    /// Replicas currently linked through a database's swarm.
    pub fn swarm_peers(&self, name: &str) -> usize {
        self.open
            .lock()
            .get(name)
            .map(|slot| slot.swarm.peer_count())
            .unwrap_or(0)
    }

    /// Stop replicating `name`. The data stays in the store.
    pub fn close(&self, name: &str) {
        if self.open.lock().remove(name).is_some() {
            debug!(db = name, "Database closed");
        }
    }

    /// Stop replicating `name` and delete it from the store.
    ///
    /// Waits for the swarm session to stop before deleting, so nothing it
    /// received is written back afterwards.
    pub async fn discard(&self, name: &str) -> MasqResult<()> {
        let slot = self.open.lock().remove(name);
        if let Some(mut slot) = slot {
            slot.session.abort();
            let _ = (&mut slot.session).await;
        }
        let removed = ReplicatedDb::destroy(self.store.as_ref(), name)?;
        info!(db = name, records = removed, "Database discarded");
        Ok(())
    }

    pub fn close_all(&self) {
        let slots: Vec<(String, Slot)> = self.open.lock().drain().collect();
        if !slots.is_empty() {
            info!(count = slots.len(), "Closing all databases");
        }
    }
}

impl Drop for DbArena {
    fn drop(&mut self) {
        self.open.get_mut().clear();
    }
}

impl std::fmt::Debug for DbArena {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DbArena")
            .field("open", &self.names())
            .finish()
    }
}
