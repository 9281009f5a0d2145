//! App databases of the open profile
//!
//! Every device of a profile lists its app grants in its own device record.
//! Reconciling walks those records so that app access follows the profile:
//!
//! 1. An app another device holds and this one does not is opened here
//!    with a fresh writer, and the grant is added to this device's record.
//! 2. Where this device can write an app database, the writers other
//!    devices recorded for it are authorized.
//!
//! Step 1 on a new device and step 2 on an old one complete each other
//! once the profile database has replicated both ways.

use std::collections::BTreeMap;

use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::db::{DbArena, ReplicatedDb};
use crate::error::MasqResult;
use crate::types::{app_db_name, device_path, validate_app_id, AppGrant, Device, DEVICES_PREFIX};

/// `app_id -> database` for the open profile.
#[derive(Debug, Default)]
pub struct AppRegistry {
    apps: RwLock<BTreeMap<String, ReplicatedDb>>,
}

impl AppRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, app_id: &str, db: ReplicatedDb) {
        self.apps.write().insert(app_id.to_string(), db);
    }

    pub fn get(&self, app_id: &str) -> Option<ReplicatedDb> {
        self.apps.read().get(app_id).cloned()
    }

    /// Forget `app_id` if it maps to the database named `name`.
    pub fn remove_if_named(&self, app_id: &str, name: &str) -> Option<ReplicatedDb> {
        let mut apps = self.apps.write();
        match apps.get(app_id) {
            Some(db) if db.name() == name => apps.remove(app_id),
            _ => None,
        }
    }

    pub fn contains(&self, app_id: &str) -> bool {
        self.apps.read().contains_key(app_id)
    }

    pub fn ids(&self) -> Vec<String> {
        self.apps.read().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.apps.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.apps.read().is_empty()
    }

    /// Forget every app, returning the database names that were open.
    pub fn clear(&self) -> Vec<String> {
        let mut apps = self.apps.write();
        let names = apps.values().map(|db| db.name().to_string()).collect();
        apps.clear();
        names
    }
}

/// What one reconcile pass changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Apps opened from another device's grant
    pub pulled: Vec<String>,
    /// Apps already granted to this device and reopened
    pub reopened: Vec<String>,
    /// `(app_id, writer)` pairs authorized for other devices
    pub authorized: Vec<(String, String)>,
}

impl ReconcileReport {
    pub fn is_empty(&self) -> bool {
        self.pulled.is_empty() && self.reopened.is_empty() && self.authorized.is_empty()
    }
}

/// All device records of a profile database, skipping unreadable ones.
pub fn read_devices(profile_db: &ReplicatedDb) -> Vec<Device> {
    profile_db
        .list(DEVICES_PREFIX)
        .into_iter()
        .filter_map(|(path, bytes)| match serde_json::from_slice(&bytes) {
            Ok(device) => Some(device),
            Err(e) => {
                warn!(%path, error = %e, "Unreadable device record");
                None
            }
        })
        .collect()
}

/// Reconcile the app databases of `profile_id` for device `device_id`.
///
/// Callers serialize reconcile passes with other writers of the device
/// record.
pub fn reconcile_apps(
    profile_db: &ReplicatedDb,
    arena: &DbArena,
    registry: &AppRegistry,
    profile_id: &str,
    device_id: &str,
) -> MasqResult<ReconcileReport> {
    let mut report = ReconcileReport::default();
    let Some(mut own) = profile_db.get_json::<Device>(&device_path(device_id))? else {
        debug!(profile = profile_id, "No device record yet, nothing to reconcile");
        return Ok(report);
    };
    let others: Vec<Device> = read_devices(profile_db)
        .into_iter()
        .filter(|d| d.id != own.id)
        .collect();

    for grant in &own.apps {
        if !registry.contains(&grant.app_id) {
            let db = arena.open(&app_db_name(profile_id, &grant.app_id), Some(grant.key))?;
            registry.insert(&grant.app_id, db);
            report.reopened.push(grant.app_id.clone());
        }
    }

    let mut own_changed = false;
    for other in &others {
        for grant in &other.apps {
            if own.grant(&grant.app_id).is_some() {
                continue;
            }
            if let Err(e) = validate_app_id(&grant.app_id) {
                warn!(app = %grant.app_id, device = %other.id, error = %e, "Skipping grant");
                continue;
            }
            let db = arena.open(&app_db_name(profile_id, &grant.app_id), Some(grant.key))?;
            own_changed |= own.upsert_grant(AppGrant {
                app_id: grant.app_id.clone(),
                key: db.key(),
                local_key: db.local_key(),
            });
            info!(app = %grant.app_id, from = %other.name, "App pulled from device");
            registry.insert(&grant.app_id, db);
            report.pulled.push(grant.app_id.clone());
        }
    }
    if own_changed {
        profile_db.put_json(&device_path(&own.id), &own)?;
    }

    for other in &others {
        for grant in &other.apps {
            let Some(db) = registry.get(&grant.app_id) else {
                continue;
            };
            if db.key() != grant.key {
                warn!(app = %grant.app_id, device = %other.id, "Grant names another database");
                continue;
            }
            if db.is_writable() && !db.is_authorized(&grant.local_key) {
                db.authorize(&grant.local_key)?;
                report
                    .authorized
                    .push((grant.app_id.clone(), grant.local_key.to_hex()));
            }
        }
    }

    if !report.is_empty() {
        debug!(profile = profile_id, ?report, "Apps reconciled");
    }
    Ok(report)
}
