//! MasqEngine - the vault's single entry point
//!
//! MasqEngine coordinates local storage, the database arena, and the
//! pairing protocols for:
//! - Profiles (create, unlock, update) and their profile databases
//! - The device records and app grants kept in the open profile
//! - Cloning a profile onto another device (push / pull)
//! - Granting apps write access to a dedicated database
//!
//! # Example
//!
//! ```ignore
//! use masq_core::{MasqConfig, MasqEngine, NewDevice, NewProfile};
//!
//! let engine = MasqEngine::open(MasqConfig::default()).await?;
//! let id = engine.add_profile(NewProfile::new("alice", "secret")).await?;
//! engine.open_profile(&id, "secret").await?;
//! engine.add_device(NewDevice::named("laptop")).await?;
//! let grant = engine.create_app_sync("notes").await?;
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::channel::{GossipRendezvous, MemoryHub, Rendezvous, SecureChannel};
use crate::config::MasqConfig;
use crate::crypto::ChannelKey;
use crate::db::{DbArena, ReplicatedDb};
use crate::error::{MasqError, MasqResult};
use crate::identity::WriterId;
use crate::protocol::{self, AppRequest, AppRequestState, AppRequester};
use crate::registry::{read_devices, reconcile_apps, AppRegistry, ReconcileReport};
use crate::storage::{LocalStore, RedbStore};
use crate::types::{
    app_db_name, app_path, current_device_key, device_path, profile_db_name, profile_record_key,
    validate_app_id, App, AppGrant, Device, NewApp, NewDevice, NewProfile, PrivateFields, Profile,
    ProfileDetails, ProfileUpdate, APPS_PREFIX, DEVICES_PREFIX,
};

/// Capacity of the engine event channel
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Local storage key of the iroh endpoint secret
const ENDPOINT_SECRET_KEY: &str = "endpoint-secret-key";

/// Notifications for the presentation layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    ProfileOpened { profile_id: String },
    ProfileClosed { profile_id: String },
    /// The device records of the open profile changed
    DevicesChanged { profile_id: String },
    /// A reconcile pass opened or authorized app databases
    AppsReconciled {
        profile_id: String,
        pulled: Vec<String>,
        authorized: usize,
    },
    AppRequestChanged {
        app_id: String,
        state: AppRequestState,
    },
    /// The request was acknowledged and is gone
    AppRequestCleared { app_id: String },
}

/// Everything the reconciler needs, detached from the engine.
#[derive(Clone)]
struct Reconciler {
    store: Arc<dyn LocalStore>,
    arena: Arc<DbArena>,
    apps: Arc<AppRegistry>,
    device_lock: Arc<Mutex<()>>,
    events: broadcast::Sender<EngineEvent>,
    profile_id: String,
    profile_db: ReplicatedDb,
}

impl Reconciler {
    fn run(&self) -> MasqResult<ReconcileReport> {
        let key = current_device_key(&self.profile_id);
        let Some(device_id) = load_string(self.store.as_ref(), &key)? else {
            return Ok(ReconcileReport::default());
        };
        let _guard = self.device_lock.lock();
        let report = reconcile_apps(
            &self.profile_db,
            &self.arena,
            &self.apps,
            &self.profile_id,
            &device_id,
        )?;
        if !report.pulled.is_empty() || !report.authorized.is_empty() {
            let _ = self.events.send(EngineEvent::AppsReconciled {
                profile_id: self.profile_id.clone(),
                pulled: report.pulled.clone(),
                authorized: report.authorized.len(),
            });
        }
        Ok(report)
    }

    fn spawn(self) -> JoinHandle<()> {
        let db = self.profile_db.clone();
        db.watch(DEVICES_PREFIX, move |_| {
            let _ = self.events.send(EngineEvent::DevicesChanged {
                profile_id: self.profile_id.clone(),
            });
            if let Err(e) = self.run() {
                warn!(profile = %self.profile_id, error = %e, "App reconcile failed");
            }
        })
    }
}

struct Session {
    profile: Profile,
    key: [u8; 32],
    fields: PrivateFields,
    db: ReplicatedDb,
    reconciler: Reconciler,
    watcher: JoinHandle<()>,
}

struct RequestSlot {
    request: AppRequest,
    state: AppRequestState,
    channel: Option<Arc<SecureChannel>>,
    /// App database an accept of this request created and has not
    /// committed yet
    created: Option<String>,
    generation: u64,
}

impl RequestSlot {
    fn abandon(&mut self) {
        if let Some(channel) = self.channel.take() {
            channel.close();
        }
    }
}

fn load_string(store: &dyn LocalStore, key: &str) -> MasqResult<Option<String>> {
    match store.load(key)? {
        Some(bytes) => String::from_utf8(bytes)
            .map(Some)
            .map_err(|e| MasqError::Storage(format!("Invalid record {}: {}", key, e))),
        None => Ok(None),
    }
}

/// The registry orchestrator.
///
/// One profile is open at a time. All app databases of the open profile
/// are kept open (and replicating) until the profile is closed.
pub struct MasqEngine {
    config: MasqConfig,
    store: Arc<dyn LocalStore>,
    arena: Arc<DbArena>,
    apps: Arc<AppRegistry>,
    session: RwLock<Option<Session>>,
    /// Serializes writes to this device's record
    device_lock: Arc<Mutex<()>>,
    request: Mutex<Option<RequestSlot>>,
    generation: AtomicU64,
    events: broadcast::Sender<EngineEvent>,
    gossip: Option<Arc<GossipRendezvous>>,
}

impl MasqEngine {
    /// Engine over explicit collaborators.
    pub fn new(
        store: Arc<dyn LocalStore>,
        rendezvous: Arc<dyn Rendezvous>,
        config: MasqConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            config,
            arena: Arc::new(DbArena::new(store.clone(), rendezvous)),
            store,
            apps: Arc::new(AppRegistry::new()),
            session: RwLock::new(None),
            device_lock: Arc::new(Mutex::new(())),
            request: Mutex::new(None),
            generation: AtomicU64::new(0),
            events,
            gossip: None,
        }
    }

    fn open_store(config: &MasqConfig) -> MasqResult<Arc<dyn LocalStore>> {
        std::fs::create_dir_all(&config.data_dir)?;
        Ok(Arc::new(RedbStore::new(config.database_path())?))
    }

    /// Engine persisting under `config.data_dir` without any networking.
    ///
    /// Databases still open normally but find no peers.
    pub fn open_offline(config: MasqConfig) -> MasqResult<Self> {
        let store = Self::open_store(&config)?;
        debug!(data_dir = %config.data_dir.display(), "MasqEngine opened offline");
        Ok(Self::new(store, Arc::new(MemoryHub::new()), config))
    }

    /// Engine persisting under `config.data_dir` and pairing over iroh.
    pub async fn open(config: MasqConfig) -> MasqResult<Self> {
        let store = Self::open_store(&config)?;

        let secret_key = match store.load(ENDPOINT_SECRET_KEY)? {
            Some(bytes) => {
                let bytes: [u8; 32] = bytes
                    .try_into()
                    .map_err(|_| MasqError::Storage("Invalid endpoint secret key".to_string()))?;
                debug!("Loaded persistent endpoint secret key");
                iroh::SecretKey::from(bytes)
            }
            None => {
                info!("No endpoint secret key found, generating new one");
                let secret_key = iroh::SecretKey::generate(&mut rand::rng());
                store.save(ENDPOINT_SECRET_KEY, &secret_key.to_bytes())?;
                secret_key
            }
        };

        let bootstrap = config.bootstrap_peers()?;
        let gossip = Arc::new(GossipRendezvous::new(Some(secret_key), bootstrap).await?);
        let rendezvous: Arc<dyn Rendezvous> = gossip.clone();
        let mut engine = Self::new(store, rendezvous, config);
        engine.gossip = Some(gossip);
        info!(data_dir = %engine.config.data_dir.display(), "MasqEngine opened");
        Ok(engine)
    }

    pub fn config(&self) -> &MasqConfig {
        &self.config
    }

    /// This node's iroh endpoint id, when networking over iroh.
    pub fn endpoint_id(&self) -> Option<String> {
        self.gossip.as_ref().map(|g| g.endpoint_id().to_string())
    }

    /// App side of the authorization protocol over this engine's network.
    ///
    /// Requested databases are stored with this engine's data.
    pub fn requester(&self) -> AppRequester {
        AppRequester::new(self.arena.clone())
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: EngineEvent) {
        let _ = self.events.send(event);
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Profiles
    // ═══════════════════════════════════════════════════════════════════════

    /// Create a profile and its database. Returns the new profile id.
    pub async fn add_profile(&self, new: NewProfile) -> MasqResult<String> {
        if new.username.trim().is_empty() {
            return Err(MasqError::InvalidRequest("username is required".to_string()));
        }
        if new.password.is_empty() {
            return Err(MasqError::InvalidRequest("password is required".to_string()));
        }

        let id = Ulid::new().to_string();
        let (profile, _) = Profile::create(
            id.clone(),
            new.username.clone(),
            &new.password,
            &new.private_fields(),
            self.config.kdf,
        )?;

        let db = ReplicatedDb::open(self.store.clone(), &profile_db_name(&id), None)?;
        self.store
            .save(&profile_record_key(&id), &serde_json::to_vec(&profile)?)?;
        info!(
            profile = %id,
            username = %profile.username,
            db_key = %db.key().short(),
            "Profile created"
        );
        Ok(id)
    }

    /// Public records of every profile on this device.
    pub fn get_profiles(&self) -> MasqResult<Vec<Profile>> {
        let mut profiles = Vec::new();
        for (key, bytes) in self.store.scan("profile-")? {
            match serde_json::from_slice::<Profile>(&bytes) {
                Ok(profile) => profiles.push(profile),
                Err(e) => warn!(%key, error = %e, "Skipping unreadable profile record"),
            }
        }
        Ok(profiles)
    }

    pub fn get_profile(&self, id: &str) -> MasqResult<Profile> {
        let bytes = self
            .store
            .load(&profile_record_key(id))?
            .ok_or_else(|| MasqError::ProfileNotFound(id.to_string()))?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Change profile fields. Private fields need the profile to be open.
    pub async fn update_profile(&self, update: ProfileUpdate) -> MasqResult<()> {
        let id = match update.id.as_deref() {
            Some(id) if !id.is_empty() => id.to_string(),
            _ => return Err(MasqError::MissingIdentifier),
        };
        let mut profile = self.get_profile(&id)?;
        if let Some(username) = &update.username {
            if username.trim().is_empty() {
                return Err(MasqError::InvalidRequest("username is required".to_string()));
            }
            profile.username = username.clone();
        }

        let mut session = self.session.write();
        let open = session.as_mut().filter(|s| s.profile.id == id);
        if update.touches_private_fields() {
            let Some(open) = open else {
                return Err(MasqError::NoOpenProfile);
            };
            let mut fields = open.fields.clone();
            update.apply_private(&mut fields);
            profile.seal_fields(&open.key, &fields)?;
            self.store
                .save(&profile_record_key(&id), &serde_json::to_vec(&profile)?)?;
            open.fields = fields;
            open.profile = profile;
        } else {
            self.store
                .save(&profile_record_key(&id), &serde_json::to_vec(&profile)?)?;
            if let Some(open) = open {
                open.profile = profile;
            }
        }
        info!(profile = %id, "Profile updated");
        Ok(())
    }

    /// Unlock a profile and make it the open one.
    ///
    /// Reopens the app databases this device holds and starts following
    /// the other devices' app grants.
    pub async fn open_profile(&self, id: &str, password: &str) -> MasqResult<ProfileDetails> {
        if id.is_empty() {
            return Err(MasqError::MissingIdentifier);
        }
        let profile = self.get_profile(id)?;
        let (key, fields) = profile.unlock(password)?;

        let name = profile_db_name(id);
        if !ReplicatedDb::exists(self.store.as_ref(), &name)? {
            return Err(MasqError::Storage(format!("database {} is missing", name)));
        }
        self.close_profile();

        let db = self.arena.open(&name, None)?;
        let reconciler = Reconciler {
            store: self.store.clone(),
            arena: self.arena.clone(),
            apps: self.apps.clone(),
            device_lock: self.device_lock.clone(),
            events: self.events.clone(),
            profile_id: id.to_string(),
            profile_db: db.clone(),
        };
        if let Err(e) = reconciler.run() {
            warn!(profile = %id, error = %e, "Initial app reconcile failed");
        }
        let watcher = reconciler.clone().spawn();

        let details = profile.details(fields.clone());
        *self.session.write() = Some(Session {
            profile,
            key,
            fields,
            db,
            reconciler,
            watcher,
        });
        info!(profile = %id, apps = self.apps.len(), "Profile opened");
        self.emit(EngineEvent::ProfileOpened {
            profile_id: id.to_string(),
        });
        Ok(details)
    }

    /// Close the open profile and stop replicating its databases.
    pub fn close_profile(&self) {
        let Some(session) = self.session.write().take() else {
            return;
        };
        session.watcher.abort();
        for name in self.apps.clear() {
            self.arena.close(&name);
        }
        self.arena.close(session.db.name());
        info!(profile = %session.profile.id, "Profile closed");
        self.emit(EngineEvent::ProfileClosed {
            profile_id: session.profile.id,
        });
    }

    /// Id of the open profile.
    pub fn current_profile(&self) -> Option<String> {
        self.session.read().as_ref().map(|s| s.profile.id.clone())
    }

    /// Database of the open profile.
    pub fn profile_db(&self) -> MasqResult<ReplicatedDb> {
        self.session
            .read()
            .as_ref()
            .map(|s| s.db.clone())
            .ok_or(MasqError::NoOpenProfile)
    }

    fn open_session(&self) -> MasqResult<(String, ReplicatedDb)> {
        self.session
            .read()
            .as_ref()
            .map(|s| (s.profile.id.clone(), s.db.clone()))
            .ok_or(MasqError::NoOpenProfile)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Devices
    // ═══════════════════════════════════════════════════════════════════════

    fn current_device_id(&self, profile_id: &str) -> MasqResult<Option<String>> {
        load_string(self.store.as_ref(), &current_device_key(profile_id))
    }

    /// Create or update this device's record in the open profile.
    pub async fn add_device(&self, new: NewDevice) -> MasqResult<Device> {
        let (profile_id, db) = self.open_session()?;
        if new.name.trim().is_empty() {
            return Err(MasqError::InvalidRequest("device name is required".to_string()));
        }
        if !db.is_writable() {
            return Err(MasqError::Unauthorized(format!(
                "device writer {} is not authorized in profile {}",
                db.local_key().short(),
                profile_id
            )));
        }

        let device = {
            let _guard = self.device_lock.lock();
            let id = match self.current_device_id(&profile_id)? {
                Some(id) => id,
                None => Ulid::new().to_string(),
            };
            let existing: Option<Device> = db.get_json(&device_path(&id))?;
            let device = Device {
                id: id.clone(),
                name: new.name,
                description: new.description,
                color: new.color,
                local_key: db.local_key(),
                apps: existing.map(|d| d.apps).unwrap_or_default(),
            };
            db.put_json(&device_path(&id), &device)?;
            self.store
                .save(&current_device_key(&profile_id), id.as_bytes())?;
            device
        };
        info!(profile = %profile_id, device = %device.id, name = %device.name, "Device saved");
        Ok(device)
    }

    /// Every device that joined the open profile.
    pub fn get_devices(&self) -> MasqResult<Vec<Device>> {
        let (_, db) = self.open_session()?;
        Ok(read_devices(&db))
    }

    /// This device's record in the open profile.
    pub fn get_device(&self) -> MasqResult<Device> {
        let (profile_id, db) = self.open_session()?;
        let id = self
            .current_device_id(&profile_id)?
            .ok_or_else(|| MasqError::DeviceNotFound(profile_id.clone()))?;
        db.get_json(&device_path(&id))?
            .ok_or(MasqError::DeviceNotFound(id))
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Apps
    // ═══════════════════════════════════════════════════════════════════════

    /// Register an app in the open profile.
    pub async fn add_app(&self, new: NewApp) -> MasqResult<App> {
        validate_app_id(&new.app_id)?;
        let (profile_id, db) = self.open_session()?;
        let app = new.into_app();
        db.put_json(&app_path(&app.app_id), &app)?;
        info!(profile = %profile_id, app = %app.app_id, "App added");
        Ok(app)
    }

    pub fn get_apps(&self) -> MasqResult<Vec<App>> {
        let (_, db) = self.open_session()?;
        let mut apps = Vec::new();
        for (path, bytes) in db.list(APPS_PREFIX) {
            match serde_json::from_slice::<App>(&bytes) {
                Ok(app) => apps.push(app),
                Err(e) => warn!(%path, error = %e, "Skipping unreadable app record"),
            }
        }
        Ok(apps)
    }

    /// Database of an app of the open profile.
    pub fn app_db(&self, app_id: &str) -> Option<ReplicatedDb> {
        self.apps.get(app_id)
    }

    /// Record `grant` on this device, returning the updated record.
    fn record_grant(
        &self,
        profile_id: &str,
        db: &ReplicatedDb,
        grant: AppGrant,
    ) -> MasqResult<Device> {
        let _guard = self.device_lock.lock();
        let id = self
            .current_device_id(profile_id)?
            .ok_or_else(|| MasqError::DeviceNotFound(profile_id.to_string()))?;
        let mut device: Device = db
            .get_json(&device_path(&id))?
            .ok_or(MasqError::DeviceNotFound(id))?;
        if device.upsert_grant(grant) {
            db.put_json(&device_path(&device.id), &device)?;
        }
        Ok(device)
    }

    /// Open the database of `app_id`, creating it with this device as sole
    /// writer if this device holds no grant for it yet.
    ///
    /// The flag is true when the database did not exist before.
    fn open_app_db(
        &self,
        profile_id: &str,
        app_id: &str,
    ) -> MasqResult<(ReplicatedDb, AppGrant, bool)> {
        validate_app_id(app_id)?;
        let device = self.get_device()?;
        let root = device.grant(app_id).map(|g| g.key);
        let name = app_db_name(profile_id, app_id);
        let created = root.is_none() && !ReplicatedDb::exists(self.store.as_ref(), &name)?;
        let db = self.arena.open(&name, root)?;
        self.apps.insert(app_id, db.clone());
        let grant = AppGrant {
            app_id: app_id.to_string(),
            key: db.key(),
            local_key: db.local_key(),
        };
        Ok((db, grant, created))
    }

    /// Close and delete app database `name`, created for a request that did
    /// not go through.
    async fn discard_app_db(&self, app_id: &str, name: &str) -> MasqResult<()> {
        self.apps.remove_if_named(app_id, name);
        self.arena.discard(name).await?;
        info!(app = app_id, db = name, "Uncommitted app database discarded");
        Ok(())
    }

    /// Create the database of app `name` and list it on this device.
    ///
    /// The creating device writes `localKey == key`; other devices of the
    /// profile pick the grant up through the reconciler.
    pub async fn create_app_sync(&self, name: &str) -> MasqResult<AppGrant> {
        let (profile_id, profile_db) = self.open_session()?;
        let (_, grant, _) = self.open_app_db(&profile_id, name)?;
        self.record_grant(&profile_id, &profile_db, grant.clone())?;
        info!(profile = %profile_id, app = name, key = %grant.key.short(), "App database synced");
        Ok(grant)
    }

    /// Reconcile app databases with the other devices' grants now.
    pub async fn pull_apps(&self) -> MasqResult<ReconcileReport> {
        let reconciler = self
            .session
            .read()
            .as_ref()
            .map(|s| s.reconciler.clone())
            .ok_or(MasqError::NoOpenProfile)?;
        reconciler.run()
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Pairing
    // ═══════════════════════════════════════════════════════════════════════

    /// Send the open profile to a new device as `new_id`.
    ///
    /// Returns the new device's profile writer once it is authorized.
    pub async fn push_profile(
        &self,
        channel: &str,
        key: &ChannelKey,
        new_id: &str,
    ) -> MasqResult<WriterId> {
        if new_id.is_empty() {
            return Err(MasqError::MissingIdentifier);
        }
        let (profile, db) = {
            let session = self.session.read();
            let session = session.as_ref().ok_or(MasqError::NoOpenProfile)?;
            (session.profile.with_id(new_id), session.db.clone())
        };
        let channel = SecureChannel::join(self.arena.rendezvous().as_ref(), channel, key)?;
        protocol::push_profile(&channel, &db, &profile, self.config.handshake_timeout()).await
    }

    /// Receive a profile pushed on `channel` and join it as a new device.
    ///
    /// The password is checked before anything is stored. On success the
    /// pulled profile is open and this device has its own record in it.
    pub async fn pull_profile(
        &self,
        channel: &str,
        key: &ChannelKey,
        password: &str,
    ) -> MasqResult<String> {
        let timeout = self.config.handshake_timeout();
        let channel = SecureChannel::join(self.arena.rendezvous().as_ref(), channel, key)?;
        let pulled = protocol::receive_push(&channel, timeout).await?;

        let profile = pulled.profile;
        if profile.id.is_empty() {
            return Err(MasqError::MissingIdentifier);
        }
        profile.kdf.check_limits()?;
        profile.unlock(password)?;
        if self.store.exists(&profile_record_key(&profile.id))? {
            return Err(MasqError::InvalidOperation(format!(
                "profile {} already exists on this device",
                profile.id
            )));
        }

        let db = self
            .arena
            .open(&profile_db_name(&profile.id), Some(pulled.db_key))?;
        protocol::complete_pull(&channel, &db, timeout).await?;
        drop(channel);

        self.store
            .save(&profile_record_key(&profile.id), &serde_json::to_vec(&profile)?)?;
        info!(profile = %profile.id, writer = %db.local_key().short(), "Profile pulled");

        self.open_profile(&profile.id, password).await?;
        let name = self
            .config
            .device_name
            .clone()
            .unwrap_or_else(|| format!("device-{}", db.local_key().short()));
        self.add_device(NewDevice::named(name)).await?;
        Ok(profile.id)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // App authorization
    // ═══════════════════════════════════════════════════════════════════════

    fn set_request_state(&self, generation: u64, state: AppRequestState) -> bool {
        let app_id = {
            let mut slot = self.request.lock();
            match slot.as_mut() {
                Some(current) if current.generation == generation => {
                    current.state = state;
                    current.request.app_id.clone()
                }
                _ => return false,
            }
        };
        info!(app = %app_id, %state, "App request state changed");
        self.emit(EngineEvent::AppRequestChanged { app_id, state });
        true
    }

    /// Generation of the request for `app_id` if `allowed` accepts its state.
    fn request_in_state<F>(&self, app_id: &str, allowed: F) -> MasqResult<u64>
    where
        F: Fn(AppRequestState) -> bool,
    {
        let slot = self.request.lock();
        match slot.as_ref() {
            Some(current) if current.request.app_id == app_id => {
                if allowed(current.state) {
                    Ok(current.generation)
                } else {
                    Err(MasqError::InvalidOperation(format!(
                        "request for {} is {}",
                        app_id, current.state
                    )))
                }
            }
            _ => Err(MasqError::InvalidRequest(format!("no request for {}", app_id))),
        }
    }

    /// Take an app request: join its channel and wait for the user.
    ///
    /// A request already showing is abandoned and its channel closed.
    pub async fn handle_app_request(&self, request: AppRequest) -> MasqResult<()> {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        {
            let mut slot = self.request.lock();
            if let Some(previous) = slot.as_mut() {
                info!(app = %previous.request.app_id, "Abandoning previous app request");
                previous.abandon();
            }
            *slot = Some(RequestSlot {
                request: request.clone(),
                state: AppRequestState::Pending,
                channel: None,
                created: None,
                generation,
            });
        }
        self.emit(EngineEvent::AppRequestChanged {
            app_id: request.app_id.clone(),
            state: AppRequestState::Pending,
        });

        let channel = Arc::new(SecureChannel::join(
            self.arena.rendezvous().as_ref(),
            &request.channel,
            &request.key,
        )?);
        {
            let mut slot = self.request.lock();
            match slot.as_mut() {
                Some(slot) if slot.generation == generation => slot.channel = Some(channel),
                // Superseded while joining
                _ => {
                    channel.close();
                    return Ok(());
                }
            }
        }
        self.set_request_state(generation, AppRequestState::Offered);
        Ok(())
    }

    /// The request currently showing, with its state.
    pub fn app_request(&self) -> Option<(AppRequest, AppRequestState)> {
        self.request
            .lock()
            .as_ref()
            .map(|slot| (slot.request.clone(), slot.state))
    }

    fn offered_request(&self, app_id: &str) -> MasqResult<(u64, Arc<SecureChannel>)> {
        let generation = self.request_in_state(app_id, |state| state == AppRequestState::Offered)?;
        self.request
            .lock()
            .as_ref()
            .filter(|slot| slot.generation == generation)
            .and_then(|slot| slot.channel.clone())
            .map(|channel| (generation, channel))
            .ok_or_else(|| {
                MasqError::InvalidOperation(format!("request for {} has no channel", app_id))
            })
    }

    /// Grant the requesting app write access to its database.
    ///
    /// On failure the request stays offered, nothing is authorized and an
    /// app database created for the request is deleted again.
    pub async fn accept(&self, app_id: &str) -> MasqResult<AppGrant> {
        let (generation, channel) = self.offered_request(app_id)?;
        let (profile_id, profile_db) = self.open_session()?;
        let (db, grant, created) = self.open_app_db(&profile_id, app_id)?;
        let name = db.name().to_string();

        if created {
            let tracked = {
                let mut slot = self.request.lock();
                match slot.as_mut() {
                    Some(current)
                        if current.generation == generation
                            && current.state == AppRequestState::Offered =>
                    {
                        current.created = Some(name.clone());
                        true
                    }
                    _ => false,
                }
            };
            if !tracked {
                drop(db);
                self.discard_app_db(app_id, &name).await?;
                return Err(MasqError::InvalidOperation(format!(
                    "request for {} was withdrawn",
                    app_id
                )));
            }
        }

        let result = self
            .complete_accept(generation, &channel, &db, &profile_id, &profile_db, &grant)
            .await;
        drop(db);
        if let Err(e) = result {
            if created {
                if let Some(current) = self.request.lock().as_mut() {
                    if current.generation == generation {
                        current.created = None;
                    }
                }
                if let Err(discard) = self.discard_app_db(app_id, &name).await {
                    warn!(app = app_id, error = %discard, "Could not discard app database");
                }
            }
            return Err(e);
        }

        info!(app = app_id, state = %AppRequestState::Connected, "App request state changed");
        self.emit(EngineEvent::AppRequestChanged {
            app_id: app_id.to_string(),
            state: AppRequestState::Connected,
        });
        Ok(grant)
    }

    /// Handshake and commit of `accept`. The request moves to connected only
    /// if it is still offered once the app's writer is authorized.
    async fn complete_accept(
        &self,
        generation: u64,
        channel: &SecureChannel,
        db: &ReplicatedDb,
        profile_id: &str,
        profile_db: &ReplicatedDb,
        grant: &AppGrant,
    ) -> MasqResult<()> {
        let app_id = grant.app_id.as_str();
        let writer =
            protocol::grant_access(channel, db, app_id, self.config.handshake_timeout()).await?;

        let committed = {
            let mut slot = self.request.lock();
            match slot.as_mut() {
                Some(current)
                    if current.generation == generation
                        && current.state == AppRequestState::Offered =>
                {
                    current.state = AppRequestState::Connected;
                    current.created = None;
                    true
                }
                _ => false,
            }
        };
        if !committed {
            return Err(MasqError::InvalidOperation(format!(
                "request for {} was withdrawn",
                app_id
            )));
        }

        if let Err(e) = self.record_grant(profile_id, profile_db, grant.clone()) {
            self.set_request_state(generation, AppRequestState::Offered);
            return Err(e);
        }
        debug!(app = app_id, writer = %writer.short(), "Grant recorded");
        Ok(())
    }

    /// Turn the request down.
    ///
    /// Closes the channel. An app database an accept created for the
    /// request is deleted, so refusing leaves nothing behind.
    pub async fn refuse(&self, app_id: &str) -> MasqResult<()> {
        let generation = self.request_in_state(app_id, |state| !state.is_settled())?;
        let created = {
            let mut slot = self.request.lock();
            match slot.as_mut() {
                Some(current) if current.generation == generation => {
                    current.abandon();
                    current.created.take()
                }
                _ => None,
            }
        };
        self.set_request_state(generation, AppRequestState::Refused);
        if let Some(name) = created {
            self.discard_app_db(app_id, &name).await?;
        }
        Ok(())
    }

    /// Dismiss a refused or connected request.
    pub async fn acknowledge(&self, app_id: &str) -> MasqResult<()> {
        let generation = self.request_in_state(app_id, AppRequestState::is_settled)?;
        let removed = {
            let mut slot = self.request.lock();
            match slot.take() {
                Some(mut current) if current.generation == generation => {
                    current.abandon();
                    true
                }
                other => {
                    *slot = other;
                    false
                }
            }
        };
        if removed {
            info!(app = app_id, "App request acknowledged");
            self.emit(EngineEvent::AppRequestCleared {
                app_id: app_id.to_string(),
            });
        }
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Lifecycle
    // ═══════════════════════════════════════════════════════════════════════

    pub async fn shutdown(&self) {
        info!("Shutting down MasqEngine");
        if let Some(mut slot) = self.request.lock().take() {
            slot.abandon();
        }
        self.close_profile();
        self.arena.close_all();
        if let Some(gossip) = &self.gossip {
            gossip.shutdown().await;
        }
        info!("MasqEngine shutdown complete");
    }
}

impl std::fmt::Debug for MasqEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MasqEngine")
            .field("data_dir", &self.config.data_dir)
            .field("profile", &self.current_profile())
            .field("apps", &self.apps.ids())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::MemoryHub;
    use crate::crypto::KdfParams;
    use crate::storage::MemoryStore;

    fn engine(hub: &MemoryHub) -> MasqEngine {
        let mut config = MasqConfig::with_data_dir("unused");
        config.kdf = KdfParams::insecure_fast();
        config.handshake_timeout_secs = 5;
        MasqEngine::new(Arc::new(MemoryStore::new()), Arc::new(hub.clone()), config)
    }

    #[tokio::test]
    async fn test_add_and_open_profile() {
        let engine = engine(&MemoryHub::new());
        let id = engine
            .add_profile(NewProfile::new("alice", "p"))
            .await
            .unwrap();

        let profiles = engine.get_profiles().unwrap();
        assert_eq!(profiles.len(), 1);
        assert_eq!(profiles[0].id, id);

        let details = engine.open_profile(&id, "p").await.unwrap();
        assert_eq!(details.username, "alice");
        assert!(matches!(
            engine.open_profile(&id, "wrong").await,
            Err(MasqError::PasswordMismatch)
        ));
        // A failed unlock leaves the open profile alone
        assert_eq!(engine.current_profile(), Some(id));
    }

    #[tokio::test]
    async fn test_update_profile() {
        let engine = engine(&MemoryHub::new());
        assert!(matches!(
            engine.update_profile(ProfileUpdate::default()).await,
            Err(MasqError::MissingIdentifier)
        ));

        let id = engine.add_profile(NewProfile::new("alice", "p")).await.unwrap();
        let rename = ProfileUpdate {
            id: Some(id.clone()),
            username: Some("alicia".to_string()),
            ..Default::default()
        };
        engine.update_profile(rename).await.unwrap();
        assert_eq!(engine.get_profile(&id).unwrap().username, "alicia");

        let private = ProfileUpdate {
            id: Some(id.clone()),
            firstname: Some("Alice".to_string()),
            ..Default::default()
        };
        assert!(matches!(
            engine.update_profile(private.clone()).await,
            Err(MasqError::NoOpenProfile)
        ));
        engine.open_profile(&id, "p").await.unwrap();
        engine.update_profile(private).await.unwrap();
        engine.close_profile();
        assert_eq!(engine.open_profile(&id, "p").await.unwrap().firstname, "Alice");
    }

    #[tokio::test]
    async fn test_device_and_app_need_open_profile() {
        let engine = engine(&MemoryHub::new());
        assert!(matches!(
            engine.add_device(NewDevice::named("laptop")).await,
            Err(MasqError::NoOpenProfile)
        ));
        assert!(matches!(engine.get_devices(), Err(MasqError::NoOpenProfile)));
        assert!(matches!(
            engine.add_app(NewApp::new("", "nameless")).await,
            Err(MasqError::MissingIdentifier)
        ));
    }

    #[tokio::test]
    async fn test_device_upsert_keeps_grants() {
        let engine = engine(&MemoryHub::new());
        let id = engine.add_profile(NewProfile::new("alice", "p")).await.unwrap();
        engine.open_profile(&id, "p").await.unwrap();

        assert!(matches!(engine.get_device(), Err(MasqError::DeviceNotFound(_))));
        let first = engine.add_device(NewDevice::named("laptop")).await.unwrap();
        engine.create_app_sync("notes").await.unwrap();
        let second = engine.add_device(NewDevice::named("work laptop")).await.unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(second.apps.len(), 1);
        assert_eq!(engine.get_devices().unwrap().len(), 1);
        assert_eq!(engine.get_device().unwrap().name, "work laptop");
    }

    #[tokio::test]
    async fn test_create_app_sync_is_creator_grant() {
        let engine = engine(&MemoryHub::new());
        let id = engine.add_profile(NewProfile::new("alice", "p")).await.unwrap();
        engine.open_profile(&id, "p").await.unwrap();
        assert!(matches!(
            engine.create_app_sync("app").await,
            Err(MasqError::DeviceNotFound(_))
        ));
        engine.add_device(NewDevice::named("laptop")).await.unwrap();

        let grant = engine.create_app_sync("app").await.unwrap();
        assert_eq!(grant.local_key, grant.key);
        assert_eq!(engine.create_app_sync("app").await.unwrap(), grant);
        assert_eq!(engine.get_device().unwrap().apps, vec![grant]);
        assert_eq!(engine.app_db("app").unwrap().authorized().len(), 1);

        // Reopening the profile reopens the app database
        engine.close_profile();
        assert!(engine.app_db("app").is_none());
        engine.open_profile(&id, "p").await.unwrap();
        assert!(engine.app_db("app").is_some());
    }

    #[tokio::test]
    async fn test_request_lifecycle_errors() {
        let engine = engine(&MemoryHub::new());
        assert!(matches!(
            engine.accept("id").await,
            Err(MasqError::InvalidRequest(_))
        ));

        let request = AppRequest::new("id", "hi", "c1", ChannelKey::generate()).unwrap();
        engine.handle_app_request(request).await.unwrap();
        assert!(matches!(
            engine.acknowledge("id").await,
            Err(MasqError::InvalidOperation(_))
        ));
        engine.refuse("id").await.unwrap();
        assert!(matches!(
            engine.refuse("id").await,
            Err(MasqError::InvalidOperation(_))
        ));
        assert!(matches!(
            engine.accept("id").await,
            Err(MasqError::InvalidOperation(_))
        ));
        engine.acknowledge("id").await.unwrap();
        assert!(engine.app_request().is_none());
    }

    #[tokio::test]
    async fn test_new_request_replaces_showing_one() {
        let engine = engine(&MemoryHub::new());
        let first = AppRequest::new("one", "", "c1", ChannelKey::generate()).unwrap();
        let second = AppRequest::new("two", "", "c2", ChannelKey::generate()).unwrap();

        engine.handle_app_request(first).await.unwrap();
        engine.handle_app_request(second).await.unwrap();

        let (request, state) = engine.app_request().unwrap();
        assert_eq!(request.app_id, "two");
        assert_eq!(state, AppRequestState::Offered);
        assert!(matches!(
            engine.refuse("one").await,
            Err(MasqError::InvalidRequest(_))
        ));
    }

    #[tokio::test]
    async fn test_pull_rejects_costly_kdf() {
        use crate::identity::WriterKeypair;
        use crate::protocol::{send_message, ProtocolMessage};

        let hub = MemoryHub::new();
        let engine = engine(&hub);
        let (mut profile, _) = Profile::create(
            "X",
            "mallory",
            "p",
            &PrivateFields::default(),
            KdfParams::insecure_fast(),
        )
        .unwrap();
        profile.kdf.memory_kib = u32::MAX;

        let key = ChannelKey::generate();
        let pusher = SecureChannel::join(&hub, "pairing", &key).unwrap();
        send_message(
            &pusher,
            ProtocolMessage::ProfilePush {
                profile,
                db_key: WriterKeypair::generate().public(),
            },
        )
        .unwrap();

        assert!(matches!(
            engine.pull_profile("pairing", &key, "p").await,
            Err(MasqError::Crypto(_))
        ));
        assert!(engine.get_profiles().unwrap().is_empty());
    }
}
