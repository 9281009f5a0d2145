//! App Authorization Integration Tests
//!
//! A vault engine and an app share one in-process rendezvous.
//!
//! ## What These Tests Verify
//!
//! - Request states: pending -> offered -> refused | connected
//! - Refusing creates no database and records no grant
//! - Accepting authorizes the app's own writer and records the grant
//! - A handshake timeout leaves the request offered and no database behind
//! - Refusing during an accept rolls the accept back

use std::sync::Arc;
use std::time::Duration;

use masq_core::{
    AppRequest, AppRequestState, AppRequester, ChannelKey, DbArena, EngineEvent, KdfParams,
    LocalStore, MasqConfig, MasqEngine, MasqError, MemoryHub, MemoryStore, NewDevice, NewProfile,
};
use tokio::sync::broadcast;
use tokio::time::{sleep, Instant};

fn engine_with_store(hub: &MemoryHub, store: Arc<MemoryStore>, timeout_secs: u64) -> MasqEngine {
    let mut config = MasqConfig::with_data_dir("unused");
    config.kdf = KdfParams::insecure_fast();
    config.handshake_timeout_secs = timeout_secs;
    MasqEngine::new(store, Arc::new(hub.clone()), config)
}

fn engine(hub: &MemoryHub, timeout_secs: u64) -> MasqEngine {
    engine_with_store(hub, Arc::new(MemoryStore::new()), timeout_secs)
}

/// Vault with an open profile and a device, plus its store.
async fn vault_and_store(hub: &MemoryHub, timeout_secs: u64) -> (MasqEngine, Arc<MemoryStore>) {
    let store = Arc::new(MemoryStore::new());
    let engine = engine_with_store(hub, store.clone(), timeout_secs);
    let id = engine
        .add_profile(NewProfile::new("alice", "p"))
        .await
        .unwrap();
    engine.open_profile(&id, "p").await.unwrap();
    engine.add_device(NewDevice::named("laptop")).await.unwrap();
    (engine, store)
}

async fn vault(hub: &MemoryHub, timeout_secs: u64) -> MasqEngine {
    vault_and_store(hub, timeout_secs).await.0
}

/// Records of every app database in `store`.
fn app_records(store: &MemoryStore) -> usize {
    store.scan("db/apps/").unwrap().len()
}

fn request(channel: &str) -> AppRequest {
    AppRequest::new("id", "Notes would like a database", channel, ChannelKey::generate()).unwrap()
}

/// Collect the request states announced so far.
fn states(events: &mut broadcast::Receiver<EngineEvent>) -> Vec<AppRequestState> {
    let mut states = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let EngineEvent::AppRequestChanged { state, .. } = event {
            states.push(state);
        }
    }
    states
}

#[tokio::test]
async fn test_refuse_creates_nothing() {
    let hub = MemoryHub::new();
    let vault = vault(&hub, 5).await;
    let mut events = vault.subscribe_events();

    vault.handle_app_request(request("c1")).await.unwrap();
    let (shown, state) = vault.app_request().unwrap();
    assert_eq!(shown.app_id, "id");
    assert_eq!(state, AppRequestState::Offered);

    vault.refuse("id").await.unwrap();
    assert_eq!(vault.app_request().unwrap().1, AppRequestState::Refused);
    assert!(vault.app_db("id").is_none());
    assert!(vault.get_device().unwrap().apps.is_empty());

    vault.acknowledge("id").await.unwrap();
    assert!(vault.app_request().is_none());
    assert_eq!(
        states(&mut events),
        vec![
            AppRequestState::Pending,
            AppRequestState::Offered,
            AppRequestState::Refused
        ]
    );
}

#[tokio::test]
async fn test_accept_connects_app() {
    let hub = MemoryHub::new();
    let vault = vault(&hub, 5).await;
    let mut events = vault.subscribe_events();

    // The app waits on the channel named in its link
    let request = request("c2");
    let link = request.to_link("https://vault.example").unwrap();
    let app_arena = Arc::new(DbArena::new(
        Arc::new(MemoryStore::new()),
        Arc::new(hub.clone()),
    ));
    let requester = AppRequester::new(app_arena.clone());
    let app = {
        let request = request.clone();
        tokio::spawn(async move {
            requester
                .request_access(&request, Duration::from_secs(5))
                .await
        })
    };

    vault
        .handle_app_request(AppRequest::from_link(&link).unwrap())
        .await
        .unwrap();
    let grant = vault.accept("id").await.unwrap();
    assert_eq!(grant.local_key, grant.key);
    assert_eq!(vault.app_request().unwrap().1, AppRequestState::Connected);

    let app_db = app.await.unwrap().unwrap();
    assert!(app_db.is_writable());
    assert_eq!(app_db.key(), grant.key);

    let vault_db = vault.app_db("id").unwrap();
    assert!(vault_db.is_authorized(&app_db.local_key()));
    assert_eq!(vault.get_device().unwrap().grant("id"), Some(&grant));

    // Writes flow from app to vault after the request is dismissed
    vault.acknowledge("id").await.unwrap();
    app_db.put("settings/theme", b"dark".to_vec()).unwrap();
    let deadline = Instant::now() + Duration::from_secs(10);
    while vault_db.get("settings/theme").is_none() {
        assert!(Instant::now() < deadline, "app write never reached the vault");
        sleep(Duration::from_millis(50)).await;
    }

    assert_eq!(
        states(&mut events),
        vec![
            AppRequestState::Pending,
            AppRequestState::Offered,
            AppRequestState::Connected
        ]
    );
}

#[tokio::test]
async fn test_accept_timeout_stays_offered() {
    let hub = MemoryHub::new();
    let (vault, store) = vault_and_store(&hub, 1).await;

    vault.handle_app_request(request("c3")).await.unwrap();
    assert!(matches!(
        vault.accept("id").await,
        Err(MasqError::HandshakeTimeout(_))
    ));
    assert_eq!(vault.app_request().unwrap().1, AppRequestState::Offered);
    assert!(vault.get_device().unwrap().grant("id").is_none());
    assert!(vault.app_db("id").is_none());
    assert_eq!(app_records(&store), 0);

    // Still refusable afterwards, and refusing leaves nothing behind
    vault.refuse("id").await.unwrap();
    assert_eq!(vault.app_request().unwrap().1, AppRequestState::Refused);
    assert!(vault.app_db("id").is_none());
    assert_eq!(app_records(&store), 0);
    vault.acknowledge("id").await.unwrap();
}

#[tokio::test]
async fn test_refuse_during_accept_rolls_back() {
    let hub = MemoryHub::new();
    let (vault, store) = vault_and_store(&hub, 5).await;

    vault.handle_app_request(request("c5")).await.unwrap();
    let (accepted, refused) = tokio::join!(vault.accept("id"), async {
        sleep(Duration::from_millis(200)).await;
        vault.refuse("id").await
    });

    assert!(accepted.is_err());
    refused.unwrap();
    assert_eq!(vault.app_request().unwrap().1, AppRequestState::Refused);
    assert!(vault.app_db("id").is_none());
    assert!(vault.get_device().unwrap().grant("id").is_none());
    assert_eq!(app_records(&store), 0);
}

#[tokio::test]
async fn test_failed_accept_keeps_existing_app_database() {
    let hub = MemoryHub::new();
    let (vault, store) = vault_and_store(&hub, 1).await;
    let grant = vault.create_app_sync("id").await.unwrap();
    let records = app_records(&store);
    assert!(records > 0);

    vault.handle_app_request(request("c6")).await.unwrap();
    assert!(matches!(
        vault.accept("id").await,
        Err(MasqError::HandshakeTimeout(_))
    ));
    vault.refuse("id").await.unwrap();

    assert_eq!(vault.app_db("id").unwrap().key(), grant.key);
    assert_eq!(vault.get_device().unwrap().grant("id"), Some(&grant));
    assert_eq!(app_records(&store), records);
}

#[tokio::test]
async fn test_accept_needs_device() {
    let hub = MemoryHub::new();
    let engine = engine(&hub, 1);
    let id = engine
        .add_profile(NewProfile::new("alice", "p"))
        .await
        .unwrap();
    engine.open_profile(&id, "p").await.unwrap();

    engine.handle_app_request(request("c4")).await.unwrap();
    assert!(matches!(
        engine.accept("id").await,
        Err(MasqError::DeviceNotFound(_))
    ));
    assert_eq!(engine.app_request().unwrap().1, AppRequestState::Offered);
}

#[tokio::test]
async fn test_bad_link_is_rejected() {
    assert!(matches!(
        AppRequest::from_link("https://vault.example#/link/%%%"),
        Err(MasqError::InvalidRequest(_))
    ));
}
