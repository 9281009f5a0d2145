//! Masq Core Library
//!
//! Personal data vault with peer-to-peer profile and app sync.
//!
//! ## Overview
//!
//! A user keeps one or more password-protected profiles on each device.
//! Every profile owns a replicated multi-writer database holding its
//! device records and app registry; every app the user authorizes gets a
//! database of its own. Devices of one profile replicate these databases
//! with each other without any server in between.
//!
//! ## Core Principles
//!
//! - **Append-only**: every writer owns a signed feed; state is derived
//! - **Authorized writers**: only entries of authorized writers count
//! - **Untrusted transport**: pairing frames are sealed with a shared key
//!
//! ## Quick Start
//!
//! ```ignore
//! use masq_core::{MasqConfig, MasqEngine, NewDevice, NewProfile};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let engine = MasqEngine::open(MasqConfig::default()).await?;
//!
//!     // Create and unlock a profile
//!     let id = engine.add_profile(NewProfile::new("alice", "secret")).await?;
//!     engine.open_profile(&id, "secret").await?;
//!     engine.add_device(NewDevice::named("laptop")).await?;
//!
//!     // Give an app its own database
//!     let grant = engine.create_app_sync("notes").await?;
//!     println!("notes: {}", grant.key);
//!
//!     engine.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod channel;
pub mod config;
pub mod crypto;
pub mod db;
pub mod engine;
pub mod error;
pub mod identity;
pub mod protocol;
pub mod registry;
pub mod storage;
pub mod types;

// Re-exports
pub use channel::{GossipRendezvous, Link, MemoryHub, Rendezvous, SecureChannel};
pub use config::{MasqConfig, NetworkConfig};
pub use crypto::{ChannelKey, KdfParams};
pub use db::{DbArena, DbEvent, DbVersion, Entry, Op, ReplicatedDb};
pub use engine::{EngineEvent, MasqEngine};
pub use error::{MasqError, MasqResult};
pub use identity::{DiscoveryKey, WriterId, WriterKeypair};
pub use protocol::{AppRequest, AppRequestState, AppRequester, ProtocolMessage, WireMessage};
pub use registry::{AppRegistry, ReconcileReport};
pub use storage::{LocalStore, MemoryStore, RedbStore};
pub use types::*;
