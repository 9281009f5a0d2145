//! Replicated multi-writer database
//!
//! - [`entry`]: signed log entries and their operations
//! - [`feed`]: one writer's hash-chained log
//! - [`database`]: the [`ReplicatedDb`] handle (authorization, resolution,
//!   versions, notifications)
//! - [`replication`]: the feed exchange run over any [`crate::channel::Link`]
//! - [`arena`]: open databases and their replication swarms

pub mod arena;
pub mod database;
pub mod entry;
pub mod feed;
pub mod replication;

pub use arena::{swarm_channel_name, DbArena};
pub use database::{verify_writer_proof, DbEvent, DbVersion, IngestReport, Origin, ReplicatedDb};
pub use entry::{Entry, Op};
pub use feed::{Append, Feed};
pub use replication::{replicate, ReplicationMessage, ReplicationStats};
