//! Multi-writer replicated key-value database
//!
//! ## Model
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────┐
//! │ ReplicatedDb "profile-01HZX…"   root = creator's WriterId  │
//! │                                                            │
//! │  feed(root)    e0 ─ e1 ─ e2 ─ e3                            │
//! │  feed(dev2)    e0 ─ e1                                     │
//! │  feed(rogue)   e0            (not authorized: audit only)  │
//! └────────────────────────────────────────────────────────────┘
//! ```
//!
//! - Every writer owns one feed. Only the local writer's feed is written
//!   locally; all other feeds arrive through replication.
//! - The authorized-writer set starts as `{root}` and grows through
//!   `Authorize` entries in authorized feeds. It never shrinks.
//! - Reads consider only authorized feeds. For a path, the newest entry of
//!   each authorized feed is a candidate; candidates in the causal past of
//!   another candidate lose; among concurrent survivors the greatest writer
//!   id wins.
//! - `version()` digests the heads of all authorized feeds, so equal
//!   versions mean equal resolved state.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use super::entry::{Entry, Op};
use super::feed::{Append, Feed};
use crate::error::{MasqError, MasqResult};
use crate::identity::{DiscoveryKey, WriterId, WriterKeypair};
use crate::storage::LocalStore;

/// Capacity of the change notification channel
const EVENT_CAPACITY: usize = 256;

/// Entries waiting for their causal dependencies are capped at this many
const MAX_PENDING: usize = 65_536;

/// Digest of the authorized feeds' heads.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct DbVersion([u8; 32]);

impl DbVersion {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for DbVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for DbVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DbVersion({})", hex::encode(&self.0[..4]))
    }
}

/// Where a change came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    Local,
    Remote,
}

/// Notification sent once per local batch or remote ingest.
#[derive(Debug, Clone)]
pub struct DbEvent {
    /// Visible paths whose resolved value may have changed
    pub paths: Vec<String>,
    /// Writers that joined the authorized set with this change
    pub authorized: Vec<WriterId>,
    /// Number of entries appended to any feed
    pub appended: usize,
    pub origin: Origin,
}

impl DbEvent {
    /// True if any changed path falls under `prefix`.
    pub fn touches(&self, prefix: &str) -> bool {
        let prefix = normalize(prefix);
        self.paths.iter().any(|p| p.starts_with(prefix))
    }
}

/// Counts from one [`ReplicatedDb::ingest`] call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IngestReport {
    pub applied: usize,
    pub duplicates: usize,
    pub rejected: usize,
    /// Entries kept aside until their dependencies arrive
    pub deferred: usize,
}

#[derive(Serialize, Deserialize)]
struct DbMeta {
    root: WriterId,
    local_secret: String,
}

fn normalize(path: &str) -> &str {
    path.trim_start_matches('/')
}

fn proof_message(context: &[u8], root: &WriterId) -> Vec<u8> {
    let mut message = Vec::with_capacity(context.len() + 32);
    message.extend_from_slice(context);
    message.extend_from_slice(root.as_bytes());
    message
}

/// Check a proof made with [`ReplicatedDb::prove_writer`].
pub fn verify_writer_proof(
    root: &WriterId,
    writer: &WriterId,
    context: &[u8],
    proof: &[u8],
) -> MasqResult<()> {
    writer.verify(&proof_message(context, root), proof)
}

#[derive(Default)]
struct DbState {
    feeds: BTreeMap<WriterId, Feed>,
    authorized: BTreeSet<WriterId>,
    /// path -> writer -> newest seq of that writer touching the path
    index: BTreeMap<String, BTreeMap<WriterId, u64>>,
    pending: BTreeMap<(WriterId, u64), Entry>,
}

impl DbState {
    fn feed_len(&self, writer: &WriterId) -> u64 {
        self.feeds.get(writer).map(Feed::len).unwrap_or(0)
    }

    fn apply(&mut self, entry: Entry) -> MasqResult<Append> {
        let writer = entry.writer;
        let seq = entry.seq;
        let path = entry.op.path().map(str::to_string);

        let outcome = self
            .feeds
            .entry(writer)
            .or_insert_with(|| Feed::new(writer))
            .append(entry)?;

        if outcome == Append::Appended {
            if let Some(path) = path {
                self.index.entry(path).or_default().insert(writer, seq);
            }
        }
        Ok(outcome)
    }

    /// Entries must not reference feed positions this replica lacks, so
    /// that clocks stay transitive.
    fn causally_ready(&self, entry: &Entry) -> bool {
        entry
            .clock
            .iter()
            .all(|(w, len)| *w == entry.writer || self.feed_len(w) >= *len)
    }

    /// Move every pending entry that can be applied into its feed.
    fn drain_pending(&mut self, report: &mut IngestReport) -> Vec<Entry> {
        let mut applied = Vec::new();
        loop {
            let mut progress = false;
            let keys: Vec<(WriterId, u64)> = self.pending.keys().copied().collect();
            for key in keys {
                let ready = match self.pending.get(&key) {
                    Some(entry) => {
                        let len = self.feed_len(&key.0);
                        entry.seq < len || (entry.seq == len && self.causally_ready(entry))
                    }
                    None => false,
                };
                if !ready {
                    continue;
                }
                let Some(entry) = self.pending.remove(&key) else {
                    continue;
                };
                match self.apply(entry.clone()) {
                    Ok(Append::Appended) => {
                        applied.push(entry);
                        progress = true;
                    }
                    Ok(Append::Duplicate) => report.duplicates += 1,
                    Ok(Append::Fork {
                        seq,
                        existing_hash,
                        conflicting_hash,
                    }) => {
                        warn!(
                            writer = %key.0.short(),
                            seq,
                            existing = %hex::encode(existing_hash),
                            conflicting = %hex::encode(conflicting_hash),
                            "Fork detected, keeping first entry"
                        );
                        report.rejected += 1;
                    }
                    Ok(Append::Gap { .. }) => {
                        self.pending.insert(key, entry);
                    }
                    Err(e) => {
                        warn!(writer = %key.0.short(), seq = key.1, error = %e, "Rejected entry");
                        report.rejected += 1;
                    }
                }
            }
            if !progress {
                break;
            }
        }

        while self.pending.len() > MAX_PENDING {
            if let Some(((writer, seq), _)) = self.pending.pop_last() {
                debug!(writer = %writer.short(), seq, "Dropping pending entry over cap");
            }
        }
        report.deferred = self.pending.len();
        applied
    }

    /// Recompute the authorized set; returns the writers added.
    fn recompute_authorized(&mut self, root: &WriterId) -> Vec<WriterId> {
        let mut authorized: BTreeSet<WriterId> = BTreeSet::new();
        authorized.insert(*root);
        loop {
            let mut grew = false;
            let members: Vec<WriterId> = authorized.iter().copied().collect();
            for member in members {
                let Some(feed) = self.feeds.get(&member) else {
                    continue;
                };
                for entry in feed.entries() {
                    if let Op::Authorize { writer } = &entry.op {
                        grew |= authorized.insert(*writer);
                    }
                }
            }
            if !grew {
                break;
            }
        }

        let added: Vec<WriterId> = authorized.difference(&self.authorized).copied().collect();
        self.authorized = authorized;
        added
    }

    fn paths_of(&self, writer: &WriterId) -> Vec<String> {
        self.index
            .iter()
            .filter(|(_, writers)| writers.contains_key(writer))
            .map(|(path, _)| path.clone())
            .collect()
    }

    fn resolve(&self, path: &str) -> Option<&[u8]> {
        let writers = self.index.get(path)?;
        let candidates: Vec<&Entry> = writers
            .iter()
            .filter(|(w, _)| self.authorized.contains(*w))
            .filter_map(|(w, seq)| self.feeds.get(w)?.get(*seq))
            .collect();

        let winner: &Entry = *candidates
            .iter()
            .filter(|c| !candidates.iter().any(|other| other.has_seen(c)))
            .max_by_key(|c| c.writer)?;

        match &winner.op {
            Op::Put { value, .. } => Some(value.as_slice()),
            _ => None,
        }
    }

    fn version(&self) -> DbVersion {
        let mut hasher = blake3::Hasher::new();
        for writer in &self.authorized {
            let (len, head) = match self.feeds.get(writer) {
                Some(feed) => (feed.len(), feed.head_hash()),
                None => continue,
            };
            if len == 0 {
                continue;
            }
            hasher.update(writer.as_bytes());
            hasher.update(&len.to_le_bytes());
            hasher.update(&head);
        }
        DbVersion(*hasher.finalize().as_bytes())
    }

    /// Visible paths changed by `applied` plus everything newly authorized
    /// writers had already written.
    fn changed_paths(&self, applied: &[Entry], newly_authorized: &[WriterId]) -> Vec<String> {
        let mut paths: BTreeSet<String> = applied
            .iter()
            .filter(|e| self.authorized.contains(&e.writer))
            .filter_map(|e| e.op.path().map(str::to_string))
            .collect();
        for writer in newly_authorized {
            paths.extend(self.paths_of(writer));
        }
        paths.into_iter().collect()
    }
}

struct DbInner {
    name: String,
    root: WriterId,
    discovery: DiscoveryKey,
    local: WriterKeypair,
    store: Arc<dyn LocalStore>,
    state: RwLock<DbState>,
    events: broadcast::Sender<DbEvent>,
}

/// Handle to a replicated database. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct ReplicatedDb {
    inner: Arc<DbInner>,
}

impl fmt::Debug for ReplicatedDb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReplicatedDb")
            .field("name", &self.inner.name)
            .field("key", &self.inner.root)
            .field("local_key", &self.inner.local.public())
            .finish()
    }
}

fn meta_key(name: &str) -> String {
    format!("db/{}/meta", name)
}

fn feed_prefix(name: &str) -> String {
    format!("db/{}/feed/", name)
}

fn entry_key(name: &str, writer: &WriterId, seq: u64) -> String {
    format!("db/{}/feed/{}/{:016x}", name, writer.to_hex(), seq)
}

impl ReplicatedDb {
    /// Open a database stored under `name`, creating it if needed.
    ///
    /// - Existing database: loads metadata and re-verifies every stored
    ///   entry. A `root` that disagrees with the stored one is an error.
    /// - New database with `root == None`: a fresh writer is generated and
    ///   becomes both the root and the sole authorized writer.
    /// - New database with `Some(root)`: a replica of someone else's
    ///   database with its own fresh, not yet authorized writer.
    pub fn open(
        store: Arc<dyn LocalStore>,
        name: &str,
        root: Option<WriterId>,
    ) -> MasqResult<Self> {
        let (root, local) = match store.load(&meta_key(name))? {
            Some(bytes) => {
                let meta: DbMeta = serde_json::from_slice(&bytes)?;
                if let Some(expected) = root {
                    if expected != meta.root {
                        return Err(MasqError::InvalidOperation(format!(
                            "database {} has root {}, not {}",
                            name, meta.root, expected
                        )));
                    }
                }
                let secret = hex::decode(&meta.local_secret)
                    .map_err(|e| MasqError::Identity(format!("Invalid writer secret: {}", e)))?;
                (meta.root, WriterKeypair::from_secret_bytes(&secret)?)
            }
            None => {
                let local = WriterKeypair::generate();
                let root = root.unwrap_or_else(|| local.public());
                let meta = DbMeta {
                    root,
                    local_secret: hex::encode(local.secret_bytes()),
                };
                store.save(&meta_key(name), &serde_json::to_vec(&meta)?)?;
                info!(
                    db = name,
                    root = %root.short(),
                    local = %local.public().short(),
                    created = root == local.public(),
                    "Database created"
                );
                (root, local)
            }
        };

        let mut state = DbState::default();
        for (key, bytes) in store.scan(&feed_prefix(name))? {
            match Entry::decode(&bytes) {
                Ok(entry) => {
                    state.pending.insert((entry.writer, entry.seq), entry);
                }
                Err(e) => warn!(db = name, key = %key, error = %e, "Skipping unreadable entry"),
            }
        }
        let mut report = IngestReport::default();
        let loaded = state.drain_pending(&mut report);
        state.recompute_authorized(&root);

        debug!(
            db = name,
            entries = loaded.len(),
            rejected = report.rejected,
            writers = state.authorized.len(),
            "Database opened"
        );

        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Ok(Self {
            inner: Arc::new(DbInner {
                name: name.to_string(),
                root,
                discovery: DiscoveryKey::from_root(&root),
                local,
                store,
                state: RwLock::new(state),
                events,
            }),
        })
    }

    /// Whether a database named `name` exists in `store`.
    pub fn exists(store: &dyn LocalStore, name: &str) -> MasqResult<bool> {
        store.exists(&meta_key(name))
    }

    /// Delete every record of database `name` from `store`.
    ///
    /// The database must not be open anywhere, or it will write again.
    pub fn destroy(store: &dyn LocalStore, name: &str) -> MasqResult<usize> {
        let records = store.scan(&format!("db/{}/", name))?;
        for (key, _) in &records {
            store.remove(key)?;
        }
        Ok(records.len())
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Root identity of the database (its creator's writer key).
    pub fn key(&self) -> WriterId {
        self.inner.root
    }

    /// This replica's own writer identity.
    pub fn local_key(&self) -> WriterId {
        self.inner.local.public()
    }

    pub fn discovery_key(&self) -> DiscoveryKey {
        self.inner.discovery
    }

    pub fn is_authorized(&self, writer: &WriterId) -> bool {
        self.inner.state.read().authorized.contains(writer)
    }

    /// Whether local writes are currently visible to readers.
    pub fn is_writable(&self) -> bool {
        self.is_authorized(&self.local_key())
    }

    /// The authorized-writer set, sorted.
    pub fn authorized(&self) -> Vec<WriterId> {
        self.inner.state.read().authorized.iter().copied().collect()
    }

    pub fn version(&self) -> DbVersion {
        self.inner.state.read().version()
    }

    pub fn get(&self, path: &str) -> Option<Vec<u8>> {
        self.inner
            .state
            .read()
            .resolve(normalize(path))
            .map(<[u8]>::to_vec)
    }

    pub fn get_json<T: DeserializeOwned>(&self, path: &str) -> MasqResult<Option<T>> {
        match self.get(path) {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Visible `(path, value)` pairs under `prefix`, sorted by path.
    pub fn list(&self, prefix: &str) -> Vec<(String, Vec<u8>)> {
        let prefix = normalize(prefix);
        let state = self.inner.state.read();
        state
            .index
            .range(prefix.to_string()..)
            .take_while(|(path, _)| path.starts_with(prefix))
            .filter_map(|(path, _)| {
                state
                    .resolve(path)
                    .map(|value| (path.clone(), value.to_vec()))
            })
            .collect()
    }

    pub fn put(&self, path: &str, value: impl Into<Vec<u8>>) -> MasqResult<()> {
        self.batch(vec![Op::Put {
            path: normalize(path).to_string(),
            value: value.into(),
        }])
    }

    pub fn put_json<T: Serialize>(&self, path: &str, value: &T) -> MasqResult<()> {
        self.put(path, serde_json::to_vec(value)?)
    }

    pub fn delete(&self, path: &str) -> MasqResult<()> {
        self.batch(vec![Op::Delete {
            path: normalize(path).to_string(),
        }])
    }

    /// Append several operations. Local watchers see one notification for
    /// the whole batch.
    ///
    /// Writes by a writer outside the authorized set are kept (and
    /// replicated) but stay invisible until that writer is authorized.
    /// `Authorize` operations are refused outright for non-members.
    pub fn batch(&self, ops: Vec<Op>) -> MasqResult<()> {
        if ops.is_empty() {
            return Ok(());
        }
        let inner = &self.inner;
        let local = inner.local.public();

        let event = {
            let mut state = inner.state.write();
            let is_member = state.authorized.contains(&local);
            if !is_member && ops.iter().any(|op| matches!(op, Op::Authorize { .. })) {
                return Err(MasqError::Unauthorized(format!(
                    "{} is not a writer of {}",
                    local.short(),
                    inner.name
                )));
            }

            let mut seq = state.feed_len(&local);
            let mut prev = state
                .feeds
                .get(&local)
                .map(Feed::head_hash)
                .unwrap_or(super::entry::GENESIS_HASH);
            let clock: Vec<(WriterId, u64)> = state
                .feeds
                .iter()
                .filter(|(w, feed)| **w != local && !feed.is_empty())
                .map(|(w, feed)| (*w, feed.len()))
                .collect();

            let mut entries = Vec::with_capacity(ops.len());
            let mut records = Vec::with_capacity(ops.len());
            for op in ops {
                let entry = Entry::create(&inner.local, seq, prev, clock.clone(), op)?;
                prev = entry.hash()?;
                records.push((entry_key(&inner.name, &local, seq), entry.encode()?));
                entries.push(entry);
                seq += 1;
            }
            inner.store.save_many(&records)?;

            for entry in &entries {
                state.apply(entry.clone())?;
            }
            let newly_authorized = state.recompute_authorized(&inner.root);
            if !state.authorized.contains(&local) {
                warn!(
                    db = %inner.name,
                    writer = %local.short(),
                    count = entries.len(),
                    "Local writes pending authorization"
                );
            }

            DbEvent {
                paths: state.changed_paths(&entries, &newly_authorized),
                authorized: newly_authorized,
                appended: entries.len(),
                origin: Origin::Local,
            }
        };

        let _ = inner.events.send(event);
        Ok(())
    }

    /// Add `writer` to the authorized set.
    ///
    /// Fails with `Unauthorized` unless the local writer is a member.
    /// Authorizing an existing member is a no-op.
    pub fn authorize(&self, writer: &WriterId) -> MasqResult<()> {
        {
            let state = self.inner.state.read();
            if !state.authorized.contains(&self.local_key()) {
                return Err(MasqError::Unauthorized(format!(
                    "{} is not a writer of {}",
                    self.local_key().short(),
                    self.inner.name
                )));
            }
            if state.authorized.contains(writer) {
                return Ok(());
            }
        }
        self.batch(vec![Op::Authorize { writer: *writer }])?;
        info!(db = %self.inner.name, writer = %writer.short(), "Writer authorized");
        Ok(())
    }

    /// Length of every known feed, including unauthorized ones.
    pub fn heads(&self) -> Vec<(WriterId, u64)> {
        self.inner
            .state
            .read()
            .feeds
            .iter()
            .map(|(w, feed)| (*w, feed.len()))
            .collect()
    }

    /// Entries a peer reporting `heads` does not have yet.
    pub fn entries_after(&self, heads: &[(WriterId, u64)]) -> Vec<Entry> {
        let remote: BTreeMap<WriterId, u64> = heads.iter().copied().collect();
        let state = self.inner.state.read();
        state
            .feeds
            .iter()
            .flat_map(|(w, feed)| feed.entries_from(remote.get(w).copied().unwrap_or(0)))
            .cloned()
            .collect()
    }

    /// True if a peer reporting `heads` has entries this replica lacks.
    pub fn lacks(&self, heads: &[(WriterId, u64)]) -> bool {
        let state = self.inner.state.read();
        heads.iter().any(|(w, len)| state.feed_len(w) < *len)
    }

    /// Merge entries received from a peer.
    ///
    /// Invalid entries (bad signature, broken chain, fork) are logged and
    /// skipped; they never fail the call. Only storage faults do.
    pub fn ingest(&self, entries: Vec<Entry>) -> MasqResult<IngestReport> {
        let inner = &self.inner;
        let mut report = IngestReport::default();

        let event = {
            let mut state = inner.state.write();
            for entry in entries {
                if let Err(e) = entry.verify() {
                    warn!(db = %inner.name, error = %e, "Rejected entry");
                    report.rejected += 1;
                    continue;
                }
                state.pending.insert((entry.writer, entry.seq), entry);
            }

            let applied = state.drain_pending(&mut report);
            report.applied = applied.len();
            if applied.is_empty() {
                None
            } else {
                let records = applied
                    .iter()
                    .map(|e| -> MasqResult<(String, Vec<u8>)> {
                        Ok((entry_key(&inner.name, &e.writer, e.seq), e.encode()?))
                    })
                    .collect::<MasqResult<Vec<_>>>()?;
                inner.store.save_many(&records)?;

                let newly_authorized = state.recompute_authorized(&inner.root);
                for writer in &newly_authorized {
                    info!(db = %inner.name, writer = %writer.short(), "Writer authorized by peer");
                }
                Some(DbEvent {
                    paths: state.changed_paths(&applied, &newly_authorized),
                    authorized: newly_authorized,
                    appended: applied.len(),
                    origin: Origin::Remote,
                })
            }
        };

        debug!(db = %inner.name, ?report, "Ingested entries");
        if let Some(event) = event {
            let _ = inner.events.send(event);
        }
        Ok(report)
    }

    /// Subscribe to change notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<DbEvent> {
        self.inner.events.subscribe()
    }

    /// Call `callback` for every change touching `prefix`.
    ///
    /// Runs until the returned task is aborted or every handle to this
    /// database is dropped. Must be called inside a tokio runtime.
    pub fn watch<F>(&self, prefix: &str, mut callback: F) -> tokio::task::JoinHandle<()>
    where
        F: FnMut(&DbEvent) + Send + 'static,
    {
        let prefix = normalize(prefix).to_string();
        let name = self.inner.name.clone();
        let mut rx = self.subscribe();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        if event.touches(&prefix) {
                            callback(&event);
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(db = %name, skipped, "Watcher lagged");
                        callback(&DbEvent {
                            paths: vec![prefix.clone()],
                            authorized: Vec::new(),
                            appended: 0,
                            origin: Origin::Remote,
                        });
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    /// Wait until `check` holds, re-evaluating after every change.
    pub async fn wait_for<F>(&self, timeout: Duration, mut check: F) -> MasqResult<()>
    where
        F: FnMut(&ReplicatedDb) -> bool,
    {
        let mut rx = self.subscribe();
        let wait = async {
            loop {
                if check(self) {
                    return Ok(());
                }
                match rx.recv().await {
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => {
                        return Err(MasqError::ChannelClosed)
                    }
                }
            }
        };
        tokio::time::timeout(timeout, wait).await.map_err(|_| {
            MasqError::HandshakeTimeout(format!("waiting on database {}", self.inner.name))
        })?
    }

    /// Prove possession of the local writer key.
    ///
    /// The signature covers `context ‖ root`, so a proof made for one
    /// database or handshake step is useless for another.
    pub fn prove_writer(&self, context: &[u8]) -> Vec<u8> {
        self.inner
            .local
            .sign(&proof_message(context, &self.inner.root))
    }

    /// Number of entries waiting on missing dependencies.
    pub fn pending_len(&self) -> usize {
        self.inner.state.read().pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;

    fn store() -> Arc<dyn LocalStore> {
        Arc::new(MemoryStore::new())
    }

    /// Copy everything each side lacks in both directions.
    fn sync(a: &ReplicatedDb, b: &ReplicatedDb) {
        a.ingest(b.entries_after(&a.heads())).unwrap();
        b.ingest(a.entries_after(&b.heads())).unwrap();
    }

    #[test]
    fn test_creator_is_sole_writer() {
        let db = ReplicatedDb::open(store(), "test", None).unwrap();
        assert_eq!(db.key(), db.local_key());
        assert_eq!(db.authorized(), vec![db.local_key()]);
        assert!(db.is_writable());
    }

    #[test]
    fn test_put_get_list_delete() {
        let db = ReplicatedDb::open(store(), "test", None).unwrap();
        db.put("/devices/a", b"1".to_vec()).unwrap();
        db.put("/devices/b", b"2".to_vec()).unwrap();
        db.put("/apps/x", b"3".to_vec()).unwrap();

        assert_eq!(db.get("/devices/a").unwrap(), b"1");
        assert_eq!(db.get("devices/a").unwrap(), b"1");
        let devices = db.list("/devices/");
        assert_eq!(devices.len(), 2);
        assert_eq!(devices[0].0, "devices/a");

        db.delete("/devices/a").unwrap();
        assert!(db.get("/devices/a").is_none());
        assert_eq!(db.list("/devices/").len(), 1);
    }

    #[test]
    fn test_replica_is_not_authorized() {
        let a = ReplicatedDb::open(store(), "test", None).unwrap();
        let b = ReplicatedDb::open(store(), "test", Some(a.key())).unwrap();
        assert_eq!(b.key(), a.key());
        assert_ne!(b.local_key(), b.key());
        assert!(!b.is_writable());
        assert_eq!(b.discovery_key(), a.discovery_key());
    }

    #[test]
    fn test_unauthorized_cannot_authorize() {
        let a = ReplicatedDb::open(store(), "test", None).unwrap();
        let b = ReplicatedDb::open(store(), "test", Some(a.key())).unwrap();
        let result = b.authorize(&b.local_key());
        assert!(matches!(result, Err(MasqError::Unauthorized(_))));
    }

    #[test]
    fn test_unauthorized_writes_invisible_until_authorized() {
        let a = ReplicatedDb::open(store(), "test", None).unwrap();
        let b = ReplicatedDb::open(store(), "test", Some(a.key())).unwrap();

        b.put("/note", b"from b".to_vec()).unwrap();
        assert!(b.get("/note").is_none());

        sync(&a, &b);
        assert!(a.get("/note").is_none());
        assert_eq!(a.heads(), vec![(b.local_key(), 1)], "audit copy kept");

        let before = a.version();
        a.authorize(&b.local_key()).unwrap();
        assert_ne!(a.version(), before);
        assert_eq!(a.get("/note").unwrap(), b"from b");

        sync(&a, &b);
        assert!(b.is_writable());
        assert_eq!(b.get("/note").unwrap(), b"from b");
        assert_eq!(a.version(), b.version());
    }

    #[test]
    fn test_causal_overwrite_wins() {
        let a = ReplicatedDb::open(store(), "test", None).unwrap();
        let b = ReplicatedDb::open(store(), "test", Some(a.key())).unwrap();
        sync(&a, &b);
        a.authorize(&b.local_key()).unwrap();
        sync(&a, &b);

        // Whichever writer id is smaller, a write made after seeing the
        // other's value replaces it.
        b.put("/k", b"b1".to_vec()).unwrap();
        sync(&a, &b);
        a.put("/k", b"a2".to_vec()).unwrap();
        sync(&a, &b);
        assert_eq!(a.get("/k").unwrap(), b"a2");
        assert_eq!(b.get("/k").unwrap(), b"a2");
    }

    #[test]
    fn test_concurrent_writes_resolve_by_writer_order() {
        let a = ReplicatedDb::open(store(), "test", None).unwrap();
        let b = ReplicatedDb::open(store(), "test", Some(a.key())).unwrap();
        sync(&a, &b);
        a.authorize(&b.local_key()).unwrap();
        sync(&a, &b);

        a.put("/k", b"from a".to_vec()).unwrap();
        b.put("/k", b"from b".to_vec()).unwrap();
        sync(&a, &b);

        let expected: &[u8] = if a.local_key() > b.local_key() {
            b"from a"
        } else {
            b"from b"
        };
        assert_eq!(a.get("/k").unwrap(), expected);
        assert_eq!(b.get("/k").unwrap(), expected);
        assert_eq!(a.version(), b.version());
    }

    #[test]
    fn test_ingest_rejects_forged_entries() {
        let a = ReplicatedDb::open(store(), "test", None).unwrap();
        let b = ReplicatedDb::open(store(), "test", Some(a.key())).unwrap();
        a.put("/k", b"v".to_vec()).unwrap();

        let mut entries = a.entries_after(&[]);
        if let Op::Put { value, .. } = &mut entries[0].op {
            *value = b"forged".to_vec();
        }
        let report = b.ingest(entries).unwrap();
        assert_eq!(report.rejected, 1);
        assert_eq!(report.applied, 0);
        assert!(b.get("/k").is_none());
    }

    #[test]
    fn test_out_of_order_entries_are_deferred() {
        let a = ReplicatedDb::open(store(), "test", None).unwrap();
        let b = ReplicatedDb::open(store(), "test", Some(a.key())).unwrap();
        a.put("/x", b"1".to_vec()).unwrap();
        a.put("/x", b"2".to_vec()).unwrap();

        let mut entries = a.entries_after(&[]);
        let first = entries.remove(0);
        let report = b.ingest(entries).unwrap();
        assert_eq!(report.applied, 0);
        assert_eq!(report.deferred, 1);
        assert_eq!(b.pending_len(), 1);

        let report = b.ingest(vec![first]).unwrap();
        assert_eq!(report.applied, 2);
        assert_eq!(b.get("/x").unwrap(), b"2");
        assert_eq!(b.version(), a.version());
    }

    #[test]
    fn test_reopen_restores_state() {
        let store = store();
        let (key, local, version) = {
            let db = ReplicatedDb::open(store.clone(), "persist", None).unwrap();
            db.put("/a", b"1".to_vec()).unwrap();
            db.authorize(&WriterKeypair::generate().public()).unwrap();
            (db.key(), db.local_key(), db.version())
        };

        assert!(ReplicatedDb::exists(store.as_ref(), "persist").unwrap());
        let db = ReplicatedDb::open(store.clone(), "persist", None).unwrap();
        assert_eq!(db.key(), key);
        assert_eq!(db.local_key(), local);
        assert_eq!(db.version(), version);
        assert_eq!(db.authorized().len(), 2);
        assert_eq!(db.get("/a").unwrap(), b"1");

        let wrong_root = WriterKeypair::generate().public();
        assert!(ReplicatedDb::open(store, "persist", Some(wrong_root)).is_err());
    }

    #[test]
    fn test_batch_is_one_notification() {
        let db = ReplicatedDb::open(store(), "test", None).unwrap();
        let mut rx = db.subscribe();
        db.batch(vec![
            Op::Put {
                path: "devices/a".to_string(),
                value: b"1".to_vec(),
            },
            Op::Put {
                path: "devices/b".to_string(),
                value: b"2".to_vec(),
            },
        ])
        .unwrap();

        let event = rx.try_recv().unwrap();
        assert_eq!(event.appended, 2);
        assert_eq!(event.paths, vec!["devices/a", "devices/b"]);
        assert!(event.touches("/devices/"));
        assert!(!event.touches("/apps/"));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_watch_filters_by_prefix() {
        let db = ReplicatedDb::open(store(), "test", None).unwrap();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let handle = db.watch("/devices/", move |event| {
            let _ = tx.send(event.paths.clone());
        });

        db.put("/apps/x", b"1".to_vec()).unwrap();
        db.put("/devices/a", b"1".to_vec()).unwrap();

        let paths = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(paths, vec!["devices/a"]);
        assert!(rx.try_recv().is_err());
        handle.abort();
    }

    #[tokio::test]
    async fn test_wait_for_times_out() {
        let db = ReplicatedDb::open(store(), "test", None).unwrap();
        let result = db
            .wait_for(Duration::from_millis(50), |db| db.get("/never").is_some())
            .await;
        assert!(matches!(result, Err(MasqError::HandshakeTimeout(_))));

        db.put("/now", b"1".to_vec()).unwrap();
        db.wait_for(Duration::from_millis(50), |db| db.get("/now").is_some())
            .await
            .unwrap();
    }

    #[test]
    fn test_writer_proof_is_bound_to_database() {
        let a = ReplicatedDb::open(store(), "a", None).unwrap();
        let b = ReplicatedDb::open(store(), "b", None).unwrap();
        let proof = a.prove_writer(b"pull-ack");

        verify_writer_proof(&a.key(), &a.local_key(), b"pull-ack", &proof).unwrap();
        assert!(verify_writer_proof(&b.key(), &a.local_key(), b"pull-ack", &proof).is_err());
        assert!(verify_writer_proof(&a.key(), &a.local_key(), b"grant", &proof).is_err());
        assert!(verify_writer_proof(&a.key(), &b.local_key(), b"pull-ack", &proof).is_err());
    }
}
