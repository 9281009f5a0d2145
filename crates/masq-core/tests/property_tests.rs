//! Property-based tests for the replicated database
//!
//! Uses proptest to verify that replicas converge no matter how entries
//! are interleaved or delivered.

use std::sync::Arc;

use masq_core::crypto::SecretBox;
use masq_core::{Entry, MemoryStore, ReplicatedDb};
use proptest::prelude::*;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

// ============================================================================
// Strategy Generators
// ============================================================================

/// One write: (writer index, key index, value, sync everyone afterwards)
type Step = (usize, u8, u8, bool);

fn writes_strategy(max_ops: usize) -> impl Strategy<Value = Vec<Step>> {
    prop::collection::vec((0..3usize, 0..4u8, any::<u8>(), prop::bool::weighted(0.3)), 1..max_ops)
}

// ============================================================================
// Helpers
// ============================================================================

fn open(name: &str, root: Option<masq_core::WriterId>) -> ReplicatedDb {
    ReplicatedDb::open(Arc::new(MemoryStore::new()), name, root).unwrap()
}

/// Exchange everything between every pair of replicas.
fn sync_all(dbs: &[ReplicatedDb]) {
    for _ in 0..2 {
        for from in dbs {
            for to in dbs {
                to.ingest(from.entries_after(&to.heads())).unwrap();
            }
        }
    }
}

/// Three writers of one database after running `writes`.
fn run(writes: &[Step]) -> Vec<ReplicatedDb> {
    let a = open("prop", None);
    let b = open("prop", Some(a.key()));
    let c = open("prop", Some(a.key()));
    a.authorize(&b.local_key()).unwrap();
    a.authorize(&c.local_key()).unwrap();
    let dbs = vec![a, b, c];
    sync_all(&dbs);

    for (writer, key, value, sync) in writes {
        dbs[*writer].put(&format!("k/{}", key), vec![*value]).unwrap();
        if *sync {
            sync_all(&dbs);
        }
    }
    sync_all(&dbs);
    dbs
}

fn shuffled(dbs: &[ReplicatedDb], seed: u64) -> Vec<Entry> {
    let mut entries = dbs[0].entries_after(&[]);
    entries.shuffle(&mut StdRng::seed_from_u64(seed));
    entries
}

// ============================================================================
// Property Tests
// ============================================================================

proptest! {
    /// Replicas that exchanged everything agree on version and values
    #[test]
    fn replicas_converge(writes in writes_strategy(40)) {
        let dbs = run(&writes);
        for db in &dbs[1..] {
            prop_assert_eq!(db.version(), dbs[0].version());
            for key in 0..4u8 {
                let path = format!("k/{}", key);
                prop_assert_eq!(db.get(&path), dbs[0].get(&path));
            }
        }
    }

    /// Delivery order does not change the outcome
    #[test]
    fn ingest_order_is_irrelevant(writes in writes_strategy(30), seed in any::<u64>()) {
        let dbs = run(&writes);
        let fresh = open("prop", Some(dbs[0].key()));
        for entry in shuffled(&dbs, seed) {
            fresh.ingest(vec![entry]).unwrap();
        }

        prop_assert_eq!(fresh.pending_len(), 0);
        prop_assert_eq!(fresh.version(), dbs[0].version());
        for key in 0..4u8 {
            let path = format!("k/{}", key);
            prop_assert_eq!(fresh.get(&path), dbs[0].get(&path));
        }
    }

    /// The authorized set never shrinks while entries arrive
    #[test]
    fn authorization_only_grows(writes in writes_strategy(20), seed in any::<u64>()) {
        let dbs = run(&writes);
        let fresh = open("prop", Some(dbs[0].key()));
        let mut seen = fresh.authorized();
        for entry in shuffled(&dbs, seed) {
            fresh.ingest(vec![entry]).unwrap();
            let now = fresh.authorized();
            prop_assert!(seen.iter().all(|w| now.contains(w)));
            seen = now;
        }
        prop_assert_eq!(seen.len(), 3);
    }

    /// Sealed payloads only open with the key that sealed them
    #[test]
    fn sealed_payload_needs_its_key(payload in prop::collection::vec(any::<u8>(), 0..256)) {
        let key = SecretBox::generate_key();
        let other = SecretBox::generate_key();
        let sealed = SecretBox::new(&key).seal(&payload).unwrap();

        prop_assert!(SecretBox::new(&other).open(&sealed).is_err());
        prop_assert_eq!(SecretBox::new(&key).open(&sealed).unwrap(), payload);
    }
}
