//! Per-record lock table
//!
//! Each data block owns one `RecordLocks` map keyed by object id. `update`,
//! `upsave` and `delete` for a given id run under its lock; `select` and
//! `insert` do not (select stays reentrant during nested reads, insert
//! targets a fresh id nobody else can address). Entries are pruned as soon
//! as their hold count drops to zero, so the table never outgrows the set
//! of ids under active mutation.

use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use torus_core::Oid;

#[derive(Default)]
struct LockEntry {
    mutex: Mutex<()>,
    holders: AtomicUsize,
}

/// Sharded map of per-id mutexes with zero-count pruning
#[derive(Default)]
pub struct RecordLocks {
    map: DashMap<Oid, Arc<LockEntry>>,
}

impl RecordLocks {
    /// Empty lock table
    pub fn new() -> Self {
        RecordLocks::default()
    }

    /// Run `f` while holding the lock of `id`.
    ///
    /// Commands for distinct ids run concurrently; commands for the same
    /// id serialize in arrival order.
    pub fn with_lock<R>(&self, id: Oid, f: impl FnOnce() -> R) -> R {
        // The hold count is bumped under the map shard lock, so pruning
        // cannot race a clone of the entry.
        let entry = {
            let e = self
                .map
                .entry(id)
                .or_insert_with(|| Arc::new(LockEntry::default()));
            e.value().holders.fetch_add(1, Ordering::SeqCst);
            e.value().clone()
        };

        let result = {
            let _guard = entry.mutex.lock();
            f()
        };

        if entry.holders.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.map
                .remove_if(&id, |_, e| e.holders.load(Ordering::SeqCst) == 0);
        }
        result
    }

    /// Number of ids currently holding a lock entry
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Whether no lock entries exist
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

impl std::fmt::Debug for RecordLocks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordLocks")
            .field("active", &self.map.len())
            .finish()
    }
}
