//! Blocks: single-owner storage units
//!
//! A block owns exactly one [`Store`] and serializes mutations inside its
//! key range. Mutating commands for one record run under that record's
//! lock; commands for distinct records run concurrently. Data blocks
//! additionally own the transient id-allocation state: an `autoincrement`
//! counter seeded from the store at open, and a `reserved` set covering
//! the ids handed out during one insert batch.

use crate::flush::FlushScheduler;
use crate::locks::RecordLocks;
use parking_lot::Mutex;
use rustc_hash::FxHashSet;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use torus_core::{encode_id, Error, InsertZones, Oid, Result, Shard};
use torus_store::{ScanIter, ScanOpts, Store};

/// Role of a block inside its sequence
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockRole {
    /// Primary data records
    Data,
    /// Derived records (index or aggregation)
    Derived,
}

/// Id assignment policy for inserts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InsertMode {
    /// Monotonically growing ids
    #[default]
    Incremental,
    /// First free id, scanning from the bottom of the insert zones;
    /// memory-resident stores only
    Compact,
}

/// Fail a command whose request deadline has already expired.
///
/// Only commands that have not started are dropped; an in-flight command
/// runs to completion.
pub fn check_deadline(deadline: Option<Instant>) -> Result<()> {
    match deadline {
        Some(d) if Instant::now() >= d => {
            Err(Error::Timeout("request deadline expired".into()))
        }
        _ => Ok(()),
    }
}

/// Single-owner unit of storage and concurrency
pub struct Block {
    name: String,
    role: BlockRole,
    store: Arc<dyn Store>,
    locks: RecordLocks,
    autoincrement: AtomicU64,
    reserved: Mutex<FxHashSet<Oid>>,
    shard: Option<Shard>,
    flush: FlushScheduler,
}

impl Block {
    /// Create a block over `store`. `shard` further restricts the ids this
    /// block accepts in the sharded zone; `flush_delay` configures
    /// deferred-flush coalescing.
    pub fn new(
        name: impl Into<String>,
        role: BlockRole,
        store: Arc<dyn Store>,
        shard: Option<Shard>,
        flush_delay: Duration,
    ) -> Self {
        Block {
            name: name.into(),
            role,
            store,
            locks: RecordLocks::new(),
            autoincrement: AtomicU64::new(0),
            reserved: Mutex::new(FxHashSet::default()),
            shard: shard.map(|s| Shard::new(s.offset, s.base)),
            flush: FlushScheduler::new(flush_delay),
        }
    }

    /// Block name, used in select annotations
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Role of this block
    pub fn role(&self) -> BlockRole {
        self.role
    }

    /// Open the underlying store and seed the autoincrement counter
    pub fn open(&self) -> Result<()> {
        let max_id = self.store.open()?;
        self.autoincrement.store(max_id, Ordering::SeqCst);
        Ok(())
    }

    /// Current autoincrement watermark
    pub fn autoincrement(&self) -> Oid {
        self.autoincrement.load(Ordering::SeqCst)
    }

    /// Point lookup by id (no row lock; select stays reentrant)
    pub fn get(&self, id: Oid) -> Result<Option<String>> {
        self.store.get(&encode_id(id))
    }

    /// Point lookup by raw key
    pub fn get_raw(&self, key: &[u8]) -> Result<Option<String>> {
        self.store.get(key)
    }

    /// Persist a record and schedule a deferred flush
    pub fn save(&self, id: Oid, value: &str) -> Result<()> {
        self.store.put(&encode_id(id), value)?;
        self.flush.request(&self.store);
        Ok(())
    }

    /// Remove a record; true iff it existed
    pub fn remove(&self, id: Oid) -> Result<bool> {
        let removed = self.store.del(&encode_id(id))?;
        if removed {
            self.flush.request(&self.store);
        }
        Ok(removed)
    }

    /// Write a derived record by raw key
    pub fn put_raw(&self, key: &[u8], value: &str) -> Result<()> {
        self.store.put(key, value)?;
        self.flush.request(&self.store);
        Ok(())
    }

    /// Remove a derived record by raw key
    pub fn del_raw(&self, key: &[u8]) -> Result<bool> {
        let removed = self.store.del(key)?;
        self.flush.request(&self.store);
        Ok(removed)
    }

    /// Bounded ordered stream from the underlying store
    pub fn scan(&self, opts: &ScanOpts) -> Result<ScanIter> {
        self.store.scan(opts)
    }

    /// Wipe the store and reset the allocation state
    pub fn erase(&self) -> Result<()> {
        self.store.erase()?;
        self.autoincrement.store(0, Ordering::SeqCst);
        self.reserved.lock().clear();
        self.flush.request(&self.store);
        Ok(())
    }

    /// Flush, deferred (coalescing) or immediate
    pub fn flush(&self, with_delay: bool) -> Result<()> {
        if with_delay {
            self.flush.request(&self.store);
            Ok(())
        } else {
            self.flush.flush_now(&self.store)
        }
    }

    /// Run `f` under the lock of `id`
    pub fn with_lock<R>(&self, id: Oid, f: impl FnOnce() -> R) -> R {
        self.locks.with_lock(id, f)
    }

    /// Number of records currently lock-tracked (test observability)
    pub fn active_locks(&self) -> usize {
        self.locks.len()
    }

    // === id allocation =====================================================

    /// Assign an id for one insert, per the requested policy.
    ///
    /// Explicit ids are checked for duplicates (a present id is a
    /// consistency error) and, unless `admin`, for zone validity. Assigned
    /// ids are reserved until [`Block::release_reserved`].
    pub fn allocate_id(
        &self,
        zones: &InsertZones,
        mode: InsertMode,
        explicit: Option<Oid>,
        admin: bool,
    ) -> Result<Oid> {
        let id = match explicit {
            Some(id) => self.claim_explicit(zones, id, admin)?,
            None => match mode {
                InsertMode::Incremental => self.alloc_incremental(zones),
                InsertMode::Compact => self.alloc_compact(zones)?,
            },
        };
        self.reserved.lock().insert(id);
        Ok(id)
    }

    /// Drop the batch reservation set (end of one insert batch)
    pub fn release_reserved(&self) {
        self.reserved.lock().clear();
    }

    /// Whether this block's own shard accepts `id`
    fn block_shard_matches(&self, id: Oid) -> bool {
        self.shard.map_or(true, |s| s.matches(id))
    }

    fn claim_explicit(&self, zones: &InsertZones, id: Oid, admin: bool) -> Result<Oid> {
        if self.get(id)?.is_some() {
            return Err(Error::DataConsistency(format!(
                "insert [{}]: id already present in block {}",
                id, self.name
            )));
        }
        if !admin && !(zones.valid_insert_id(id) && self.block_shard_matches(id)) {
            return Err(Error::DataAccess(format!(
                "insert [{}]: id outside the valid insert set",
                id
            )));
        }
        self.autoincrement.fetch_max(id, Ordering::SeqCst);
        Ok(id)
    }

    fn alloc_incremental(&self, zones: &InsertZones) -> Oid {
        let auto = self.autoincrement.load(Ordering::SeqCst) + 1;
        if let Some(a) = zones.exclusive_min {
            let id = auto.max(a.max(1));
            if id < zones.exclusive_end() {
                self.autoincrement.fetch_max(id, Ordering::SeqCst);
                return id;
            }
        }
        let id = self.fix_upwards(auto.max(zones.sharded_min).max(1), zones);
        self.autoincrement.fetch_max(id, Ordering::SeqCst);
        id
    }

    /// Move `id` upward to the first value satisfying the combined
    /// ring-shard and block-shard predicate
    fn fix_upwards(&self, mut id: Oid, zones: &InsertZones) -> Oid {
        let ring_shard = zones.effective_shard();
        loop {
            id = ring_shard.next_at_or_after(id);
            if self.block_shard_matches(id) {
                return id;
            }
            id += 1;
        }
    }

    /// First free id scanning from the bottom of the insert zones.
    ///
    /// O(n) in the number of records; compact mode is restricted to small
    /// memory-resident rings.
    fn alloc_compact(&self, zones: &InsertZones) -> Result<Oid> {
        if !self.store.supports_compact() {
            return Err(Error::NotImplemented(
                "compact insert requires a memory-resident store",
            ));
        }
        let auto = self.autoincrement.load(Ordering::SeqCst);
        {
            let reserved = self.reserved.lock();
            if reserved.contains(&auto) {
                // Every slot below the watermark was used during this batch
                drop(reserved);
                return Ok(self.alloc_incremental(zones));
            }
            let mut id = zones.exclusive_min.unwrap_or(zones.sharded_min).max(1);
            while id <= auto {
                if zones.exclusive_min.is_some()
                    && id >= zones.exclusive_end()
                    && id < zones.sharded_min
                {
                    // Never allocate inside the forbidden zone
                    id = zones.sharded_min;
                    continue;
                }
                if zones.valid_insert_id(id)
                    && self.block_shard_matches(id)
                    && !reserved.contains(&id)
                    && self.get(id)?.is_none()
                {
                    return Ok(id);
                }
                id += 1;
            }
        }
        Ok(self.alloc_incremental(zones))
    }
}

impl std::fmt::Debug for Block {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Block")
            .field("name", &self.name)
            .field("role", &self.role)
            .field("autoincrement", &self.autoincrement())
            .finish()
    }
}
