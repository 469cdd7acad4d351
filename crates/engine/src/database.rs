//! Database: the top of the ring stack
//!
//! The database owns the topmost ring and exposes the public surface:
//! `select` / `insert` / `update` / `delete` / `scan`, plus the
//! administrative actions (`admin_reinsert`, `rebuild_indexes`,
//! `create_index`). Reads resolve top-down through the stack; writes land
//! in the nearest writable ring. Cascade deletions triggered by a
//! committed change re-enter the database through the normal delete path,
//! drained iteratively from a work queue so a transitive delete can never
//! deadlock on a row lock higher up the call chain.

use crate::block::{check_deadline, InsertMode};
use crate::config::DatabaseConfig;
use crate::operator::{IndexOperator, KeyField, Operator};
use crate::registry::Registry;
use crate::ring::{InsertDraft, Ring, SchemaCatalog, UpdateOutcome};
use crate::sequence::Sequence;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use torus_core::{Edit, Error, Oid, Result, Value, WebObject, META_KEY};
use torus_store::{MemoryStore, ScanIter, ScanOpts};
use tracing::{error, info, warn};

/// Options of a `select`
#[derive(Debug, Clone, Default)]
pub struct SelectOptions {
    /// Start the descent at this ring instead of the top
    pub ring: Option<String>,
    /// Drop the command if it has not started by this instant
    pub deadline: Option<Instant>,
}

/// Options of an `insert`
#[derive(Debug, Clone, Default)]
pub struct InsertOptions {
    /// Target ring (must be writable); defaults to the topmost writable
    pub ring: Option<String>,
    /// Explicit id (single-entry batches only)
    pub id: Option<Oid>,
    /// Id allocation policy override
    pub mode: Option<InsertMode>,
    /// Administrative path: bypass zone validity for explicit ids
    pub admin: bool,
    /// Drop the command if it has not started by this instant
    pub deadline: Option<Instant>,
}

/// Options of an `update`
#[derive(Debug, Clone, Default)]
pub struct UpdateOptions {
    /// Start the descent at this ring instead of the top
    pub ring: Option<String>,
    /// Drop the command if it has not started by this instant
    pub deadline: Option<Instant>,
}

/// Options of a `delete`
#[derive(Debug, Clone, Default)]
pub struct DeleteOptions {
    /// Start the descent at this ring instead of the top
    pub ring: Option<String>,
    /// Drop the command if it has not started by this instant
    pub deadline: Option<Instant>,
}

/// Options of a cross-ring `scan`
#[derive(Debug, Clone, Default)]
pub struct ScanOptions {
    /// Inclusive lower bound (encoded key prefix)
    pub start: Option<Vec<u8>>,
    /// Exclusive upper bound (encoded key prefix)
    pub stop: Option<Vec<u8>>,
    /// Records to skip after the merge
    pub offset: usize,
    /// Maximum records to yield
    pub limit: Option<usize>,
    /// Descending byte order
    pub reverse: bool,
    /// Drop the command if it has not started by this instant
    pub deadline: Option<Instant>,
}

/// Top of the ring stack
pub struct Database {
    /// All rings, topmost first
    rings_top_down: Vec<Arc<Ring>>,
    catalog: SchemaCatalog,
    registry: Registry,
}

impl Database {
    /// Open a database from its configuration with an empty schema catalog
    pub fn open(config: DatabaseConfig) -> Result<Self> {
        Self::open_with_catalog(config, SchemaCatalog::default())
    }

    /// Open a database from its configuration
    pub fn open_with_catalog(config: DatabaseConfig, catalog: SchemaCatalog) -> Result<Self> {
        let top = config.build_stack()?;
        let mut registry = Registry::new(
            Duration::from_secs(config.registry_ttl_secs),
            Duration::from_secs(config.registry_purge_interval_secs),
        );
        if let Some(root) = config.root_id {
            registry = registry.with_root(root);
        }
        Self::from_top_ring(top, catalog, registry)
    }

    /// Open a database over an already-built ring stack.
    ///
    /// Opens every ring bottom-up and validates the insert zones of each
    /// ring against every ring below it; a violation is fatal.
    pub fn from_top_ring(
        top: Arc<Ring>,
        catalog: SchemaCatalog,
        registry: Registry,
    ) -> Result<Self> {
        let stack = top.stack(); // bottom first
        for (i, ring) in stack.iter().enumerate() {
            ring.open()?;
            for lower in &stack[..i] {
                ring.validate_against_lower(lower)?;
            }
        }
        let mut rings_top_down = stack;
        rings_top_down.reverse();
        info!(rings = rings_top_down.len(), "database opened");
        let db = Database {
            rings_top_down,
            catalog,
            registry,
        };
        if let Some(root) = db.registry.root() {
            if let Ok(object) = db.load_object(root) {
                let _ = db.registry.set(object);
                db.registry.pin(root);
            }
        }
        Ok(db)
    }

    /// The object registry
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// The schema catalog
    pub fn catalog(&self) -> &SchemaCatalog {
        &self.catalog
    }

    /// Rings, topmost first
    pub fn rings(&self) -> &[Arc<Ring>] {
        &self.rings_top_down
    }

    fn ring_position(&self, name: &str) -> Result<usize> {
        self.rings_top_down
            .iter()
            .position(|r| r.name() == name)
            .ok_or_else(|| Error::DataAccess(format!("unknown ring {}", name)))
    }

    fn descent_start(&self, ring: &Option<String>) -> Result<usize> {
        match ring {
            Some(name) => self.ring_position(name),
            None => Ok(0),
        }
    }

    fn writable_ring(&self, name: &Option<String>) -> Result<&Arc<Ring>> {
        match name {
            Some(name) => {
                let ring = &self.rings_top_down[self.ring_position(name)?];
                if ring.readonly() {
                    return Err(Error::DataAccess(format!("ring {} is read-only", name)));
                }
                Ok(ring)
            }
            None => self
                .rings_top_down
                .iter()
                .find(|r| !r.readonly())
                .ok_or_else(|| Error::DataAccess("no writable ring in the stack".into())),
        }
    }

    // === public surface ====================================================

    /// Read one object, annotated with the ring and block it came from
    pub fn select(&self, id: Oid, opts: &SelectOptions) -> Result<serde_json::Value> {
        check_deadline(opts.deadline)?;
        let start = self.descent_start(&opts.ring)?;
        for ring in &self.rings_top_down[start..] {
            if let Some(record) = ring.get_local(id)? {
                let mut json: serde_json::Value = serde_json::from_str(&record)?;
                if let Some(obj) = json.as_object_mut() {
                    obj.insert(
                        META_KEY.to_string(),
                        serde_json::json!({
                            "ring": ring.name(),
                            "block": ring.route(id).name(),
                        }),
                    );
                }
                if let Ok(object) = WebObject::from_record_str(id, &record) {
                    let _ = self.registry.set(Arc::new(object));
                }
                return Ok(json);
            }
        }
        Err(Error::ObjectNotFound(id))
    }

    /// Deserialized object, served from the registry when cached
    pub fn get_object(&self, id: Oid) -> Result<Arc<WebObject>> {
        if let Some(object) = self.registry.get(id) {
            return Ok(object);
        }
        let object = self.load_object(id)?;
        let _ = self.registry.set(object.clone());
        Ok(object)
    }

    fn load_object(&self, id: Oid) -> Result<Arc<WebObject>> {
        for ring in &self.rings_top_down {
            if let Some(record) = ring.get_local(id)? {
                return Ok(Arc::new(WebObject::from_record_str(id, &record)?));
            }
        }
        Err(Error::ObjectNotFound(id))
    }

    /// Insert one object; returns its assigned id
    pub fn insert(
        &self,
        data: BTreeMap<String, Value>,
        opts: InsertOptions,
    ) -> Result<Oid> {
        let ids = self.insert_batch(vec![InsertDraft::new(data)], opts)?;
        Ok(ids[0])
    }

    /// Insert a batch of drafts; returns the assigned ids, in order
    pub fn insert_batch(
        &self,
        drafts: Vec<InsertDraft>,
        opts: InsertOptions,
    ) -> Result<Vec<Oid>> {
        check_deadline(opts.deadline)?;
        let ring = self.writable_ring(&opts.ring)?;
        ring.insert_batch(drafts, opts.id, opts.mode, opts.admin, &self.catalog)
            .map_err(Error::into_access)
    }

    /// Apply an edit list to one object.
    ///
    /// The stack is searched top-down for the authoritative copy; a
    /// read-only ring computes the new record and hands it to the nearest
    /// writable ring above via `upsave`.
    pub fn update(&self, id: Oid, edits: &[Edit], opts: &UpdateOptions) -> Result<()> {
        check_deadline(opts.deadline)?;
        self.update_inner(id, edits, opts)
            .map_err(Error::into_access)
    }

    fn update_inner(&self, id: Oid, edits: &[Edit], opts: &UpdateOptions) -> Result<()> {
        let start = self.descent_start(&opts.ring)?;
        for (i, ring) in self.rings_top_down.iter().enumerate().skip(start) {
            match ring.apply_update(id, edits, &self.catalog)? {
                UpdateOutcome::Absent => continue,
                UpdateOutcome::Saved { cascade } => {
                    self.registry.invalidate(id);
                    self.run_cascade(cascade);
                    return Ok(());
                }
                UpdateOutcome::ForwardUp { record } => {
                    let writable = self.rings_top_down[..i]
                        .iter()
                        .rev()
                        .find(|r| !r.readonly())
                        .ok_or_else(|| {
                            Error::DataAccess(format!(
                                "update [{}]: no writable ring above {}",
                                id,
                                ring.name()
                            ))
                        })?;
                    writable.upsave(id, &record, &self.catalog)?;
                    self.registry.invalidate(id);
                    // The old version in the read-only ring still holds its
                    // strong references; nothing is dropped, no cascade
                    return Ok(());
                }
            }
        }
        Err(Error::ObjectNotFound(id))
    }

    /// Delete one object; returns the number of records removed (0 or 1)
    pub fn delete(&self, id: Oid, opts: &DeleteOptions) -> Result<u64> {
        check_deadline(opts.deadline)?;
        let start = self.descent_start(&opts.ring)?;
        match self.delete_one(id, start)? {
            None => Ok(0),
            Some(cascade) => {
                self.registry.invalidate(id);
                self.run_cascade(cascade);
                Ok(1)
            }
        }
    }

    fn delete_one(&self, id: Oid, start: usize) -> Result<Option<Vec<Oid>>> {
        for ring in &self.rings_top_down[start..] {
            if let Some(cascade) = ring.delete_local(id, &self.catalog)? {
                return Ok(Some(cascade));
            }
        }
        Ok(None)
    }

    /// Drain cascade targets through the normal delete path.
    ///
    /// Runs outside every row lock. Failures are logged and surfaced in
    /// the log only; the parent write stays committed.
    fn run_cascade(&self, targets: Vec<Oid>) {
        let mut queue: VecDeque<Oid> = targets.into();
        while let Some(id) = queue.pop_front() {
            match self.delete_one(id, 0) {
                Ok(Some(more)) => {
                    self.registry.invalidate(id);
                    queue.extend(more);
                }
                Ok(None) => {
                    warn!(id, "cascade target already absent");
                }
                Err(e) => {
                    error!(id, error = %e, "cascade delete failed");
                }
            }
        }
    }

    /// Merge-scan a named sequence across every ring.
    ///
    /// Streams are merged by binary key (descending when `reverse`);
    /// identical keys deduplicate with the top ring winning.
    pub fn scan(&self, name: &str, opts: &ScanOptions) -> Result<ScanIter> {
        check_deadline(opts.deadline)?;
        let store_opts = ScanOpts {
            start: opts.start.clone(),
            stop: opts.stop.clone(),
            limit: None, // applied after the merge
            reverse: opts.reverse,
        };
        let mut streams = Vec::new();
        for ring in &self.rings_top_down {
            if let Some(stream) = ring.scan_sequence(name, &store_opts)? {
                streams.push(stream.peekable());
            }
        }
        if streams.is_empty() {
            return Err(Error::DataAccess(format!("unknown sequence {}", name)));
        }
        let merged = MergeScan {
            streams,
            reverse: opts.reverse,
        };
        let skipped: ScanIter = Box::new(merged.skip(opts.offset));
        Ok(match opts.limit {
            Some(limit) => Box::new(skipped.take(limit)),
            None => skipped,
        })
    }

    // === administrative actions ============================================

    /// Delete and re-insert objects, assigning fresh ids in the target
    /// ring.
    ///
    /// `new_id` is honored for a single-id call only; `compact` selects
    /// the compact allocation policy. References held by other objects
    /// are not rewritten.
    pub fn admin_reinsert(
        &self,
        ids: &[Oid],
        target_ring: Option<&str>,
        new_id: Option<Oid>,
        compact: bool,
    ) -> Result<Vec<Oid>> {
        if new_id.is_some() && ids.len() != 1 {
            return Err(Error::DataAccess(
                "an explicit id requires a single-id reinsert".into(),
            ));
        }
        let ring_name = target_ring.map(|s| s.to_string());
        let ring = self.writable_ring(&ring_name)?;
        let mode = compact.then_some(InsertMode::Compact);

        let mut assigned = Vec::with_capacity(ids.len());
        for &id in ids {
            let object = self.load_object(id)?;
            // The object comes right back with its references intact, so
            // the cascade set of this delete is discarded
            if self.delete_one(id, 0)?.is_none() {
                return Err(Error::ObjectNotFound(id));
            }
            self.registry.invalidate(id);
            let draft = InsertDraft {
                data: object.data.clone(),
                category: object.category,
                setup: None,
            };
            let new_ids =
                ring.insert_batch(vec![draft], new_id, mode, true, &self.catalog)?;
            info!(old = id, new = new_ids[0], ring = ring.name(), "object reinserted");
            assigned.push(new_ids[0]);
        }
        Ok(assigned)
    }

    /// Erase and replay every derived sequence from its ring's data.
    ///
    /// Idempotent and restartable: a rebuild that dies halfway is
    /// repaired by running it again.
    pub fn rebuild_indexes(&self) -> Result<()> {
        for ring in &self.rings_top_down {
            let derived = ring.derived();
            if derived.is_empty() {
                continue;
            }
            for seq in &derived {
                seq.erase()?;
            }
            let stream = ring.data().scan(&ScanOpts::all())?;
            for item in stream {
                let (key, value) = item?;
                for seq in &derived {
                    seq.capture_change(&key, None, Some(&value));
                }
            }
            for seq in &derived {
                seq.flush(false)?;
            }
            info!(ring = ring.name(), sequences = derived.len(), "indexes rebuilt");
        }
        Ok(())
    }

    /// Create a memory-backed index on a ring and backfill it from the
    /// ring's existing data
    pub fn create_index(
        &self,
        name: &str,
        key: Vec<KeyField>,
        payload: Vec<String>,
        target_ring: Option<&str>,
    ) -> Result<()> {
        let ring_name = target_ring.map(|s| s.to_string());
        let ring = self.writable_ring(&ring_name)?;
        if ring.derived_by_name(name).is_some() {
            return Err(Error::DataConsistency(format!(
                "ring {} already has a sequence named {}",
                ring.name(),
                name
            )));
        }
        let block = Arc::new(crate::block::Block::new(
            format!("{}.{}.0", ring.name(), name),
            crate::block::BlockRole::Derived,
            Arc::new(MemoryStore::new()),
            None,
            Duration::ZERO,
        ));
        let operator = Operator::Index(IndexOperator::new(key, payload));
        let sequence = Sequence::new(name.to_string(), operator, block);
        sequence.open()?;

        // Register first, then replay existing records through the
        // registered sequence
        ring.add_derived(sequence);
        let registered = ring
            .derived_by_name(name)
            .expect("sequence registered above");
        let stream = ring.data().scan(&ScanOpts::all())?;
        for item in stream {
            let (src_key, value) = item?;
            registered.capture_change(&src_key, None, Some(&value));
        }
        info!(ring = ring.name(), index = name, "index created");
        Ok(())
    }

    /// Flush every ring immediately
    pub fn flush(&self) -> Result<()> {
        for ring in &self.rings_top_down {
            ring.flush(false)?;
        }
        Ok(())
    }

    /// Sweep expired registry entries, reloading the root object
    pub fn purge_registry(&self) -> usize {
        self.registry.purge(|id| self.load_object(id).ok())
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("rings", &self.rings_top_down.len())
            .finish()
    }
}

/// K-way merge over per-ring scan streams with top-ring-wins dedupe
struct MergeScan {
    /// Peekable per-ring streams, topmost ring first
    streams: Vec<std::iter::Peekable<ScanIter>>,
    reverse: bool,
}

impl Iterator for MergeScan {
    type Item = Result<(Vec<u8>, String)>;

    fn next(&mut self) -> Option<Self::Item> {
        // Surface stream errors as they appear
        for stream in &mut self.streams {
            if matches!(stream.peek(), Some(Err(_))) {
                return stream.next();
            }
        }
        // Pick the best key; ties keep the earliest (topmost) stream
        let mut best_idx = None;
        let mut best_key: Option<Vec<u8>> = None;
        for (i, stream) in self.streams.iter_mut().enumerate() {
            if let Some(Ok((key, _))) = stream.peek() {
                let better = match &best_key {
                    None => true,
                    Some(best) => {
                        if self.reverse {
                            key > best
                        } else {
                            key < best
                        }
                    }
                };
                if better {
                    best_key = Some(key.clone());
                    best_idx = Some(i);
                }
            }
        }
        let best_idx = best_idx?;
        let best_key = best_key.expect("key set with index");
        let item = self.streams[best_idx].next();
        // Deduplicate: drop the same key from every other stream
        for (i, stream) in self.streams.iter_mut().enumerate() {
            if i == best_idx {
                continue;
            }
            while matches!(stream.peek(), Some(Ok((key, _))) if key == &best_key) {
                stream.next();
            }
        }
        item
    }
}
