//! Rings: one layer of the stacked database
//!
//! A ring owns one primary data sequence plus any number of derived
//! sequences, and links to an optional base ring below it. Reads resolve
//! top-down through the stack; writes land in the nearest writable ring
//! (a read-only ring forwards updated records *up* via `upsave`). Every
//! committed data change is propagated to the ring's own derived
//! sequences; writes never cross rings.
//!
//! Each data ring declares insert zones over the id space and an optional
//! shard predicate; zone ordering and cross-ring overlap are validated
//! when the stack opens, and a violation is fatal.

use crate::block::{Block, InsertMode};
use crate::cascade::cascade_targets;
use crate::sequence::Sequence;
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use torus_core::{
    encode_id, Edit, Error, InsertZones, KeyCodec, Oid, Result, Schema, Value, WebObject,
};
use torus_store::{ScanIter, ScanOpts};
use tracing::{debug, info, warn};

/// Category-to-schema mapping consumed from the object system.
///
/// The storage core reads schemas for validation, operator field
/// extraction and strong-reference discovery; unknown categories fall
/// back to the default schema.
#[derive(Debug, Clone, Default)]
pub struct SchemaCatalog {
    /// Schema applied when the category is unknown or unset
    pub default: Schema,
    /// Per-category schemas
    pub by_category: FxHashMap<Oid, Schema>,
}

impl SchemaCatalog {
    /// Catalog with only a default schema
    pub fn new(default: Schema) -> Self {
        SchemaCatalog {
            default,
            by_category: FxHashMap::default(),
        }
    }

    /// Register the schema of one category
    pub fn with_category(mut self, category: Oid, schema: Schema) -> Self {
        self.by_category.insert(category, schema);
        self
    }

    /// Schema governing an object of `category`
    pub fn schema_for(&self, category: Option<Oid>) -> &Schema {
        category
            .and_then(|c| self.by_category.get(&c))
            .unwrap_or(&self.default)
    }
}

/// One entry of an insert batch
pub struct InsertDraft {
    /// Object data; may hold provisional references into the batch
    pub data: std::collections::BTreeMap<String, Value>,
    /// Category of the object
    pub category: Option<Oid>,
    /// Setup side-effects, run after rectification; may spawn newborn
    /// objects through the transaction
    pub setup: Option<SetupFn>,
}

/// Setup callback of one draft
pub type SetupFn = Box<dyn FnOnce(&mut WebObject, &mut InsertTx<'_>) -> Result<()> + Send>;

impl InsertDraft {
    /// Draft carrying plain data
    pub fn new(data: std::collections::BTreeMap<String, Value>) -> Self {
        InsertDraft {
            data,
            category: None,
            setup: None,
        }
    }

    /// Draft in a category
    pub fn in_category(mut self, category: Oid) -> Self {
        self.category = Some(category);
        self
    }

    /// Attach a setup callback
    pub fn with_setup(mut self, setup: SetupFn) -> Self {
        self.setup = Some(setup);
        self
    }
}

impl std::fmt::Debug for InsertDraft {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InsertDraft")
            .field("category", &self.category)
            .field("fields", &self.data.len())
            .field("setup", &self.setup.is_some())
            .finish()
    }
}

/// Insert-mode context handed to setup callbacks.
///
/// Newborn objects spawned here receive an id from the same allocation
/// policy as the batch and join the pending queue, which drains to
/// fixpoint before anything commits.
pub struct InsertTx<'a> {
    block: &'a Block,
    zones: &'a InsertZones,
    mode: InsertMode,
    spawned: Vec<(Oid, InsertDraft)>,
}

impl InsertTx<'_> {
    /// Queue a newborn object; returns its assigned id immediately so the
    /// caller can reference it
    pub fn spawn(&mut self, draft: InsertDraft) -> Result<Oid> {
        let id = self.block.allocate_id(self.zones, self.mode, None, false)?;
        self.spawned.push((id, draft));
        Ok(id)
    }
}

/// Outcome of applying an update inside one ring
#[derive(Debug)]
pub enum UpdateOutcome {
    /// The id is not present in this ring; descend to the base ring
    Absent,
    /// Saved locally; cascade targets still need deleting
    Saved {
        /// Ids scheduled for cascade deletion
        cascade: Vec<Oid>,
    },
    /// This ring is read-only; the fully computed record must be handed
    /// to the nearest writable ring above via `upsave`
    ForwardUp {
        /// Record JSON of the new version
        record: String,
    },
}

/// One layer of the stacked key/value database
pub struct Ring {
    name: String,
    readonly: bool,
    base: Option<Arc<Ring>>,
    data: Sequence,
    derived: RwLock<Vec<Arc<Sequence>>>,
    revisions: Option<Sequence>,
    zones: InsertZones,
    default_mode: InsertMode,
}

impl Ring {
    /// Create a ring over `data` with `base` below it
    pub fn new(
        name: impl Into<String>,
        readonly: bool,
        base: Option<Arc<Ring>>,
        data: Sequence,
        zones: InsertZones,
    ) -> Self {
        Ring {
            name: name.into(),
            readonly,
            base,
            data,
            derived: RwLock::new(Vec::new()),
            revisions: None,
            zones,
            default_mode: InsertMode::Incremental,
        }
    }

    /// Set the default insert policy
    pub fn with_insert_mode(mut self, mode: InsertMode) -> Self {
        self.default_mode = mode;
        self
    }

    /// Keep revision snapshots of every updated record, keyed `[id, ver]`
    pub fn with_revisions(mut self, revisions: Sequence) -> Self {
        self.revisions = Some(revisions);
        self
    }

    /// Register a derived sequence (also possible after open)
    pub fn add_derived(&self, sequence: Sequence) {
        self.derived.write().push(Arc::new(sequence));
    }

    /// Ring name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether this ring refuses local writes
    pub fn readonly(&self) -> bool {
        self.readonly
    }

    /// The ring below, if any
    pub fn base(&self) -> Option<&Arc<Ring>> {
        self.base.as_ref()
    }

    /// Insert zones of this ring
    pub fn zones(&self) -> &InsertZones {
        &self.zones
    }

    /// The primary data sequence
    pub fn data(&self) -> &Sequence {
        &self.data
    }

    /// The revisions sequence, when snapshots are enabled
    pub fn revisions(&self) -> Option<&Sequence> {
        self.revisions.as_ref()
    }

    /// Derived sequences, in registration order
    pub fn derived(&self) -> Vec<Arc<Sequence>> {
        self.derived.read().clone()
    }

    /// Derived sequence by name
    pub fn derived_by_name(&self, name: &str) -> Option<Arc<Sequence>> {
        self.derived
            .read()
            .iter()
            .find(|s| s.name() == name)
            .cloned()
    }

    /// The stack from the bottom ring up to (and including) this one
    pub fn stack(self: Arc<Self>) -> Vec<Arc<Ring>> {
        let mut stack = match &self.base {
            Some(base) => base.clone().stack(),
            None => Vec::new(),
        };
        stack.push(self);
        stack
    }

    /// Whether a fresh insert may be assigned `id` in this ring
    pub fn valid_insert_id(&self, id: Oid) -> bool {
        self.zones.valid_insert_id(id)
    }

    /// Open this ring's sequences and validate the zone declaration.
    ///
    /// Cross-ring overlap checks run once per stack, driven by the
    /// database over the full stack.
    pub fn open(&self) -> Result<()> {
        self.zones
            .check_ordering()
            .map_err(|msg| Error::DataAccess(format!("ring {}: {}", self.name, msg)))?;
        self.data.open()?;
        for seq in self.derived.read().iter() {
            seq.open()?;
        }
        if let Some(rev) = &self.revisions {
            rev.open()?;
        }
        info!(ring = %self.name, readonly = self.readonly, "ring opened");
        Ok(())
    }

    /// Insert-zone compatibility with one lower ring; fatal at open.
    pub fn validate_against_lower(&self, lower: &Ring) -> Result<()> {
        // Read-only rings never receive inserts, so their zones are inert
        if self.readonly || lower.readonly {
            return Ok(());
        }
        if self
            .zones
            .effective_shard()
            .overlaps(&lower.zones.effective_shard())
        {
            return Err(Error::DataAccess(format!(
                "rings {} and {}: sharded insert zones overlap",
                self.name, lower.name
            )));
        }
        if let Some(a) = self.zones.exclusive_min {
            let b = self.zones.exclusive_end();
            if lower.zones.exclusive_intersects(a, b) {
                return Err(Error::DataAccess(format!(
                    "ring {}: exclusive zone overlaps the exclusive zone of {}",
                    self.name, lower.name
                )));
            }
            if lower.zones.sharded_witness_below(a, b).is_some() {
                return Err(Error::DataAccess(format!(
                    "ring {}: exclusive zone overlaps the sharded zone of {}",
                    self.name, lower.name
                )));
            }
        }
        Ok(())
    }

    /// Block owning `id` in the data sequence
    pub fn route(&self, id: Oid) -> &Arc<Block> {
        self.data.find_block(&encode_id(id))
    }

    /// Local point lookup (no descent)
    pub fn get_local(&self, id: Oid) -> Result<Option<String>> {
        self.route(id).get(id)
    }

    // === commands ==========================================================

    /// Batch insert: allocate ids, rectify provisional references, drain
    /// setup side-effects to fixpoint, validate, seal, persist, propagate.
    ///
    /// Returns the ids of the top-level drafts, in order. A failed batch
    /// leaves no partial state.
    pub fn insert_batch(
        &self,
        drafts: Vec<InsertDraft>,
        explicit_id: Option<Oid>,
        mode: Option<InsertMode>,
        admin: bool,
        catalog: &SchemaCatalog,
    ) -> Result<Vec<Oid>> {
        if self.readonly {
            return Err(Error::DataAccess(format!(
                "ring {} is read-only",
                self.name
            )));
        }
        if explicit_id.is_some() && drafts.len() != 1 {
            return Err(Error::DataAccess(
                "an explicit id requires a single-entry batch".into(),
            ));
        }
        let block = self.data.insert_block();
        let mode = mode.unwrap_or(self.default_mode);
        let result = self.insert_batch_inner(drafts, explicit_id, mode, admin, catalog, block);
        block.release_reserved();
        result
    }

    fn insert_batch_inner(
        &self,
        drafts: Vec<InsertDraft>,
        explicit_id: Option<Oid>,
        mode: InsertMode,
        admin: bool,
        catalog: &SchemaCatalog,
        block: &Arc<Block>,
    ) -> Result<Vec<Oid>> {
        // Pre-assign final ids for the whole batch
        let mut batch_ids = Vec::with_capacity(drafts.len());
        for (i, _) in drafts.iter().enumerate() {
            let explicit = if i == 0 { explicit_id } else { None };
            batch_ids.push(block.allocate_id(&self.zones, mode, explicit, admin)?);
        }

        // Materialize, rectify, and drain setup side-effects to fixpoint
        let mut pending: VecDeque<(Oid, InsertDraft)> =
            batch_ids.iter().copied().zip(drafts).collect();
        let mut objects: Vec<WebObject> = Vec::new();
        while let Some((id, draft)) = pending.pop_front() {
            let mut object = WebObject {
                id,
                version: 0,
                seal: None,
                category: draft.category,
                data: draft.data,
            };
            for value in object.data.values_mut() {
                if !value.rectify(&batch_ids) {
                    return Err(Error::DataConsistency(format!(
                        "insert [{}]: provisional reference outside the batch",
                        id
                    )));
                }
            }
            if let Some(setup) = draft.setup {
                let mut tx = InsertTx {
                    block: block.as_ref(),
                    zones: &self.zones,
                    mode,
                    spawned: Vec::new(),
                };
                setup(&mut object, &mut tx)?;
                pending.extend(tx.spawned);
            }
            objects.push(object);
        }

        // Validate, version, seal; nothing persists before this completes
        for object in &mut objects {
            catalog.schema_for(object.category).validate(&object.data)?;
            object.version = 1;
            object.reseal();
        }

        // Persist, rolling back on a mid-batch store failure
        let mut written = Vec::with_capacity(objects.len());
        for object in &objects {
            let record = object.to_record_string();
            if let Err(e) = block.save(object.id, &record) {
                for &id in &written {
                    let _ = block.remove(id);
                }
                return Err(e);
            }
            written.push(object.id);
        }

        // Propagate after every data write landed
        for object in &objects {
            let record = object.to_record_string();
            self.propagate_change(object.id, None, Some(&record), catalog);
        }
        debug!(ring = %self.name, count = objects.len(), "insert batch committed");
        Ok(batch_ids)
    }

    /// Apply an update to the local copy of `id`, under its row lock.
    ///
    /// The new record is fully computed (edits, validation, version bump,
    /// reseal) before any routing decision: a read-only ring returns the
    /// computed record for `upsave` in a writable ring above instead of
    /// applying edits twice.
    pub fn apply_update(
        &self,
        id: Oid,
        edits: &[Edit],
        catalog: &SchemaCatalog,
    ) -> Result<UpdateOutcome> {
        enum Local {
            Absent,
            Forward(String),
            Saved { prev: String, next: String },
        }

        let block = self.route(id);
        let local = block.with_lock(id, || -> Result<Local> {
            let Some(prev_str) = block.get(id)? else {
                return Ok(Local::Absent);
            };
            let prev = WebObject::from_record_str(id, &prev_str)?;
            let mut next = prev.clone();
            next.apply_edits(edits)?;
            // Schema-dependent state refreshes before validation; the
            // seal is recomputed only once the new version is final
            catalog.schema_for(next.category).validate(&next.data)?;
            next.bump_version();
            next.reseal();
            let next_str = next.to_record_string();

            if self.readonly {
                return Ok(Local::Forward(next_str));
            }
            if let Some(revisions) = &self.revisions {
                self.snapshot_revision(revisions, &prev, &prev_str);
            }
            block.save(id, &next_str)?;
            Ok(Local::Saved {
                prev: prev_str,
                next: next_str,
            })
        })?;

        // Propagation and cascade run outside the row lock
        Ok(match local {
            Local::Absent => UpdateOutcome::Absent,
            Local::Forward(record) => UpdateOutcome::ForwardUp { record },
            Local::Saved { prev, next } => UpdateOutcome::Saved {
                cascade: self.propagate_change(id, Some(&prev), Some(&next), catalog),
            },
        })
    }

    fn snapshot_revision(&self, revisions: &Sequence, prev: &WebObject, prev_str: &str) {
        let codec = KeyCodec::new(vec![
            torus_core::FieldKind::Int,
            torus_core::FieldKind::Int,
        ]);
        match codec.encode(&[
            Value::Int(prev.id as i64),
            Value::Int(prev.version as i64),
        ]) {
            Ok(key) => {
                if let Err(e) = revisions.put(&key, prev_str) {
                    warn!(ring = %self.name, id = prev.id, error = %e, "revision snapshot failed");
                }
            }
            Err(e) => warn!(ring = %self.name, id = prev.id, error = %e, "revision key failed"),
        }
    }

    /// Write a record computed in a lower read-only ring.
    ///
    /// Succeeds only when `id` is absent here: by read-through order this
    /// ring would otherwise already be the authoritative copy, and two
    /// copies in one ring are a consistency violation.
    pub fn upsave(&self, id: Oid, record: &str, catalog: &SchemaCatalog) -> Result<()> {
        if self.readonly {
            return Err(Error::DataAccess(format!(
                "upsave into read-only ring {}",
                self.name
            )));
        }
        let block = self.route(id);
        block.with_lock(id, || -> Result<()> {
            if block.get(id)?.is_some() {
                return Err(Error::DataConsistency(format!(
                    "upsave [{}]: id already present in ring {}",
                    id, self.name
                )));
            }
            block.save(id, record)
        })?;
        self.propagate_change(id, None, Some(record), catalog);
        Ok(())
    }

    /// Delete the local copy of `id`.
    ///
    /// `Ok(None)` means the id is absent here (descend to the base ring);
    /// a present id in a read-only ring is an access error.
    pub fn delete_local(
        &self,
        id: Oid,
        catalog: &SchemaCatalog,
    ) -> Result<Option<Vec<Oid>>> {
        let block = self.route(id);
        let prev = block.with_lock(id, || -> Result<Option<String>> {
            let Some(prev) = block.get(id)? else {
                return Ok(None);
            };
            if self.readonly {
                return Err(Error::DataAccess(format!(
                    "delete [{}] targets read-only ring {}",
                    id, self.name
                )));
            }
            block.remove(id)?;
            Ok(Some(prev))
        })?;
        Ok(match prev {
            None => None,
            Some(prev) => {
                Some(self.propagate_change(id, Some(&prev), None, catalog))
            }
        })
    }

    /// Drive every derived sequence with a committed source change and
    /// collect the cascade-delete targets.
    ///
    /// Cascade targets are computed first, then each derived sequence
    /// captures the change; the caller executes the cascade deletes after
    /// all row locks are released.
    pub fn propagate_change(
        &self,
        id: Oid,
        prev: Option<&str>,
        next: Option<&str>,
        catalog: &SchemaCatalog,
    ) -> Vec<Oid> {
        let prev_obj = prev.and_then(|p| match WebObject::from_record_str(id, p) {
            Ok(obj) => Some(obj),
            Err(e) => {
                warn!(ring = %self.name, id, error = %e, "unparsable prev record");
                None
            }
        });
        let next_obj = next.and_then(|n| match WebObject::from_record_str(id, n) {
            Ok(obj) => Some(obj),
            Err(e) => {
                warn!(ring = %self.name, id, error = %e, "unparsable next record");
                None
            }
        });
        let schema =
            catalog.schema_for(prev_obj.as_ref().and_then(|o| o.category));
        let targets = cascade_targets(schema, prev_obj.as_ref(), next_obj.as_ref());

        let key = encode_id(id);
        for sequence in self.derived.read().iter() {
            sequence.capture_change(&key, prev, next);
        }
        targets
    }

    /// Scan one of this ring's sequences by name; `None` when the ring
    /// has no sequence of that name
    pub fn scan_sequence(&self, name: &str, opts: &ScanOpts) -> Result<Option<ScanIter>> {
        if name == self.data.name() {
            return Ok(Some(self.data.scan(opts)?));
        }
        match self.derived_by_name(name) {
            Some(seq) => Ok(Some(seq.scan(opts)?)),
            None => Ok(None),
        }
    }

    /// Flush the data and derived sequences
    pub fn flush(&self, with_delay: bool) -> Result<()> {
        self.data.flush(with_delay)?;
        for seq in self.derived.read().iter() {
            seq.flush(with_delay)?;
        }
        if let Some(rev) = &self.revisions {
            rev.flush(with_delay)?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for Ring {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ring")
            .field("name", &self.name)
            .field("readonly", &self.readonly)
            .field("derived", &self.derived.read().len())
            .field("has_base", &self.base.is_some())
            .finish()
    }
}
