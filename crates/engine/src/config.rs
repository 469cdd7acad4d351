//! Database and ring configuration
//!
//! A database opens from a [`DatabaseConfig`]: an ordered list of ring
//! configs, bottom ring first. Ring configs pick the backing store kind,
//! declare the insert zones and shard, and describe the derived sequences
//! to maintain. Configs are plain serde structs, so a stack can live in a
//! YAML or JSON file next to the data it describes.

use crate::block::{Block, BlockRole, InsertMode};
use crate::operator::{AggregationOperator, IndexOperator, KeyField, Operator};
use crate::ring::Ring;
use crate::sequence::Sequence;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use torus_core::{Error, InsertZones, Oid, Result, Shard};
use torus_store::{JsonIndexStore, MemoryStore, NativeStore, Store, YamlDataStore};

/// Backing store of a ring
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum StoreKind {
    /// Memory-resident; data is lost at shutdown
    #[default]
    Memory,
    /// YAML data file (development-time); derived sequences live in
    /// sibling JSON-lines files
    Yaml {
        /// Path of the data file
        path: PathBuf,
    },
    /// Log-structured native store; derived sequences live in
    /// subdirectories
    Native {
        /// Directory of the store
        path: PathBuf,
    },
}

/// Kind of a derived sequence
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SequenceKind {
    /// One destination record per extracted key
    Index,
    /// Accumulator records merged by inc/dec
    Aggregation,
}

/// Configuration of one derived sequence
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SequenceConfig {
    /// Sequence name (scan surface)
    pub name: String,
    /// Index or aggregation
    pub kind: SequenceKind,
    /// Ordered key fields; the first may carry a plural `$` marker
    pub key: Vec<KeyField>,
    /// Payload fields (indexes)
    #[serde(default)]
    pub payload: Vec<String>,
    /// Summed fields (aggregations)
    #[serde(default)]
    pub sums: Vec<String>,
    /// Restrict to one category
    #[serde(default)]
    pub category: Option<Oid>,
}

impl SequenceConfig {
    /// Build the operator this config describes
    pub fn operator(&self) -> Operator {
        match self.kind {
            SequenceKind::Index => {
                let mut op = IndexOperator::new(self.key.clone(), self.payload.clone());
                op.category = self.category;
                Operator::Index(op)
            }
            SequenceKind::Aggregation => {
                let mut op = AggregationOperator::new(self.key.clone(), self.sums.clone());
                op.category = self.category;
                Operator::Aggregation(op)
            }
        }
    }
}

/// Configuration of one ring
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RingConfig {
    /// Ring name, unique within the stack
    pub name: String,
    /// Read-only rings never receive local writes
    #[serde(default)]
    pub readonly: bool,
    /// Backing store
    #[serde(default)]
    pub store: StoreKind,
    /// Lower bound of the exclusive insert zone
    #[serde(default)]
    pub exclusive_min: Option<Oid>,
    /// Lower bound of the forbidden zone
    #[serde(default)]
    pub forbidden_min: Option<Oid>,
    /// Lower bound of the sharded zone
    #[serde(default)]
    pub sharded_min: Oid,
    /// Shard predicate over the sharded zone
    #[serde(default)]
    pub shard: Option<Shard>,
    /// Default id allocation policy
    #[serde(default)]
    pub insert_mode: InsertMode,
    /// Deferred-flush delay in milliseconds (0 flushes inline)
    #[serde(default)]
    pub flush_delay_ms: u64,
    /// Snapshot previous record versions on update
    #[serde(default)]
    pub revisions: bool,
    /// Derived sequences maintained by this ring
    #[serde(default)]
    pub sequences: Vec<SequenceConfig>,
}

impl RingConfig {
    /// Writable memory ring accepting every id >= 1
    pub fn memory(name: &str) -> Self {
        RingConfig {
            name: name.to_string(),
            readonly: false,
            store: StoreKind::Memory,
            exclusive_min: None,
            forbidden_min: None,
            sharded_min: 1,
            shard: None,
            insert_mode: InsertMode::Incremental,
            flush_delay_ms: 0,
            revisions: false,
            sequences: Vec::new(),
        }
    }

    /// The insert zones this config declares
    pub fn zones(&self) -> InsertZones {
        InsertZones {
            exclusive_min: self.exclusive_min,
            forbidden_min: self.forbidden_min,
            sharded_min: self.sharded_min,
            shard: self.shard,
        }
    }

    fn data_store(&self) -> Result<Arc<dyn Store>> {
        Ok(match &self.store {
            StoreKind::Memory => Arc::new(MemoryStore::new()),
            StoreKind::Yaml { path } => Arc::new(YamlDataStore::new(path)),
            StoreKind::Native { path } => Arc::new(NativeStore::open_at(path.join("data"))?),
        })
    }

    fn derived_store(&self, sequence: &str) -> Result<Arc<dyn Store>> {
        Ok(match &self.store {
            StoreKind::Memory => Arc::new(MemoryStore::new()),
            StoreKind::Yaml { path } => {
                let file = path.with_file_name(format!("{}.{}.jl", self.name, sequence));
                Arc::new(JsonIndexStore::new(file))
            }
            StoreKind::Native { path } => Arc::new(NativeStore::open_at(path.join(sequence))?),
        })
    }

    /// Build (but do not open) the ring this config describes
    pub fn build(&self, base: Option<Arc<Ring>>) -> Result<Ring> {
        let flush_delay = Duration::from_millis(self.flush_delay_ms);
        let data_block = Arc::new(Block::new(
            format!("{}.data.0", self.name),
            BlockRole::Data,
            self.data_store()?,
            None,
            flush_delay,
        ));
        let data = Sequence::new("data", Operator::Data(crate::operator::DataOperator::new()), data_block);

        let mut ring = Ring::new(self.name.clone(), self.readonly, base, data, self.zones())
            .with_insert_mode(self.insert_mode);

        if self.revisions {
            let block = Arc::new(Block::new(
                format!("{}.revisions.0", self.name),
                BlockRole::Derived,
                self.derived_store("revisions")?,
                None,
                flush_delay,
            ));
            let operator = Operator::Index(IndexOperator::new(
                vec![KeyField::int("id"), KeyField::int("__ver")],
                Vec::new(),
            ));
            ring = ring.with_revisions(Sequence::new("revisions", operator, block));
        }

        for seq in &self.sequences {
            let block = Arc::new(Block::new(
                format!("{}.{}.0", self.name, seq.name),
                BlockRole::Derived,
                self.derived_store(&seq.name)?,
                None,
                flush_delay,
            ));
            ring.add_derived(Sequence::new(seq.name.clone(), seq.operator(), block));
        }
        Ok(ring)
    }
}

/// Configuration of a full ring stack
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Rings, bottom first; the last entry is the top of the stack
    pub rings: Vec<RingConfig>,
    /// Root object pinned in the registry
    #[serde(default)]
    pub root_id: Option<Oid>,
    /// Registry entry TTL in seconds
    #[serde(default = "default_registry_ttl")]
    pub registry_ttl_secs: u64,
    /// Minimum delay between registry purges, in seconds
    #[serde(default = "default_purge_interval")]
    pub registry_purge_interval_secs: u64,
}

fn default_registry_ttl() -> u64 {
    300
}

fn default_purge_interval() -> u64 {
    10
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        DatabaseConfig {
            rings: Vec::new(),
            root_id: None,
            registry_ttl_secs: default_registry_ttl(),
            registry_purge_interval_secs: default_purge_interval(),
        }
    }
}

impl DatabaseConfig {
    /// Build the ring stack bottom-up; returns the top ring
    pub fn build_stack(&self) -> Result<Arc<Ring>> {
        if self.rings.is_empty() {
            return Err(Error::DataAccess("a database needs at least one ring".into()));
        }
        let mut names = std::collections::HashSet::new();
        for ring in &self.rings {
            if !names.insert(ring.name.as_str()) {
                return Err(Error::DataAccess(format!(
                    "duplicate ring name {}",
                    ring.name
                )));
            }
        }
        let mut base: Option<Arc<Ring>> = None;
        for config in &self.rings {
            base = Some(Arc::new(config.build(base)?));
        }
        Ok(base.expect("at least one ring"))
    }
}
