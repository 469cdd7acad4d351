//! # TorusDB
//!
//! A layered object-database storage core: a stack of key/value **rings**
//! holding schema-driven web objects, with derived sequences (indexes and
//! aggregations) kept in sync with the primary data by change propagation.
//!
//! Each ring owns one primary data sequence plus any number of derived
//! sequences. Reads resolve top-down through the stack; writes land in the
//! nearest writable ring. Every successful data change drives the ring's
//! operators, which translate the `(prev, next)` pair into destination
//! operations on other blocks.
//!
//! # Quick Start
//!
//! ```no_run
//! use torusdb::{Database, DatabaseConfig, RingConfig, Value};
//!
//! fn main() -> torusdb::Result<()> {
//!     let config = DatabaseConfig {
//!         rings: vec![RingConfig::memory("main")],
//!         ..Default::default()
//!     };
//!     let db = Database::open(config)?;
//!
//!     let mut data = std::collections::BTreeMap::new();
//!     data.insert("name".to_string(), Value::Str("alice".into()));
//!     let id = db.insert(data, Default::default())?;
//!
//!     let record = db.select(id, &Default::default())?;
//!     assert_eq!(record["name"], "alice");
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! | Layer | Crate | Responsibility |
//! |-------|-------|----------------|
//! | **Database** | `torus-engine` | Top of the ring stack; public API and admin actions |
//! | **Ring** | `torus-engine` | One storage layer; id zones, read/write-through |
//! | **Sequence / Block** | `torus-engine` | Key routing, row locks, change propagation |
//! | **Store** | `torus-store` | Memory, YAML, JSON-lines and log-structured backends |
//! | **Core** | `torus-core` | Objects, values, schemas, key codec, errors |
//!
//! Internal layering is not part of the stable surface; depend on the
//! re-exports below.

pub use torus_core::{
    decode_id, encode_id, Edit, Error, FieldKind, FieldType, KeyCodec, Oid, Result, Schema, Shard,
    Value, WebObject,
};
pub use torus_engine::{
    Database, DatabaseConfig, DeleteOptions, InsertDraft, InsertMode, InsertOptions, KeyField,
    Registry, RingConfig, ScanOptions, SchemaCatalog, SelectOptions, SequenceConfig, SequenceKind,
    StoreKind, UpdateOptions,
};
pub use torus_store::{MemoryStore, ScanOpts, Store};
