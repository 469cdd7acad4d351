//! Storage engine for the torus ring stack
//!
//! This crate orchestrates the layers below the public API:
//! - Block: single-owner store unit with row locks and id allocation
//! - Sequence: ordered blocks, key routing, change capture
//! - Ring: one storage layer with insert zones and read/write-through
//! - Database: top of the stack, public surface and admin actions
//! - Registry: process-local object cache with a pinned root
//!
//! The engine is the only component that knows about the ring stack and
//! about cross-layer coordination (propagation ordering, cascade
//! scheduling, flush batching).

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod block;
pub mod cascade;
pub mod config;
pub mod database;
pub mod flush;
pub mod locks;
pub mod operator;
pub mod registry;
pub mod ring;
pub mod sequence;

pub use block::{Block, BlockRole, InsertMode};
pub use cascade::cascade_targets;
pub use config::{DatabaseConfig, RingConfig, SequenceConfig, SequenceKind, StoreKind};
pub use database::{
    Database, DeleteOptions, InsertOptions, ScanOptions, SelectOptions, UpdateOptions,
};
pub use locks::RecordLocks;
pub use operator::{AggregationOperator, DataOperator, IndexOperator, KeyField, Operator};
pub use registry::Registry;
pub use ring::{InsertDraft, InsertTx, Ring, SchemaCatalog, SetupFn, UpdateOutcome};
pub use sequence::{derive_ops, DerivedOp, Sequence};
