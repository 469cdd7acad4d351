//! Storage backends for the torus engine
//!
//! One small object-safe contract ([`Store`]) and four interchangeable
//! backends:
//! - [`MemoryStore`]: sorted in-memory map; the only compact-capable store
//! - [`YamlDataStore`]: YAML-file data records, development-time
//! - [`JsonIndexStore`]: JSON-lines derived records, development-time
//! - [`NativeStore`]: log-structured sled tree, production

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod jsonl;
pub mod memory;
pub mod native;
pub mod traits;
pub mod yaml;

pub use jsonl::JsonIndexStore;
pub use memory::MemoryStore;
pub use native::NativeStore;
pub use traits::{ScanIter, ScanOpts, Store, StoreOp};
pub use yaml::YamlDataStore;
