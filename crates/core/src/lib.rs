//! Core types for the torus storage engine
//!
//! This crate defines the foundational types used throughout the system:
//! - Oid, Shard, InsertZones: identifiers and id-zone arithmetic
//! - Value: unified value enum, including object references
//! - WebObject, Edit: stored objects and in-memory edit application
//! - Schema, FieldType: typed field catalogs and strong references
//! - KeyCodec: order-preserving binary key encoding
//! - Error: the workspace-wide error taxonomy

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod codec;
pub mod error;
pub mod object;
pub mod schema;
pub mod types;
pub mod value;

pub use codec::{decode_id, encode_id, prefix_successor, FieldKind, KeyCodec};
pub use error::{Error, Result};
pub use object::{Edit, WebObject, CATEGORY_KEY, DATA_KEY, META_KEY, SEAL_KEY, VER_KEY};
pub use schema::{singular_name, FieldType, Schema};
pub use types::{InsertZones, Oid, Shard};
pub use value::{Value, PROVISIONAL_KEY, REF_KEY};
