//! Error types for the torus storage core
//!
//! One `Error` enum covers every crate in the workspace. The user-visible
//! taxonomy is small and stable:
//!
//! - **ObjectNotFound**: a lookup exhausted the ring stack
//! - **DataAccess**: a write landed where writes are not possible, or an id
//!   falls outside the valid insert set
//! - **DataConsistency**: an invariant violation discovered at write time;
//!   the current command is aborted
//! - **Schema / Validation**: surfaced by object validation; translated to
//!   `DataAccess` at the database boundary
//! - **Timeout**: a forwarded operation exceeded its deadline
//! - **NotImplemented**: a store does not support an optional operation
//!
//! Transport variants (`Io`, `Json`, `Yaml`, `Store`, `Codec`) carry failures
//! from the backends and codecs.

use std::io;
use thiserror::Error;

/// Result type alias for torus operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for the torus storage core
#[derive(Debug, Error)]
pub enum Error {
    /// Lookup exhausted the ring stack without finding the object
    #[error("object not found: [{0}]")]
    ObjectNotFound(u64),

    /// A write landed on a read-only ring with no writable ring above,
    /// or an id falls outside the ring's valid insert set
    #[error("data access error: {0}")]
    DataAccess(String),

    /// Invariant violation discovered at write time (duplicate id on
    /// explicit insert, upsave collision, cascade target missing)
    #[error("data consistency error: {0}")]
    DataConsistency(String),

    /// A record or operator does not match its declared schema
    #[error("schema error: {0}")]
    Schema(String),

    /// Object validation failed
    #[error("validation error: {0}")]
    Validation(String),

    /// A forwarded operation exceeded its deadline
    #[error("timeout: {0}")]
    Timeout(String),

    /// A store does not support an optional operation
    #[error("not implemented: {0}")]
    NotImplemented(&'static str),

    /// Key encoding or decoding failure
    #[error("key codec error: {0}")]
    Codec(String),

    /// Low-level store failure
    #[error("store error: {0}")]
    Store(String),

    /// I/O error from a file-backed or native store
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// JSON (de)serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML (de)serialization error
    #[error("YAML error: {0}")]
    Yaml(String),
}

impl Error {
    /// True iff this error means "the object does not exist"
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::ObjectNotFound(_))
    }

    /// Translate schema/validation failures to the storage boundary.
    ///
    /// Object validation surfaces `Schema`/`Validation`; callers of the
    /// database API observe them as `DataAccess`.
    pub fn into_access(self) -> Error {
        match self {
            Error::Schema(msg) | Error::Validation(msg) => Error::DataAccess(msg),
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_predicate() {
        assert!(Error::ObjectNotFound(7).is_not_found());
        assert!(!Error::DataAccess("x".into()).is_not_found());
    }

    #[test]
    fn test_validation_translates_to_access() {
        let err = Error::Validation("field n: expected int".into()).into_access();
        assert!(matches!(err, Error::DataAccess(_)));

        let err = Error::Schema("unknown field".into()).into_access();
        assert!(matches!(err, Error::DataAccess(_)));
    }

    #[test]
    fn test_other_errors_pass_through_access_translation() {
        let err = Error::ObjectNotFound(3).into_access();
        assert!(matches!(err, Error::ObjectNotFound(3)));
    }

    #[test]
    fn test_display_messages() {
        assert_eq!(
            Error::ObjectNotFound(42).to_string(),
            "object not found: [42]"
        );
        assert_eq!(
            Error::NotImplemented("compact insert").to_string(),
            "not implemented: compact insert"
        );
    }
}
