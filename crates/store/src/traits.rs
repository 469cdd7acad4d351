//! The `Store` contract
//!
//! A store is a physical key/value container mapping binary keys to JSON
//! string values. Blocks own exactly one store each and drive it through
//! this object-safe trait, which keeps the backends (memory, YAML file,
//! JSON-lines file, log-structured) interchangeable.

use torus_core::Result;

/// Scan bounds and shaping options.
///
/// `start`/`stop` are already-encoded binary prefixes; the scan yields
/// pairs with `start <= key < stop` in ascending byte order, or descending
/// when `reverse` is set. A scan must be consistent with the store contents
/// at the moment iteration starts; mutations made during iteration may or
/// may not appear.
#[derive(Debug, Clone, Default)]
pub struct ScanOpts {
    /// Inclusive lower bound; absent means from the first key
    pub start: Option<Vec<u8>>,
    /// Exclusive upper bound; absent means to the last key
    pub stop: Option<Vec<u8>>,
    /// Maximum number of pairs to yield
    pub limit: Option<usize>,
    /// Yield in descending byte order
    pub reverse: bool,
}

impl ScanOpts {
    /// Scan everything in ascending order
    pub fn all() -> Self {
        ScanOpts::default()
    }

    /// Scan `[start, stop)` in ascending order
    pub fn range(start: Option<Vec<u8>>, stop: Option<Vec<u8>>) -> Self {
        ScanOpts {
            start,
            stop,
            ..ScanOpts::default()
        }
    }

    /// Whether `key` falls inside the configured bounds
    pub fn contains(&self, key: &[u8]) -> bool {
        if let Some(start) = &self.start {
            if key < start.as_slice() {
                return false;
            }
        }
        if let Some(stop) = &self.stop {
            if key >= stop.as_slice() {
                return false;
            }
        }
        true
    }
}

/// One operation of a bulk batch
#[derive(Debug, Clone)]
pub enum StoreOp {
    /// Insert or overwrite
    Put(Vec<u8>, String),
    /// Remove
    Del(Vec<u8>),
}

/// Fallible owned iterator over `(key, value)` pairs
pub type ScanIter = Box<dyn Iterator<Item = Result<(Vec<u8>, String)>> + Send>;

/// Physical key/value container: binary key -> JSON string value
pub trait Store: Send + Sync + std::fmt::Debug {
    /// Load existing records or open the native backend.
    ///
    /// Returns the maximum data key observed, decoded as an id (0 when the
    /// store is empty or holds no id-shaped keys); data blocks seed their
    /// autoincrement counter from it.
    fn open(&self) -> Result<u64>;

    /// Point lookup
    fn get(&self, key: &[u8]) -> Result<Option<String>>;

    /// Insert or overwrite
    fn put(&self, key: &[u8], value: &str) -> Result<()>;

    /// Remove; true iff a record was removed.
    ///
    /// Log-structured backends may be unchecked and always report true.
    fn del(&self, key: &[u8]) -> Result<bool>;

    /// Bounded ordered iteration; see [`ScanOpts`]
    fn scan(&self, opts: &ScanOpts) -> Result<ScanIter>;

    /// Remove all records
    fn erase(&self) -> Result<()>;

    /// Persist pending in-memory mutations; idempotent
    fn flush(&self) -> Result<()>;

    /// Apply a batch of operations, atomically where the backend can.
    ///
    /// The default implementation applies the operations one by one.
    fn bulk(&self, ops: Vec<StoreOp>) -> Result<()> {
        for op in ops {
            match op {
                StoreOp::Put(key, value) => self.put(&key, &value)?,
                StoreOp::Del(key) => {
                    self.del(&key)?;
                }
            }
        }
        Ok(())
    }

    /// Whether the compact insert policy may scan this store.
    ///
    /// Only memory-resident stores support it; everything else answers
    /// `NotImplemented` through the block layer.
    fn supports_compact(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scan_opts_contains() {
        let opts = ScanOpts::range(Some(vec![2]), Some(vec![5]));
        assert!(!opts.contains(&[1]));
        assert!(opts.contains(&[2]));
        assert!(opts.contains(&[4, 200]));
        assert!(!opts.contains(&[5]));
        assert!(!opts.contains(&[9]));
    }

    #[test]
    fn test_scan_opts_unbounded() {
        let opts = ScanOpts::all();
        assert!(opts.contains(&[]));
        assert!(opts.contains(&[255, 255]));
    }
}
