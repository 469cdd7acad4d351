//! Memory-resident store
//!
//! A sorted byte-keyed map behind a `parking_lot::RwLock`. Scans snapshot
//! the matching range under the read lock, so iteration is consistent with
//! the store contents at scan start. The only variant eligible for the
//! compact insert policy.

use crate::traits::{ScanIter, ScanOpts, Store, StoreOp};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::ops::Bound;
use torus_core::{decode_id, Result};

/// In-memory sorted store
#[derive(Debug, Default)]
pub struct MemoryStore {
    data: RwLock<BTreeMap<Vec<u8>, String>>,
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        MemoryStore::default()
    }

    /// Number of records
    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    /// Whether the store holds no records
    pub fn is_empty(&self) -> bool {
        self.data.read().is_empty()
    }
}

/// Snapshot the bounded range of `data` under its lock.
pub(crate) fn collect_range(
    data: &BTreeMap<Vec<u8>, String>,
    opts: &ScanOpts,
) -> Vec<(Vec<u8>, String)> {
    if let (Some(start), Some(stop)) = (&opts.start, &opts.stop) {
        if start > stop {
            return Vec::new();
        }
    }
    let start = match &opts.start {
        Some(s) => Bound::Included(s.clone()),
        None => Bound::Unbounded,
    };
    let stop = match &opts.stop {
        Some(s) => Bound::Excluded(s.clone()),
        None => Bound::Unbounded,
    };
    let range = data.range((start, stop));
    let pairs: Vec<(Vec<u8>, String)> = if opts.reverse {
        let mut v: Vec<_> = range.map(|(k, v)| (k.clone(), v.clone())).collect();
        v.reverse();
        v
    } else {
        range.map(|(k, v)| (k.clone(), v.clone())).collect()
    };
    match opts.limit {
        Some(limit) => pairs.into_iter().take(limit).collect(),
        None => pairs,
    }
}

/// Maximum id-shaped key of `data`, for seeding autoincrement.
pub(crate) fn max_data_id(data: &BTreeMap<Vec<u8>, String>) -> u64 {
    data.keys()
        .filter_map(|k| decode_id(k).ok())
        .max()
        .unwrap_or(0)
}

impl Store for MemoryStore {
    fn open(&self) -> Result<u64> {
        Ok(max_data_id(&self.data.read()))
    }

    fn get(&self, key: &[u8]) -> Result<Option<String>> {
        Ok(self.data.read().get(key).cloned())
    }

    fn put(&self, key: &[u8], value: &str) -> Result<()> {
        self.data.write().insert(key.to_vec(), value.to_string());
        Ok(())
    }

    fn del(&self, key: &[u8]) -> Result<bool> {
        Ok(self.data.write().remove(key).is_some())
    }

    fn scan(&self, opts: &ScanOpts) -> Result<ScanIter> {
        let pairs = collect_range(&self.data.read(), opts);
        Ok(Box::new(pairs.into_iter().map(Ok)))
    }

    fn erase(&self) -> Result<()> {
        self.data.write().clear();
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        // Nothing to persist
        Ok(())
    }

    fn bulk(&self, ops: Vec<StoreOp>) -> Result<()> {
        let mut data = self.data.write();
        for op in ops {
            match op {
                StoreOp::Put(key, value) => {
                    data.insert(key, value);
                }
                StoreOp::Del(key) => {
                    data.remove(&key);
                }
            }
        }
        Ok(())
    }

    fn supports_compact(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use torus_core::encode_id;

    fn seeded() -> MemoryStore {
        let store = MemoryStore::new();
        for id in [1u64, 2, 5, 10] {
            store.put(&encode_id(id), &format!("{{\"n\":{}}}", id)).unwrap();
        }
        store
    }

    #[test]
    fn test_get_put_del() {
        let store = MemoryStore::new();
        let key = encode_id(7);
        assert_eq!(store.get(&key).unwrap(), None);

        store.put(&key, "{}").unwrap();
        assert_eq!(store.get(&key).unwrap().as_deref(), Some("{}"));

        assert!(store.del(&key).unwrap());
        assert!(!store.del(&key).unwrap());
    }

    #[test]
    fn test_open_reports_max_id() {
        let store = seeded();
        assert_eq!(store.open().unwrap(), 10);
        assert_eq!(MemoryStore::new().open().unwrap(), 0);
    }

    #[test]
    fn test_scan_ascending_bounds() {
        let store = seeded();
        let opts = ScanOpts::range(Some(encode_id(2)), Some(encode_id(10)));
        let keys: Vec<u64> = store
            .scan(&opts)
            .unwrap()
            .map(|r| decode_id(&r.unwrap().0).unwrap())
            .collect();
        assert_eq!(keys, vec![2, 5]);
    }

    #[test]
    fn test_scan_empty_when_start_equals_stop() {
        let store = seeded();
        let opts = ScanOpts::range(Some(encode_id(2)), Some(encode_id(2)));
        assert_eq!(store.scan(&opts).unwrap().count(), 0);
    }

    #[test]
    fn test_scan_reverse_with_limit() {
        let store = seeded();
        let opts = ScanOpts {
            reverse: true,
            limit: Some(2),
            ..ScanOpts::all()
        };
        let keys: Vec<u64> = store
            .scan(&opts)
            .unwrap()
            .map(|r| decode_id(&r.unwrap().0).unwrap())
            .collect();
        assert_eq!(keys, vec![10, 5]);
    }

    #[test]
    fn test_erase_resets() {
        let store = seeded();
        store.erase().unwrap();
        assert!(store.is_empty());
        assert_eq!(store.open().unwrap(), 0);
    }

    #[test]
    fn test_bulk_applies_all_ops() {
        let store = MemoryStore::new();
        store
            .bulk(vec![
                StoreOp::Put(encode_id(1), "\"a\"".into()),
                StoreOp::Put(encode_id(2), "\"b\"".into()),
                StoreOp::Del(encode_id(1)),
            ])
            .unwrap();
        assert_eq!(store.get(&encode_id(1)).unwrap(), None);
        assert_eq!(store.get(&encode_id(2)).unwrap().as_deref(), Some("\"b\""));
    }

    #[test]
    fn test_supports_compact() {
        assert!(MemoryStore::new().supports_compact());
    }
}
