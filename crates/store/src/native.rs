//! Log-structured native store
//!
//! Production backend wrapping a `sled` tree. `open` creates the directory
//! if missing; `bulk` maps to an atomic write batch; `del` is unchecked
//! (removal of an absent key still reports success, as the backend gives
//! no cheap existence answer); `erase` clears the tree in place.

use crate::traits::{ScanIter, ScanOpts, Store, StoreOp};
use std::ops::Bound;
use std::path::{Path, PathBuf};
use torus_core::{decode_id, Error, Result};

/// Store backed by a sled database directory
pub struct NativeStore {
    path: PathBuf,
    tree: sled::Db,
}

fn store_err(e: sled::Error) -> Error {
    Error::Store(e.to_string())
}

fn utf8_value(key: &[u8], bytes: &[u8]) -> Result<String> {
    String::from_utf8(bytes.to_vec())
        .map_err(|_| Error::Store(format!("non-UTF-8 value at key {:?}", key)))
}

impl NativeStore {
    /// Open (creating if missing) the sled database at `path`
    pub fn open_at<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let tree = sled::open(&path).map_err(store_err)?;
        Ok(NativeStore { path, tree })
    }

    /// Directory of the backing database
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl std::fmt::Debug for NativeStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NativeStore")
            .field("path", &self.path)
            .field("len", &self.tree.len())
            .finish()
    }
}

impl Store for NativeStore {
    fn open(&self) -> Result<u64> {
        match self.tree.last().map_err(store_err)? {
            Some((key, _)) => Ok(decode_id(&key).unwrap_or(0)),
            None => Ok(0),
        }
    }

    fn get(&self, key: &[u8]) -> Result<Option<String>> {
        match self.tree.get(key).map_err(store_err)? {
            Some(bytes) => Ok(Some(utf8_value(key, &bytes)?)),
            None => Ok(None),
        }
    }

    fn put(&self, key: &[u8], value: &str) -> Result<()> {
        self.tree
            .insert(key, value.as_bytes())
            .map_err(store_err)?;
        Ok(())
    }

    fn del(&self, key: &[u8]) -> Result<bool> {
        // Unchecked: absent keys still report success
        self.tree.remove(key).map_err(store_err)?;
        Ok(true)
    }

    fn scan(&self, opts: &ScanOpts) -> Result<ScanIter> {
        if let (Some(start), Some(stop)) = (&opts.start, &opts.stop) {
            if start > stop {
                return Ok(Box::new(std::iter::empty()));
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
        let iter = self.tree.range::<Vec<u8>, _>((start, stop));

        let mapped = |item: std::result::Result<(sled::IVec, sled::IVec), sled::Error>| {
            item.map_err(store_err).and_then(|(k, v)| {
                let value = utf8_value(&k, &v)?;
                Ok((k.to_vec(), value))
            })
        };

        let boxed: ScanIter = if opts.reverse {
            Box::new(iter.rev().map(mapped))
        } else {
            Box::new(iter.map(mapped))
        };
        Ok(match opts.limit {
            Some(limit) => Box::new(boxed.take(limit)),
            None => boxed,
        })
    }

    fn erase(&self) -> Result<()> {
        self.tree.clear().map_err(store_err)?;
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        self.tree.flush().map_err(store_err)?;
        Ok(())
    }

    fn bulk(&self, ops: Vec<StoreOp>) -> Result<()> {
        let mut batch = sled::Batch::default();
        for op in ops {
            match op {
                StoreOp::Put(key, value) => batch.insert(key, value.as_bytes()),
                StoreOp::Del(key) => batch.remove(key),
            }
        }
        self.tree.apply_batch(batch).map_err(store_err)
    }
}
