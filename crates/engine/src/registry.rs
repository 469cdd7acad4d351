//! Process-local object registry
//!
//! Caches deserialized objects by id so the ring stack does not re-parse
//! frequently accessed records. Entries expire after a TTL and are swept
//! by `purge`, with two exceptions: pinned entries are never evicted, and
//! the designated *root* object is reloaded in place instead of evicted.
//! Purging is re-entrancy safe (a concurrent purge is a no-op) and honors
//! a minimum inter-purge delay.

use chrono::Utc;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use torus_core::{Error, Oid, Result, WebObject};
use tracing::debug;

struct CacheEntry {
    object: Arc<WebObject>,
    expires_at_ms: i64,
    pinned: bool,
}

/// Expiring object cache with a pinned root
pub struct Registry {
    entries: DashMap<Oid, CacheEntry>,
    ttl_ms: i64,
    root: Option<Oid>,
    purging: AtomicBool,
    last_purge_ms: AtomicI64,
    min_purge_interval_ms: i64,
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

impl Registry {
    /// Registry with per-entry TTL and a minimum delay between purges
    pub fn new(ttl: Duration, min_purge_interval: Duration) -> Self {
        Registry {
            entries: DashMap::new(),
            ttl_ms: ttl.as_millis() as i64,
            root: None,
            purging: AtomicBool::new(false),
            last_purge_ms: AtomicI64::new(0),
            min_purge_interval_ms: min_purge_interval.as_millis() as i64,
        }
    }

    /// Designate the root object, reloaded rather than evicted on purge
    pub fn with_root(mut self, root: Oid) -> Self {
        self.root = Some(root);
        self
    }

    /// The designated root id, if any
    pub fn root(&self) -> Option<Oid> {
        self.root
    }

    /// Cached object, or `None`
    pub fn get(&self, id: Oid) -> Option<Arc<WebObject>> {
        self.entries.get(&id).map(|e| e.object.clone())
    }

    /// Cache an object. The object must carry an assigned id.
    pub fn set(&self, object: Arc<WebObject>) -> Result<()> {
        if object.id == 0 {
            return Err(Error::Validation(
                "registry requires an object with an assigned id".into(),
            ));
        }
        let pinned = self
            .entries
            .get(&object.id)
            .map(|e| e.pinned)
            .unwrap_or(false);
        self.entries.insert(
            object.id,
            CacheEntry {
                object,
                expires_at_ms: now_ms() + self.ttl_ms,
                pinned,
            },
        );
        Ok(())
    }

    /// Pin an entry; pinned entries are never evicted
    pub fn pin(&self, id: Oid) {
        if let Some(mut entry) = self.entries.get_mut(&id) {
            entry.pinned = true;
        }
    }

    /// Drop an entry (every committed mutation of the object)
    pub fn invalidate(&self, id: Oid) {
        self.entries.remove(&id);
    }

    /// Evict expired entries.
    ///
    /// Pinned entries survive; the root object is refreshed through
    /// `reload` instead of evicted. A purge racing another purge, or one
    /// arriving before the minimum inter-purge delay has passed, is a
    /// no-op. Returns the number of evicted entries.
    pub fn purge<F>(&self, mut reload: F) -> usize
    where
        F: FnMut(Oid) -> Option<Arc<WebObject>>,
    {
        let now = now_ms();
        if now - self.last_purge_ms.load(Ordering::SeqCst) < self.min_purge_interval_ms {
            return 0;
        }
        if self.purging.swap(true, Ordering::SeqCst) {
            return 0; // purge already in flight
        }

        let expired: Vec<Oid> = self
            .entries
            .iter()
            .filter(|e| e.value().expires_at_ms <= now && !e.value().pinned)
            .map(|e| *e.key())
            .collect();

        let mut evicted = 0;
        for id in expired {
            if self.root == Some(id) {
                match reload(id) {
                    Some(object) => {
                        let _ = self.set(object);
                        debug!(id, "root object reloaded during purge");
                    }
                    None => debug!(id, "root object reload failed, entry kept"),
                }
                continue;
            }
            if self
                .entries
                .remove_if(&id, |_, e| e.expires_at_ms <= now && !e.pinned)
                .is_some()
            {
                evicted += 1;
            }
        }

        self.last_purge_ms.store(now_ms(), Ordering::SeqCst);
        self.purging.store(false, Ordering::SeqCst);
        evicted
    }

    /// Number of cached entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the cache is empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("entries", &self.entries.len())
            .field("root", &self.root)
            .finish()
    }
}
