//! Bounded caches for large values. Both caches are best-effort; every
//! entry can be rebuilt from the sidecar files, so eviction never affects
//! correctness.

use crate::entry::ObjectValue;

use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::Arc;

const BLOB_CACHE_SLOTS: usize = 32;
const VALUE_CACHE_SLOTS: usize = 32;

/// A decoded large value, cached under its user key.
#[derive(Clone)]
pub enum BigValue {
    Str(Arc<String>),
    Bytes(Arc<Vec<u8>>),
    Object(ObjectValue),
}

/// Recently written raw sidecar bytes, keyed by file name. Holds the
/// bytes exactly as stored on disk (encrypted when a cipher is active).
pub struct BlobCache {
    inner: LruCache<String, Arc<Vec<u8>>>,
}

impl BlobCache {
    pub fn new() -> Self {
        Self { inner: LruCache::new(NonZeroUsize::new(BLOB_CACHE_SLOTS).unwrap()) }
    }

    pub fn put(&mut self, name: String, bytes: Arc<Vec<u8>>) {
        self.inner.put(name, bytes);
    }

    pub fn get(&mut self, name: &str) -> Option<Arc<Vec<u8>>> {
        self.inner.get(name).cloned()
    }

    pub fn remove(&mut self, name: &str) {
        self.inner.pop(name);
    }

    pub fn clear(&mut self) {
        self.inner.clear();
    }
}

/// Decoded large values, keyed by user key, so a read immediately after a
/// large put does not have to re-read and re-decode the sidecar.
pub struct ValueCache {
    inner: LruCache<String, BigValue>,
}

impl ValueCache {
    pub fn new() -> Self {
        Self { inner: LruCache::new(NonZeroUsize::new(VALUE_CACHE_SLOTS).unwrap()) }
    }

    pub fn put(&mut self, key: String, value: BigValue) {
        self.inner.put(key, value);
    }

    pub fn get(&mut self, key: &str) -> Option<BigValue> {
        self.inner.get(key).cloned()
    }

    pub fn remove(&mut self, key: &str) {
        self.inner.pop(key);
    }

    pub fn clear(&mut self) {
        self.inner.clear();
    }
}
