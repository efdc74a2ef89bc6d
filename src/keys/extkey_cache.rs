//! Extended-key cache - memoized full forms of extended keys.
//!
//! A key longer than the B+tree key slot keeps only a prefix in the node;
//! the suffix lives in a blob. This cache maps the suffix blob's offset to
//! the fully reassembled key so the comparator does not re-read the blob
//! on every descent.

use crate::common::config::EXTKEY_BUCKETS;
use crate::common::{Error, Result};

/// One memoized key: the blob offset of its suffix and the full bytes.
struct Entry {
    blob_id: u64,
    key: Vec<u8>,
}

/// Fixed-bucket hash cache of reassembled extended keys.
///
/// The bucket count is a power of two so the bucket index is just the low
/// bits of the blob offset. Entries are never mutated; an update is
/// expressed as remove + insert.
pub struct ExtkeyCache {
    /// Chained buckets, newest entry first.
    buckets: Vec<Vec<Entry>>,
    used_bytes: usize,
}

impl ExtkeyCache {
    pub fn new() -> Self {
        Self {
            buckets: (0..EXTKEY_BUCKETS).map(|_| Vec::new()).collect(),
            used_bytes: 0,
        }
    }

    #[inline]
    fn bucket_of(blob_id: u64) -> usize {
        blob_id as usize & (EXTKEY_BUCKETS - 1)
    }

    /// Memoize `key` under `blob_id`.
    ///
    /// The admission check is shared with the page cache: if the combined
    /// usage of both caches would exceed the page cache capacity, the
    /// insert fails with `CacheFull` and the caller proceeds uncached.
    /// Nothing is evicted here.
    ///
    /// # Panics
    /// Double insertion of a blob_id is a programming error and is
    /// asserted against in debug builds.
    pub fn insert(
        &mut self,
        blob_id: u64,
        key: Vec<u8>,
        page_cache_used: usize,
        page_cache_capacity: usize,
    ) -> Result<()> {
        let bucket = Self::bucket_of(blob_id);
        debug_assert!(
            !self.buckets[bucket].iter().any(|e| e.blob_id == blob_id),
            "duplicate extended-key cache insert for blob {blob_id}"
        );

        if page_cache_used + self.used_bytes + key.len() > page_cache_capacity {
            return Err(Error::CacheFull);
        }

        self.used_bytes += key.len();
        self.buckets[bucket].insert(0, Entry { blob_id, key });
        Ok(())
    }

    /// Look up the full key for `blob_id`.
    pub fn fetch(&self, blob_id: u64) -> Result<&[u8]> {
        self.buckets[Self::bucket_of(blob_id)]
            .iter()
            .find(|e| e.blob_id == blob_id)
            .map(|e| e.key.as_slice())
            .ok_or(Error::KeyNotFound)
    }

    /// Drop the entry for `blob_id`.
    pub fn remove(&mut self, blob_id: u64) -> Result<()> {
        let bucket = &mut self.buckets[Self::bucket_of(blob_id)];
        let index = bucket
            .iter()
            .position(|e| e.blob_id == blob_id)
            .ok_or(Error::KeyNotFound)?;

        self.used_bytes -= bucket[index].key.len();
        bucket.remove(index);
        Ok(())
    }

    /// Bytes held by all memoized keys.
    #[inline]
    pub fn used_bytes(&self) -> usize {
        self.used_bytes
    }

    /// Number of memoized keys.
    pub fn len(&self) -> usize {
        self.buckets.iter().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.used_bytes == 0
    }
}

impl Default for ExtkeyCache {
    fn default() -> Self {
        Self::new()
    }
}
