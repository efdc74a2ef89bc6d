//! Page manager - the paged file manager at the heart of the engine.
//!
//! The [`PageManager`] provides:
//! - Page caching between the device and memory, bounded by a byte budget
//! - LRU-style eviction (lowest cache counter wins)
//! - Automatic dirty page write-back with page checksums
//! - The freelist-first allocation discipline
//! - Pin tracking for cursors and the active transaction
//!
//! # Architecture
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        PageManager                          │
//! │  ┌──────────────┐  ┌───────────────────────────────────┐   │
//! │  │ pages        │  │  resident_bytes ≤ capacity        │   │
//! │  │ offset→Page  │─▶│  victim = lowest cache_counter    │   │
//! │  └──────────────┘  └───────────────────────────────────┘   │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────┐      │
//! │  │   device     │  │  lru_clock   │  │   counters   │      │
//! │  └──────────────┘  └──────────────┘  └──────────────┘      │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! For an `IN_MEMORY_DB` environment all pages are arena-resident for the
//! life of the environment: they are exempt from the byte budget (there is
//! nowhere to re-read them from), are never dirty, and a cache miss is an
//! invariant violation.

use std::collections::HashMap;
use std::fmt;

use log::trace;

use crate::common::{Error, FetchFlags, PageOffset, Result};
use crate::storage::{AllocKind, Device, Freelist, Page, PageType};
use crate::txn::TxnState;

/// Counters accumulated by the cache since the environment opened.
#[derive(Debug, Default)]
struct Counters {
    hits: u64,
    misses: u64,
    evictions: u64,
    pages_read: u64,
    pages_written: u64,
}

/// Point-in-time view of the cache: the residency budget and the
/// counters accumulated since the environment opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheInfo {
    /// Residency budget in bytes.
    pub capacity: usize,
    /// Bytes held by disk-backed resident pages.
    pub resident_bytes: usize,
    /// Resident page count (arena pages of an in-memory environment
    /// included).
    pub resident_pages: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub pages_read: u64,
    pub pages_written: u64,
}

impl CacheInfo {
    /// Fraction of fetches served from the resident set (0.0 to 1.0).
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }

    /// How full the byte budget is (0.0 to 1.0).
    pub fn utilization(&self) -> f64 {
        if self.capacity == 0 {
            0.0
        } else {
            self.resident_bytes as f64 / self.capacity as f64
        }
    }
}

impl fmt::Display for CacheInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{} bytes in {} pages; {} hits / {} misses ({:.0}% hit rate), {} evictions",
            self.resident_bytes,
            self.capacity,
            self.resident_pages,
            self.hits,
            self.misses,
            self.hit_rate() * 100.0,
            self.evictions
        )
    }
}

/// Manages the resident set of pages for one environment.
pub struct PageManager {
    /// All device I/O funnels through here.
    device: Device,

    /// Fixed per-environment page size in bytes.
    page_size: usize,

    /// Residency budget in bytes.
    capacity: usize,

    /// Flush dirty pages on every cache put.
    write_through: bool,

    /// Residency map: offset → page.
    pages: HashMap<u64, Page>,

    /// Bytes held by disk-backed resident pages.
    resident_bytes: usize,

    /// Monotonic clock stamped onto pages on access.
    lru_clock: u64,

    /// Offsets freed while not resident; reclaimed on the next flush.
    pending_free: Vec<u64>,

    counters: Counters,
}

impl PageManager {
    /// Create a page manager over a device.
    ///
    /// # Panics
    /// Panics if `capacity` cannot hold a single page.
    pub fn new(device: Device, page_size: usize, capacity: usize, write_through: bool) -> Self {
        assert!(capacity >= page_size, "cache capacity below one page");

        Self {
            device,
            page_size,
            capacity,
            write_through,
            pages: HashMap::new(),
            resident_bytes: 0,
            lru_clock: 0,
            pending_free: Vec::new(),
            counters: Counters::default(),
        }
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    #[inline]
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Bytes currently held by disk-backed resident pages.
    #[inline]
    pub fn resident_bytes(&self) -> usize {
        self.resident_bytes
    }

    #[inline]
    pub fn is_in_memory(&self) -> bool {
        self.device.is_in_memory()
    }

    /// Snapshot the cache's budget, residency and counters.
    pub fn cache_info(&self) -> CacheInfo {
        CacheInfo {
            capacity: self.capacity,
            resident_bytes: self.resident_bytes,
            resident_pages: self.pages.len(),
            hits: self.counters.hits,
            misses: self.counters.misses,
            evictions: self.counters.evictions,
            pages_read: self.counters.pages_read,
            pages_written: self.counters.pages_written,
        }
    }

    pub fn device_mut(&mut self) -> &mut Device {
        &mut self.device
    }

    /// Number of resident pages.
    pub fn resident_count(&self) -> usize {
        self.pages.len()
    }

    // ========================================================================
    // Public API: fetch and allocate
    // ========================================================================

    /// Fetch the page at `offset`.
    ///
    /// The transaction's own pages are consulted first (a transaction sees
    /// its uncommitted buffers), then the residency map; on a miss the page
    /// is read from the device, possibly evicting a victim to stay inside
    /// the budget.
    ///
    /// # Errors
    /// - `Error::KeyNotFound` if `ONLY_FROM_CACHE` is set and the page is
    ///   not resident
    /// - `Error::CacheFull` if the budget is exhausted and nothing is
    ///   evictable
    /// - `Error::IntegrityViolation` if the page fails its checksum
    /// - I/O errors from the device
    ///
    /// # Panics
    /// Panics on a miss in an in-memory environment: all pages of such an
    /// environment are arena-resident by construction.
    pub fn fetch_page(
        &mut self,
        txn: Option<&mut TxnState>,
        offset: PageOffset,
        flags: FetchFlags,
    ) -> Result<&mut Page> {
        assert!(!offset.is_null(), "fetch of the NULL page");

        // Pages registered with the transaction are resident by contract.
        if let Some(txn) = &txn {
            if txn.has_page(offset) {
                debug_assert!(self.pages.contains_key(&offset.0));
            }
        }

        if self.pages.contains_key(&offset.0) {
            self.lru_clock += 1;
            let clock = self.lru_clock;
            self.counters.hits += 1;

            let page = self.pages.get_mut(&offset.0).unwrap();
            page.touch(clock);
            return Ok(page);
        }

        if flags.contains(FetchFlags::ONLY_FROM_CACHE) {
            return Err(Error::KeyNotFound);
        }

        assert!(
            !self.device.is_in_memory(),
            "page fault in an in-memory environment"
        );

        self.make_room()?;

        let mut page = Page::new(self.page_size, PageType::Undefined);
        let kind = if self.device.disk().is_mapped() {
            AllocKind::Mapped
        } else {
            AllocKind::Heap
        };
        self.device.disk().read_at(offset.0, page.data_mut())?;
        page.set_offset(offset);
        page.set_alloc_kind(kind);
        page.verify()?;

        let header = page.persisted_header();
        page.set_page_type(header.page_type);
        page.set_db(if header.db == 0 { None } else { Some(header.db) });

        self.lru_clock += 1;
        page.touch(self.lru_clock);
        if let Some(txn) = txn {
            txn.add_page(offset);
            page.set_txn_pinned(true);
        }

        self.counters.misses += 1;
        self.counters.pages_read += 1;
        self.resident_bytes += self.page_size;
        trace!("fetched {} ({:?})", offset, page.page_type());

        Ok(self.pages.entry(offset.0).or_insert(page))
    }

    /// Allocate a fresh page of the given type.
    ///
    /// On disk the freelist is asked first (unless `IGNORE_FREELIST`);
    /// otherwise the file grows by one page. In an in-memory environment
    /// the page gets the next arena offset and simply stays resident.
    ///
    /// The page comes back zeroed, clean, with its offset stamped.
    ///
    /// # Errors
    /// - `Error::CacheFull` if the budget is exhausted and nothing is
    ///   evictable
    /// - I/O errors from the device
    pub fn alloc_page(
        &mut self,
        txn: Option<&mut TxnState>,
        ptype: PageType,
        db: Option<u16>,
        freelist: &mut Freelist,
        flags: FetchFlags,
    ) -> Result<&mut Page> {
        if self.device.is_in_memory() {
            let offset = self.device.arena().alloc_page_offset();
            let mut page = Page::new(self.page_size, ptype);
            page.set_offset(PageOffset::new(offset));
            page.set_db(db);
            self.lru_clock += 1;
            page.touch(self.lru_clock);
            if let Some(txn) = txn {
                txn.add_page(PageOffset::new(offset));
                page.set_txn_pinned(true);
            }
            return Ok(self.pages.entry(offset).or_insert(page));
        }

        self.make_room()?;

        let recycled = if flags.contains(FetchFlags::IGNORE_FREELIST) {
            None
        } else {
            freelist.alloc_area(self.page_size as u64)
        };
        let offset = match recycled {
            Some(offset) => offset,
            None => {
                let disk = self.device.disk();
                let end = disk.len();
                disk.truncate(end + self.page_size as u64)?;
                end
            }
        };

        let mut page = Page::new(self.page_size, ptype);
        page.set_offset(PageOffset::new(offset));
        page.set_db(db);
        if recycled.is_some() {
            // A recycled area still holds the previous page's bytes on
            // disk; the zeroed buffer must win if this page is evicted
            // before its first write-back.
            page.mark_dirty();
        }

        self.lru_clock += 1;
        page.touch(self.lru_clock);
        if let Some(txn) = txn {
            txn.add_page(PageOffset::new(offset));
            page.set_txn_pinned(true);
        }

        self.resident_bytes += self.page_size;
        trace!("allocated {} ({:?})", page.offset(), ptype);

        Ok(self.pages.entry(offset).or_insert(page))
    }

    // ========================================================================
    // Public API: flush and free
    // ========================================================================

    /// Write a page through if the environment is in write-through mode.
    ///
    /// `_flags` is a stable slot for a future force-write flag.
    pub fn flush_page(&mut self, offset: PageOffset, _flags: FetchFlags) -> Result<()> {
        if !self.write_through || self.device.is_in_memory() {
            return Ok(());
        }
        if self.pages.get(&offset.0).is_some_and(Page::is_dirty) {
            self.write_page(offset)?;
        }
        Ok(())
    }

    /// Mark a page as delete-pending.
    ///
    /// The page stays resident (and is never handed out again) until the
    /// next flush reclaims its area. In an in-memory environment the page
    /// is dropped immediately.
    pub fn free_page(&mut self, offset: PageOffset) {
        if self.device.is_in_memory() {
            self.pages.remove(&offset.0);
            return;
        }

        match self.pages.get_mut(&offset.0) {
            Some(page) => {
                page.mark_delete_pending();
                page.clear_dirty();
            }
            None => self.pending_free.push(offset.0),
        }
        trace!("freed {}", offset);
    }

    /// Walk the cache: reclaim delete-pending pages, write dirty pages,
    /// and (with `drop_clean`) release every unpinned buffer.
    pub fn flush_all(&mut self, freelist: &mut Freelist, drop_clean: bool) -> Result<()> {
        if self.device.is_in_memory() {
            return Ok(());
        }

        let offsets: Vec<u64> = self.pages.keys().copied().collect();
        for raw in offsets {
            let offset = PageOffset::new(raw);
            let (delete_pending, dirty, evictable) = {
                let page = &self.pages[&raw];
                (page.is_delete_pending(), page.is_dirty(), page.is_evictable())
            };

            if delete_pending {
                self.pages.remove(&raw);
                self.resident_bytes -= self.page_size;
                freelist.add_area(raw, self.page_size as u64);
                continue;
            }
            if dirty {
                self.write_page(offset)?;
            }
            if drop_clean && evictable {
                self.pages.remove(&raw);
                self.resident_bytes -= self.page_size;
            }
        }

        for raw in std::mem::take(&mut self.pending_free) {
            freelist.add_area(raw, self.page_size as u64);
        }
        Ok(())
    }

    // ========================================================================
    // Public API: pins
    // ========================================================================

    /// Pin a page on behalf of a cursor coupling to it.
    pub fn pin_cursor(&mut self, offset: PageOffset) {
        if let Some(page) = self.pages.get_mut(&offset.0) {
            page.pin_cursor();
        }
    }

    /// Release a cursor pin. Tolerates pages already released by a flush.
    pub fn unpin_cursor(&mut self, offset: PageOffset) {
        if let Some(page) = self.pages.get_mut(&offset.0) {
            page.unpin_cursor();
        }
    }

    /// Release the transaction pins when a transaction ends.
    pub fn release_txn_pins<'a>(&mut self, offsets: impl Iterator<Item = &'a PageOffset>) {
        for offset in offsets {
            if let Some(page) = self.pages.get_mut(&offset.0) {
                page.set_txn_pinned(false);
            }
        }
    }

    // ========================================================================
    // Internal: write-back and eviction
    // ========================================================================

    /// Seal and write one resident page, clearing its dirty flag.
    ///
    /// # Panics
    /// Panics if the page is not resident: writing a page whose buffer has
    /// been released is an invariant violation.
    pub(crate) fn write_page(&mut self, offset: PageOffset) -> Result<()> {
        assert!(
            !self.device.is_in_memory(),
            "write-back in an in-memory environment"
        );

        let page = self
            .pages
            .get_mut(&offset.0)
            .expect("write of a page whose buffer was released");
        page.seal();

        let Device::Disk(disk) = &mut self.device else {
            unreachable!()
        };
        disk.write_at(offset.0, page.data())?;
        page.clear_dirty();

        self.counters.pages_written += 1;
        trace!("wrote back {}", offset);
        Ok(())
    }

    /// Evict victims until one more page fits in the budget.
    fn make_room(&mut self) -> Result<()> {
        while self.resident_bytes + self.page_size > self.capacity {
            self.evict_one()?;
        }
        Ok(())
    }

    /// Evict the unused page with the lowest cache counter.
    ///
    /// Dirty victims are written through before their buffer is released;
    /// delete-pending pages are skipped (they are reclaimed by flush, not
    /// recycled).
    fn evict_one(&mut self) -> Result<()> {
        let victim = self
            .pages
            .values()
            .filter(|p| p.is_evictable() && !p.is_delete_pending())
            .min_by_key(|p| p.cache_counter())
            .map(Page::offset);

        let Some(offset) = victim else {
            return Err(Error::CacheFull);
        };

        if self.pages[&offset.0].is_dirty() {
            self.write_page(offset)?;
        }

        self.pages.remove(&offset.0);
        self.resident_bytes -= self.page_size;
        self.counters.evictions += 1;
        trace!("evicted {}", offset);
        Ok(())
    }
}
