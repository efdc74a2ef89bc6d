//! Page - the fundamental unit of I/O and caching.
//!
//! A [`Page`] couples a page-sized byte buffer with the metadata the cache
//! and the transaction layer need: the on-disk offset, the page type, the
//! owning database, the dirty flag, and the non-persistent bookkeeping
//! flags (allocation kind, delete-pending, pins, LRU counter).

use crate::common::{PageOffset, Result};

/// Type of page stored on disk.
///
/// Uses `#[repr(u8)]` to guarantee a 1-byte representation for
/// serialization.
#[repr(u8)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum PageType {
    /// Uninitialized page.
    #[default]
    Undefined = 0,
    /// The environment header page (offset 0).
    Header = 1,
    /// Root node of a B+tree.
    BRoot = 2,
    /// Inner or leaf node of a B+tree.
    BIndex = 3,
    /// Page of the persistent freelist chain.
    Freelist = 4,
    /// Page belonging to a blob area.
    Blob = 5,
}

impl PageType {
    /// Convert from u8, returning Undefined for unknown values.
    pub fn from_u8(value: u8) -> Self {
        match value {
            1 => PageType::Header,
            2 => PageType::BRoot,
            3 => PageType::BIndex,
            4 => PageType::Freelist,
            5 => PageType::Blob,
            _ => PageType::Undefined,
        }
    }
}

/// How a page buffer was obtained.
///
/// Buffers sourced from the memory map were copied out of it; the flag is
/// kept so the release path and diagnostics can tell the two apart.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum AllocKind {
    #[default]
    Heap,
    Mapped,
}

/// Metadata persisted at the beginning of every structured page.
///
/// # Layout (8 bytes)
/// ```text
/// Offset  Size  Field
/// ------  ----  -----
/// 0       1     page_type (PageType as u8)
/// 1       1     reserved
/// 2       2     owning database name (little-endian, 0 = none)
/// 4       4     checksum (CRC32, little-endian)
/// ```
///
/// # Checksum
/// The checksum is computed over the entire page with the checksum field
/// itself set to zero. A stored checksum of zero means "never written"
/// and is not verified.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PersistedHeader {
    pub page_type: PageType,
    pub db: u16,
    pub checksum: u32,
}

impl PersistedHeader {
    /// Size of the persisted header in bytes.
    pub const SIZE: usize = 8;

    pub const OFFSET_PAGE_TYPE: usize = 0;
    pub const OFFSET_DB: usize = 2;
    pub const OFFSET_CHECKSUM: usize = 4;

    /// Read a header from the beginning of a page buffer.
    ///
    /// # Panics
    /// Panics if `data.len() < PersistedHeader::SIZE`.
    pub fn from_bytes(data: &[u8]) -> Self {
        assert!(data.len() >= Self::SIZE, "buffer too small for PersistedHeader");

        let page_type = PageType::from_u8(data[Self::OFFSET_PAGE_TYPE]);
        let db = u16::from_le_bytes([data[Self::OFFSET_DB], data[Self::OFFSET_DB + 1]]);
        let checksum = u32::from_le_bytes([
            data[Self::OFFSET_CHECKSUM],
            data[Self::OFFSET_CHECKSUM + 1],
            data[Self::OFFSET_CHECKSUM + 2],
            data[Self::OFFSET_CHECKSUM + 3],
        ]);

        Self {
            page_type,
            db,
            checksum,
        }
    }

    /// Write this header to the beginning of a page buffer.
    ///
    /// # Panics
    /// Panics if `data.len() < PersistedHeader::SIZE`.
    pub fn write_to(&self, data: &mut [u8]) {
        assert!(data.len() >= Self::SIZE, "buffer too small for PersistedHeader");

        data[Self::OFFSET_PAGE_TYPE] = self.page_type as u8;
        data[Self::OFFSET_PAGE_TYPE + 1] = 0;
        data[Self::OFFSET_DB..Self::OFFSET_DB + 2].copy_from_slice(&self.db.to_le_bytes());
        data[Self::OFFSET_CHECKSUM..Self::OFFSET_CHECKSUM + 4]
            .copy_from_slice(&self.checksum.to_le_bytes());
    }

    /// Compute the CRC32 checksum of a page buffer.
    ///
    /// The checksum field (bytes 4-8) is fed as zeros so the checksum does
    /// not include itself.
    pub fn compute_checksum(page_data: &[u8]) -> u32 {
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&page_data[..Self::OFFSET_CHECKSUM]);
        hasher.update(&[0u8; 4]);
        hasher.update(&page_data[Self::OFFSET_CHECKSUM + 4..]);
        hasher.finalize()
    }
}

/// A resident page: buffer plus cache metadata.
///
/// The buffer is owned; creating a `Page` allocates it and every early
/// error return drops it, so a partially constructed page can never leak.
pub struct Page {
    /// Byte offset of this page in the file; NULL until the page has been
    /// placed on disk (or given its arena address).
    offset: PageOffset,
    ptype: PageType,
    /// Owning database, if any.
    db: Option<u16>,
    dirty: bool,
    delete_pending: bool,
    alloc_kind: AllocKind,
    /// Pages coupled to by cursors; not evictable while non-zero.
    cursor_pins: u32,
    /// Registered with the active transaction; not evictable while set.
    txn_pinned: bool,
    /// LRU clock value; the eviction victim is the lowest.
    cache_counter: u64,
    buffer: Box<[u8]>,
}

impl Page {
    /// Create a new zeroed page of `page_size` bytes.
    pub fn new(page_size: usize, ptype: PageType) -> Self {
        Self {
            offset: PageOffset::NULL,
            ptype,
            db: None,
            dirty: false,
            delete_pending: false,
            alloc_kind: AllocKind::Heap,
            cursor_pins: 0,
            txn_pinned: false,
            cache_counter: 0,
            buffer: vec![0u8; page_size].into_boxed_slice(),
        }
    }

    // ========================================================================
    // Buffer access
    // ========================================================================

    #[inline]
    pub fn data(&self) -> &[u8] {
        &self.buffer
    }

    #[inline]
    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.buffer
    }

    /// The page body after the persisted header.
    #[inline]
    pub fn payload(&self) -> &[u8] {
        &self.buffer[PersistedHeader::SIZE..]
    }

    #[inline]
    pub fn payload_mut(&mut self) -> &mut [u8] {
        &mut self.buffer[PersistedHeader::SIZE..]
    }

    /// Zero the buffer.
    pub fn reset_buffer(&mut self) {
        self.buffer.fill(0);
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.buffer.len()
    }

    // ========================================================================
    // Persisted header
    // ========================================================================

    pub fn persisted_header(&self) -> PersistedHeader {
        PersistedHeader::from_bytes(&self.buffer)
    }

    /// Stamp the persisted header from the descriptor state and store a
    /// fresh checksum. Called on the write-back path.
    pub fn seal(&mut self) {
        let mut header = PersistedHeader {
            page_type: self.ptype,
            db: self.db.unwrap_or(0),
            checksum: 0,
        };
        header.write_to(&mut self.buffer);
        header.checksum = PersistedHeader::compute_checksum(&self.buffer);
        header.write_to(&mut self.buffer);
    }

    /// Verify the stored checksum after a read.
    ///
    /// A stored checksum of zero (page never written back) passes.
    pub fn verify(&self) -> Result<()> {
        let header = self.persisted_header();
        if header.checksum != 0
            && header.checksum != PersistedHeader::compute_checksum(&self.buffer)
        {
            return Err(crate::common::Error::IntegrityViolation(self.offset.0));
        }
        Ok(())
    }

    // ========================================================================
    // Descriptor state
    // ========================================================================

    #[inline]
    pub fn offset(&self) -> PageOffset {
        self.offset
    }

    pub(crate) fn set_offset(&mut self, offset: PageOffset) {
        self.offset = offset;
    }

    #[inline]
    pub fn page_type(&self) -> PageType {
        self.ptype
    }

    pub(crate) fn set_page_type(&mut self, ptype: PageType) {
        self.ptype = ptype;
    }

    #[inline]
    pub fn db(&self) -> Option<u16> {
        self.db
    }

    pub(crate) fn set_db(&mut self, db: Option<u16>) {
        self.db = db;
    }

    #[inline]
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub(crate) fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    pub(crate) fn clear_dirty(&mut self) {
        self.dirty = false;
    }

    #[inline]
    pub fn is_delete_pending(&self) -> bool {
        self.delete_pending
    }

    pub(crate) fn mark_delete_pending(&mut self) {
        self.delete_pending = true;
    }

    #[inline]
    pub fn alloc_kind(&self) -> AllocKind {
        self.alloc_kind
    }

    pub(crate) fn set_alloc_kind(&mut self, kind: AllocKind) {
        self.alloc_kind = kind;
    }

    // ========================================================================
    // Pins and the LRU counter
    // ========================================================================

    pub(crate) fn pin_cursor(&mut self) {
        self.cursor_pins += 1;
    }

    /// # Panics
    /// Panics on pin underflow; unpinning must match pinning.
    pub(crate) fn unpin_cursor(&mut self) {
        assert!(self.cursor_pins > 0, "cursor pin underflow");
        self.cursor_pins -= 1;
    }

    #[inline]
    pub fn cursor_pins(&self) -> u32 {
        self.cursor_pins
    }

    pub(crate) fn set_txn_pinned(&mut self, pinned: bool) {
        self.txn_pinned = pinned;
    }

    #[inline]
    pub fn is_txn_pinned(&self) -> bool {
        self.txn_pinned
    }

    /// A page is evictable when nothing holds it.
    #[inline]
    pub fn is_evictable(&self) -> bool {
        self.cursor_pins == 0 && !self.txn_pinned
    }

    #[inline]
    pub fn cache_counter(&self) -> u64 {
        self.cache_counter
    }

    pub(crate) fn touch(&mut self, counter: u64) {
        self.cache_counter = counter;
    }
}
