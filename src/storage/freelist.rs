//! Persistent freelist - accounting of reusable areas in the file.
//!
//! Freed pages and blob areas land here instead of leaking; allocation
//! consults the freelist before the file is extended. The list is loaded
//! with the environment header and written back as a chain of freelist
//! pages rooted in the header.

use crate::common::{PageOffset, Result};
use crate::storage::device::DiskDevice;
use crate::storage::page::{Page, PageType, PersistedHeader};

/// In-page layout of a freelist chain page, after the persisted header:
///
/// ```text
/// Offset  Size  Field
/// ------  ----  -----
/// 8       8     next chain page offset (0 = end of chain)
/// 16      2     entry count (little-endian)
/// 18      6     reserved
/// 24      16×N  entries: { offset u64, size u64 }
/// ```
const OFFSET_NEXT: usize = PersistedHeader::SIZE;
const OFFSET_COUNT: usize = PersistedHeader::SIZE + 8;
const OFFSET_ENTRIES: usize = PersistedHeader::SIZE + 16;
const ENTRY_SIZE: usize = 16;

/// A free area: page-aligned offset and size in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreeArea {
    pub offset: u64,
    pub size: u64,
}

/// Persistent accounting of freed areas.
///
/// Areas are kept sorted by offset and coalesced so that adjacent frees
/// merge back into one area.
pub struct Freelist {
    areas: Vec<FreeArea>,
    /// Pages already owned by the persisted chain; reused on flush.
    chain: Vec<PageOffset>,
    dirty: bool,
}

impl Freelist {
    /// Create an empty freelist.
    pub fn new() -> Self {
        Self {
            areas: Vec::new(),
            chain: Vec::new(),
            dirty: false,
        }
    }

    /// Entries per chain page for the given page size.
    fn entries_per_page(page_size: usize) -> usize {
        (page_size - OFFSET_ENTRIES) / ENTRY_SIZE
    }

    /// Load the freelist from the chain rooted at `root`.
    pub fn load(device: &mut DiskDevice, page_size: usize, root: PageOffset) -> Result<Self> {
        let mut list = Self::new();

        let mut next = root;
        while !next.is_null() {
            let mut page = Page::new(page_size, PageType::Freelist);
            device.read_at(next.0, page.data_mut())?;
            page.set_offset(next);
            page.verify()?;

            let data = page.data();
            let count = u16::from_le_bytes([data[OFFSET_COUNT], data[OFFSET_COUNT + 1]]) as usize;
            for i in 0..count {
                let at = OFFSET_ENTRIES + i * ENTRY_SIZE;
                let offset = u64::from_le_bytes(data[at..at + 8].try_into().unwrap());
                let size = u64::from_le_bytes(data[at + 8..at + 16].try_into().unwrap());
                list.areas.push(FreeArea { offset, size });
            }

            list.chain.push(next);
            next = PageOffset::new(u64::from_le_bytes(
                data[OFFSET_NEXT..OFFSET_NEXT + 8].try_into().unwrap(),
            ));
        }

        list.areas.sort_by_key(|a| a.offset);
        Ok(list)
    }

    /// Write the freelist back as a page chain; returns the chain root for
    /// the environment header.
    ///
    /// Existing chain pages are reused; if more are needed the file is
    /// extended directly (the freelist never allocates from itself). A
    /// chain that shrank returns its surplus pages to the area set before
    /// anything is written, so the surplus is persisted by this same call
    /// and survives a close/reopen.
    pub fn flush(&mut self, device: &mut DiskDevice, page_size: usize) -> Result<PageOffset> {
        if !self.dirty && !self.chain.is_empty() {
            return Ok(self.chain[0]);
        }
        if self.areas.is_empty() && self.chain.is_empty() {
            return Ok(PageOffset::NULL);
        }

        let per_page = Self::entries_per_page(page_size);

        // Releasing surplus chain pages adds areas (and may coalesce),
        // which changes how many chain pages are needed; settle first.
        let pages_needed = loop {
            let pages_needed = self.areas.len().div_ceil(per_page).max(1);
            if self.chain.len() <= pages_needed {
                break pages_needed;
            }
            for page in self.chain.split_off(pages_needed) {
                self.add_area(page.0, page_size as u64);
            }
        };

        // Grow the chain by extending the file.
        while self.chain.len() < pages_needed {
            let offset = device.len();
            device.truncate(offset + page_size as u64)?;
            self.chain.push(PageOffset::new(offset));
        }

        for (index, chunk_start) in (0..pages_needed).map(|i| (i, i * per_page)) {
            let mut page = Page::new(page_size, PageType::Freelist);
            page.set_offset(self.chain[index]);

            let next = if index + 1 < pages_needed {
                self.chain[index + 1].0
            } else {
                0
            };
            let chunk = &self.areas[chunk_start..self.areas.len().min(chunk_start + per_page)];

            let data = page.data_mut();
            data[OFFSET_NEXT..OFFSET_NEXT + 8].copy_from_slice(&next.to_le_bytes());
            data[OFFSET_COUNT..OFFSET_COUNT + 2]
                .copy_from_slice(&(chunk.len() as u16).to_le_bytes());
            for (i, area) in chunk.iter().enumerate() {
                let at = OFFSET_ENTRIES + i * ENTRY_SIZE;
                data[at..at + 8].copy_from_slice(&area.offset.to_le_bytes());
                data[at + 8..at + 16].copy_from_slice(&area.size.to_le_bytes());
            }

            page.seal();
            device.write_at(page.offset().0, page.data())?;
        }

        self.dirty = false;
        Ok(self.chain[0])
    }

    /// Carve `size` bytes out of the freelist.
    ///
    /// Returns a page-aligned offset, or `None` when no area is large
    /// enough (the caller extends the file instead). The returned area is
    /// no longer on the list.
    pub fn alloc_area(&mut self, size: u64) -> Option<u64> {
        let index = self.areas.iter().position(|a| a.size >= size)?;
        let area = self.areas[index];

        if area.size == size {
            self.areas.remove(index);
        } else {
            self.areas[index] = FreeArea {
                offset: area.offset + size,
                size: area.size - size,
            };
        }
        self.dirty = true;
        Some(area.offset)
    }

    /// Return an area to the freelist, coalescing with its neighbours.
    pub fn add_area(&mut self, offset: u64, size: u64) {
        debug_assert!(size > 0);

        let index = self.areas.partition_point(|a| a.offset < offset);
        self.areas.insert(index, FreeArea { offset, size });

        // Merge with the successor, then the predecessor.
        if index + 1 < self.areas.len()
            && self.areas[index].offset + self.areas[index].size == self.areas[index + 1].offset
        {
            self.areas[index].size += self.areas[index + 1].size;
            self.areas.remove(index + 1);
        }
        if index > 0
            && self.areas[index - 1].offset + self.areas[index - 1].size
                == self.areas[index].offset
        {
            self.areas[index - 1].size += self.areas[index].size;
            self.areas.remove(index);
        }
        self.dirty = true;
    }

    /// Number of distinct free areas (after coalescing).
    pub fn area_count(&self) -> usize {
        self.areas.len()
    }

    /// Total free bytes on the list.
    pub fn free_bytes(&self) -> u64 {
        self.areas.iter().map(|a| a.size).sum()
    }
}

impl Default for Freelist {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_alloc_from_empty() {
        let mut list = Freelist::new();
        assert_eq!(list.alloc_area(4096), None);
    }

    #[test]
    fn test_add_then_alloc() {
        let mut list = Freelist::new();
        list.add_area(4096, 4096);

        assert_eq!(list.alloc_area(4096), Some(4096));
        // The area is gone now.
        assert_eq!(list.alloc_area(4096), None);
    }

    #[test]
    fn test_alloc_splits_large_area() {
        let mut list = Freelist::new();
        list.add_area(8192, 3 * 4096);

        assert_eq!(list.alloc_area(4096), Some(8192));
        assert_eq!(list.alloc_area(4096), Some(8192 + 4096));
        assert_eq!(list.alloc_area(4096), Some(8192 + 2 * 4096));
        assert_eq!(list.alloc_area(4096), None);
    }

    #[test]
    fn test_coalescing() {
        let mut list = Freelist::new();
        list.add_area(4096, 4096);
        list.add_area(12288, 4096);
        assert_eq!(list.area_count(), 2);

        // Filling the hole merges all three into one area.
        list.add_area(8192, 4096);
        assert_eq!(list.area_count(), 1);
        assert_eq!(list.alloc_area(3 * 4096), Some(4096));
    }

    #[test]
    fn test_too_small_areas_are_skipped() {
        let mut list = Freelist::new();
        list.add_area(4096, 1024);
        list.add_area(8192, 8192);

        assert_eq!(list.alloc_area(4096), Some(8192));
    }

    #[test]
    fn test_flush_and_load_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.db");
        let mut device = DiskDevice::create(&path, false).unwrap();
        // Simulate a file that already has a header page.
        device.truncate(4096).unwrap();

        let mut list = Freelist::new();
        list.add_area(8192, 4096);
        list.add_area(20480, 8192);

        let root = list.flush(&mut device, 4096).unwrap();
        assert!(!root.is_null());

        let loaded = Freelist::load(&mut device, 4096, root).unwrap();
        assert_eq!(loaded.area_count(), 2);
        assert_eq!(loaded.free_bytes(), 4096 + 8192);
    }

    #[test]
    fn test_shrinking_chain_persists_surplus() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.db");
        let mut device = DiskDevice::create(&path, false).unwrap();
        device.truncate(4096).unwrap();

        // Enough distinct areas for a three-page chain.
        let per_page = (4096 - 24) / 16;
        let mut list = Freelist::new();
        for i in 0..(2 * per_page + 10) {
            list.add_area(1 << 30 | (i as u64 * 8192), 4096);
        }
        list.flush(&mut device, 4096).unwrap();
        assert_eq!(list.chain.len(), 3);

        // Drain most areas: the chain shrinks and the surplus pages must
        // come back as free areas in the same flush.
        while list.area_count() > 4 {
            list.alloc_area(4096);
        }
        let expected = list.free_bytes() + 2 * 4096;
        let root = list.flush(&mut device, 4096).unwrap();
        assert_eq!(list.chain.len(), 1);
        assert_eq!(list.free_bytes(), expected);

        // A reload sees the surplus pages too, not just the drained areas.
        let loaded = Freelist::load(&mut device, 4096, root).unwrap();
        assert_eq!(loaded.free_bytes(), list.free_bytes());
    }

    #[test]
    fn test_flush_spills_to_chain() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.db");
        let mut device = DiskDevice::create(&path, false).unwrap();
        device.truncate(4096).unwrap();

        // More distinct (non-adjacent) areas than one page holds.
        let per_page = (4096 - 24) / 16;
        let mut list = Freelist::new();
        for i in 0..(per_page + 10) {
            list.add_area(1 << 30 | (i as u64 * 8192), 4096);
        }

        let root = list.flush(&mut device, 4096).unwrap();
        let loaded = Freelist::load(&mut device, 4096, root).unwrap();
        assert_eq!(loaded.area_count(), per_page + 10);
    }
}
