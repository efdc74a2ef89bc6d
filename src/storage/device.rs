//! Device layer - raw byte-addressed I/O for the environment.
//!
//! The [`Device`] hides where bytes live: a single file on disk (with an
//! optional read-only memory map) or, for `IN_MEMORY_DB` environments, an
//! arena that never touches a file descriptor.
//!
//! # Thread Safety
//! The device is **single-threaded**; the environment core serializes all
//! access to it behind the per-environment mutex.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use memmap2::Mmap;
use std::collections::HashMap;

use crate::common::{Error, Result};

/// File-backed byte storage.
///
/// # File Layout
/// Pages are addressed by byte offset; page 0 starts at offset 0 and every
/// page starts at a multiple of the environment page size. Blob areas are
/// page-aligned runs of bytes between and after the structured pages.
///
/// # Memory mapping
/// With `use_mmap`, reads are served from a read-only map of the file and
/// writes still go through positional I/O (the map observes them through
/// the shared file). The map is dropped and re-created whenever the file
/// grows past its mapped length.
pub struct DiskDevice {
    file: File,
    /// Current file length in bytes.
    len: u64,
    use_mmap: bool,
    map: Option<Mmap>,
}

impl DiskDevice {
    /// Create a new database file.
    ///
    /// # Errors
    /// Returns an error if the file already exists or cannot be created.
    pub fn create<P: AsRef<Path>>(path: P, use_mmap: bool) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)?;

        Ok(Self {
            file,
            len: 0,
            use_mmap,
            map: None,
        })
    }

    /// Open an existing database file.
    ///
    /// # Errors
    /// Returns an error if the file doesn't exist or cannot be opened.
    pub fn open<P: AsRef<Path>>(path: P, use_mmap: bool) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        let len = file.metadata()?.len();

        let mut device = Self {
            file,
            len,
            use_mmap,
            map: None,
        };
        if use_mmap {
            device.map()?;
        }
        Ok(device)
    }

    /// Open an existing database file, or create if it doesn't exist.
    pub fn open_or_create<P: AsRef<Path>>(path: P, use_mmap: bool) -> Result<Self> {
        if path.as_ref().exists() {
            Self::open(path, use_mmap)
        } else {
            Self::create(path, use_mmap)
        }
    }

    /// (Re)establish the memory map over the current file length.
    pub fn map(&mut self) -> Result<()> {
        self.map = None;
        if self.len > 0 {
            // Safety: the map is read-only and this process is the only
            // writer of the file while the environment is open.
            self.map = Some(unsafe { Mmap::map(&self.file)? });
        }
        Ok(())
    }

    /// Drop the memory map.
    pub fn unmap(&mut self) {
        self.map = None;
    }

    /// Positional read of exactly `buf.len()` bytes at `offset`.
    pub fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let end = offset
            .checked_add(buf.len() as u64)
            .ok_or(Error::InvParameter("read range overflows"))?;
        if end > self.len {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "read past end of device",
            )));
        }

        if let Some(map) = &self.map {
            if end <= map.len() as u64 {
                buf.copy_from_slice(&map[offset as usize..end as usize]);
                return Ok(());
            }
        }

        self.file.seek(SeekFrom::Start(offset))?;
        self.file.read_exact(buf)?;
        Ok(())
    }

    /// Positional write of `buf` at `offset`.
    pub fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<()> {
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(buf)?;

        let end = offset + buf.len() as u64;
        if end > self.len {
            self.len = end;
            if self.use_mmap {
                self.map()?;
            }
        }
        Ok(())
    }

    /// Extend (or shrink) the file to `new_len` bytes.
    pub fn truncate(&mut self, new_len: u64) -> Result<()> {
        self.file.set_len(new_len)?;
        self.len = new_len;
        if self.use_mmap {
            self.map()?;
        }
        Ok(())
    }

    /// Current length of the file in bytes.
    #[inline]
    pub fn len(&self) -> u64 {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Flush file contents to stable storage.
    pub fn sync(&mut self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }

    #[inline]
    pub fn is_mapped(&self) -> bool {
        self.map.is_some()
    }
}

/// Arena storage for `IN_MEMORY_DB` environments.
///
/// Page offsets are synthetic (page-size aligned, handed out in order) and
/// blobs are plain owned byte vectors keyed by synthetic ids. Nothing here
/// is ever written anywhere.
pub struct MemoryArena {
    page_size: usize,
    next_page: u64,
    next_blob: u64,
    blobs: HashMap<u64, Vec<u8>>,
}

impl MemoryArena {
    pub fn new(page_size: usize) -> Self {
        Self {
            page_size,
            // Offset 0 stays the NULL sentinel.
            next_page: page_size as u64,
            next_blob: 8,
            blobs: HashMap::new(),
        }
    }

    /// Hand out the next synthetic page offset.
    pub fn alloc_page_offset(&mut self) -> u64 {
        let offset = self.next_page;
        self.next_page += self.page_size as u64;
        offset
    }

    pub fn store_blob(&mut self, bytes: Vec<u8>) -> u64 {
        let id = self.next_blob;
        self.next_blob += 8;
        self.blobs.insert(id, bytes);
        id
    }

    pub fn read_blob(&self, id: u64) -> Result<&[u8]> {
        self.blobs
            .get(&id)
            .map(Vec::as_slice)
            .ok_or(Error::KeyNotFound)
    }

    pub fn free_blob(&mut self, id: u64) {
        self.blobs.remove(&id);
    }
}

/// Where the environment's bytes live.
pub enum Device {
    Disk(DiskDevice),
    Memory(MemoryArena),
}

impl Device {
    /// Short-circuit accessor for the disk variant.
    ///
    /// # Panics
    /// Panics for an in-memory environment; no path in the engine performs
    /// device I/O for one.
    pub fn disk(&mut self) -> &mut DiskDevice {
        match self {
            Device::Disk(d) => d,
            Device::Memory(_) => panic!("device I/O attempted on an in-memory environment"),
        }
    }

    pub fn arena(&mut self) -> &mut MemoryArena {
        match self {
            Device::Memory(a) => a,
            Device::Disk(_) => panic!("arena access on a disk-backed environment"),
        }
    }

    #[inline]
    pub fn is_in_memory(&self) -> bool {
        matches!(self, Device::Memory(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_create_new_device() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.db");

        let device = DiskDevice::create(&path, false).unwrap();
        assert_eq!(device.len(), 0);
        assert!(device.is_empty());
    }

    #[test]
    fn test_create_existing_fails() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.db");

        DiskDevice::create(&path, false).unwrap();
        assert!(DiskDevice::create(&path, false).is_err());
    }

    #[test]
    fn test_open_nonexistent_fails() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nonexistent.db");

        assert!(DiskDevice::open(&path, false).is_err());
    }

    #[test]
    fn test_write_and_read_back() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.db");

        let mut device = DiskDevice::create(&path, false).unwrap();
        device.write_at(0, &[0xAB; 64]).unwrap();
        device.write_at(4096, &[0xCD; 64]).unwrap();
        assert_eq!(device.len(), 4096 + 64);

        let mut buf = [0u8; 64];
        device.read_at(0, &mut buf).unwrap();
        assert_eq!(buf, [0xAB; 64]);
        device.read_at(4096, &mut buf).unwrap();
        assert_eq!(buf, [0xCD; 64]);
    }

    #[test]
    fn test_read_past_end_fails() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.db");

        let mut device = DiskDevice::create(&path, false).unwrap();
        device.write_at(0, &[0u8; 16]).unwrap();

        let mut buf = [0u8; 32];
        assert!(device.read_at(0, &mut buf).is_err());
    }

    #[test]
    fn test_truncate_extends() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.db");

        let mut device = DiskDevice::create(&path, false).unwrap();
        device.truncate(8192).unwrap();
        assert_eq!(device.len(), 8192);

        // The extension reads back as zeros.
        let mut buf = [0xFFu8; 32];
        device.read_at(8000, &mut buf).unwrap();
        assert_eq!(buf, [0u8; 32]);
    }

    #[test]
    fn test_mmap_read_path() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.db");

        {
            let mut device = DiskDevice::create(&path, false).unwrap();
            device.write_at(0, &[0x42; 4096]).unwrap();
            device.sync().unwrap();
        }

        let mut device = DiskDevice::open(&path, true).unwrap();
        assert!(device.is_mapped());

        let mut buf = [0u8; 16];
        device.read_at(100, &mut buf).unwrap();
        assert_eq!(buf, [0x42; 16]);
    }

    #[test]
    fn test_mmap_sees_growth() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.db");

        let mut device = DiskDevice::create(&path, true).unwrap();
        device.write_at(0, &[1u8; 4096]).unwrap();
        device.write_at(4096, &[2u8; 4096]).unwrap();

        let mut buf = [0u8; 8];
        device.read_at(4096, &mut buf).unwrap();
        assert_eq!(buf, [2u8; 8]);
    }

    #[test]
    fn test_persistence_across_open() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.db");

        {
            let mut device = DiskDevice::create(&path, false).unwrap();
            device.write_at(0, b"persistent").unwrap();
            device.sync().unwrap();
        }

        {
            let mut device = DiskDevice::open(&path, false).unwrap();
            let mut buf = [0u8; 10];
            device.read_at(0, &mut buf).unwrap();
            assert_eq!(&buf, b"persistent");
        }
    }

    #[test]
    fn test_arena_pages_and_blobs() {
        let mut arena = MemoryArena::new(4096);

        let first = arena.alloc_page_offset();
        let second = arena.alloc_page_offset();
        assert_eq!(first, 4096);
        assert_eq!(second, 8192);

        let id = arena.store_blob(vec![1, 2, 3]);
        assert_eq!(arena.read_blob(id).unwrap(), &[1, 2, 3]);

        arena.free_blob(id);
        assert!(matches!(arena.read_blob(id), Err(Error::KeyNotFound)));
    }
}
