//! Per-key duplicate tables.
//!
//! A key with more than one record keeps them in a duplicate table: a blob
//! holding `count u32` followed by one 13-byte slot per duplicate
//! `{flags u8, size u32, payload u64}`. Slot payloads follow the same rule
//! as leaf entries (inline bytes or a record blob id).
//!
//! Tables are rewritten wholesale: load, modify, free the old blob, store
//! the new one.

use crate::common::{Error, Result};
use crate::storage::blob;
use crate::storage::{Device, Freelist};

const SLOT_SIZE: usize = 13;

/// One duplicate: record flags, size and payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DupEntry {
    pub flags: u8,
    pub size: u32,
    pub payload: u64,
}

/// An in-memory duplicate table.
#[derive(Debug, Clone, Default)]
pub struct DupTable {
    pub entries: Vec<DupEntry>,
}

impl DupTable {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Load a duplicate table from its blob.
pub fn load(device: &mut Device, table_id: u64) -> Result<DupTable> {
    let bytes = blob::blob_read(device, table_id)?;
    if bytes.len() < 4 {
        return Err(Error::InvParameter("truncated duplicate table"));
    }

    let count = u32::from_le_bytes(bytes[..4].try_into().unwrap()) as usize;
    if bytes.len() < 4 + count * SLOT_SIZE {
        return Err(Error::InvParameter("truncated duplicate table"));
    }

    let mut entries = Vec::with_capacity(count);
    for i in 0..count {
        let at = 4 + i * SLOT_SIZE;
        entries.push(DupEntry {
            flags: bytes[at],
            size: u32::from_le_bytes(bytes[at + 1..at + 5].try_into().unwrap()),
            payload: u64::from_le_bytes(bytes[at + 5..at + 13].try_into().unwrap()),
        });
    }
    Ok(DupTable { entries })
}

/// Store a duplicate table as a fresh blob; returns its id.
pub fn store(
    device: &mut Device,
    freelist: &mut Freelist,
    page_size: usize,
    table: &DupTable,
) -> Result<u64> {
    let mut bytes = Vec::with_capacity(4 + table.len() * SLOT_SIZE);
    bytes.extend_from_slice(&(table.len() as u32).to_le_bytes());
    for entry in &table.entries {
        bytes.push(entry.flags);
        bytes.extend_from_slice(&entry.size.to_le_bytes());
        bytes.extend_from_slice(&entry.payload.to_le_bytes());
    }
    blob::blob_write(device, freelist, page_size, &bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryArena;

    #[test]
    fn test_store_load_roundtrip() {
        let mut device = Device::Memory(MemoryArena::new(4096));
        let mut freelist = Freelist::new();

        let table = DupTable {
            entries: vec![
                DupEntry {
                    flags: 2,
                    size: 3,
                    payload: 0x616263,
                },
                DupEntry {
                    flags: 4,
                    size: 100,
                    payload: 8192,
                },
            ],
        };

        let id = store(&mut device, &mut freelist, 4096, &table).unwrap();
        let loaded = load(&mut device, id).unwrap();
        assert_eq!(loaded.entries, table.entries);
    }

    #[test]
    fn test_empty_table() {
        let mut device = Device::Memory(MemoryArena::new(4096));
        let mut freelist = Freelist::new();

        let id = store(&mut device, &mut freelist, 4096, &DupTable::default()).unwrap();
        assert!(load(&mut device, id).unwrap().is_empty());
    }
}
