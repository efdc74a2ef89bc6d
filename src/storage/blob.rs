//! Blob areas - variable-length byte sequences outside the B+tree nodes.
//!
//! A blob holds record bytes too large to inline and the suffixes of
//! extended keys. On disk a blob is a `u64` length header followed by the
//! bytes, in a page-aligned area carved from the freelist or appended to
//! the file; its id is the byte offset of the header. Blob I/O goes
//! straight through the device and never enters the page cache.
//!
//! For in-memory environments blobs live in the device arena under
//! synthetic ids.

use crate::common::Result;
use crate::storage::device::Device;
use crate::storage::freelist::Freelist;

/// Bytes of the length header in front of every blob.
const BLOB_HEADER: u64 = 8;

fn area_size(len: usize, page_size: usize) -> u64 {
    let raw = BLOB_HEADER + len as u64;
    raw.div_ceil(page_size as u64) * page_size as u64
}

/// Store `data` as a new blob; returns its id.
pub fn blob_write(
    device: &mut Device,
    freelist: &mut Freelist,
    page_size: usize,
    data: &[u8],
) -> Result<u64> {
    if let Device::Memory(arena) = device {
        return Ok(arena.store_blob(data.to_vec()));
    }

    let size = area_size(data.len(), page_size);
    let disk = device.disk();
    let offset = match freelist.alloc_area(size) {
        Some(offset) => offset,
        None => {
            let offset = disk.len();
            disk.truncate(offset + size)?;
            offset
        }
    };

    disk.write_at(offset, &(data.len() as u64).to_le_bytes())?;
    disk.write_at(offset + BLOB_HEADER, data)?;
    Ok(offset)
}

/// Read a blob back in full.
pub fn blob_read(device: &mut Device, id: u64) -> Result<Vec<u8>> {
    if let Device::Memory(arena) = device {
        return Ok(arena.read_blob(id)?.to_vec());
    }

    let disk = device.disk();
    let mut header = [0u8; 8];
    disk.read_at(id, &mut header)?;
    let len = u64::from_le_bytes(header) as usize;

    let mut data = vec![0u8; len];
    disk.read_at(id + BLOB_HEADER, &mut data)?;
    Ok(data)
}

/// Release a blob's area back to the freelist.
pub fn blob_free(
    device: &mut Device,
    freelist: &mut Freelist,
    page_size: usize,
    id: u64,
) -> Result<()> {
    if let Device::Memory(arena) = device {
        arena.free_blob(id);
        return Ok(());
    }

    let disk = device.disk();
    let mut header = [0u8; 8];
    disk.read_at(id, &mut header)?;
    let len = u64::from_le_bytes(header) as usize;

    freelist.add_area(id, area_size(len, page_size));
    Ok(())
}
