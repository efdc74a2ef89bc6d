//! B+tree - ordered key/record storage over pager pages.
//!
//! Nodes are fixed-slot arrays (see [`node`]) descended by binary search
//! through the key comparison protocol. Leaves are chained through sibling
//! links for range traversal. Splits happen on the way down when a node is
//! full; nodes are never merged, and an emptied leaf stays linked and is
//! skipped by traversal.
//!
//! All functions here operate on one database's tree and leave cursor and
//! transaction semantics to the layers above; the [`BtreePos`] leaf
//! position is what couples a cursor to the tree.

pub mod dupes;
pub mod node;

use std::cmp::Ordering;

use crate::cache::PageManager;
use crate::common::config::INLINE_RECORD_MAX;
use crate::common::{Error, FetchFlags, InsertFlags, PageOffset, Result};
use crate::db::DbState;
use crate::keys::{compare_keys, materialize_key, NodeKey};
use crate::storage::page::PageType;
use crate::storage::{blob, Freelist};
use crate::txn::TxnState;

use dupes::{DupEntry, DupTable};
use node::{Entry, NodeHeader, KEY_EXTENDED, REC_BLOB, REC_DUPLICATES, REC_INLINE};

/// A position in a leaf: the leaf page and the entry slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BtreePos {
    pub page: PageOffset,
    pub slot: usize,
}

/// Entries per node for this database's geometry.
pub fn node_capacity(pager: &PageManager, db: &DbState) -> usize {
    let payload_len = pager.page_size() - crate::storage::PersistedHeader::SIZE;
    node::capacity(payload_len, db.key_size as usize)
}

// ============================================================================
// Page access helpers
// ============================================================================

fn fetch_header(pager: &mut PageManager, page: PageOffset) -> Result<NodeHeader> {
    let p = pager.fetch_page(None, page, FetchFlags::empty())?;
    Ok(node::read_header(p.payload()))
}

fn fetch_entry(
    pager: &mut PageManager,
    key_size: usize,
    page: PageOffset,
    index: usize,
) -> Result<Entry> {
    let p = pager.fetch_page(None, page, FetchFlags::empty())?;
    Ok(node::read_entry(p.payload(), key_size, index))
}

/// Compare the entry at `page[index]` against `key`.
fn compare_at(
    pager: &mut PageManager,
    db: &mut DbState,
    page: PageOffset,
    index: usize,
    key: &NodeKey,
) -> Result<Ordering> {
    let entry_key = fetch_entry(pager, db.key_size as usize, page, index)?.node_key();
    let hooks = db.hooks;
    compare_keys(pager, db.extkey_cache(), &hooks, &entry_key, key)
}

/// First slot in `page` whose key is >= `key`.
fn lower_bound(
    pager: &mut PageManager,
    db: &mut DbState,
    page: PageOffset,
    key: &NodeKey,
) -> Result<usize> {
    let count = fetch_header(pager, page)?.count;
    let (mut lo, mut hi) = (0, count);
    while lo < hi {
        let mid = (lo + hi) / 2;
        match compare_at(pager, db, page, mid, key)? {
            Ordering::Less => lo = mid + 1,
            _ => hi = mid,
        }
    }
    Ok(lo)
}

/// Index of the child to descend into: the number of separators <= `key`.
fn child_index(
    pager: &mut PageManager,
    db: &mut DbState,
    page: PageOffset,
    key: &NodeKey,
) -> Result<usize> {
    let count = fetch_header(pager, page)?.count;
    let (mut lo, mut hi) = (0, count);
    while lo < hi {
        let mid = (lo + hi) / 2;
        match compare_at(pager, db, page, mid, key)? {
            Ordering::Greater => hi = mid,
            _ => lo = mid + 1,
        }
    }
    Ok(lo)
}

/// Walk from the root to the leaf responsible for `key`.
fn descend_to_leaf(
    pager: &mut PageManager,
    db: &mut DbState,
    key: &NodeKey,
) -> Result<PageOffset> {
    let mut page = db.root;
    loop {
        let header = fetch_header(pager, page)?;
        if header.is_leaf {
            return Ok(page);
        }
        let index = child_index(pager, db, page, key)?;
        page = if index == 0 {
            header.ptr_left
        } else {
            fetch_entry(pager, db.key_size as usize, page, index - 1)?.child()
        };
    }
}

// ============================================================================
// Record payload helpers
// ============================================================================

/// Encode record bytes as entry payload: inline when small, a blob
/// otherwise. Returns `(flags, size, payload)`.
fn make_record(
    pager: &mut PageManager,
    freelist: &mut Freelist,
    record: &[u8],
) -> Result<(u8, u32, u64)> {
    if record.len() <= INLINE_RECORD_MAX {
        let mut packed = [0u8; 8];
        packed[..record.len()].copy_from_slice(record);
        Ok((REC_INLINE, record.len() as u32, u64::from_le_bytes(packed)))
    } else {
        let page_size = pager.page_size();
        let id = blob::blob_write(pager.device_mut(), freelist, page_size, record)?;
        Ok((REC_BLOB, record.len() as u32, id))
    }
}

/// Decode record bytes from `(flags, size, payload)`.
fn read_record(pager: &mut PageManager, flags: u8, size: u32, payload: u64) -> Result<Vec<u8>> {
    if flags & REC_INLINE != 0 {
        Ok(payload.to_le_bytes()[..size as usize].to_vec())
    } else if flags & REC_BLOB != 0 {
        blob::blob_read(pager.device_mut(), payload)
    } else {
        Err(Error::InvParameter("entry carries no record"))
    }
}

/// Release the blob behind `(flags, payload)`, if any.
fn free_record(
    pager: &mut PageManager,
    freelist: &mut Freelist,
    flags: u8,
    payload: u64,
) -> Result<()> {
    if flags & REC_BLOB != 0 {
        let page_size = pager.page_size();
        blob::blob_free(pager.device_mut(), freelist, page_size, payload)?;
    }
    Ok(())
}

/// Release everything a leaf entry owns: its record blob or its duplicate
/// table (and every duplicate's blob), and its extended-key blob.
fn free_entry_payloads(
    pager: &mut PageManager,
    freelist: &mut Freelist,
    db: &mut DbState,
    entry: &Entry,
) -> Result<()> {
    let page_size = pager.page_size();

    if entry.flags & REC_DUPLICATES != 0 {
        let table = dupes::load(pager.device_mut(), entry.payload)?;
        for dup in &table.entries {
            free_record(pager, freelist, dup.flags, dup.payload)?;
        }
        blob::blob_free(pager.device_mut(), freelist, page_size, entry.payload)?;
    } else {
        free_record(pager, freelist, entry.flags, entry.payload)?;
    }

    if let Some(blob_id) = entry.extkey_blob() {
        if let Some(extkeys) = db.extkeys.as_mut() {
            let _ = extkeys.remove(blob_id);
        }
        blob::blob_free(pager.device_mut(), freelist, page_size, blob_id)?;
    }
    Ok(())
}

/// Build a fresh leaf entry for `key`/`record`, writing the extended-key
/// suffix and oversized record to blobs as needed.
fn build_leaf_entry(
    pager: &mut PageManager,
    freelist: &mut Freelist,
    db: &DbState,
    key: &[u8],
    record: &[u8],
) -> Result<Entry> {
    let key_size = db.key_size as usize;
    let page_size = pager.page_size();

    let (key_flags, key_slot) = if key.len() <= key_size {
        let mut slot = key.to_vec();
        slot.resize(key_size, 0);
        (0u8, slot)
    } else {
        let prefix_len = key_size - 8;
        let id = blob::blob_write(pager.device_mut(), freelist, page_size, &key[prefix_len..])?;
        let mut slot = key[..prefix_len].to_vec();
        slot.extend_from_slice(&id.to_le_bytes());
        (KEY_EXTENDED, slot)
    };

    let (rec_flags, size, payload) = make_record(pager, freelist, record)?;
    Ok(Entry {
        flags: key_flags | rec_flags,
        key_len: key.len(),
        payload_size: size,
        payload,
        key_slot,
    })
}

// ============================================================================
// Lookup
// ============================================================================

/// Find the exact position of `key`, if present.
pub fn search(
    pager: &mut PageManager,
    db: &mut DbState,
    key: &[u8],
) -> Result<Option<BtreePos>> {
    if db.root.is_null() {
        return Ok(None);
    }

    let key_node = NodeKey::from_user(key);
    let page = descend_to_leaf(pager, db, &key_node)?;
    let slot = lower_bound(pager, db, page, &key_node)?;

    let count = fetch_header(pager, page)?.count;
    if slot < count && compare_at(pager, db, page, slot, &key_node)? == Ordering::Equal {
        Ok(Some(BtreePos { page, slot }))
    } else {
        Ok(None)
    }
}

/// Position at the first entry >= `key`, walking into the following leaf
/// when the responsible leaf ends before one. Returns the position and
/// whether it is an exact match.
pub fn search_near(
    pager: &mut PageManager,
    db: &mut DbState,
    key: &[u8],
) -> Result<Option<(BtreePos, bool)>> {
    if db.root.is_null() {
        return Ok(None);
    }

    let key_node = NodeKey::from_user(key);
    let page = descend_to_leaf(pager, db, &key_node)?;
    let slot = lower_bound(pager, db, page, &key_node)?;

    let count = fetch_header(pager, page)?.count;
    if slot < count {
        let exact = compare_at(pager, db, page, slot, &key_node)? == Ordering::Equal;
        return Ok(Some((BtreePos { page, slot }, exact)));
    }

    // Past the last entry of this leaf: the successor, if any, is the
    // first entry of the next non-empty leaf.
    let mut next = fetch_header(pager, page)?.right;
    while !next.is_null() {
        if fetch_header(pager, next)?.count > 0 {
            return Ok(Some((BtreePos { page: next, slot: 0 }, false)));
        }
        next = fetch_header(pager, next)?.right;
    }
    Ok(None)
}

// ============================================================================
// Traversal
// ============================================================================

fn leftmost_leaf(pager: &mut PageManager, db: &DbState) -> Result<PageOffset> {
    let mut page = db.root;
    loop {
        let header = fetch_header(pager, page)?;
        if header.is_leaf {
            return Ok(page);
        }
        page = header.ptr_left;
    }
}

fn rightmost_leaf(pager: &mut PageManager, db: &mut DbState) -> Result<PageOffset> {
    let mut page = db.root;
    loop {
        let header = fetch_header(pager, page)?;
        if header.is_leaf {
            return Ok(page);
        }
        page = if header.count == 0 {
            header.ptr_left
        } else {
            fetch_entry(pager, db.key_size as usize, page, header.count - 1)?.child()
        };
    }
}

/// Position at the first key of the tree.
pub fn first(pager: &mut PageManager, db: &DbState) -> Result<Option<BtreePos>> {
    if db.root.is_null() {
        return Ok(None);
    }

    let mut page = leftmost_leaf(pager, db)?;
    loop {
        let header = fetch_header(pager, page)?;
        if header.count > 0 {
            return Ok(Some(BtreePos { page, slot: 0 }));
        }
        if header.right.is_null() {
            return Ok(None);
        }
        page = header.right;
    }
}

/// Position at the last key of the tree.
pub fn last(pager: &mut PageManager, db: &mut DbState) -> Result<Option<BtreePos>> {
    if db.root.is_null() {
        return Ok(None);
    }

    let mut page = rightmost_leaf(pager, db)?;
    loop {
        let header = fetch_header(pager, page)?;
        if header.count > 0 {
            return Ok(Some(BtreePos {
                page,
                slot: header.count - 1,
            }));
        }
        if header.left.is_null() {
            return Ok(None);
        }
        page = header.left;
    }
}

/// Position at the key after `pos`, or None at the end of the key space.
pub fn next(pager: &mut PageManager, pos: BtreePos) -> Result<Option<BtreePos>> {
    let header = fetch_header(pager, pos.page)?;
    if pos.slot + 1 < header.count {
        return Ok(Some(BtreePos {
            page: pos.page,
            slot: pos.slot + 1,
        }));
    }

    let mut page = header.right;
    while !page.is_null() {
        let header = fetch_header(pager, page)?;
        if header.count > 0 {
            return Ok(Some(BtreePos { page, slot: 0 }));
        }
        page = header.right;
    }
    Ok(None)
}

/// Position at the key before `pos`, or None at the start of the key space.
pub fn previous(pager: &mut PageManager, pos: BtreePos) -> Result<Option<BtreePos>> {
    if pos.slot > 0 {
        return Ok(Some(BtreePos {
            page: pos.page,
            slot: pos.slot - 1,
        }));
    }

    let mut page = fetch_header(pager, pos.page)?.left;
    while !page.is_null() {
        let header = fetch_header(pager, page)?;
        if header.count > 0 {
            return Ok(Some(BtreePos {
                page,
                slot: header.count - 1,
            }));
        }
        page = header.left;
    }
    Ok(None)
}

// ============================================================================
// Reads at a position
// ============================================================================

/// The comparator view of the key at `pos`.
pub fn node_key_at(pager: &mut PageManager, db: &DbState, pos: BtreePos) -> Result<NodeKey> {
    Ok(fetch_entry(pager, db.key_size as usize, pos.page, pos.slot)?.node_key())
}

/// Does `pos` still name an entry? Slots shift when entries around them
/// are inserted or erased.
pub fn valid_pos(pager: &mut PageManager, pos: BtreePos) -> Result<bool> {
    let header = fetch_header(pager, pos.page)?;
    Ok(header.is_leaf && pos.slot < header.count)
}

/// The full materialized key bytes at `pos`.
pub fn key_at(pager: &mut PageManager, db: &mut DbState, pos: BtreePos) -> Result<Vec<u8>> {
    let key = node_key_at(pager, db, pos)?;
    materialize_key(pager, db.extkey_cache(), &key)
}

/// How many records live under the key at `pos` (1 unless duplicated).
pub fn dup_count_at(pager: &mut PageManager, db: &DbState, pos: BtreePos) -> Result<usize> {
    Ok(fetch_entry(pager, db.key_size as usize, pos.page, pos.slot)?.dup_count())
}

/// The record bytes of duplicate `dup` (0-based) at `pos`.
pub fn record_at(
    pager: &mut PageManager,
    db: &DbState,
    pos: BtreePos,
    dup: usize,
) -> Result<Vec<u8>> {
    let entry = fetch_entry(pager, db.key_size as usize, pos.page, pos.slot)?;

    if entry.flags & REC_DUPLICATES != 0 {
        let table = dupes::load(pager.device_mut(), entry.payload)?;
        let slot = table.entries.get(dup).ok_or(Error::KeyNotFound)?;
        read_record(pager, slot.flags, slot.size, slot.payload)
    } else {
        if dup != 0 {
            return Err(Error::KeyNotFound);
        }
        read_record(pager, entry.flags, entry.payload_size, entry.payload)
    }
}

// ============================================================================
// Insert
// ============================================================================

enum InsertOutcome {
    Done,
    /// The child split: a separator entry whose payload is the new right
    /// node, to be inserted into the parent.
    Split(Entry),
}

/// Insert `key`/`record`.
///
/// # Errors
/// - `Error::DuplicateKey` if the key exists and neither `OVERWRITE` nor
///   `DUPLICATE` is given
/// - `Error::InvParameter` for `DUPLICATE` on a database without
///   `ENABLE_DUPLICATES`
pub fn insert(
    pager: &mut PageManager,
    mut txn: Option<&mut TxnState>,
    freelist: &mut Freelist,
    db: &mut DbState,
    key: &[u8],
    record: &[u8],
    flags: InsertFlags,
) -> Result<()> {
    if flags.contains(InsertFlags::DUPLICATE)
        && !db.flags.contains(crate::common::DatabaseFlags::ENABLE_DUPLICATES)
    {
        return Err(Error::InvParameter(
            "duplicate insert into a database without ENABLE_DUPLICATES",
        ));
    }

    // An empty tree grows its root leaf on first insert.
    if db.root.is_null() {
        let page = pager.alloc_page(
            txn.as_deref_mut(),
            PageType::BRoot,
            Some(db.name),
            freelist,
            FetchFlags::empty(),
        )?;
        let offset = page.offset();
        node::write_header(page.payload_mut(), &NodeHeader::new_leaf());
        page.mark_dirty();
        db.root = offset;
        db.root_changed = true;
    }

    let key_node = NodeKey::from_user(key);
    let root = db.root;
    match insert_into(pager, txn.as_deref_mut(), freelist, db, root, key, &key_node, record, flags)? {
        InsertOutcome::Done => {}
        InsertOutcome::Split(separator) => {
            // The root split: grow the tree by one level.
            let old_root = db.root;
            let page = pager.alloc_page(
                txn.as_deref_mut(),
                PageType::BRoot,
                Some(db.name),
                freelist,
                FetchFlags::empty(),
            )?;
            let new_root = page.offset();
            let key_size = db.key_size as usize;
            node::write_header(page.payload_mut(), &NodeHeader::new_internal(old_root));
            node::insert_entry(page.payload_mut(), key_size, 0, 0, &separator);
            let mut header = node::read_header(page.payload());
            header.count = 1;
            node::write_header(page.payload_mut(), &header);
            page.mark_dirty();

            let old = pager.fetch_page(None, old_root, FetchFlags::empty())?;
            old.set_page_type(PageType::BIndex);
            old.mark_dirty();

            db.root = new_root;
            db.root_changed = true;
            pager.flush_page(new_root, FetchFlags::empty())?;
            pager.flush_page(old_root, FetchFlags::empty())?;
        }
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn insert_into(
    pager: &mut PageManager,
    mut txn: Option<&mut TxnState>,
    freelist: &mut Freelist,
    db: &mut DbState,
    page: PageOffset,
    key: &[u8],
    key_node: &NodeKey,
    record: &[u8],
    flags: InsertFlags,
) -> Result<InsertOutcome> {
    let header = fetch_header(pager, page)?;
    let key_size = db.key_size as usize;
    let capacity = node_capacity(pager, db);

    if header.is_leaf {
        let slot = lower_bound(pager, db, page, key_node)?;

        if slot < header.count && compare_at(pager, db, page, slot, key_node)? == Ordering::Equal {
            update_existing(pager, freelist, db, page, slot, record, flags)?;
            pager.flush_page(page, FetchFlags::empty())?;
            return Ok(InsertOutcome::Done);
        }

        if header.count < capacity {
            let entry = build_leaf_entry(pager, freelist, db, key, record)?;
            let p = pager.fetch_page(txn.as_deref_mut(), page, FetchFlags::empty())?;
            node::insert_entry(p.payload_mut(), key_size, header.count, slot, &entry);
            let mut h = node::read_header(p.payload());
            h.count = header.count + 1;
            node::write_header(p.payload_mut(), &h);
            p.mark_dirty();
            pager.flush_page(page, FetchFlags::empty())?;
            return Ok(InsertOutcome::Done);
        }

        // Full leaf: split, then insert into whichever half owns the key.
        let (separator, right) = split_leaf(pager, txn.as_deref_mut(), freelist, db, page)?;
        let hooks = db.hooks;
        let sep_key = separator.node_key();
        let target =
            match compare_keys(pager, db.extkey_cache(), &hooks, key_node, &sep_key)? {
                Ordering::Less => page,
                _ => right,
            };
        match insert_into(pager, txn, freelist, db, target, key, key_node, record, flags)? {
            InsertOutcome::Done => {}
            InsertOutcome::Split(_) => unreachable!("fresh half split on insert"),
        }
        return Ok(InsertOutcome::Split(separator));
    }

    // Internal node: descend, then place a separator here if the child split.
    let index = child_index(pager, db, page, key_node)?;
    let child = if index == 0 {
        header.ptr_left
    } else {
        fetch_entry(pager, key_size, page, index - 1)?.child()
    };

    let child_outcome =
        insert_into(pager, txn.as_deref_mut(), freelist, db, child, key, key_node, record, flags)?;
    let separator = match child_outcome {
        InsertOutcome::Done => return Ok(InsertOutcome::Done),
        InsertOutcome::Split(separator) => separator,
    };

    if header.count < capacity {
        let p = pager.fetch_page(txn.as_deref_mut(), page, FetchFlags::empty())?;
        node::insert_entry(p.payload_mut(), key_size, header.count, index, &separator);
        let mut h = node::read_header(p.payload());
        h.count = header.count + 1;
        node::write_header(p.payload_mut(), &h);
        p.mark_dirty();
        pager.flush_page(page, FetchFlags::empty())?;
        return Ok(InsertOutcome::Done);
    }

    // Full internal node: split and route the pending separator.
    let (promoted, right) = split_internal(pager, txn.as_deref_mut(), freelist, db, page)?;
    let hooks = db.hooks;
    let promoted_key = promoted.node_key();
    let sep_key = separator.node_key();
    let target = match compare_keys(pager, db.extkey_cache(), &hooks, &sep_key, &promoted_key)? {
        Ordering::Less => page,
        _ => right,
    };

    let target_header = fetch_header(pager, target)?;
    let insert_at = child_index(pager, db, target, &sep_key)?;
    let p = pager.fetch_page(txn.as_deref_mut(), target, FetchFlags::empty())?;
    node::insert_entry(p.payload_mut(), key_size, target_header.count, insert_at, &separator);
    let mut h = node::read_header(p.payload());
    h.count = target_header.count + 1;
    node::write_header(p.payload_mut(), &h);
    p.mark_dirty();
    pager.flush_page(target, FetchFlags::empty())?;

    Ok(InsertOutcome::Split(promoted))
}

/// Apply an insert that hit an existing key: duplicate, overwrite, or fail.
fn update_existing(
    pager: &mut PageManager,
    freelist: &mut Freelist,
    db: &mut DbState,
    page: PageOffset,
    slot: usize,
    record: &[u8],
    flags: InsertFlags,
) -> Result<()> {
    let key_size = db.key_size as usize;
    let page_size = pager.page_size();
    let mut entry = fetch_entry(pager, key_size, page, slot)?;

    if flags.contains(InsertFlags::DUPLICATE) {
        let (rec_flags, size, payload) = make_record(pager, freelist, record)?;
        let new_dup = DupEntry {
            flags: rec_flags,
            size,
            payload,
        };

        let mut table = if entry.flags & REC_DUPLICATES != 0 {
            let table = dupes::load(pager.device_mut(), entry.payload)?;
            blob::blob_free(pager.device_mut(), freelist, page_size, entry.payload)?;
            table
        } else {
            // Promote the single record to a table of one.
            DupTable {
                entries: vec![DupEntry {
                    flags: entry.flags & (REC_INLINE | REC_BLOB),
                    size: entry.payload_size,
                    payload: entry.payload,
                }],
            }
        };
        table.entries.push(new_dup);

        let table_id = dupes::store(pager.device_mut(), freelist, page_size, &table)?;
        entry.flags = (entry.flags & KEY_EXTENDED) | REC_DUPLICATES;
        entry.payload = table_id;
        entry.payload_size = table.len() as u32;
    } else if flags.contains(InsertFlags::OVERWRITE) {
        // Whatever records the key held are replaced by this one.
        free_record_side_of_entry(pager, freelist, &entry)?;
        let (rec_flags, size, payload) = make_record(pager, freelist, record)?;
        entry.flags = (entry.flags & KEY_EXTENDED) | rec_flags;
        entry.payload = payload;
        entry.payload_size = size;
    } else {
        return Err(Error::DuplicateKey);
    }

    let p = pager.fetch_page(None, page, FetchFlags::empty())?;
    node::write_entry(p.payload_mut(), key_size, slot, &entry);
    p.mark_dirty();
    Ok(())
}

/// Release an entry's record blob or duplicate table, leaving its key
/// (and extended-key blob) alone.
fn free_record_side_of_entry(
    pager: &mut PageManager,
    freelist: &mut Freelist,
    entry: &Entry,
) -> Result<()> {
    let page_size = pager.page_size();
    if entry.flags & REC_DUPLICATES != 0 {
        let table = dupes::load(pager.device_mut(), entry.payload)?;
        for dup in &table.entries {
            free_record(pager, freelist, dup.flags, dup.payload)?;
        }
        blob::blob_free(pager.device_mut(), freelist, page_size, entry.payload)?;
    } else {
        free_record(pager, freelist, entry.flags, entry.payload)?;
    }
    Ok(())
}

/// Split a full leaf; returns the separator (payload = right page) and the
/// right page offset.
fn split_leaf(
    pager: &mut PageManager,
    mut txn: Option<&mut TxnState>,
    freelist: &mut Freelist,
    db: &mut DbState,
    page: PageOffset,
) -> Result<(Entry, PageOffset)> {
    let key_size = db.key_size as usize;
    let header = fetch_header(pager, page)?;
    let pivot = header.count / 2;

    let right_page = pager
        .alloc_page(
            txn.as_deref_mut(),
            PageType::BIndex,
            Some(db.name),
            freelist,
            FetchFlags::empty(),
        )?
        .offset();

    // Move the upper half. Entries are copied out first so only one page
    // buffer is borrowed at a time.
    let moved: Vec<u8> = {
        let p = pager.fetch_page(None, page, FetchFlags::empty())?;
        let from = node::NODE_HEADER + pivot * node::entry_size(key_size);
        let to = node::NODE_HEADER + header.count * node::entry_size(key_size);
        p.payload()[from..to].to_vec()
    };

    {
        let p = pager.fetch_page(txn.as_deref_mut(), right_page, FetchFlags::empty())?;
        let right_header = NodeHeader {
            is_leaf: true,
            count: header.count - pivot,
            left: page,
            right: header.right,
            ptr_left: PageOffset::NULL,
        };
        node::write_header(p.payload_mut(), &right_header);
        let at = node::NODE_HEADER;
        p.payload_mut()[at..at + moved.len()].copy_from_slice(&moved);
        p.mark_dirty();
    }

    {
        let p = pager.fetch_page(txn.as_deref_mut(), page, FetchFlags::empty())?;
        let mut left_header = node::read_header(p.payload());
        left_header.count = pivot;
        left_header.right = right_page;
        node::write_header(p.payload_mut(), &left_header);
        p.mark_dirty();
    }

    if !header.right.is_null() {
        let p = pager.fetch_page(None, header.right, FetchFlags::empty())?;
        let mut h = node::read_header(p.payload());
        h.left = right_page;
        node::write_header(p.payload_mut(), &h);
        p.mark_dirty();
        pager.flush_page(header.right, FetchFlags::empty())?;
    }

    pager.flush_page(page, FetchFlags::empty())?;
    pager.flush_page(right_page, FetchFlags::empty())?;

    // The separator is a copy of the right node's first key. An extended
    // separator clones the suffix blob so the leaf's copy can be freed
    // independently.
    let first_right = fetch_entry(pager, key_size, right_page, 0)?;
    let mut sep_slot = first_right.key_slot.clone();
    let sep_flags = first_right.flags & KEY_EXTENDED;
    if let Some(blob_id) = first_right.extkey_blob() {
        let page_size = pager.page_size();
        let suffix = blob::blob_read(pager.device_mut(), blob_id)?;
        let clone_id = blob::blob_write(pager.device_mut(), freelist, page_size, &suffix)?;
        let at = sep_slot.len() - 8;
        sep_slot[at..].copy_from_slice(&clone_id.to_le_bytes());
    }

    let separator = Entry {
        flags: sep_flags,
        key_len: first_right.key_len,
        payload_size: 0,
        payload: right_page.0,
        key_slot: sep_slot,
    };
    Ok((separator, right_page))
}

/// Split a full internal node; the pivot entry is promoted and its child
/// becomes the right node's leftmost child.
fn split_internal(
    pager: &mut PageManager,
    mut txn: Option<&mut TxnState>,
    freelist: &mut Freelist,
    db: &mut DbState,
    page: PageOffset,
) -> Result<(Entry, PageOffset)> {
    let key_size = db.key_size as usize;
    let header = fetch_header(pager, page)?;
    let pivot = header.count / 2;

    let mut promoted = fetch_entry(pager, key_size, page, pivot)?;

    let right_page = pager
        .alloc_page(
            txn.as_deref_mut(),
            PageType::BIndex,
            Some(db.name),
            freelist,
            FetchFlags::empty(),
        )?
        .offset();

    let moved: Vec<u8> = {
        let p = pager.fetch_page(None, page, FetchFlags::empty())?;
        let from = node::NODE_HEADER + (pivot + 1) * node::entry_size(key_size);
        let to = node::NODE_HEADER + header.count * node::entry_size(key_size);
        p.payload()[from..to].to_vec()
    };

    {
        let p = pager.fetch_page(txn.as_deref_mut(), right_page, FetchFlags::empty())?;
        let right_header = NodeHeader {
            is_leaf: false,
            count: header.count - pivot - 1,
            left: PageOffset::NULL,
            right: PageOffset::NULL,
            ptr_left: promoted.child(),
        };
        node::write_header(p.payload_mut(), &right_header);
        let at = node::NODE_HEADER;
        p.payload_mut()[at..at + moved.len()].copy_from_slice(&moved);
        p.mark_dirty();
    }

    {
        let p = pager.fetch_page(txn.as_deref_mut(), page, FetchFlags::empty())?;
        let mut left_header = node::read_header(p.payload());
        left_header.count = pivot;
        node::write_header(p.payload_mut(), &left_header);
        p.mark_dirty();
    }

    pager.flush_page(page, FetchFlags::empty())?;
    pager.flush_page(right_page, FetchFlags::empty())?;

    // The promoted entry now routes to the right node.
    promoted.payload = right_page.0;
    promoted.payload_size = 0;
    Ok((promoted, right_page))
}

// ============================================================================
// Erase and overwrite
// ============================================================================

/// Erase `key`, or just its `dup_index`-th duplicate (1-based) when given.
pub fn erase(
    pager: &mut PageManager,
    mut txn: Option<&mut TxnState>,
    freelist: &mut Freelist,
    db: &mut DbState,
    key: &[u8],
    dup_index: Option<usize>,
) -> Result<()> {
    let Some(pos) = search(pager, db, key)? else {
        return Err(Error::KeyNotFound);
    };

    let key_size = db.key_size as usize;
    let page_size = pager.page_size();
    let mut entry = fetch_entry(pager, key_size, pos.page, pos.slot)?;

    if let Some(index) = dup_index {
        if index == 0 {
            return Err(Error::InvParameter("duplicate index is 1-based"));
        }

        if entry.flags & REC_DUPLICATES != 0 {
            let mut table = dupes::load(pager.device_mut(), entry.payload)?;
            if index > table.len() {
                return Err(Error::KeyNotFound);
            }
            let victim = table.entries.remove(index - 1);
            free_record(pager, freelist, victim.flags, victim.payload)?;
            blob::blob_free(pager.device_mut(), freelist, page_size, entry.payload)?;

            if table.len() == 1 {
                // Back to a plain single-record entry.
                let only = table.entries[0];
                entry.flags = (entry.flags & KEY_EXTENDED) | only.flags;
                entry.payload = only.payload;
                entry.payload_size = only.size;
            } else {
                let table_id = dupes::store(pager.device_mut(), freelist, page_size, &table)?;
                entry.payload = table_id;
                entry.payload_size = table.len() as u32;
            }

            let p = pager.fetch_page(txn.as_deref_mut(), pos.page, FetchFlags::empty())?;
            node::write_entry(p.payload_mut(), key_size, pos.slot, &entry);
            p.mark_dirty();
            pager.flush_page(pos.page, FetchFlags::empty())?;
            return Ok(());
        }

        // A single record only has duplicate index 1.
        if index != 1 {
            return Err(Error::KeyNotFound);
        }
    }

    // Whole-entry erase.
    free_entry_payloads(pager, freelist, db, &entry)?;

    let header = fetch_header(pager, pos.page)?;
    let p = pager.fetch_page(txn.as_deref_mut(), pos.page, FetchFlags::empty())?;
    node::remove_entry(p.payload_mut(), key_size, header.count, pos.slot);
    let mut h = node::read_header(p.payload());
    h.count = header.count - 1;
    node::write_header(p.payload_mut(), &h);
    p.mark_dirty();
    pager.flush_page(pos.page, FetchFlags::empty())?;
    Ok(())
}

/// Replace the record of duplicate `dup` (0-based) at `pos` in place.
pub fn overwrite_at(
    pager: &mut PageManager,
    freelist: &mut Freelist,
    db: &mut DbState,
    pos: BtreePos,
    dup: usize,
    record: &[u8],
) -> Result<()> {
    let key_size = db.key_size as usize;
    let page_size = pager.page_size();
    let mut entry = fetch_entry(pager, key_size, pos.page, pos.slot)?;

    if entry.flags & REC_DUPLICATES != 0 {
        let mut table = dupes::load(pager.device_mut(), entry.payload)?;
        let slot = table.entries.get_mut(dup).ok_or(Error::KeyNotFound)?;
        free_record(pager, freelist, slot.flags, slot.payload)?;
        let (rec_flags, size, payload) = make_record(pager, freelist, record)?;
        *slot = DupEntry {
            flags: rec_flags,
            size,
            payload,
        };
        blob::blob_free(pager.device_mut(), freelist, page_size, entry.payload)?;
        entry.payload = dupes::store(pager.device_mut(), freelist, page_size, &table)?;
    } else {
        if dup != 0 {
            return Err(Error::KeyNotFound);
        }
        free_record(pager, freelist, entry.flags, entry.payload)?;
        let (rec_flags, size, payload) = make_record(pager, freelist, record)?;
        entry.flags = (entry.flags & KEY_EXTENDED) | rec_flags;
        entry.payload = payload;
        entry.payload_size = size;
    }

    let p = pager.fetch_page(None, pos.page, FetchFlags::empty())?;
    node::write_entry(p.payload_mut(), key_size, pos.slot, &entry);
    p.mark_dirty();
    pager.flush_page(pos.page, FetchFlags::empty())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::DatabaseFlags;
    use crate::storage::{Device, MemoryArena};

    const PAGE: usize = 1024;

    fn setup() -> (PageManager, Freelist, DbState) {
        let pager = PageManager::new(
            Device::Memory(MemoryArena::new(PAGE)),
            PAGE,
            64 * PAGE,
            false,
        );
        (
            pager,
            Freelist::new(),
            DbState::new(1, DatabaseFlags::ENABLE_DUPLICATES, 16, true),
        )
    }

    fn put(
        pager: &mut PageManager,
        freelist: &mut Freelist,
        db: &mut DbState,
        key: &[u8],
        record: &[u8],
    ) {
        insert(pager, None, freelist, db, key, record, InsertFlags::empty()).unwrap();
    }

    #[test]
    fn test_insert_and_search() {
        let (mut pager, mut freelist, mut db) = setup();

        put(&mut pager, &mut freelist, &mut db, b"beta", b"2");
        put(&mut pager, &mut freelist, &mut db, b"alpha", b"1");
        put(&mut pager, &mut freelist, &mut db, b"gamma", b"3");

        let pos = search(&mut pager, &mut db, b"beta").unwrap().unwrap();
        assert_eq!(key_at(&mut pager, &mut db, pos).unwrap(), b"beta");
        assert_eq!(record_at(&mut pager, &db, pos, 0).unwrap(), b"2");

        assert!(search(&mut pager, &mut db, b"delta").unwrap().is_none());
    }

    #[test]
    fn test_search_on_empty_tree() {
        let (mut pager, _freelist, mut db) = setup();
        assert!(search(&mut pager, &mut db, b"k").unwrap().is_none());
        assert!(first(&mut pager, &db).unwrap().is_none());
        assert!(last(&mut pager, &mut db).unwrap().is_none());
    }

    #[test]
    fn test_splits_preserve_order() {
        use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};

        let (mut pager, mut freelist, mut db) = setup();

        // Far more entries than one node holds, inserted in random order.
        let mut keys: Vec<u32> = (0..500).collect();
        keys.shuffle(&mut StdRng::seed_from_u64(7));
        for i in keys {
            let key = format!("{i:04}");
            put(&mut pager, &mut freelist, &mut db, key.as_bytes(), &i.to_le_bytes());
        }

        // Forward walk yields every key in order.
        let mut pos = first(&mut pager, &db).unwrap().unwrap();
        let mut seen = 0u32;
        loop {
            let key = key_at(&mut pager, &mut db, pos).unwrap();
            assert_eq!(key, format!("{seen:04}").into_bytes());
            seen += 1;
            match next(&mut pager, pos).unwrap() {
                Some(next_pos) => pos = next_pos,
                None => break,
            }
        }
        assert_eq!(seen, 500);

        // Backward walk from the last key.
        let mut pos = last(&mut pager, &mut db).unwrap().unwrap();
        let mut remaining = 500u32;
        loop {
            remaining -= 1;
            let key = key_at(&mut pager, &mut db, pos).unwrap();
            assert_eq!(key, format!("{remaining:04}").into_bytes());
            match previous(&mut pager, pos).unwrap() {
                Some(prev_pos) => pos = prev_pos,
                None => break,
            }
        }
        assert_eq!(remaining, 0);
    }

    #[test]
    fn test_duplicate_key_errors() {
        let (mut pager, mut freelist, mut db) = setup();

        put(&mut pager, &mut freelist, &mut db, b"k", b"1");
        let result = insert(
            &mut pager,
            None,
            &mut freelist,
            &mut db,
            b"k",
            b"2",
            InsertFlags::empty(),
        );
        assert!(matches!(result, Err(Error::DuplicateKey)));
    }

    #[test]
    fn test_overwrite_replaces_record() {
        let (mut pager, mut freelist, mut db) = setup();

        put(&mut pager, &mut freelist, &mut db, b"k", b"old");
        insert(
            &mut pager,
            None,
            &mut freelist,
            &mut db,
            b"k",
            &vec![9u8; 5000],
            InsertFlags::OVERWRITE,
        )
        .unwrap();

        let pos = search(&mut pager, &mut db, b"k").unwrap().unwrap();
        assert_eq!(record_at(&mut pager, &db, pos, 0).unwrap(), vec![9u8; 5000]);
    }

    #[test]
    fn test_duplicates_and_dup_erase() {
        let (mut pager, mut freelist, mut db) = setup();

        put(&mut pager, &mut freelist, &mut db, b"k", b"a");
        for record in [b"b", b"c"] {
            insert(
                &mut pager,
                None,
                &mut freelist,
                &mut db,
                b"k",
                record,
                InsertFlags::DUPLICATE,
            )
            .unwrap();
        }

        let pos = search(&mut pager, &mut db, b"k").unwrap().unwrap();
        assert_eq!(dup_count_at(&mut pager, &db, pos).unwrap(), 3);
        assert_eq!(record_at(&mut pager, &db, pos, 0).unwrap(), b"a");
        assert_eq!(record_at(&mut pager, &db, pos, 2).unwrap(), b"c");

        // Erase the middle duplicate (1-based index 2).
        erase(&mut pager, None, &mut freelist, &mut db, b"k", Some(2)).unwrap();
        let pos = search(&mut pager, &mut db, b"k").unwrap().unwrap();
        assert_eq!(dup_count_at(&mut pager, &db, pos).unwrap(), 2);
        assert_eq!(record_at(&mut pager, &db, pos, 1).unwrap(), b"c");

        // Down to one: the entry demotes to a plain record.
        erase(&mut pager, None, &mut freelist, &mut db, b"k", Some(1)).unwrap();
        let pos = search(&mut pager, &mut db, b"k").unwrap().unwrap();
        assert_eq!(dup_count_at(&mut pager, &db, pos).unwrap(), 1);
        assert_eq!(record_at(&mut pager, &db, pos, 0).unwrap(), b"c");
    }

    #[test]
    fn test_erase_whole_key() {
        let (mut pager, mut freelist, mut db) = setup();

        for i in 0..50u32 {
            let key = format!("{i:03}");
            put(&mut pager, &mut freelist, &mut db, key.as_bytes(), b"r");
        }
        for i in (0..50u32).step_by(2) {
            let key = format!("{i:03}");
            erase(&mut pager, None, &mut freelist, &mut db, key.as_bytes(), None).unwrap();
        }

        for i in 0..50u32 {
            let key = format!("{i:03}");
            let found = search(&mut pager, &mut db, key.as_bytes()).unwrap();
            assert_eq!(found.is_some(), i % 2 == 1, "key {key}");
        }

        let result = erase(&mut pager, None, &mut freelist, &mut db, b"000", None);
        assert!(matches!(result, Err(Error::KeyNotFound)));
    }

    #[test]
    fn test_extended_keys_roundtrip() {
        let (mut pager, mut freelist, mut db) = setup();

        // 100-byte keys against a 16-byte slot: all extended.
        let mut keys = Vec::new();
        for i in 0..60u32 {
            let mut key = format!("{i:04}").into_bytes();
            key.resize(100, b'z');
            put(&mut pager, &mut freelist, &mut db, &key, &i.to_le_bytes());
            keys.push(key);
        }

        for (i, key) in keys.iter().enumerate() {
            let pos = search(&mut pager, &mut db, key).unwrap().unwrap();
            assert_eq!(key_at(&mut pager, &mut db, pos).unwrap(), *key);
            assert_eq!(
                record_at(&mut pager, &db, pos, 0).unwrap(),
                (i as u32).to_le_bytes()
            );
        }
    }

    #[test]
    fn test_shorter_key_orders_after_longer() {
        let (mut pager, mut freelist, mut db) = setup();

        put(&mut pager, &mut freelist, &mut db, b"ab", b"1");
        put(&mut pager, &mut freelist, &mut db, b"abc", b"2");

        let pos = first(&mut pager, &db).unwrap().unwrap();
        assert_eq!(key_at(&mut pager, &mut db, pos).unwrap(), b"abc");
        let pos = next(&mut pager, pos).unwrap().unwrap();
        assert_eq!(key_at(&mut pager, &mut db, pos).unwrap(), b"ab");
    }

    #[test]
    fn test_search_near() {
        let (mut pager, mut freelist, mut db) = setup();

        for key in [b"b", b"d", b"f"] {
            put(&mut pager, &mut freelist, &mut db, key, b"r");
        }

        let (pos, exact) = search_near(&mut pager, &mut db, b"d").unwrap().unwrap();
        assert!(exact);
        assert_eq!(key_at(&mut pager, &mut db, pos).unwrap(), b"d");

        let (pos, exact) = search_near(&mut pager, &mut db, b"c").unwrap().unwrap();
        assert!(!exact);
        assert_eq!(key_at(&mut pager, &mut db, pos).unwrap(), b"d");

        assert!(search_near(&mut pager, &mut db, b"g").unwrap().is_none());
    }
}
