//! Transactions - a bounded set of in-flight updates.
//!
//! A transaction buffers its mutations as an ordered op tree per database
//! instead of touching the B+tree; commit replays the ops in sequence
//! order, abort just drops them. While the transaction lives, reads
//! consult the op tree before the B+tree, and every page the transaction
//! registered stays pinned in the cache.
//!
//! The op tree is ordered by the owning database's comparator (not plain
//! lexicographic order) so cursor merges see one consistent order on both
//! sides.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::ops::Bound;

use crate::common::{InsertFlags, PageOffset};
use crate::keys::FullCompareFn;

/// A key wrapped with its database's compare hook so it can live in an
/// ordered map.
#[derive(Clone)]
pub struct TxnKey {
    pub bytes: Vec<u8>,
    compare: FullCompareFn,
}

impl TxnKey {
    pub fn new(bytes: Vec<u8>, compare: FullCompareFn) -> Self {
        Self { bytes, compare }
    }
}

impl PartialEq for TxnKey {
    fn eq(&self, other: &Self) -> bool {
        (self.compare)(&self.bytes, &other.bytes) == Ordering::Equal
    }
}

impl Eq for TxnKey {}

impl PartialOrd for TxnKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TxnKey {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.compare)(&self.bytes, &other.bytes)
    }
}

impl std::fmt::Debug for TxnKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("TxnKey").field(&self.bytes).finish()
    }
}

/// One buffered mutation.
#[derive(Debug, Clone)]
pub enum TxnOpKind {
    Insert {
        record: Vec<u8>,
        flags: InsertFlags,
    },
    Erase {
        /// 1-based duplicate index, or None for the whole key.
        dup_index: Option<usize>,
    },
    Overwrite {
        record: Vec<u8>,
        /// 0-based duplicate position the overwrite targets.
        dup_index: usize,
    },
}

/// An op with its commit-order sequence number.
#[derive(Debug, Clone)]
pub struct TxnOp {
    pub seq: u64,
    pub kind: TxnOpKind,
}

/// What the op chain says about a key's existence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyProbe {
    /// No record-level op touches the key.
    Untouched,
    /// The latest whole-key op is an erase.
    Erased,
    /// The latest record-producing op left this record visible.
    Visible(Vec<u8>),
}

/// Walk an op chain in commit order and report the key's visibility.
///
/// Duplicate-level erases do not change whether the key exists; they are
/// resolved by the duplicate cache.
pub fn probe_chain(ops: &[TxnOp]) -> KeyProbe {
    let mut probe = KeyProbe::Untouched;
    for op in ops {
        match &op.kind {
            TxnOpKind::Insert { record, .. } => probe = KeyProbe::Visible(record.clone()),
            TxnOpKind::Overwrite { record, .. } => probe = KeyProbe::Visible(record.clone()),
            TxnOpKind::Erase { dup_index: None } => probe = KeyProbe::Erased,
            TxnOpKind::Erase { dup_index: Some(_) } => {}
        }
    }
    probe
}

/// The state of one active transaction.
pub struct TxnState {
    id: u64,
    next_seq: u64,
    /// Per-database op trees, ordered by the database comparator.
    ops: HashMap<u16, BTreeMap<TxnKey, Vec<TxnOp>>>,
    /// Pages registered with this transaction; pinned until it ends.
    pages: HashSet<PageOffset>,
}

impl TxnState {
    pub fn new(id: u64) -> Self {
        Self {
            id,
            next_seq: 0,
            ops: HashMap::new(),
            pages: HashSet::new(),
        }
    }

    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    // ========================================================================
    // Page registration
    // ========================================================================

    /// Register a page with this transaction.
    pub fn add_page(&mut self, offset: PageOffset) {
        self.pages.insert(offset);
    }

    /// Does the transaction hold this page?
    pub fn has_page(&self, offset: PageOffset) -> bool {
        self.pages.contains(&offset)
    }

    pub fn pages(&self) -> impl Iterator<Item = &PageOffset> {
        self.pages.iter()
    }

    // ========================================================================
    // Op tree
    // ========================================================================

    /// Append an op for `key` in database `db`.
    pub fn record_op(&mut self, db: u16, compare: FullCompareFn, key: &[u8], kind: TxnOpKind) {
        let seq = self.next_seq;
        self.next_seq += 1;

        self.ops
            .entry(db)
            .or_default()
            .entry(TxnKey::new(key.to_vec(), compare))
            .or_default()
            .push(TxnOp { seq, kind });
    }

    /// The op chain for `key`, if any.
    pub fn ops_for(&self, db: u16, compare: FullCompareFn, key: &[u8]) -> Option<&[TxnOp]> {
        self.ops
            .get(&db)?
            .get(&TxnKey::new(key.to_vec(), compare))
            .map(Vec::as_slice)
    }

    /// Visibility of `key` under this transaction's ops.
    pub fn probe_key(&self, db: u16, compare: FullCompareFn, key: &[u8]) -> KeyProbe {
        match self.ops_for(db, compare, key) {
            Some(ops) => probe_chain(ops),
            None => KeyProbe::Untouched,
        }
    }

    /// Does the transaction have any op for this key?
    pub fn touches_key(&self, db: u16, compare: FullCompareFn, key: &[u8]) -> bool {
        self.ops_for(db, compare, key).is_some()
    }

    /// The first or last key (by the database comparator) with ops.
    pub fn edge_key(&self, db: u16, last: bool) -> Option<(&[u8], &[TxnOp])> {
        let tree = self.ops.get(&db)?;
        let entry = if last {
            tree.iter().next_back()
        } else {
            tree.iter().next()
        };
        entry.map(|(k, v)| (k.bytes.as_slice(), v.as_slice()))
    }

    /// The next key with ops strictly after (or before, with `reverse`)
    /// `key` in comparator order.
    pub fn neighbour_key(
        &self,
        db: u16,
        compare: FullCompareFn,
        key: &[u8],
        reverse: bool,
    ) -> Option<(&[u8], &[TxnOp])> {
        let tree = self.ops.get(&db)?;
        let bound = TxnKey::new(key.to_vec(), compare);
        let entry = if reverse {
            tree.range((Bound::Unbounded, Bound::Excluded(bound)))
                .next_back()
        } else {
            tree.range((Bound::Excluded(bound), Bound::Unbounded)).next()
        };
        entry.map(|(k, v)| (k.bytes.as_slice(), v.as_slice()))
    }

    /// Drain the op trees for commit replay, in database order.
    pub fn take_ops(&mut self) -> Vec<(u16, BTreeMap<TxnKey, Vec<TxnOp>>)> {
        let mut dbs: Vec<(u16, BTreeMap<TxnKey, Vec<TxnOp>>)> =
            std::mem::take(&mut self.ops).into_iter().collect();
        dbs.sort_by_key(|(db, _)| *db);
        dbs
    }

    /// True when the transaction buffered no mutations.
    pub fn is_read_only(&self) -> bool {
        self.ops.values().all(|tree| tree.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::default_full_compare;

    fn insert_op(record: &[u8]) -> TxnOpKind {
        TxnOpKind::Insert {
            record: record.to_vec(),
            flags: InsertFlags::empty(),
        }
    }

    #[test]
    fn test_probe_untouched() {
        let txn = TxnState::new(1);
        assert_eq!(
            txn.probe_key(1, default_full_compare, b"k"),
            KeyProbe::Untouched
        );
    }

    #[test]
    fn test_probe_insert_then_erase() {
        let mut txn = TxnState::new(1);
        txn.record_op(1, default_full_compare, b"k", insert_op(b"v"));
        assert_eq!(
            txn.probe_key(1, default_full_compare, b"k"),
            KeyProbe::Visible(b"v".to_vec())
        );

        txn.record_op(1, default_full_compare, b"k", TxnOpKind::Erase { dup_index: None });
        assert_eq!(
            txn.probe_key(1, default_full_compare, b"k"),
            KeyProbe::Erased
        );

        // A later insert resurrects the key.
        txn.record_op(1, default_full_compare, b"k", insert_op(b"w"));
        assert_eq!(
            txn.probe_key(1, default_full_compare, b"k"),
            KeyProbe::Visible(b"w".to_vec())
        );
    }

    #[test]
    fn test_dup_erase_keeps_key_visible() {
        let mut txn = TxnState::new(1);
        txn.record_op(1, default_full_compare, b"k", insert_op(b"v"));
        txn.record_op(
            1,
            default_full_compare,
            b"k",
            TxnOpKind::Erase { dup_index: Some(1) },
        );
        assert_eq!(
            txn.probe_key(1, default_full_compare, b"k"),
            KeyProbe::Visible(b"v".to_vec())
        );
    }

    #[test]
    fn test_op_tree_uses_db_comparator() {
        // With the default compare, "ab" orders after "abc".
        let mut txn = TxnState::new(1);
        txn.record_op(1, default_full_compare, b"ab", insert_op(b"1"));
        txn.record_op(1, default_full_compare, b"abc", insert_op(b"2"));

        let (first, _) = txn.edge_key(1, false).unwrap();
        assert_eq!(first, b"abc");
        let (last, _) = txn.edge_key(1, true).unwrap();
        assert_eq!(last, b"ab");
    }

    #[test]
    fn test_neighbour_key() {
        let mut txn = TxnState::new(1);
        txn.record_op(1, default_full_compare, b"a", insert_op(b"1"));
        txn.record_op(1, default_full_compare, b"c", insert_op(b"2"));
        txn.record_op(1, default_full_compare, b"e", insert_op(b"3"));

        let (next, _) = txn
            .neighbour_key(1, default_full_compare, b"b", false)
            .unwrap();
        assert_eq!(next, b"c");

        let (prev, _) = txn
            .neighbour_key(1, default_full_compare, b"c", true)
            .unwrap();
        assert_eq!(prev, b"a");

        assert!(txn
            .neighbour_key(1, default_full_compare, b"e", false)
            .is_none());
    }

    #[test]
    fn test_sequence_numbers_order_ops() {
        let mut txn = TxnState::new(1);
        txn.record_op(1, default_full_compare, b"k", insert_op(b"1"));
        txn.record_op(1, default_full_compare, b"k", insert_op(b"2"));

        let ops = txn.ops_for(1, default_full_compare, b"k").unwrap();
        assert_eq!(ops.len(), 2);
        assert!(ops[0].seq < ops[1].seq);
    }

    #[test]
    fn test_page_registration() {
        let mut txn = TxnState::new(1);
        assert!(!txn.has_page(PageOffset::new(4096)));

        txn.add_page(PageOffset::new(4096));
        assert!(txn.has_page(PageOffset::new(4096)));
        assert_eq!(txn.pages().count(), 1);
    }

    #[test]
    fn test_read_only() {
        let mut txn = TxnState::new(1);
        assert!(txn.is_read_only());
        txn.record_op(1, default_full_compare, b"k", insert_op(b"v"));
        assert!(!txn.is_read_only());
    }
}
