//! Cursors - dual-mode traversal handles.
//!
//! A cursor is coupled to a B+tree leaf position, to a transaction op for
//! a key that may not exist in the tree yet, or to nothing (NIL). Moves
//! merge the two sides in comparator order; a per-key duplicate cache
//! merges committed duplicates with the transaction's in-flight duplicate
//! ops and carries the 1-based selection index.
//!
//! A cursor pins the leaf page it is coupled to so the page cannot be
//! evicted from under it; dropping the cursor releases the pin. Cursors
//! bound to a transaction become invalid the moment the transaction ends.

use std::cmp::Ordering;
use std::collections::HashSet;

use parking_lot::MutexGuard;

use crate::btree::{self, BtreePos};
use crate::cache::PageManager;
use crate::common::{Error, MoveFlags, InsertFlags, PageOffset, Result};
use crate::db::DbState;
use crate::env::{EnvCore, EnvHandle};
use crate::txn::{probe_chain, KeyProbe, TxnOp, TxnOpKind, TxnState};

/// Which inner cursor a NIL check or detach applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorSide {
    Btree,
    Txn,
    Both,
}

/// The authoritative coupling of the cursor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Couple {
    Nil,
    Btree,
    Txn,
}

/// One line of the duplicate cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DupeLine {
    /// 0-based duplicate position in the B+tree entry.
    Btree(usize),
    /// Sequence number of the transaction op holding the record.
    Txn(u64),
}

/// The last public operation, kept for diagnostics and move dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum LastOp {
    #[default]
    None,
    Find,
    Move,
    Insert,
    Erase,
}

#[derive(Default)]
struct CursorState {
    couple: Option<Couple>,
    btree: Option<BtreePos>,
    txn_key: Option<Vec<u8>>,
    /// The key the cursor currently stands on, fully materialized.
    current_key: Option<Vec<u8>>,
    dupecache: Vec<DupeLine>,
    /// 1-based selected line; 0 = not in duplicate mode.
    dupe_index: usize,
    last_op: LastOp,
    /// Cached cross-side compare; None = needs refresh.
    last_cmp: Option<Ordering>,
    /// Page pinned on behalf of the B+tree coupling.
    pinned: Option<PageOffset>,
}

impl CursorState {
    fn couple(&self) -> Couple {
        self.couple.unwrap_or(Couple::Nil)
    }
}

/// A traversal handle over one database.
pub struct Cursor {
    env: EnvHandle,
    db: u16,
    txn_id: Option<u64>,
    state: CursorState,
}

// ============================================================================
// Internal helpers over the destructured core
// ============================================================================

fn unpin(pager: &mut PageManager, state: &mut CursorState) {
    if let Some(offset) = state.pinned.take() {
        pager.unpin_cursor(offset);
    }
}

/// Replace the btree coupling (and its pin).
fn set_btree_pos(pager: &mut PageManager, state: &mut CursorState, pos: Option<BtreePos>) {
    unpin(pager, state);
    if let Some(pos) = pos {
        pager.pin_cursor(pos.page);
        state.pinned = Some(pos.page);
    }
    state.btree = pos;
}

/// Detach everything: the cursor goes NIL.
fn detach(pager: &mut PageManager, state: &mut CursorState) {
    unpin(pager, state);
    state.couple = Some(Couple::Nil);
    state.btree = None;
    state.txn_key = None;
    state.current_key = None;
    state.dupecache.clear();
    state.dupe_index = 0;
    state.last_cmp = None;
}

/// Position the btree side at `key` (or, without `only_equal`, at its
/// nearest successor).
fn sync_btree_side(
    pager: &mut PageManager,
    db: &mut DbState,
    key: &[u8],
    only_equal: bool,
) -> Result<Option<BtreePos>> {
    if only_equal {
        btree::search(pager, db, key)
    } else {
        Ok(btree::search_near(pager, db, key)?.map(|(pos, _)| pos))
    }
}

/// The 1-based btree duplicate indexes erased by the op chain.
fn erased_dup_indexes(ops: &[TxnOp]) -> HashSet<usize> {
    ops.iter()
        .filter_map(|op| match op.kind {
            TxnOpKind::Erase {
                dup_index: Some(index),
            } => Some(index),
            _ => None,
        })
        .collect()
}

/// Rebuild the duplicate cache for `key`: surviving btree duplicates
/// first, then the transaction ops applied in commit order.
fn build_dupecache(
    pager: &mut PageManager,
    db: &mut DbState,
    bt_pos: Option<BtreePos>,
    ops: Option<&[TxnOp]>,
) -> Result<Vec<DupeLine>> {
    let mut lines = Vec::new();

    if let Some(pos) = bt_pos {
        let count = btree::dup_count_at(pager, db, pos)?;
        let erased = ops.map(erased_dup_indexes).unwrap_or_default();
        for index in 0..count {
            if !erased.contains(&(index + 1)) {
                lines.push(DupeLine::Btree(index));
            }
        }
    }

    if let Some(ops) = ops {
        for op in ops {
            match &op.kind {
                TxnOpKind::Insert { .. } => lines.push(DupeLine::Txn(op.seq)),
                TxnOpKind::Erase { dup_index: None } => lines.clear(),
                // Btree-indexed erases were applied above.
                TxnOpKind::Erase { dup_index: Some(_) } => {}
                TxnOpKind::Overwrite { dup_index, .. } => {
                    if let Some(line) = lines.get_mut(*dup_index) {
                        *line = DupeLine::Txn(op.seq);
                    }
                }
            }
        }
    }

    Ok(lines)
}

/// Resolve one duplicate cache line to its record bytes.
fn line_record(
    pager: &mut PageManager,
    db: &mut DbState,
    bt_pos: Option<BtreePos>,
    ops: Option<&[TxnOp]>,
    line: DupeLine,
) -> Result<Vec<u8>> {
    match line {
        DupeLine::Btree(index) => {
            // A transaction overwrite shadows the committed record.
            if let Some(ops) = ops {
                let shadow = ops.iter().rev().find_map(|op| match &op.kind {
                    TxnOpKind::Overwrite { record, dup_index } if *dup_index == index => {
                        Some(record.clone())
                    }
                    _ => None,
                });
                if let Some(record) = shadow {
                    return Ok(record);
                }
            }
            let pos = bt_pos.ok_or(Error::InvParameter("cursor lost its tree position"))?;
            btree::record_at(pager, db, pos, index)
        }
        DupeLine::Txn(seq) => {
            let ops = ops.ok_or(Error::InvParameter("cursor lost its transaction ops"))?;
            let op = ops
                .iter()
                .find(|op| op.seq == seq)
                .ok_or(Error::InvParameter("cursor lost its transaction ops"))?;
            match &op.kind {
                TxnOpKind::Insert { record, .. } => Ok(record.clone()),
                TxnOpKind::Overwrite { record, .. } => Ok(record.clone()),
                TxnOpKind::Erase { .. } => {
                    Err(Error::InvParameter("duplicate cache line names an erase"))
                }
            }
        }
    }
}

/// Re-anchor a stored btree position: entries may have shifted within the
/// leaf since the cursor coupled. The key bytes are authoritative.
fn revalidate_btree_pos(
    pager: &mut PageManager,
    db: &mut DbState,
    state: &mut CursorState,
) -> Result<()> {
    let (Some(pos), Some(current)) = (state.btree, state.current_key.clone()) else {
        return Ok(());
    };

    let still_there = btree::valid_pos(pager, pos)?
        && btree::key_at(pager, db, pos)? == current;
    if !still_there {
        let fresh = btree::search(pager, db, &current)?;
        set_btree_pos(pager, state, fresh);
    }
    Ok(())
}

/// Where a merged seek starts from.
enum Seek {
    Edge { last: bool },
    Beyond { key: Vec<u8>, reverse: bool },
}

struct Winner {
    key: Vec<u8>,
    bt_pos: Option<BtreePos>,
    couple: Couple,
    lines: Vec<DupeLine>,
    cross_cmp: Option<Ordering>,
}

/// The btree key strictly beyond `key` in the given direction.
fn bt_beyond(
    pager: &mut PageManager,
    db: &mut DbState,
    key: &[u8],
    reverse: bool,
) -> Result<Option<BtreePos>> {
    if reverse {
        match btree::search_near(pager, db, key)? {
            // `pos` is the first entry >= key, so its predecessor is the
            // last entry < key.
            Some((pos, _)) => btree::previous(pager, pos),
            None => btree::last(pager, db),
        }
    } else {
        match btree::search_near(pager, db, key)? {
            Some((pos, true)) => btree::next(pager, pos),
            Some((pos, false)) => Ok(Some(pos)),
            None => Ok(None),
        }
    }
}

/// Merge the btree and transaction sides and pick the next visible key.
///
/// Keys whose transaction chain ends in a whole-key erase (or whose
/// duplicates were all erased) are skipped.
fn seek_visible(
    pager: &mut PageManager,
    db: &mut DbState,
    txn: Option<&TxnState>,
    db_id: u16,
    mut from: Seek,
) -> Result<Option<Winner>> {
    let compare = db.hooks.full;

    loop {
        let reverse = match &from {
            Seek::Edge { last } => *last,
            Seek::Beyond { reverse, .. } => *reverse,
        };

        let bt_pos = match &from {
            Seek::Edge { last: false } => btree::first(pager, db)?,
            Seek::Edge { last: true } => btree::last(pager, db)?,
            Seek::Beyond { key, reverse } => bt_beyond(pager, db, key, *reverse)?,
        };
        let tx_side: Option<(Vec<u8>, Vec<TxnOp>)> = match (&from, txn) {
            (_, None) => None,
            (Seek::Edge { last }, Some(txn)) => txn
                .edge_key(db_id, *last)
                .map(|(k, ops)| (k.to_vec(), ops.to_vec())),
            (Seek::Beyond { key, reverse }, Some(txn)) => txn
                .neighbour_key(db_id, compare, key, *reverse)
                .map(|(k, ops)| (k.to_vec(), ops.to_vec())),
        };

        let bt_key = match bt_pos {
            Some(pos) => Some(btree::key_at(pager, db, pos)?),
            None => None,
        };

        // Decide the candidate key and which side owns it.
        let (key, owner_bt_pos, couple, ops, cross_cmp) = match (bt_key, tx_side) {
            (None, None) => return Ok(None),
            (Some(bk), None) => {
                let ops = txn.and_then(|t| t.ops_for(db_id, compare, &bk).map(<[TxnOp]>::to_vec));
                (bk, bt_pos, Couple::Btree, ops, None)
            }
            (None, Some((tk, ops))) => (tk, None, Couple::Txn, Some(ops), None),
            (Some(bk), Some((tk, ops))) => {
                let ordering = compare(&bk, &tk);
                let bt_wins = if reverse {
                    ordering == Ordering::Greater
                } else {
                    ordering == Ordering::Less
                };
                if ordering == Ordering::Equal {
                    (bk, bt_pos, Couple::Txn, Some(ops), Some(ordering))
                } else if bt_wins {
                    (bk, bt_pos, Couple::Btree, None, Some(ordering))
                } else {
                    (tk, None, Couple::Txn, Some(ops), Some(ordering))
                }
            }
        };

        // Visibility: a chain ending in a whole-key erase hides the key.
        if let Some(ops) = &ops {
            if probe_chain(ops) == KeyProbe::Erased {
                from = Seek::Beyond { key, reverse };
                continue;
            }
        }

        let lines = build_dupecache(pager, db, owner_bt_pos, ops.as_deref())?;
        if lines.is_empty() {
            // Every duplicate was erased in the transaction.
            from = Seek::Beyond { key, reverse };
            continue;
        }

        return Ok(Some(Winner {
            key,
            bt_pos: owner_bt_pos,
            couple,
            lines,
            cross_cmp,
        }));
    }
}

/// Lock the environment, refusing to operate for a cursor whose
/// transaction has ended.
fn lock_env(env: &EnvHandle, txn_id: Option<u64>) -> Result<MutexGuard<'_, EnvCore>> {
    let core = env.lock();
    if let Some(id) = txn_id {
        if !core.txn_is_active(id) {
            return Err(Error::InvParameter(
                "cursor's transaction has ended; the cursor is closed",
            ));
        }
    }
    Ok(core)
}

// ============================================================================
// The public cursor
// ============================================================================

impl Cursor {
    pub(crate) fn create(env: EnvHandle, db: u16, txn_id: Option<u64>) -> Result<Self> {
        {
            let mut core = env.lock();
            if let Some(id) = txn_id {
                if !core.txn_is_active(id) {
                    return Err(Error::InvParameter("transaction is no longer active"));
                }
            }
            core.db_state(db)?;
        }
        Ok(Self {
            env,
            db,
            txn_id,
            state: CursorState::default(),
        })
    }

    /// Is the cursor (or one side of it) detached?
    pub fn is_nil(&self, side: CursorSide) -> bool {
        match side {
            CursorSide::Btree => self.state.btree.is_none(),
            CursorSide::Txn => self.state.txn_key.is_none(),
            CursorSide::Both => self.state.couple() == Couple::Nil,
        }
    }

    /// The key the cursor currently stands on.
    pub fn key(&self) -> Result<Vec<u8>> {
        self.state
            .current_key
            .clone()
            .ok_or(Error::InvParameter("cursor is nil"))
    }

    /// The record of the currently selected duplicate.
    pub fn record(&mut self) -> Result<Vec<u8>> {
        if self.state.couple() == Couple::Nil {
            return Err(Error::InvParameter("cursor is nil"));
        }

        let mut core = lock_env(&self.env, self.txn_id)?;
        let core = &mut *core;
        let EnvCore {
            pager,
            databases,
            txn,
            ..
        } = core;
        let db = databases
            .get_mut(&self.db)
            .ok_or(Error::InvParameter("unknown database"))?;

        revalidate_btree_pos(pager, db, &mut self.state)?;
        let compare = db.hooks.full;
        let key = self.key()?;
        let ops = match (self.txn_id, txn.as_ref()) {
            (Some(_), Some(txn)) => txn.ops_for(self.db, compare, &key).map(<[TxnOp]>::to_vec),
            _ => None,
        };

        let index = self.state.dupe_index.max(1) - 1;
        let line = *self
            .state
            .dupecache
            .get(index)
            .ok_or(Error::InvParameter("cursor has no selected duplicate"))?;
        line_record(pager, db, self.state.btree, ops.as_deref(), line)
    }

    /// Position on `key` and return its (first visible) record.
    ///
    /// Couples to the transaction side when the key has in-flight ops,
    /// else to the B+tree.
    ///
    /// # Errors
    /// - `Error::KeyErasedInTxn` if the match was erased in the transaction
    /// - `Error::KeyNotFound` if no side has the key
    pub fn find(&mut self, key: &[u8]) -> Result<Vec<u8>> {
        let mut core = lock_env(&self.env, self.txn_id)?;
        let core = &mut *core;
        let EnvCore {
            pager,
            databases,
            txn,
            ..
        } = core;
        let db = databases
            .get_mut(&self.db)
            .ok_or(Error::InvParameter("unknown database"))?;
        let compare = db.hooks.full;

        detach(pager, &mut self.state);

        let txn_ref = match self.txn_id {
            Some(_) => txn.as_ref(),
            None => None,
        };
        let ops = txn_ref.and_then(|t| t.ops_for(self.db, compare, key).map(<[TxnOp]>::to_vec));

        let couple = if let Some(ops) = &ops {
            match probe_chain(ops) {
                KeyProbe::Erased => return Err(Error::KeyErasedInTxn),
                KeyProbe::Visible(_) => Couple::Txn,
                KeyProbe::Untouched => Couple::Btree,
            }
        } else {
            Couple::Btree
        };

        // Keep the btree side in sync whenever the key exists there.
        let bt_pos = sync_btree_side(pager, db, key, true)?;
        if couple == Couple::Btree && bt_pos.is_none() {
            return Err(Error::KeyNotFound);
        }

        let lines = build_dupecache(pager, db, bt_pos, ops.as_deref())?;
        if lines.is_empty() {
            return Err(Error::KeyErasedInTxn);
        }

        set_btree_pos(pager, &mut self.state, bt_pos);
        self.state.couple = Some(couple);
        self.state.txn_key = (couple == Couple::Txn).then(|| key.to_vec());
        self.state.current_key = Some(key.to_vec());
        self.state.dupecache = lines;
        self.state.dupe_index = 1;
        self.state.last_op = LastOp::Find;
        self.state.last_cmp = None;

        let line = self.state.dupecache[0];
        line_record(pager, db, self.state.btree, ops.as_deref(), line)
    }

    /// Move the cursor and return the key/record it lands on.
    ///
    /// `flags` carries one direction (FIRST/LAST/NEXT/PREVIOUS) plus
    /// optional SKIP_DUPLICATES / ONLY_DUPLICATES.
    ///
    /// # Errors
    /// `Error::KeyNotFound` at the ends of the key space (the cursor goes
    /// NIL).
    pub fn move_to(&mut self, flags: MoveFlags) -> Result<(Vec<u8>, Vec<u8>)> {
        let direction = flags.direction();
        if direction.bits().count_ones() != 1 {
            return Err(Error::InvParameter("exactly one move direction is required"));
        }

        let mut core = lock_env(&self.env, self.txn_id)?;
        let core = &mut *core;
        let EnvCore {
            pager,
            databases,
            txn,
            ..
        } = core;
        let db = databases
            .get_mut(&self.db)
            .ok_or(Error::InvParameter("unknown database"))?;
        let txn_ref = match self.txn_id {
            Some(_) => txn.as_ref(),
            None => None,
        };

        let reverse = direction.intersects(MoveFlags::LAST | MoveFlags::PREVIOUS);
        let is_step = direction.intersects(MoveFlags::NEXT | MoveFlags::PREVIOUS);

        // Duplicate-local movement never leaves the current key.
        if flags.contains(MoveFlags::ONLY_DUPLICATES) || (is_step && !flags.contains(MoveFlags::SKIP_DUPLICATES)) {
            if self.state.couple() != Couple::Nil && !self.state.dupecache.is_empty() {
                let len = self.state.dupecache.len();
                let moved = if direction == MoveFlags::FIRST {
                    self.state.dupe_index = 1;
                    true
                } else if direction == MoveFlags::LAST {
                    self.state.dupe_index = len;
                    true
                } else if direction == MoveFlags::NEXT && self.state.dupe_index < len {
                    self.state.dupe_index += 1;
                    true
                } else if direction == MoveFlags::PREVIOUS && self.state.dupe_index > 1 {
                    self.state.dupe_index -= 1;
                    true
                } else {
                    false
                };
                if moved {
                    revalidate_btree_pos(pager, db, &mut self.state)?;
                    let key = self.state.current_key.clone().unwrap();
                    let compare = db.hooks.full;
                    let ops = txn_ref
                        .and_then(|t| t.ops_for(self.db, compare, &key).map(<[TxnOp]>::to_vec));
                    let line = self.state.dupecache[self.state.dupe_index - 1];
                    let record =
                        line_record(pager, db, self.state.btree, ops.as_deref(), line)?;
                    self.state.last_op = LastOp::Move;
                    return Ok((key, record));
                }
            }
            if flags.contains(MoveFlags::ONLY_DUPLICATES) {
                return Err(Error::KeyNotFound);
            }
        }

        // Cross-key movement: merge the two sides.
        let from = if is_step && self.state.couple() != Couple::Nil {
            Seek::Beyond {
                key: self.state.current_key.clone().unwrap(),
                reverse,
            }
        } else {
            Seek::Edge { last: reverse }
        };

        match seek_visible(pager, db, txn_ref, self.db, from)? {
            None => {
                detach(pager, &mut self.state);
                self.state.last_op = LastOp::Move;
                Err(Error::KeyNotFound)
            }
            Some(winner) => {
                set_btree_pos(pager, &mut self.state, winner.bt_pos);
                self.state.couple = Some(winner.couple);
                self.state.txn_key =
                    (winner.couple == Couple::Txn).then(|| winner.key.clone());
                self.state.current_key = Some(winner.key.clone());
                self.state.dupe_index = if reverse { winner.lines.len() } else { 1 };
                self.state.dupecache = winner.lines;
                self.state.last_cmp = winner.cross_cmp;
                self.state.last_op = LastOp::Move;

                let compare = db.hooks.full;
                let ops = txn_ref
                    .and_then(|t| t.ops_for(self.db, compare, &winner.key).map(<[TxnOp]>::to_vec));
                let line = self.state.dupecache[self.state.dupe_index - 1];
                let record = line_record(pager, db, self.state.btree, ops.as_deref(), line)?;
                Ok((winner.key, record))
            }
        }
    }

    /// Insert through the cursor; on success the cursor stands on the
    /// inserted record.
    pub fn insert(&mut self, key: &[u8], record: &[u8], flags: InsertFlags) -> Result<()> {
        let mut core = lock_env(&self.env, self.txn_id)?;
        let core = &mut *core;
        core.db_insert(self.db, self.txn_id, key, record, flags)?;

        let EnvCore {
            pager,
            databases,
            txn,
            ..
        } = core;
        let db = databases
            .get_mut(&self.db)
            .ok_or(Error::InvParameter("unknown database"))?;
        let compare = db.hooks.full;

        detach(pager, &mut self.state);

        let bt_pos = sync_btree_side(pager, db, key, true)?;
        let (couple, ops) = match self.txn_id {
            Some(_) => {
                let ops = txn
                    .as_ref()
                    .and_then(|t| t.ops_for(self.db, compare, key).map(<[TxnOp]>::to_vec));
                (Couple::Txn, ops)
            }
            None => (Couple::Btree, None),
        };

        let lines = build_dupecache(pager, db, bt_pos, ops.as_deref())?;
        set_btree_pos(pager, &mut self.state, bt_pos);
        self.state.couple = Some(couple);
        self.state.txn_key = (couple == Couple::Txn).then(|| key.to_vec());
        self.state.current_key = Some(key.to_vec());
        self.state.dupe_index = lines.len().max(1);
        self.state.dupecache = lines;
        self.state.last_op = LastOp::Insert;
        self.state.last_cmp = None;
        Ok(())
    }

    /// Replace the record of the currently selected duplicate. The cursor
    /// does not move.
    pub fn overwrite(&mut self, record: &[u8]) -> Result<()> {
        if self.state.couple() == Couple::Nil {
            return Err(Error::InvParameter("cursor is nil"));
        }
        let key = self.key()?;
        let dup = self.state.dupe_index.max(1) - 1;

        let mut core = lock_env(&self.env, self.txn_id)?;
        let core = &mut *core;
        let EnvCore {
            pager,
            freelist,
            databases,
            txn,
            ..
        } = core;
        let db = databases
            .get_mut(&self.db)
            .ok_or(Error::InvParameter("unknown database"))?;
        let compare = db.hooks.full;

        match self.txn_id {
            Some(_) => {
                let txn = txn
                    .as_mut()
                    .ok_or(Error::InvParameter("transaction is no longer active"))?;
                txn.record_op(
                    self.db,
                    compare,
                    &key,
                    TxnOpKind::Overwrite {
                        record: record.to_vec(),
                        dup_index: dup,
                    },
                );
                // The matching duplicate cache line now names the new op.
                let ops = txn.ops_for(self.db, compare, &key).map(<[TxnOp]>::to_vec);
                revalidate_btree_pos(pager, db, &mut self.state)?;
                self.state.dupecache =
                    build_dupecache(pager, db, self.state.btree, ops.as_deref())?;
                Ok(())
            }
            None => {
                if let Some(txn) = txn {
                    if txn.touches_key(self.db, compare, &key) {
                        return Err(Error::TxnConflict);
                    }
                }
                revalidate_btree_pos(pager, db, &mut self.state)?;
                let pos = self
                    .state
                    .btree
                    .ok_or(Error::InvParameter("cursor lost its tree position"))?;
                btree::overwrite_at(pager, freelist, db, pos, dup, record)
            }
        }
    }

    /// Erase the key the cursor stands on; the cursor goes NIL.
    pub fn erase(&mut self) -> Result<()> {
        if self.state.couple() == Couple::Nil {
            return Err(Error::InvParameter("cursor is nil"));
        }
        let key = self.key()?;

        let mut core = lock_env(&self.env, self.txn_id)?;
        core.db_erase(self.db, self.txn_id, &key)?;
        detach(&mut core.pager, &mut self.state);
        self.state.last_op = LastOp::Erase;
        Ok(())
    }

    /// Number of records under the current key, rebuilding the duplicate
    /// cache when it is stale.
    pub fn duplicate_count(&mut self) -> Result<usize> {
        if self.state.couple() == Couple::Nil {
            return Err(Error::InvParameter("cursor is nil"));
        }

        let mut core = lock_env(&self.env, self.txn_id)?;
        let core = &mut *core;
        let EnvCore {
            pager,
            databases,
            txn,
            ..
        } = core;
        let db = databases
            .get_mut(&self.db)
            .ok_or(Error::InvParameter("unknown database"))?;

        if self.state.dupecache.is_empty() {
            revalidate_btree_pos(pager, db, &mut self.state)?;
            let compare = db.hooks.full;
            let key = self.key()?;
            let ops = match (self.txn_id, txn.as_ref()) {
                (Some(_), Some(txn)) => {
                    txn.ops_for(self.db, compare, &key).map(<[TxnOp]>::to_vec)
                }
                _ => None,
            };
            self.state.dupecache =
                build_dupecache(pager, db, self.state.btree, ops.as_deref())?;
            if self.state.dupe_index == 0 && !self.state.dupecache.is_empty() {
                self.state.dupe_index = 1;
            }
        }

        Ok(self.state.dupecache.len().max(1))
    }

    /// Probe the transaction op chain for the btree-coupled key.
    ///
    /// Returns the overwriting record if one shadows the committed value.
    ///
    /// # Errors
    /// `Error::KeyErasedInTxn` if a whole-key erase shadows the btree hit.
    pub fn check_txn_shadow(&mut self) -> Result<Option<Vec<u8>>> {
        let key = self.key()?;
        let core = lock_env(&self.env, self.txn_id)?;
        let Some(txn) = core.txn.as_ref() else {
            return Ok(None);
        };
        if self.txn_id.is_none() {
            return Ok(None);
        }

        let compare = core
            .databases
            .get(&self.db)
            .ok_or(Error::InvParameter("unknown database"))?
            .hooks
            .full;
        match txn.probe_key(self.db, compare, &key) {
            KeyProbe::Erased => Err(Error::KeyErasedInTxn),
            KeyProbe::Visible(record) => Ok(Some(record)),
            KeyProbe::Untouched => Ok(None),
        }
    }

    /// Deep-copy the cursor: position, duplicate cache and pins.
    pub fn try_clone(&self) -> Result<Cursor> {
        let mut core = lock_env(&self.env, self.txn_id)?;

        if let Some(offset) = self.state.pinned {
            core.pager.pin_cursor(offset);
        }
        Ok(Cursor {
            env: self.env.clone(),
            db: self.db,
            txn_id: self.txn_id,
            state: CursorState {
                couple: self.state.couple,
                btree: self.state.btree,
                txn_key: self.state.txn_key.clone(),
                current_key: self.state.current_key.clone(),
                dupecache: self.state.dupecache.clone(),
                dupe_index: self.state.dupe_index,
                last_op: self.state.last_op,
                last_cmp: self.state.last_cmp,
                pinned: self.state.pinned,
            },
        })
    }

    /// Detach one or both sides without destroying the cursor.
    pub fn set_to_nil(&mut self, side: CursorSide) {
        let mut core = self.env.lock();
        match side {
            CursorSide::Btree => {
                unpin(&mut core.pager, &mut self.state);
                self.state.btree = None;
                if self.state.couple() == Couple::Btree {
                    self.state.couple = Some(if self.state.txn_key.is_some() {
                        Couple::Txn
                    } else {
                        Couple::Nil
                    });
                }
            }
            CursorSide::Txn => {
                self.state.txn_key = None;
                if self.state.couple() == Couple::Txn {
                    self.state.couple = Some(if self.state.btree.is_some() {
                        Couple::Btree
                    } else {
                        Couple::Nil
                    });
                }
            }
            CursorSide::Both => detach(&mut core.pager, &mut self.state),
        }
        if self.state.couple() == Couple::Nil {
            self.state.dupecache.clear();
            self.state.dupe_index = 0;
            self.state.current_key = None;
        }
    }

    /// Close the cursor, releasing its pins.
    pub fn close(mut self) {
        let mut core = self.env.lock();
        detach(&mut core.pager, &mut self.state);
    }
}

impl Drop for Cursor {
    fn drop(&mut self) {
        if self.state.pinned.is_some() {
            let mut core = self.env.lock();
            unpin(&mut core.pager, &mut self.state);
        }
    }
}
