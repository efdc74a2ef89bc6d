//! Databases - named B+trees inside one environment.
//!
//! [`DbState`] is the environment-side state of one database (its root,
//! flags, compare hooks and extended-key cache); [`Database`] is the
//! public handle. All handle operations funnel through the environment
//! mutex into the `EnvCore` methods below, which implement transactional
//! visibility and conflict checks on top of the B+tree.

use crate::btree;
use crate::common::{DatabaseFlags, Error, InsertFlags, PageOffset, Result};
use crate::env::{EnvCore, EnvHandle, Transaction};
use crate::keys::{CompareHooks, ExtkeyCache, FullCompareFn, PrefixCompareFn};
use crate::txn::{KeyProbe, TxnOpKind};

/// Environment-side state of one named database.
pub(crate) struct DbState {
    pub name: u16,
    pub flags: DatabaseFlags,
    pub key_size: u16,
    /// Root page of the B+tree; NULL until the first insert.
    pub root: PageOffset,
    pub hooks: CompareHooks,
    /// Created lazily on the first extended-key compare; never for an
    /// in-memory environment.
    pub extkeys: Option<ExtkeyCache>,
    pub in_memory: bool,
    /// An open `Database` handle exists.
    pub open: bool,
    /// The root moved since the directory was last written.
    pub root_changed: bool,
}

impl DbState {
    pub fn new(name: u16, flags: DatabaseFlags, key_size: u16, in_memory: bool) -> Self {
        Self {
            name,
            flags,
            key_size,
            root: PageOffset::NULL,
            hooks: CompareHooks::default(),
            extkeys: None,
            in_memory,
            open: false,
            root_changed: false,
        }
    }

    /// The extended-key cache, created on first use. In-memory
    /// environments never cache extended keys (the blob arena *is*
    /// memory).
    pub fn extkey_cache(&mut self) -> Option<&mut ExtkeyCache> {
        if self.in_memory {
            return None;
        }
        Some(self.extkeys.get_or_insert_with(ExtkeyCache::new))
    }
}

impl EnvCore {
    /// Insert `key`/`record` into database `db`, transactionally if a
    /// transaction id is given.
    pub(crate) fn db_insert(
        &mut self,
        db: u16,
        txn_id: Option<u64>,
        key: &[u8],
        record: &[u8],
        flags: InsertFlags,
    ) -> Result<()> {
        if key.len() > u16::MAX as usize {
            return Err(Error::InvParameter("key is longer than 65535 bytes"));
        }
        if record.len() > u32::MAX as usize {
            return Err(Error::InvParameter("record is longer than u32::MAX bytes"));
        }

        let EnvCore {
            pager,
            freelist,
            databases,
            txn,
            ..
        } = self;
        let state = databases.get_mut(&db).ok_or(Error::InvParameter("unknown database"))?;
        let compare = state.hooks.full;

        if flags.contains(InsertFlags::DUPLICATE)
            && !state.flags.contains(DatabaseFlags::ENABLE_DUPLICATES)
        {
            return Err(Error::InvParameter(
                "duplicate insert into a database without ENABLE_DUPLICATES",
            ));
        }

        match txn_id {
            Some(id) => {
                let txn = match txn {
                    Some(txn) if txn.id() == id => txn,
                    _ => return Err(Error::InvParameter("transaction is no longer active")),
                };

                // Does the key exist from this transaction's point of view?
                let exists = match txn.probe_key(db, compare, key) {
                    KeyProbe::Visible(_) => true,
                    KeyProbe::Erased => false,
                    KeyProbe::Untouched => btree::search(pager, state, key)?.is_some(),
                };
                if exists
                    && !flags.contains(InsertFlags::DUPLICATE)
                    && !flags.contains(InsertFlags::OVERWRITE)
                {
                    return Err(Error::DuplicateKey);
                }

                txn.record_op(
                    db,
                    compare,
                    key,
                    TxnOpKind::Insert {
                        record: record.to_vec(),
                        flags,
                    },
                );
                Ok(())
            }
            None => {
                // A non-transactional write must not thread through keys
                // an in-flight transaction is working on.
                if let Some(txn) = txn {
                    if txn.touches_key(db, compare, key) {
                        return Err(Error::TxnConflict);
                    }
                }
                btree::insert(pager, None, freelist, state, key, record, flags)
            }
        }
    }

    /// Look up `key`; returns its (first) record.
    pub(crate) fn db_find(
        &mut self,
        db: u16,
        txn_id: Option<u64>,
        key: &[u8],
    ) -> Result<Vec<u8>> {
        let EnvCore {
            pager,
            databases,
            txn,
            ..
        } = self;
        let state = databases.get_mut(&db).ok_or(Error::InvParameter("unknown database"))?;
        let compare = state.hooks.full;

        if let Some(id) = txn_id {
            let txn = match txn {
                Some(txn) if txn.id() == id => txn,
                _ => return Err(Error::InvParameter("transaction is no longer active")),
            };
            match txn.probe_key(db, compare, key) {
                KeyProbe::Visible(record) => return Ok(record),
                KeyProbe::Erased => return Err(Error::KeyNotFound),
                KeyProbe::Untouched => {}
            }
        }

        match btree::search(pager, state, key)? {
            Some(pos) => btree::record_at(pager, state, pos, 0),
            None => Err(Error::KeyNotFound),
        }
    }

    /// Erase `key` (all of its duplicates).
    pub(crate) fn db_erase(&mut self, db: u16, txn_id: Option<u64>, key: &[u8]) -> Result<()> {
        let EnvCore {
            pager,
            freelist,
            databases,
            txn,
            ..
        } = self;
        let state = databases.get_mut(&db).ok_or(Error::InvParameter("unknown database"))?;
        let compare = state.hooks.full;

        match txn_id {
            Some(id) => {
                let txn = match txn {
                    Some(txn) if txn.id() == id => txn,
                    _ => return Err(Error::InvParameter("transaction is no longer active")),
                };

                let exists = match txn.probe_key(db, compare, key) {
                    KeyProbe::Visible(_) => true,
                    KeyProbe::Erased => false,
                    KeyProbe::Untouched => btree::search(pager, state, key)?.is_some(),
                };
                if !exists {
                    return Err(Error::KeyNotFound);
                }

                txn.record_op(db, compare, key, TxnOpKind::Erase { dup_index: None });
                Ok(())
            }
            None => {
                if let Some(txn) = txn {
                    if txn.touches_key(db, compare, key) {
                        return Err(Error::TxnConflict);
                    }
                }
                btree::erase(pager, None, freelist, state, key, None)
            }
        }
    }

    /// Erase one duplicate of `key`, addressed by its 1-based position
    /// among the committed duplicates.
    pub(crate) fn db_erase_duplicate(
        &mut self,
        db: u16,
        txn_id: Option<u64>,
        key: &[u8],
        dup_index: usize,
    ) -> Result<()> {
        if dup_index == 0 {
            return Err(Error::InvParameter("duplicate index is 1-based"));
        }

        let EnvCore {
            pager,
            freelist,
            databases,
            txn,
            ..
        } = self;
        let state = databases.get_mut(&db).ok_or(Error::InvParameter("unknown database"))?;
        let compare = state.hooks.full;

        match txn_id {
            Some(id) => {
                let txn = match txn {
                    Some(txn) if txn.id() == id => txn,
                    _ => return Err(Error::InvParameter("transaction is no longer active")),
                };
                if matches!(txn.probe_key(db, compare, key), KeyProbe::Erased) {
                    return Err(Error::KeyNotFound);
                }
                if btree::search(pager, state, key)?.is_none()
                    && !txn.touches_key(db, compare, key)
                {
                    return Err(Error::KeyNotFound);
                }

                txn.record_op(
                    db,
                    compare,
                    key,
                    TxnOpKind::Erase {
                        dup_index: Some(dup_index),
                    },
                );
                Ok(())
            }
            None => {
                if let Some(txn) = txn {
                    if txn.touches_key(db, compare, key) {
                        return Err(Error::TxnConflict);
                    }
                }
                btree::erase(pager, None, freelist, state, key, Some(dup_index))
            }
        }
    }

    pub(crate) fn db_state(&mut self, db: u16) -> Result<&mut DbState> {
        self.databases
            .get_mut(&db)
            .ok_or(Error::InvParameter("unknown database"))
    }
}

/// A handle to one named database.
///
/// The handle shares the environment core; dropping it releases the
/// database for re-opening. At most one handle per database is open at a
/// time.
pub struct Database {
    env: EnvHandle,
    name: u16,
}

impl Database {
    pub(crate) fn new(env: EnvHandle, name: u16) -> Self {
        Self { env, name }
    }

    /// The database's numeric name.
    #[inline]
    pub fn name(&self) -> u16 {
        self.name
    }

    /// Insert a key/record pair.
    ///
    /// # Errors
    /// - `Error::DuplicateKey` if the key exists and no `OVERWRITE` /
    ///   `DUPLICATE` flag is given
    /// - `Error::TxnConflict` for a non-transactional write on a key with
    ///   in-flight transaction ops
    pub fn insert(
        &self,
        txn: Option<&Transaction>,
        key: &[u8],
        record: &[u8],
        flags: InsertFlags,
    ) -> Result<()> {
        let mut core = self.env.lock();
        core.db_insert(self.name, txn.map(Transaction::id), key, record, flags)
    }

    /// Look up a key; returns its (first) record.
    pub fn find(&self, txn: Option<&Transaction>, key: &[u8]) -> Result<Vec<u8>> {
        let mut core = self.env.lock();
        core.db_find(self.name, txn.map(Transaction::id), key)
    }

    /// Erase a key and all of its duplicates.
    pub fn erase(&self, txn: Option<&Transaction>, key: &[u8]) -> Result<()> {
        let mut core = self.env.lock();
        core.db_erase(self.name, txn.map(Transaction::id), key)
    }

    /// Erase one duplicate of `key`, addressed by its 1-based position
    /// among the committed duplicates.
    pub fn erase_duplicate(
        &self,
        txn: Option<&Transaction>,
        key: &[u8],
        dup_index: usize,
    ) -> Result<()> {
        let mut core = self.env.lock();
        core.db_erase_duplicate(self.name, txn.map(Transaction::id), key, dup_index)
    }

    /// Bytes held by this database's extended-key cache (0 when the cache
    /// was never created, as in an in-memory environment).
    pub fn extkey_cache_bytes(&self) -> usize {
        let mut core = self.env.lock();
        core.db_state(self.name)
            .ok()
            .and_then(|state| state.extkeys.as_ref())
            .map_or(0, |cache| cache.used_bytes())
    }

    /// Open a cursor over this database, optionally bound to `txn`.
    pub fn cursor(&self, txn: Option<&Transaction>) -> Result<crate::cursor::Cursor> {
        crate::cursor::Cursor::create(self.env.clone(), self.name, txn.map(Transaction::id))
    }

    /// Install a full-key compare hook.
    ///
    /// Must happen before the first insert; the on-disk order is fixed by
    /// whatever hook performed it.
    pub fn set_compare(&self, compare: FullCompareFn) -> Result<()> {
        let mut core = self.env.lock();
        let state = core.db_state(self.name)?;
        if !state.root.is_null() {
            return Err(Error::InvParameter(
                "compare hook installed on a non-empty database",
            ));
        }
        state.hooks.full = compare;
        Ok(())
    }

    /// Install (or clear) the prefix compare hook.
    pub fn set_prefix_compare(&self, compare: Option<PrefixCompareFn>) -> Result<()> {
        let mut core = self.env.lock();
        core.db_state(self.name)?.hooks.prefix = compare;
        Ok(())
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        let mut core = self.env.lock();
        if let Ok(state) = core.db_state(self.name) {
            state.open = false;
        }
    }
}
