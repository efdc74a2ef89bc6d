//! Environment - the top-level handle over one file or arena.
//!
//! An environment owns the device, the page cache, the freelist and the
//! database directory; page 0 of the file is its header. All state is
//! reachable only through the environment handle (nothing here is
//! process-global), and one `parking_lot::Mutex` serializes every
//! operation on the core.

use std::path::Path;
use std::sync::Arc;

use log::{debug, warn};
use parking_lot::Mutex;

use crate::btree;
use crate::cache::{CacheInfo, PageManager};
use crate::common::config::{
    DEFAULT_CACHE_CAPACITY, DEFAULT_KEY_SIZE, DEFAULT_PAGE_SIZE, ENV_MAGIC, FORMAT_VERSION,
    MAX_DATABASES, MIN_KEY_SIZE, MIN_PAGE_SIZE,
};
use crate::common::{DatabaseFlags, EnvFlags, Error, InsertFlags, PageOffset, Result};
use crate::db::{Database, DbState};
use crate::storage::page::{Page, PageType};
use crate::storage::{Device, DiskDevice, Freelist, MemoryArena};
use crate::txn::{TxnOpKind, TxnState};

use std::collections::HashMap;

/// Shared handle to the environment core.
pub(crate) type EnvHandle = Arc<Mutex<EnvCore>>;

// Environment header layout, inside the payload of page 0:
//
// ```text
// Offset  Size  Field
// ------  ----  -----
// 0       4     magic
// 4       4     format version
// 8       4     page size
// 12      2     max databases
// 14      2     reserved
// 16      8     freelist root offset
// 24      16×N  directory: { name u16, pad u16, flags u32, key_size u16,
//               pad u16, root u64 } is 18 bytes -- packed as below
// ```
//
// Directory slots are 16 bytes: name u16, key_size u16, flags u32, root u64.
const HDR_MAGIC: usize = 0;
const HDR_VERSION: usize = 4;
const HDR_PAGE_SIZE: usize = 8;
const HDR_MAX_DBS: usize = 12;
const HDR_FREELIST: usize = 16;
const HDR_DIRECTORY: usize = 24;
const DIR_SLOT: usize = 16;

/// The single-threaded core every public handle locks into.
pub(crate) struct EnvCore {
    pub flags: EnvFlags,
    pub page_size: usize,
    pub max_databases: u16,
    pub pager: PageManager,
    pub freelist: Freelist,
    pub databases: HashMap<u16, DbState>,
    /// The active transaction, if any. One at a time.
    pub txn: Option<TxnState>,
    pub(crate) next_txn_id: u64,
}

impl EnvCore {
    fn new(
        device: Device,
        flags: EnvFlags,
        page_size: usize,
        cache_capacity: usize,
    ) -> Self {
        let write_through = flags.contains(EnvFlags::WRITE_THROUGH);
        Self {
            flags,
            page_size,
            max_databases: MAX_DATABASES,
            pager: PageManager::new(device, page_size, cache_capacity, write_through),
            freelist: Freelist::new(),
            databases: HashMap::new(),
            txn: None,
            next_txn_id: 1,
        }
    }

    #[inline]
    fn is_in_memory(&self) -> bool {
        self.flags.contains(EnvFlags::IN_MEMORY_DB)
    }

    // ========================================================================
    // Header page
    // ========================================================================

    /// Serialize the header and directory into page 0.
    ///
    /// The freelist is flushed first so its root lands in the header.
    fn write_header(&mut self) -> Result<()> {
        if self.is_in_memory() {
            return Ok(());
        }

        let freelist_root = self
            .freelist
            .flush(self.pager.device_mut().disk(), self.page_size)?;

        let mut page = Page::new(self.page_size, PageType::Header);
        page.set_offset(PageOffset::NULL);
        {
            let payload = page.payload_mut();
            payload[HDR_MAGIC..HDR_MAGIC + 4].copy_from_slice(&ENV_MAGIC);
            payload[HDR_VERSION..HDR_VERSION + 4]
                .copy_from_slice(&FORMAT_VERSION.to_le_bytes());
            payload[HDR_PAGE_SIZE..HDR_PAGE_SIZE + 4]
                .copy_from_slice(&(self.page_size as u32).to_le_bytes());
            payload[HDR_MAX_DBS..HDR_MAX_DBS + 2]
                .copy_from_slice(&self.max_databases.to_le_bytes());
            payload[HDR_FREELIST..HDR_FREELIST + 8]
                .copy_from_slice(&freelist_root.0.to_le_bytes());

            let mut names: Vec<u16> = self.databases.keys().copied().collect();
            names.sort_unstable();
            for (slot, name) in names.iter().enumerate() {
                let state = &self.databases[name];
                let at = HDR_DIRECTORY + slot * DIR_SLOT;
                payload[at..at + 2].copy_from_slice(&state.name.to_le_bytes());
                payload[at + 2..at + 4].copy_from_slice(&state.key_size.to_le_bytes());
                payload[at + 4..at + 8].copy_from_slice(&state.flags.bits().to_le_bytes());
                payload[at + 8..at + 16].copy_from_slice(&state.root.0.to_le_bytes());
            }
        }
        page.seal();
        self.pager.device_mut().disk().write_at(0, page.data())?;

        for state in self.databases.values_mut() {
            state.root_changed = false;
        }
        Ok(())
    }

    /// Parse the header page of an existing file into a fresh core.
    fn read_header(&mut self) -> Result<()> {
        let mut page = Page::new(self.page_size, PageType::Header);
        self.pager.device_mut().disk().read_at(0, page.data_mut())?;
        page.verify()?;

        let payload = page.payload();
        if payload[HDR_MAGIC..HDR_MAGIC + 4] != ENV_MAGIC {
            return Err(Error::InvParameter("not a burrowdb file"));
        }
        let version = u32::from_le_bytes(payload[HDR_VERSION..HDR_VERSION + 4].try_into().unwrap());
        if version != FORMAT_VERSION {
            return Err(Error::InvParameter("unsupported format version"));
        }

        self.max_databases =
            u16::from_le_bytes(payload[HDR_MAX_DBS..HDR_MAX_DBS + 2].try_into().unwrap());
        let freelist_root = PageOffset::new(u64::from_le_bytes(
            payload[HDR_FREELIST..HDR_FREELIST + 8].try_into().unwrap(),
        ));

        for slot in 0..self.max_databases as usize {
            let at = HDR_DIRECTORY + slot * DIR_SLOT;
            let name = u16::from_le_bytes(payload[at..at + 2].try_into().unwrap());
            if name == 0 {
                continue;
            }
            let key_size = u16::from_le_bytes(payload[at + 2..at + 4].try_into().unwrap());
            let flags = DatabaseFlags::from_bits_truncate(u32::from_le_bytes(
                payload[at + 4..at + 8].try_into().unwrap(),
            ));
            let root = PageOffset::new(u64::from_le_bytes(
                payload[at + 8..at + 16].try_into().unwrap(),
            ));

            let mut state = DbState::new(name, flags, key_size, false);
            state.root = root;
            self.databases.insert(name, state);
        }

        self.freelist = Freelist::load(
            self.pager.device_mut().disk(),
            self.page_size,
            freelist_root,
        )?;
        Ok(())
    }

    // ========================================================================
    // Flush and close
    // ========================================================================

    /// Write every dirty page, the freelist and the header; sync the file.
    pub(crate) fn flush(&mut self, drop_clean: bool) -> Result<()> {
        if self.is_in_memory() {
            return Ok(());
        }

        self.pager.flush_all(&mut self.freelist, drop_clean)?;
        self.write_header()?;
        self.pager.device_mut().disk().sync()?;
        Ok(())
    }

    // ========================================================================
    // Databases
    // ========================================================================

    pub(crate) fn create_database(
        &mut self,
        name: u16,
        flags: DatabaseFlags,
        key_size: u16,
    ) -> Result<()> {
        // The hash backend is declared but unsupported.
        if self.flags.contains(EnvFlags::USE_HASH) {
            return Err(Error::InvParameter("hash indexes are not supported"));
        }
        if name == 0 {
            return Err(Error::InvParameter("database name 0 is reserved"));
        }
        if self.databases.len() >= self.max_databases as usize {
            return Err(Error::InvParameter("database directory is full"));
        }
        if self.databases.contains_key(&name) {
            return Err(Error::InvParameter("database already exists"));
        }
        if key_size < MIN_KEY_SIZE {
            return Err(Error::InvParameter("key size is too small"));
        }
        let payload_len = self.page_size - crate::storage::PersistedHeader::SIZE;
        if crate::btree::node::capacity(payload_len, key_size as usize) < 4 {
            return Err(Error::InvParameter("key size is too large for the page size"));
        }

        let state = DbState::new(name, flags, key_size, self.is_in_memory());
        self.databases.insert(name, state);
        debug!("created database {name} (key_size {key_size})");
        Ok(())
    }

    fn mark_open(&mut self, name: u16) -> Result<()> {
        let state = self
            .databases
            .get_mut(&name)
            .ok_or(Error::KeyNotFound)?;
        if state.open {
            return Err(Error::DatabaseAlreadyOpen(name));
        }
        state.open = true;
        Ok(())
    }

    // ========================================================================
    // Transactions
    // ========================================================================

    fn begin_txn(&mut self) -> Result<u64> {
        if !self.flags.contains(EnvFlags::ENABLE_TRANSACTIONS) {
            return Err(Error::InvParameter(
                "environment was not created with ENABLE_TRANSACTIONS",
            ));
        }
        if self.txn.is_some() {
            return Err(Error::InvParameter("a transaction is already active"));
        }

        let id = self.next_txn_id;
        self.next_txn_id += 1;
        self.txn = Some(TxnState::new(id));
        debug!("began transaction {id}");
        Ok(id)
    }

    /// Replay the transaction's ops through the B+tree, in the order they
    /// were recorded.
    pub(crate) fn commit_txn(&mut self, id: u64) -> Result<()> {
        let mut txn = match self.txn.take() {
            Some(txn) if txn.id() == id => txn,
            other => {
                self.txn = other;
                return Err(Error::InvParameter("transaction is no longer active"));
            }
        };

        // Flatten to (seq, db, key, op) and apply in sequence order.
        let mut ops = Vec::new();
        for (db, tree) in txn.take_ops() {
            for (key, chain) in tree {
                for op in chain {
                    ops.push((op.seq, db, key.bytes.clone(), op.kind));
                }
            }
        }
        ops.sort_by_key(|(seq, ..)| *seq);

        let EnvCore {
            pager,
            freelist,
            databases,
            ..
        } = self;
        for (_, db, key, kind) in ops {
            let state = databases
                .get_mut(&db)
                .ok_or(Error::InvParameter("unknown database"))?;
            match kind {
                TxnOpKind::Insert { record, flags } => {
                    btree::insert(pager, Some(&mut txn), freelist, state, &key, &record, flags)?;
                }
                TxnOpKind::Erase { dup_index } => {
                    btree::erase(pager, Some(&mut txn), freelist, state, &key, dup_index)?;
                }
                TxnOpKind::Overwrite { record, dup_index } => {
                    match btree::search(pager, state, &key)? {
                        Some(pos) => {
                            btree::overwrite_at(pager, freelist, state, pos, dup_index, &record)?;
                        }
                        None => {
                            btree::insert(
                                pager,
                                Some(&mut txn),
                                freelist,
                                state,
                                &key,
                                &record,
                                InsertFlags::OVERWRITE,
                            )?;
                        }
                    }
                }
            }
        }

        self.pager.release_txn_pins(txn.pages());
        debug!("committed transaction {id}");
        Ok(())
    }

    /// Discard the transaction's pending work.
    pub(crate) fn abort_txn(&mut self, id: u64) -> Result<()> {
        let txn = match self.txn.take() {
            Some(txn) if txn.id() == id => txn,
            other => {
                self.txn = other;
                return Err(Error::InvParameter("transaction is no longer active"));
            }
        };

        self.pager.release_txn_pins(txn.pages());
        debug!("aborted transaction {id}");
        Ok(())
    }

    /// Is this transaction id still the active one?
    pub(crate) fn txn_is_active(&self, id: u64) -> bool {
        self.txn.as_ref().is_some_and(|txn| txn.id() == id)
    }
}

impl Drop for EnvCore {
    fn drop(&mut self) {
        if let Err(err) = self.flush(true) {
            warn!("flush on close failed: {err}");
        }
    }
}

/// An environment: one file (or in-memory arena) holding up to
/// [`MAX_DATABASES`] named databases.
///
/// # Usage
/// ```no_run
/// use burrowdb::{DatabaseFlags, EnvFlags, Environment, InsertFlags};
///
/// let env = Environment::create("my.db", EnvFlags::empty()).unwrap();
/// let db = env.create_database(1, DatabaseFlags::empty()).unwrap();
///
/// db.insert(None, b"hello", b"world", InsertFlags::empty()).unwrap();
/// assert_eq!(db.find(None, b"hello").unwrap(), b"world");
/// ```
pub struct Environment {
    inner: EnvHandle,
}

impl Environment {
    /// Create a new environment file with default page size and cache
    /// capacity.
    pub fn create<P: AsRef<Path>>(path: P, flags: EnvFlags) -> Result<Self> {
        Self::create_with(path, flags, DEFAULT_PAGE_SIZE, DEFAULT_CACHE_CAPACITY)
    }

    /// Create a new environment file.
    ///
    /// `page_size` is fixed for the life of the file and recorded in its
    /// header; `cache_capacity` bounds the page cache in bytes.
    pub fn create_with<P: AsRef<Path>>(
        path: P,
        flags: EnvFlags,
        page_size: usize,
        cache_capacity: usize,
    ) -> Result<Self> {
        if flags.contains(EnvFlags::IN_MEMORY_DB) {
            return Err(Error::InvParameter(
                "use Environment::create_in_memory for IN_MEMORY_DB",
            ));
        }
        Self::validate_page_size(page_size)?;

        let use_mmap = flags.contains(EnvFlags::USE_MMAP);
        let mut device = DiskDevice::create(path, use_mmap)?;
        // Reserve the header page; every later allocation starts behind it.
        device.truncate(page_size as u64)?;

        let mut core = EnvCore::new(Device::Disk(device), flags, page_size, cache_capacity);
        core.write_header()?;
        debug!("created environment (page_size {page_size})");

        Ok(Self {
            inner: Arc::new(Mutex::new(core)),
        })
    }

    /// Create an environment that never touches disk.
    pub fn create_in_memory(flags: EnvFlags) -> Result<Self> {
        Self::create_in_memory_with(flags, DEFAULT_PAGE_SIZE, DEFAULT_CACHE_CAPACITY)
    }

    pub fn create_in_memory_with(
        flags: EnvFlags,
        page_size: usize,
        cache_capacity: usize,
    ) -> Result<Self> {
        Self::validate_page_size(page_size)?;

        let core = EnvCore::new(
            Device::Memory(MemoryArena::new(page_size)),
            flags | EnvFlags::IN_MEMORY_DB,
            page_size,
            cache_capacity,
        );
        Ok(Self {
            inner: Arc::new(Mutex::new(core)),
        })
    }

    /// Open an existing environment file with the default cache capacity.
    pub fn open<P: AsRef<Path>>(path: P, flags: EnvFlags) -> Result<Self> {
        Self::open_with(path, flags, DEFAULT_CACHE_CAPACITY)
    }

    /// Open an existing environment file.
    ///
    /// The page size comes from the file header.
    pub fn open_with<P: AsRef<Path>>(
        path: P,
        flags: EnvFlags,
        cache_capacity: usize,
    ) -> Result<Self> {
        if flags.contains(EnvFlags::IN_MEMORY_DB) {
            return Err(Error::InvParameter(
                "use Environment::create_in_memory for IN_MEMORY_DB",
            ));
        }

        let use_mmap = flags.contains(EnvFlags::USE_MMAP);
        let mut device = DiskDevice::open(path, use_mmap)?;

        // The page size lives in the header; peek at it before the page
        // cache exists.
        let mut prefix = [0u8; HDR_DIRECTORY];
        device.read_at(0, &mut prefix)?;
        let payload = &prefix[crate::storage::PersistedHeader::SIZE..];
        if payload[HDR_MAGIC..HDR_MAGIC + 4] != ENV_MAGIC {
            return Err(Error::InvParameter("not a burrowdb file"));
        }
        let page_size =
            u32::from_le_bytes(payload[HDR_PAGE_SIZE..HDR_PAGE_SIZE + 4].try_into().unwrap())
                as usize;
        Self::validate_page_size(page_size)?;

        let mut core = EnvCore::new(Device::Disk(device), flags, page_size, cache_capacity);
        core.read_header()?;
        debug!("opened environment (page_size {page_size})");

        Ok(Self {
            inner: Arc::new(Mutex::new(core)),
        })
    }

    fn validate_page_size(page_size: usize) -> Result<()> {
        if page_size < MIN_PAGE_SIZE || !page_size.is_power_of_two() {
            return Err(Error::InvParameter(
                "page size must be a power of two >= 1024",
            ));
        }
        Ok(())
    }

    /// Create a named database with the default key size.
    pub fn create_database(&self, name: u16, flags: DatabaseFlags) -> Result<Database> {
        self.create_database_with(name, flags, DEFAULT_KEY_SIZE)
    }

    /// Create a named database.
    ///
    /// `key_size` is the in-node key slot; longer keys become extended
    /// keys with their suffix in a blob.
    pub fn create_database_with(
        &self,
        name: u16,
        flags: DatabaseFlags,
        key_size: u16,
    ) -> Result<Database> {
        let mut core = self.inner.lock();
        core.create_database(name, flags, key_size)?;
        core.mark_open(name)?;
        drop(core);
        Ok(Database::new(self.inner.clone(), name))
    }

    /// Open an existing named database.
    ///
    /// # Errors
    /// - `Error::KeyNotFound` if no such database exists
    /// - `Error::DatabaseAlreadyOpen` if a handle is already open
    pub fn open_database(&self, name: u16) -> Result<Database> {
        let mut core = self.inner.lock();
        core.mark_open(name)?;
        drop(core);
        Ok(Database::new(self.inner.clone(), name))
    }

    /// Begin a transaction. One transaction is active at a time.
    pub fn begin(&self) -> Result<Transaction> {
        let id = self.inner.lock().begin_txn()?;
        Ok(Transaction {
            env: self.inner.clone(),
            id,
            done: false,
        })
    }

    /// Write every dirty page, the freelist and the header; fsync.
    pub fn flush(&self) -> Result<()> {
        self.inner.lock().flush(false)
    }

    /// Snapshot of the page cache: budget, residency and counters.
    pub fn cache_info(&self) -> CacheInfo {
        self.inner.lock().pager.cache_info()
    }

    /// The flags this environment was created or opened with.
    pub fn flags(&self) -> EnvFlags {
        self.inner.lock().flags
    }
}

/// An in-flight transaction.
///
/// Commit or abort consume the handle; dropping it without either aborts.
pub struct Transaction {
    env: EnvHandle,
    id: u64,
    done: bool,
}

impl Transaction {
    #[inline]
    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    /// Make the transaction's work visible, atomically with respect to
    /// readers that begin after this call.
    pub fn commit(mut self) -> Result<()> {
        self.done = true;
        self.env.lock().commit_txn(self.id)
    }

    /// Discard the transaction's pending work.
    pub fn abort(mut self) -> Result<()> {
        self.done = true;
        self.env.lock().abort_txn(self.id)
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if !self.done {
            let _ = self.env.lock().abort_txn(self.id);
        }
    }
}
