//! burrowdb - an embedded single-file key/value storage engine.
//!
//! # Architecture
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                           burrowdb                              │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  ┌─────────────────────────────────────────────────────────┐   │
//! │  │        Environment (env/) + Databases (db/)             │   │
//! │  │   header page · database directory · transactions       │   │
//! │  └─────────────────────────────────────────────────────────┘   │
//! │                              ↓                                  │
//! │  ┌─────────────────────────────────────────────────────────┐   │
//! │  │           Cursors (cursor/) + B+tree (btree/)           │   │
//! │  │   dual-mode coupling · duplicate cache · comparator      │   │
//! │  └─────────────────────────────────────────────────────────┘   │
//! │                              ↓                                  │
//! │  ┌─────────────────────────────────────────────────────────┐   │
//! │  │                Page cache (cache/)                       │   │
//! │  │   byte-bounded residency · LRU eviction · write-back     │   │
//! │  │   extended-key cache (keys/) shares the budget           │   │
//! │  └─────────────────────────────────────────────────────────┘   │
//! │                              ↓                                  │
//! │  ┌─────────────────────────────────────────────────────────┐   │
//! │  │               Storage layer (storage/)                   │   │
//! │  │   device I/O (file / mmap / arena) · freelist · blobs    │   │
//! │  └─────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//! - [`common`] - Shared primitives (config, errors, flags, page offsets)
//! - [`storage`] - Device I/O, pages, blobs and the freelist
//! - [`cache`] - The paged file manager
//! - [`keys`] - Extended-key cache and the key comparison protocol
//! - [`txn`] - Transactions as ordered op trees
//! - [`cursor`] - Dual-mode cursors with duplicate caches
//! - [`env`] / [`db`] - Environments, databases and transactions
//!
//! The B+tree itself lives in a private `btree` module; it is consumed
//! through databases and cursors.
//!
//! # Quick Start
//! ```no_run
//! use burrowdb::{DatabaseFlags, EnvFlags, Environment, InsertFlags};
//!
//! let env = Environment::create("my.db", EnvFlags::empty()).unwrap();
//! let db = env.create_database(1, DatabaseFlags::empty()).unwrap();
//!
//! db.insert(None, b"hello", b"world", InsertFlags::empty()).unwrap();
//! assert_eq!(db.find(None, b"hello").unwrap(), b"world");
//! ```

mod btree;
pub mod cache;
pub mod common;
pub mod cursor;
pub mod db;
pub mod env;
pub mod keys;
pub mod storage;
pub mod txn;

// Re-export commonly used items at crate root for convenience
pub use common::config::{DEFAULT_CACHE_CAPACITY, DEFAULT_KEY_SIZE, DEFAULT_PAGE_SIZE};
pub use common::{
    DatabaseFlags, EnvFlags, Error, FetchFlags, InsertFlags, MoveFlags, PageOffset, Result,
};

pub use cache::{CacheInfo, PageManager};
pub use cursor::{Cursor, CursorSide};
pub use db::Database;
pub use env::{Environment, Transaction};
pub use keys::{CompareHooks, PrefixDecision};
pub use storage::{Device, DiskDevice, Freelist, Page, PageType};
