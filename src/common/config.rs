//! Configuration constants for burrowdb.

/// Default size of a page in bytes (4KB).
///
/// This value is chosen to match:
/// - OS page size on most systems (4096 bytes)
/// - Common database page sizes
///
/// Unlike the page size of a particular environment (which is recorded in
/// the environment header and fixed for the life of the file), this is only
/// the value used when the caller does not ask for something else.
pub const DEFAULT_PAGE_SIZE: usize = 4096;

/// Smallest page size the engine accepts.
///
/// The environment header and a one-entry B+tree node must both fit.
pub const MIN_PAGE_SIZE: usize = 1024;

/// Default capacity of the page cache in bytes.
pub const DEFAULT_CACHE_CAPACITY: usize = 262_144;

/// Default in-node key slot size in bytes.
///
/// Keys longer than this are split: the node keeps the first
/// `key_size - 8` bytes and the trailing 8 bytes name the blob holding
/// the remainder.
pub const DEFAULT_KEY_SIZE: u16 = 32;

/// Smallest key slot that still leaves room for a blob offset.
pub const MIN_KEY_SIZE: u16 = 16;

/// Number of buckets in the extended-key cache.
///
/// A power of two, so the bucket index is a mask of the blob offset.
pub const EXTKEY_BUCKETS: usize = 128;

/// Maximum number of named databases per environment.
///
/// The database directory must fit in the environment header page.
pub const MAX_DATABASES: u16 = 16;

/// Records this size or smaller are stored inline in the node entry
/// instead of in a blob.
pub const INLINE_RECORD_MAX: usize = 8;

/// Magic bytes at the start of every environment file.
pub const ENV_MAGIC: [u8; 4] = *b"BRW1";

/// On-disk format version.
pub const FORMAT_VERSION: u32 = 1;
