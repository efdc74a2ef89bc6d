//! Flag sets recognized by the engine.

use bitflags::bitflags;

bitflags! {
    /// Environment-wide behavior flags, fixed at create/open time.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct EnvFlags: u32 {
        /// Never touch disk; pages live in an arena for the life of the
        /// environment and the extended-key cache is disabled.
        const IN_MEMORY_DB = 1 << 0;
        /// Use memory-mapped I/O for page reads.
        const USE_MMAP = 1 << 1;
        /// Flush dirty pages on every cache put.
        const WRITE_THROUGH = 1 << 2;
        /// Allow begin/commit/abort and the txn-coupled cursor mode.
        const ENABLE_TRANSACTIONS = 1 << 3;
        /// Reserved; rejected by the database factory as unsupported.
        const USE_HASH = 1 << 4;
    }
}

bitflags! {
    /// Per-database flags, fixed at database create time.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct DatabaseFlags: u32 {
        /// Allow more than one record per key.
        const ENABLE_DUPLICATES = 1 << 0;
    }
}

bitflags! {
    /// Flags accepted by insert and overwrite operations.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct InsertFlags: u32 {
        /// If the key exists, replace its record instead of failing.
        const OVERWRITE = 1 << 0;
        /// If the key exists, append the record as a duplicate.
        const DUPLICATE = 1 << 1;
    }
}

bitflags! {
    /// Flags accepted by the paged file manager.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct FetchFlags: u32 {
        /// Report a miss instead of going to the device.
        const ONLY_FROM_CACHE = 1 << 0;
        /// Allocate by extending the file even if the freelist has space.
        const IGNORE_FREELIST = 1 << 1;
    }
}

bitflags! {
    /// Cursor movement flags.
    ///
    /// Exactly one of FIRST/LAST/NEXT/PREVIOUS selects the direction;
    /// SKIP_DUPLICATES and ONLY_DUPLICATES modify how duplicates of the
    /// current key take part in the move.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct MoveFlags: u32 {
        const FIRST = 1 << 0;
        const LAST = 1 << 1;
        const NEXT = 1 << 2;
        const PREVIOUS = 1 << 3;
        const SKIP_DUPLICATES = 1 << 4;
        const ONLY_DUPLICATES = 1 << 5;
    }
}

impl MoveFlags {
    /// The direction bits of this flag set.
    pub fn direction(self) -> MoveFlags {
        self & (MoveFlags::FIRST | MoveFlags::LAST | MoveFlags::NEXT | MoveFlags::PREVIOUS)
    }
}
