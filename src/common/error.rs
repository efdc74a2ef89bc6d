//! Error types for burrowdb.

/// Convenient Result type alias.
///
/// Instead of writing `Result<T, Error>` everywhere, we can write
/// `Result<T>`. This is a common Rust pattern (see `std::io::Result`).
pub type Result<T> = std::result::Result<T, Error>;

/// All possible errors in burrowdb.
///
/// By having a single error type, error handling is consistent across the
/// whole engine. Invariant violations (writing a buffer-less page, fetching
/// a page of an in-memory database from disk, double-inserting into the
/// extended-key cache) are programming errors and panic instead of showing
/// up here.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// I/O error from the device layer.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Buffer or structure allocation failed.
    #[error("out of memory")]
    OutOfMemory,

    /// The cache capacity budget would be exceeded.
    ///
    /// The caller may flush and retry.
    #[error("cache is full")]
    CacheFull,

    /// Expected and informational: a lookup missed, a traversal hit the
    /// end of the key space, or an extended-key cache probe missed.
    #[error("key not found")]
    KeyNotFound,

    /// A would-be B+tree match has been erased inside the transaction.
    #[error("key erased in transaction")]
    KeyErasedInTxn,

    /// A write collides with an in-flight op on the same key.
    #[error("conflict with an in-flight transaction operation")]
    TxnConflict,

    /// The named database already has an open handle.
    #[error("database {0} is already open")]
    DatabaseAlreadyOpen(u16),

    /// The key already exists and neither a duplicate nor an overwrite
    /// flag was given.
    #[error("duplicate key")]
    DuplicateKey,

    /// An argument or flag combination the engine rejects.
    #[error("invalid parameter: {0}")]
    InvParameter(&'static str),

    /// A page failed its checksum on read.
    #[error("page at offset {0} failed its integrity check")]
    IntegrityViolation(u64),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        assert_eq!(format!("{}", Error::KeyNotFound), "key not found");
        assert_eq!(format!("{}", Error::CacheFull), "cache is full");
        assert_eq!(
            format!("{}", Error::DatabaseAlreadyOpen(7)),
            "database 7 is already open"
        );
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: Error = io_err.into();

        match err {
            Error::Io(_) => {}
            _ => panic!("Expected Io error"),
        }
    }

    #[test]
    fn test_io_error_has_source() {
        use std::error::Error as _;

        let io_err = std::io::Error::new(std::io::ErrorKind::Other, "boom");
        let err: Error = io_err.into();
        assert!(err.source().is_some());
        assert!(Error::KeyNotFound.source().is_none());
    }
}
