//! Integration tests for the storage engine: environments, databases,
//! persistence, eviction and extended keys.

use burrowdb::{DatabaseFlags, EnvFlags, Environment, Error, InsertFlags, MoveFlags};
use tempfile::tempdir;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

#[test]
fn test_insert_find_roundtrip() {
    init_logging();
    let dir = tempdir().unwrap();
    let env = Environment::create(dir.path().join("test.db"), EnvFlags::empty()).unwrap();
    let db = env.create_database(1, DatabaseFlags::empty()).unwrap();

    db.insert(None, b"hello", b"world", InsertFlags::empty()).unwrap();
    assert_eq!(db.find(None, b"hello").unwrap(), b"world");

    // Large records go to blobs and come back whole.
    let big = vec![0xAB; 20_000];
    db.insert(None, b"big", &big, InsertFlags::empty()).unwrap();
    assert_eq!(db.find(None, b"big").unwrap(), big);
}

#[test]
fn test_insert_erase_find_not_found() {
    let dir = tempdir().unwrap();
    let env = Environment::create(dir.path().join("test.db"), EnvFlags::empty()).unwrap();
    let db = env.create_database(1, DatabaseFlags::empty()).unwrap();

    db.insert(None, b"k", b"v", InsertFlags::empty()).unwrap();
    db.erase(None, b"k").unwrap();

    assert!(matches!(db.find(None, b"k"), Err(Error::KeyNotFound)));
    assert!(matches!(db.erase(None, b"k"), Err(Error::KeyNotFound)));
}

#[test]
fn test_duplicate_key_needs_a_flag() {
    let dir = tempdir().unwrap();
    let env = Environment::create(dir.path().join("test.db"), EnvFlags::empty()).unwrap();
    let db = env.create_database(1, DatabaseFlags::empty()).unwrap();

    db.insert(None, b"k", b"v1", InsertFlags::empty()).unwrap();
    assert!(matches!(
        db.insert(None, b"k", b"v2", InsertFlags::empty()),
        Err(Error::DuplicateKey)
    ));

    db.insert(None, b"k", b"v2", InsertFlags::OVERWRITE).unwrap();
    assert_eq!(db.find(None, b"k").unwrap(), b"v2");

    // DUPLICATE needs ENABLE_DUPLICATES on the database.
    assert!(matches!(
        db.insert(None, b"k", b"v3", InsertFlags::DUPLICATE),
        Err(Error::InvParameter(_))
    ));
}

/// 10 000 keys pushed through a 64 KiB cache, reopened and walked in
/// order.
#[test]
fn test_persistence_and_sorted_iteration() {
    init_logging();
    let dir = tempdir().unwrap();
    let path = dir.path().join("test.db");

    {
        let env = Environment::create_with(&path, EnvFlags::empty(), 4096, 64 * 1024).unwrap();
        let db = env.create_database(1, DatabaseFlags::empty()).unwrap();

        for i in 0..10_000u32 {
            let key = format!("{i:05}");
            db.insert(None, key.as_bytes(), key.as_bytes(), InsertFlags::empty())
                .unwrap();
        }

        // The working set is far larger than the cache.
        let info = env.cache_info();
        assert!(info.evictions > 0);
        assert!(info.resident_bytes <= info.capacity);
    }

    {
        let env = Environment::open_with(&path, EnvFlags::empty(), 64 * 1024).unwrap();
        let db = env.open_database(1).unwrap();

        let mut cursor = db.cursor(None).unwrap();
        let mut previous: Option<Vec<u8>> = None;
        let mut count = 0u32;

        let mut next = cursor.move_to(MoveFlags::FIRST);
        while let Ok((key, record)) = next {
            assert_eq!(key, record);
            if let Some(previous) = &previous {
                assert!(previous < &key, "iteration out of order");
            }
            previous = Some(key);
            count += 1;
            next = cursor.move_to(MoveFlags::NEXT);
        }

        assert_eq!(count, 10_000);
        assert_eq!(previous.unwrap(), b"09999");
    }
}

#[test]
fn test_write_through_survives_reopen() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("test.db");

    {
        let env = Environment::create(&path, EnvFlags::WRITE_THROUGH).unwrap();
        let db = env.create_database(1, DatabaseFlags::empty()).unwrap();
        for i in 0..100u32 {
            db.insert(None, &i.to_be_bytes(), &i.to_le_bytes(), InsertFlags::empty())
                .unwrap();
        }
    }

    let env = Environment::open(&path, EnvFlags::empty()).unwrap();
    let db = env.open_database(1).unwrap();
    for i in 0..100u32 {
        assert_eq!(db.find(None, &i.to_be_bytes()).unwrap(), i.to_le_bytes());
    }
}

#[test]
fn test_mmap_reopen() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("test.db");

    {
        let env = Environment::create(&path, EnvFlags::USE_MMAP).unwrap();
        let db = env.create_database(1, DatabaseFlags::empty()).unwrap();
        for i in 0..500u32 {
            let key = format!("key-{i:04}");
            db.insert(None, key.as_bytes(), &i.to_le_bytes(), InsertFlags::empty())
                .unwrap();
        }
    }

    let env = Environment::open(&path, EnvFlags::USE_MMAP).unwrap();
    let db = env.open_database(1).unwrap();
    assert_eq!(db.find(None, b"key-0042").unwrap(), 42u32.to_le_bytes());
}

/// Extended keys in an in-memory environment; the extended-key cache
/// stays disabled.
#[test]
fn test_in_memory_extended_keys() {
    let env = Environment::create_in_memory(EnvFlags::empty()).unwrap();
    let db = env
        .create_database_with(1, DatabaseFlags::empty(), 64)
        .unwrap();

    let mut keys = Vec::new();
    for i in 0..1000u32 {
        // 200-byte keys against a 64-byte slot: all extended.
        let mut key = format!("{i:05}").into_bytes();
        key.resize(200, b'x');
        db.insert(None, &key, &key, InsertFlags::empty()).unwrap();
        keys.push(key);
    }

    for key in &keys {
        assert_eq!(&db.find(None, key).unwrap(), key);
    }

    // In-memory environments bypass the extended-key cache entirely.
    assert_eq!(db.extkey_cache_bytes(), 0);
}

#[test]
fn test_extended_keys_on_disk_use_the_cache() {
    let dir = tempdir().unwrap();
    let env = Environment::create(dir.path().join("test.db"), EnvFlags::empty()).unwrap();
    let db = env
        .create_database_with(1, DatabaseFlags::empty(), 32)
        .unwrap();

    for i in 0..100u32 {
        let mut key = format!("{i:05}").into_bytes();
        key.resize(100, b'k');
        db.insert(None, &key, b"r", InsertFlags::empty()).unwrap();
    }

    let mut probe = format!("{:05}", 42).into_bytes();
    probe.resize(100, b'k');
    assert_eq!(db.find(None, &probe).unwrap(), b"r");

    // Descents memoized reassembled keys.
    assert!(db.extkey_cache_bytes() > 0);
}

/// The default comparator orders a key before its own prefix (shorter
/// is greater).
#[test]
fn test_default_compare_shorter_is_greater() {
    let dir = tempdir().unwrap();
    let env = Environment::create(dir.path().join("test.db"), EnvFlags::empty()).unwrap();
    let db = env.create_database(1, DatabaseFlags::empty()).unwrap();

    db.insert(None, b"ab", b"1", InsertFlags::empty()).unwrap();
    db.insert(None, b"abc", b"2", InsertFlags::empty()).unwrap();

    let mut cursor = db.cursor(None).unwrap();
    let (first, _) = cursor.move_to(MoveFlags::FIRST).unwrap();
    let (second, _) = cursor.move_to(MoveFlags::NEXT).unwrap();
    assert_eq!(first, b"abc");
    assert_eq!(second, b"ab");
    assert!(matches!(
        cursor.move_to(MoveFlags::NEXT),
        Err(Error::KeyNotFound)
    ));
}

#[test]
fn test_multiple_databases_are_disjoint() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("test.db");

    {
        let env = Environment::create(&path, EnvFlags::empty()).unwrap();
        let one = env.create_database(1, DatabaseFlags::empty()).unwrap();
        let two = env.create_database(2, DatabaseFlags::empty()).unwrap();

        one.insert(None, b"k", b"from-1", InsertFlags::empty()).unwrap();
        two.insert(None, b"k", b"from-2", InsertFlags::empty()).unwrap();
    }

    let env = Environment::open(&path, EnvFlags::empty()).unwrap();
    let one = env.open_database(1).unwrap();
    let two = env.open_database(2).unwrap();
    assert_eq!(one.find(None, b"k").unwrap(), b"from-1");
    assert_eq!(two.find(None, b"k").unwrap(), b"from-2");
}

#[test]
fn test_open_database_twice_fails() {
    let dir = tempdir().unwrap();
    let env = Environment::create(dir.path().join("test.db"), EnvFlags::empty()).unwrap();
    let db = env.create_database(1, DatabaseFlags::empty()).unwrap();

    assert!(matches!(
        env.open_database(1),
        Err(Error::DatabaseAlreadyOpen(1))
    ));

    // Dropping the handle releases the database.
    drop(db);
    assert!(env.open_database(1).is_ok());
}

#[test]
fn test_use_hash_is_rejected() {
    let dir = tempdir().unwrap();
    let env = Environment::create(dir.path().join("test.db"), EnvFlags::USE_HASH).unwrap();

    assert!(matches!(
        env.create_database(1, DatabaseFlags::empty()),
        Err(Error::InvParameter(_))
    ));
}

#[test]
fn test_open_rejects_foreign_files() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("not-a-db");
    std::fs::write(&path, vec![0u8; 8192]).unwrap();

    assert!(Environment::open(&path, EnvFlags::empty()).is_err());
}

#[test]
fn test_erased_pages_are_reused() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("test.db");

    let env = Environment::create(&path, EnvFlags::empty()).unwrap();
    let db = env.create_database(1, DatabaseFlags::empty()).unwrap();

    // Blob records: erase frees their areas, the next inserts reuse them.
    let record = vec![7u8; 10_000];
    for round in 0..5 {
        for i in 0..20u32 {
            let key = format!("{round}-{i}");
            db.insert(None, key.as_bytes(), &record, InsertFlags::empty())
                .unwrap();
        }
        for i in 0..20u32 {
            let key = format!("{round}-{i}");
            db.erase(None, key.as_bytes()).unwrap();
        }
        env.flush().unwrap();
    }

    let size = std::fs::metadata(&path).unwrap().len();
    // Without reuse this would be ≥ 5 rounds × 20 blobs × 12 KiB.
    assert!(size < 5 * 20 * 12 * 1024, "file grew without bound: {size}");
}
