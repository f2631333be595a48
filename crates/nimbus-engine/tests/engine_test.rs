//! End-to-end tests over the full engine stack.

use nimbus_common::document::{Document, Value};
use nimbus_common::page::RecordId;
use nimbus_common::DbConfig;
use nimbus_engine::{CompareOp, Database, Executor, Filter, Predicate, SeqScan};
use nimbus_wal::LogRecordType;
use tempfile::tempdir;

fn open_db(dir: &std::path::Path) -> Database {
    let mut config = DbConfig::in_dir(dir);
    config.fsync_enabled = false;
    Database::open(config).unwrap()
}

fn user(i: i32) -> Document {
    let mut d = Document::new();
    d.insert("name", format!("User_{}", i));
    d.insert("age", 20 + i);
    d.insert("city", if i < 10 { "NYC" } else { "LA" });
    d
}

/// Document serialization round-trip with one value of each scalar
/// type.
#[test]
fn document_roundtrip() {
    let mut doc = Document::new();
    doc.insert("name", "Alice");
    doc.insert("age", 30i32);
    doc.insert("score", 95.5f64);
    doc.insert("active", true);

    let bytes = doc.serialize();
    let recovered = Document::deserialize(&bytes).unwrap();

    assert_eq!(recovered.len(), 4);
    assert_eq!(
        recovered.get("name"),
        Some(&Value::String("Alice".to_string()))
    );
    assert_eq!(recovered.get("age"), Some(&Value::Int32(30)));
    assert_eq!(recovered.get("score"), Some(&Value::Double(95.5)));
    assert_eq!(recovered.get("active"), Some(&Value::Boolean(true)));
}

/// Twenty inserts scan back as twenty tuples; an equality filter on
/// the city keeps exactly the ten NYC rows.
#[test]
fn heap_insert_and_filtered_scan() {
    let dir = tempdir().unwrap();
    let mut db = open_db(dir.path());

    db.create_collection("users").unwrap();
    for i in 0..20 {
        db.insert("users", &user(i)).unwrap();
    }

    assert_eq!(db.count("users").unwrap(), 20);

    // Drive the executor pipeline directly, the way a caller would
    let coll = db.catalog().get("users").unwrap();
    let scan = Box::new(SeqScan::new(&coll.heap_file));
    let mut filter = Filter::new(
        scan,
        vec![Predicate::new("city", CompareOp::Eq, "NYC")],
    );

    filter.init().unwrap();
    let mut nyc = 0;
    while let Some(tuple) = filter.next().unwrap() {
        assert_eq!(
            tuple.doc.get("city"),
            Some(&Value::String("NYC".to_string()))
        );
        nyc += 1;
    }
    filter.close();

    assert_eq!(nyc, 10);
}

/// An index scan over ["User_1", "User_3"] returns the 13
/// lexicographically ordered names User_1, User_10..User_19, User_2,
/// User_3.
#[test]
fn index_range_scan() {
    let dir = tempdir().unwrap();
    let mut db = open_db(dir.path());

    db.create_collection("users").unwrap();
    for i in 0..20 {
        db.insert("users", &user(i)).unwrap();
    }
    db.create_index("users", "name").unwrap();

    let docs = db.index_scan("users", "name", "User_1", "User_3").unwrap();
    assert_eq!(docs.len(), 13);

    let names: Vec<String> = docs
        .iter()
        .map(|d| match d.get("name") {
            Some(Value::String(s)) => s.clone(),
            other => panic!("unexpected name value: {:?}", other),
        })
        .collect();

    let mut expected = vec!["User_1".to_string()];
    expected.extend((10..20).map(|i| format!("User_{}", i)));
    expected.push("User_2".to_string());
    expected.push("User_3".to_string());
    assert_eq!(names, expected);
}

/// Deleting one document makes the next scan one row shorter.
#[test]
fn delete_visibility() {
    let dir = tempdir().unwrap();
    let mut db = open_db(dir.path());

    db.create_collection("users").unwrap();
    for i in 0..20 {
        db.insert("users", &user(i)).unwrap();
    }

    let mut filter = Document::new();
    filter.insert("name", "User_0");
    assert_eq!(db.delete("users", &filter).unwrap(), 1);

    assert_eq!(db.count("users").unwrap(), 19);
    assert!(db.find("users", &filter).unwrap().is_empty());
}

/// Shared and exclusive locks grant immediately to one transaction,
/// and commit wipes every trace of it from the lock tables.
#[test]
fn transaction_lock_lifecycle() {
    let dir = tempdir().unwrap();
    let db = open_db(dir.path());

    let txn = db.txn_manager().begin();
    let r1 = RecordId::new(nimbus_common::page::PageId(3), 0);
    let r2 = RecordId::new(nimbus_common::page::PageId(3), 1);

    assert!(db.lock_manager().lock_shared(txn, r1));
    assert!(db.lock_manager().lock_exclusive(txn, r2));
    assert!(db.lock_manager().holds_locks(txn));

    db.txn_manager().commit(txn).unwrap();
    assert!(!db.lock_manager().holds_locks(txn));
}

/// BEGIN/INSERT/COMMIT appended for one transaction read back as
/// exactly those three records with their fields intact.
#[test]
fn wal_replay_scenario() {
    use bytes::Bytes;
    use nimbus_common::page::PageId;
    use nimbus_wal::{LogRecord, Wal};

    let dir = tempdir().unwrap();
    let wal = Wal::open(dir.path().join("scenario.wal"), true).unwrap();

    wal.append(LogRecord::begin(100)).unwrap();
    wal.append(LogRecord::insert(
        100,
        PageId(5),
        0,
        Bytes::from_static(&[1, 2, 3]),
    ))
    .unwrap();
    wal.append(LogRecord::commit(100)).unwrap();

    let reopened = Wal::open(dir.path().join("scenario.wal"), true).unwrap();
    let records = reopened.read_all().unwrap();

    assert_eq!(records.len(), 3);
    assert_eq!(records[0].record_type, LogRecordType::Begin);
    assert_eq!(records[1].record_type, LogRecordType::Insert);
    assert_eq!(records[2].record_type, LogRecordType::Commit);
    for r in &records {
        assert_eq!(r.txn_id, 100);
    }
    assert_eq!(records[1].page_id, PageId(5));
    assert_eq!(records[1].slot_id, 0);
    assert_eq!(records[1].after_image, Bytes::from_static(&[1, 2, 3]));
}

/// Update with identical content leaves the observable state alone.
#[test]
fn identity_update_is_noop() {
    let dir = tempdir().unwrap();
    let mut db = open_db(dir.path());

    db.create_collection("users").unwrap();
    db.insert("users", &user(3)).unwrap();

    let before = db.find("users", &Document::new()).unwrap();

    let mut filter = Document::new();
    filter.insert("name", "User_3");
    assert_eq!(db.update("users", &filter, &user(3)).unwrap(), 1);

    let after = db.find("users", &Document::new()).unwrap();
    assert_eq!(before, after);
}

/// Committed inserts survive a crash that loses the buffer pool:
/// reopening replays the log before any query runs.
#[test]
fn committed_work_survives_crash() {
    let dir = tempdir().unwrap();

    {
        let mut db = open_db(dir.path());
        // The catalog save inside create_collection flushes the empty
        // collection to disk; the inserts after it live only in the
        // pool and the log
        db.create_collection("users").unwrap();
        for i in 0..6 {
            db.insert("users", &user(i)).unwrap();
        }
        // Crash: the pool is never flushed, close never runs
        std::mem::forget(db);
    }

    let db = open_db(dir.path());
    let stats = db.recovery_stats();
    assert_eq!(stats.redone, 6);
    assert_eq!(stats.undone, 0);

    assert_eq!(db.count("users").unwrap(), 6);
    let mut filter = Document::new();
    filter.insert("name", "User_2");
    assert_eq!(db.find("users", &filter).unwrap().len(), 1);
}

/// A relocating update (the merged document outgrew its slot) is
/// logged as the delete + insert that actually happened, so it
/// survives a crash that loses the buffer pool.
#[test]
fn relocating_update_survives_crash() {
    let dir = tempdir().unwrap();

    {
        let mut db = open_db(dir.path());
        db.create_collection("users").unwrap();
        db.insert("users", &user(0)).unwrap();

        let mut filter = Document::new();
        filter.insert("name", "User_0");
        let mut fragment = Document::new();
        fragment.insert("bio", "b".repeat(120));
        assert_eq!(db.update("users", &filter, &fragment).unwrap(), 1);

        // Crash: the pool is never flushed, close never runs
        std::mem::forget(db);
    }

    let db = open_db(dir.path());

    assert_eq!(db.count("users").unwrap(), 1);
    let docs = db.find("users", &Document::new()).unwrap();
    assert_eq!(
        docs[0].get("bio"),
        Some(&Value::String("b".repeat(120)))
    );
    assert_eq!(
        docs[0].get("name"),
        Some(&Value::String("User_0".to_string()))
    );
}

/// Documents too wide for one page are refused without disturbing the
/// collection.
#[test]
fn oversized_document_rejected() {
    let dir = tempdir().unwrap();
    let mut db = open_db(dir.path());

    db.create_collection("blobs").unwrap();

    let mut huge = Document::new();
    huge.insert("data", "x".repeat(5000));
    assert!(db.insert("blobs", &huge).is_err());

    assert_eq!(db.count("blobs").unwrap(), 0);
}

/// The whole surface in sequence: create, insert, index, filter,
/// update, delete, reopen.
#[test]
fn full_engine_walkthrough() {
    let dir = tempdir().unwrap();

    {
        let mut db = open_db(dir.path());
        db.create_collection("users").unwrap();

        for i in 0..20 {
            db.insert("users", &user(i)).unwrap();
        }
        db.create_index("users", "name").unwrap();

        // Update the LA rows
        let mut filter = Document::new();
        filter.insert("city", "LA");
        let mut fragment = Document::new();
        fragment.insert("coast", "west");
        assert_eq!(db.update("users", &filter, &fragment).unwrap(), 10);

        // Delete the NYC rows
        let mut filter = Document::new();
        filter.insert("city", "NYC");
        assert_eq!(db.delete("users", &filter).unwrap(), 10);
        assert_eq!(db.count("users").unwrap(), 10);

        db.close().unwrap();
    }

    let db = open_db(dir.path());
    assert_eq!(db.count("users").unwrap(), 10);

    let mut filter = Document::new();
    filter.insert("coast", "west");
    assert_eq!(db.find("users", &filter).unwrap().len(), 10);
}
