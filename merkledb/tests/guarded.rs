use merkledb::{GuardedDb, MerkleError};
use tempfile::TempDir;

#[test]
fn round_trip_and_delete() {
    let dir = TempDir::new().unwrap();
    let db = GuardedDb::open(dir.path().join("store")).unwrap();

    db.put(b"k1", b"v1").unwrap();
    db.put(b"k2", b"").unwrap();

    assert_eq!(db.get(b"k1").unwrap(), Some(b"v1".to_vec()));
    assert_eq!(db.get(b"k2").unwrap(), Some(Vec::new()));
    assert_eq!(db.get(b"missing").unwrap(), None);

    db.delete(b"k1").unwrap();
    assert_eq!(db.get(b"k1").unwrap(), None);

    db.close().unwrap();
}

#[test]
fn open_returns_the_live_instance_for_a_path() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("shared");

    let first = GuardedDb::open(&path).unwrap();
    first.put(b"k", b"v").unwrap();

    let second = GuardedDb::open(&path).unwrap();
    assert_eq!(second.get(b"k").unwrap(), Some(b"v".to_vec()));

    first.close().unwrap();
    assert!(second.is_closed());
}

#[test]
fn scans_verify_every_entry() {
    let dir = TempDir::new().unwrap();
    let db = GuardedDb::open(dir.path().join("scan")).unwrap();

    for i in 0u32..5 {
        db.put(format!("key-{i}").as_bytes(), format!("value-{i}").as_bytes())
            .unwrap();
    }

    let keys = db.get_all_keys().unwrap();
    assert_eq!(keys.len(), 5);

    let entries = db.entries().unwrap();
    assert_eq!(entries.len(), 5);
    for (key, value) in entries {
        let suffix = &key[b"key-".len()..];
        assert_eq!(value, [b"value-", suffix].concat());
    }

    db.close().unwrap();
}

#[test]
fn corrupted_value_surfaces_an_error() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("corrupt");

    let db = GuardedDb::open(&path).unwrap();
    db.put(b"k", b"important").unwrap();
    db.close().unwrap();

    // Damage the framed value underneath the wrapper.
    {
        let raw = rocksdb::DB::open_default(&path).unwrap();
        let mut framed = raw.get(b"k").unwrap().unwrap();
        let last = framed.len() - 1;
        framed[last] ^= 0xFF;
        raw.put(b"k", framed).unwrap();
    }

    let db = GuardedDb::open(&path).unwrap();
    let err = db.get(b"k").unwrap_err();
    assert!(matches!(err, MerkleError::CorruptState(_)));

    db.close().unwrap();
}

#[test]
fn clone_store_replaces_destination_contents() {
    let dir = TempDir::new().unwrap();
    let source = GuardedDb::open(dir.path().join("clone-src")).unwrap();
    let dest = GuardedDb::open(dir.path().join("clone-dst")).unwrap();

    source.put(b"k1", b"v1").unwrap();
    source.put(b"k2", b"v2").unwrap();
    dest.put(b"stale", b"entry").unwrap();

    GuardedDb::clone_store(&source, &dest).unwrap();

    assert_eq!(dest.get(b"k1").unwrap(), Some(b"v1".to_vec()));
    assert_eq!(dest.get(b"k2").unwrap(), Some(b"v2".to_vec()));
    assert_eq!(dest.get(b"stale").unwrap(), None);

    source.close().unwrap();
    dest.close().unwrap();
}

#[test]
fn update_store_applies_a_key_list_atomically() {
    let dir = TempDir::new().unwrap();
    let source = GuardedDb::open(dir.path().join("update-src")).unwrap();
    let dest = GuardedDb::open(dir.path().join("update-dst")).unwrap();

    source.put(b"k1", b"new-1").unwrap();
    source.put(b"k2", b"new-2").unwrap();
    dest.put(b"k1", b"old-1").unwrap();
    dest.put(b"gone", b"deleted-in-source").unwrap();
    dest.put(b"untouched", b"kept").unwrap();

    let keys = vec![b"k1".to_vec(), b"k2".to_vec(), b"gone".to_vec()];
    GuardedDb::update_store(&source, &dest, &keys).unwrap();

    assert_eq!(dest.get(b"k1").unwrap(), Some(b"new-1".to_vec()));
    assert_eq!(dest.get(b"k2").unwrap(), Some(b"new-2".to_vec()));
    assert_eq!(dest.get(b"gone").unwrap(), None);
    assert_eq!(dest.get(b"untouched").unwrap(), Some(b"kept".to_vec()));

    source.close().unwrap();
    dest.close().unwrap();
}
