// close_all tears down every tree in the process, so this test runs alone in
// its own binary.

mod common;

use common::{unique_name, TestDir};

#[test]
fn close_all_flushes_and_deregisters_every_tree() {
    let dir = TestDir::new();
    let name_a = unique_name("shutdown-a");
    let name_b = unique_name("shutdown-b");

    let a = dir.open(&name_a);
    let b = dir.open(&name_b);
    a.put(b"k", b"from-a").unwrap();
    b.put(b"k", b"from-b").unwrap();
    let root_a = a.root_hash().unwrap();

    merkledb::close_all().unwrap();

    assert!(a.is_closed());
    assert!(b.is_closed());
    assert!(merkledb::open_trees().is_empty());

    // flushed on the way down
    let a = dir.open(&name_a);
    assert_eq!(a.root_hash_on_disk().unwrap(), root_a);
    assert_eq!(a.get(b"k").unwrap(), Some(b"from-a".to_vec()));
}
