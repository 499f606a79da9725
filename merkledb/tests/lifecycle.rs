mod common;

use common::{unique_name, TestDir};
use merkledb::{MerkleError, MerkleTree};

#[test]
fn second_open_of_the_same_name_conflicts() {
    let dir = TestDir::new();
    let name = unique_name("conflict");

    let _tree = dir.open(&name);
    let err = MerkleTree::open_with(&name, dir.options()).unwrap_err();
    assert!(matches!(err, MerkleError::Conflict(_)));
}

#[test]
fn reopen_after_close_succeeds() {
    let dir = TestDir::new();
    let name = unique_name("reopen");

    let tree = dir.open(&name);
    tree.put(b"k", b"v").unwrap();
    tree.close().unwrap();

    let tree = dir.open(&name);
    assert_eq!(tree.get(b"k").unwrap(), Some(b"v".to_vec()));
}

#[test]
fn close_is_idempotent_and_terminal() {
    let dir = TestDir::new();
    let tree = dir.open(&unique_name("terminal"));

    tree.put(b"k", b"v").unwrap();
    assert!(!tree.is_closed());

    tree.close().unwrap();
    tree.close().unwrap();
    assert!(tree.is_closed());

    assert!(matches!(tree.put(b"k", b"v2"), Err(MerkleError::TreeClosed)));
    assert!(matches!(tree.get(b"k"), Err(MerkleError::TreeClosed)));
    assert!(matches!(tree.root_hash(), Err(MerkleError::TreeClosed)));
    assert!(matches!(tree.flush(), Err(MerkleError::TreeClosed)));
    assert!(matches!(tree.num_leaves(), Err(MerkleError::TreeClosed)));
    assert!(matches!(tree.all_keys(), Err(MerkleError::TreeClosed)));
}

#[test]
fn close_flushes_pending_state() {
    let dir = TestDir::new();
    let name = unique_name("close-flush");

    let expected = {
        let tree = dir.open(&name);
        tree.put(b"k1", b"v1").unwrap();
        tree.put(b"k2", b"v2").unwrap();
        let root = tree.root_hash().unwrap();
        tree.close().unwrap();
        root
    };

    let tree = dir.open(&name);
    assert_eq!(tree.root_hash_on_disk().unwrap(), expected);
    assert_eq!(tree.get(b"k1").unwrap(), Some(b"v1".to_vec()));
}

#[test]
fn registry_lists_open_trees() {
    let dir = TestDir::new();
    let name = unique_name("registry");

    let tree = dir.open(&name);
    assert!(merkledb::open_trees().contains(&name));

    tree.close().unwrap();
    assert!(!merkledb::open_trees().contains(&name));
}

#[test]
fn dropping_the_handle_closes_the_tree() {
    let dir = TestDir::new();
    let name = unique_name("drop");

    {
        let tree = dir.open(&name);
        tree.put(b"k", b"v").unwrap();
        tree.root_hash().unwrap();
    }

    assert!(!merkledb::open_trees().contains(&name));
    let tree = dir.open(&name);
    assert_eq!(tree.get(b"k").unwrap(), Some(b"v".to_vec()));
}

#[test]
fn cache_stats_track_staging() {
    let dir = TestDir::new();
    let tree = dir.open(&unique_name("stats"));

    tree.put(b"k1", b"v1").unwrap();
    tree.put(b"k2", b"v2").unwrap();
    tree.root_hash().unwrap();

    let stats = tree.cache_stats();
    assert_eq!(stats.pending_entries, 0);
    assert_eq!(stats.committed_entries, 2);
    assert!(stats.cached_nodes >= 3);
    assert!(stats.hanging_levels >= 1);

    tree.flush().unwrap();
    let stats = tree.cache_stats();
    assert_eq!(stats.committed_entries, 0);
    assert_eq!(stats.cached_nodes, 0);
}

#[test]
fn empty_tree_name_is_rejected() {
    let dir = TestDir::new();
    let err = MerkleTree::open_with("", dir.options()).unwrap_err();
    assert!(matches!(err, MerkleError::InvalidArgument(_)));
}
