use std::sync::atomic::{AtomicU32, Ordering};

use merkledb::{hasher, MerkleTree, NodeHash, Options};
use tempfile::TempDir;

static NAME_COUNTER: AtomicU32 = AtomicU32::new(0);

/// Tree names are process-wide, so every test opens trees under a fresh
/// name even though each test also gets its own directory.
pub fn unique_name(prefix: &str) -> String {
    let n = NAME_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("{prefix}-{n}")
}

/// An isolated base directory for one test.
///
/// Declare the `TestDir` before any tree handles so the trees close before
/// the directory is removed.
pub struct TestDir {
    dir: TempDir,
}

#[allow(dead_code)]
impl TestDir {
    pub fn new() -> Self {
        TestDir {
            dir: TempDir::new().unwrap(),
        }
    }

    pub fn options(&self) -> Options {
        let mut options = Options::new();
        options.base_dir(self.dir.path());
        options
    }

    pub fn open(&self, name: &str) -> MerkleTree {
        MerkleTree::open_with(name, self.options()).unwrap()
    }
}

#[allow(dead_code)]
pub fn leaf(key: &[u8], value: &[u8]) -> NodeHash {
    hasher::hash256_pair(key, value)
}

#[allow(dead_code)]
pub fn branch(left: NodeHash, right: NodeHash) -> NodeHash {
    hasher::hash256_pair(&left, &right)
}
