//! Options for opening trees.

use std::path::PathBuf;

/// Options when opening a [`crate::MerkleTree`] instance.
#[derive(Clone)]
pub struct Options {
    pub(crate) base_dir: PathBuf,
}

impl Options {
    /// Create a new `Options` instance with the default base directory.
    pub fn new() -> Self {
        Options {
            base_dir: PathBuf::from("merkleTree"),
        }
    }

    /// Set the directory under which tree databases are stored.
    ///
    /// Default: `merkleTree`.
    pub fn base_dir(&mut self, path: impl Into<PathBuf>) {
        self.base_dir = path.into();
    }
}

impl Default for Options {
    fn default() -> Self {
        Self::new()
    }
}
