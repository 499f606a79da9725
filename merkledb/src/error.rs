//! The error type shared by every operation in this crate.

/// Errors surfaced by tree and guarded-store operations.
#[derive(Debug, thiserror::Error)]
pub enum MerkleError {
    /// A caller-supplied argument was rejected.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A node lookup by hash yielded nothing where the algorithm required
    /// the node to exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The tree was closed; only `close` and `is_closed` remain legal.
    #[error("merkle tree is closed")]
    TreeClosed,

    /// An instance with the same name is already open.
    #[error("conflict: {0}")]
    Conflict(String),

    /// The underlying storage engine failed.
    #[error("storage engine error: {0}")]
    Storage(#[from] rocksdb::Error),

    /// A filesystem operation failed.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// The tree was closed while this thread was waiting for pending
    /// changes to be processed.
    #[error("interrupted while waiting for pending changes")]
    Interrupted,

    /// On-disk or in-memory state violated a structural invariant.
    #[error("corrupt state: {0}")]
    CorruptState(String),
}

impl From<merkledb_core::node::NodeDecodeError> for MerkleError {
    fn from(err: merkledb_core::node::NodeDecodeError) -> Self {
        MerkleError::CorruptState(err.to_string())
    }
}

/// Shorthand result type for tree operations.
pub type Result<T> = std::result::Result<T, MerkleError>;
