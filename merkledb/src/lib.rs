//! A persistent authenticated key-value store.
//!
//! Every tree maps opaque binary keys to opaque binary values and maintains a
//! merkle root authenticating the whole set. Leaves are Keccak-256 hashes of
//! key-value pairs; the tree grows incrementally in insertion order, keeping
//! at most one "hanging" single-child node per level. Data lives in an
//! embedded RocksDB instance with separate column families for the metadata
//! record, encoded tree nodes, and raw key-value entries.
//!
//! Writes are staged: [`MerkleTree::put`] records the change in a pending
//! cache and on a queue drained by a per-tree commit worker, which folds the
//! change into the tree structure. [`MerkleTree::root_hash`] waits for the
//! queue to drain, so a writer always observes its own writes in the root.
//! [`MerkleTree::flush`] persists nodes, metadata, and committed entries in
//! one atomic write batch.
//!
//! Trees can be cloned cheaply through hardlink-based checkpoints of the
//! underlying engine, and one tree can fast-forward to another with
//! [`MerkleTree::update`], which copies in-memory caches when the durable
//! state of both trees already matches and otherwise swaps in a fresh
//! checkpoint.

#![warn(missing_docs)]

pub use merkledb_core::{hasher, node::Node, NodeHash};

mod commit;
mod error;
mod guarded;
mod latch;
mod meta;
mod options;
mod store;
mod tree;

pub use error::{MerkleError, Result};
pub use guarded::GuardedDb;
pub use options::Options;

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use crossbeam_channel::{Receiver, Sender};
use dashmap::DashMap;
use once_cell::sync::Lazy;
use parking_lot::{Mutex, RwLock};

use commit::WorkerCommand;
use latch::EventLatch;
use meta::TreeMeta;
use store::Store;
use tree::CachedNode;

/// Registry of live tree instances, one per tree name.
static OPEN_TREES: Lazy<Mutex<HashMap<String, Arc<Shared>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

static TREES_CLONED: AtomicU32 = AtomicU32::new(0);
static TREES_UPDATED_WITHOUT_CLONE: AtomicU32 = AtomicU32::new(0);

/// Number of trees fast-forwarded by replacing their on-disk state with a
/// checkpoint of the source.
pub fn trees_cloned() -> u32 {
    TREES_CLONED.load(Ordering::Relaxed)
}

/// Number of trees fast-forwarded by copying in-memory caches only, without
/// touching the filesystem.
pub fn trees_updated_without_clone() -> u32 {
    TREES_UPDATED_WITHOUT_CLONE.load(Ordering::Relaxed)
}

/// Names of all currently open trees.
pub fn open_trees() -> Vec<String> {
    OPEN_TREES.lock().keys().cloned().collect()
}

/// Close every open tree, flushing each to disk. Hosts call this on
/// shutdown.
pub fn close_all() -> Result<()> {
    let open: Vec<Arc<Shared>> = OPEN_TREES.lock().values().cloned().collect();
    for shared in open {
        shared.close()?;
    }
    Ok(())
}

/// A snapshot of a tree's in-memory cache occupancy.
#[derive(Debug, Clone, Copy)]
pub struct CacheStats {
    /// Nodes resident in the write-through node cache.
    pub cached_nodes: usize,
    /// Key-value entries committed to the tree but not yet flushed.
    pub committed_entries: usize,
    /// Key-value entries staged but not yet folded into the tree.
    pub pending_entries: usize,
    /// Levels currently holding a hanging node.
    pub hanging_levels: usize,
}

pub(crate) struct Shared {
    pub(crate) name: String,
    pub(crate) base_dir: PathBuf,
    pub(crate) path: PathBuf,

    /// The database handle. `None` once closed, and transiently while the
    /// on-disk state is being replaced by an update.
    pub(crate) store: RwLock<Option<Store>>,

    /// Write-through cache of tree nodes keyed by their current hash.
    pub(crate) nodes: DashMap<NodeHash, CachedNode>,
    /// At most one node per level still awaiting a sibling.
    pub(crate) hanging: DashMap<u32, NodeHash>,
    /// Writes accepted but not yet folded into the tree.
    pub(crate) pending: DashMap<Vec<u8>, Vec<u8>>,
    /// Writes folded into the tree but not yet flushed.
    pub(crate) committed: DashMap<Vec<u8>, Vec<u8>>,

    pub(crate) meta: Mutex<TreeMeta>,

    pub(crate) queue_tx: Sender<WorkerCommand>,
    pub(crate) queue_rx: Receiver<WorkerCommand>,
    /// Fired by the worker whenever the pending cache empties.
    pub(crate) drained: EventLatch,

    /// Serializes structural mutations: put, flush, clear, clone, update,
    /// revert, close. The commit worker does not take this lock.
    pub(crate) write_lock: Mutex<()>,

    pub(crate) closed: AtomicBool,
    pub(crate) dirty: AtomicBool,
    pub(crate) processing: AtomicBool,
    pub(crate) poisoned: AtomicBool,
}

impl Shared {
    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub(crate) fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            Err(MerkleError::TreeClosed)
        } else {
            Ok(())
        }
    }

    pub(crate) fn ensure_not_poisoned(&self) -> Result<()> {
        if self.poisoned.load(Ordering::SeqCst) {
            Err(MerkleError::CorruptState(format!(
                "merkle tree {} is poisoned by an earlier commit failure; revert or clear it",
                self.name
            )))
        } else {
            Ok(())
        }
    }

    /// Run `f` against the database handle, failing when the tree is closed.
    pub(crate) fn with_store<T>(&self, f: impl FnOnce(&Store) -> Result<T>) -> Result<T> {
        let guard = self.store.read();
        match guard.as_ref() {
            Some(store) => f(store),
            None => Err(MerkleError::TreeClosed),
        }
    }

    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.ensure_open()?;
        if let Some(entry) = self.pending.get(key) {
            return Ok(Some(entry.value().clone()));
        }
        if let Some(entry) = self.committed.get(key) {
            return Ok(Some(entry.value().clone()));
        }
        self.with_store(|store| store.value(key))
    }

    fn get_committed(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.ensure_open()?;
        if let Some(entry) = self.committed.get(key) {
            return Ok(Some(entry.value().clone()));
        }
        self.with_store(|store| store.value(key))
    }

    fn contains_key(&self, key: &[u8]) -> Result<bool> {
        self.ensure_open()?;
        self.with_store(|store| store.contains_key(key))
    }

    fn root_hash_on_disk(&self) -> Result<Option<NodeHash>> {
        self.ensure_open()?;
        self.with_store(|store| store.root_hash_on_disk())
    }

    fn num_leaves(&self) -> Result<u32> {
        self.ensure_open()?;
        Ok(self.meta.lock().num_leaves)
    }

    fn depth(&self) -> Result<u32> {
        self.ensure_open()?;
        Ok(self.meta.lock().depth)
    }

    fn all_nodes(&self) -> Result<HashSet<Node>> {
        self.ensure_open()?;
        let _guard = self.write_lock.lock();
        self.flush_locked()?;
        self.with_store(|store| store.all_nodes())
    }

    fn clear(&self) -> Result<()> {
        self.ensure_open()?;
        let _guard = self.write_lock.lock();
        self.clear_locked()
    }

    fn clear_locked(&self) -> Result<()> {
        self.with_store(|store| store.clear_all())?;

        self.nodes.clear();
        self.committed.clear();
        self.pending.clear();
        self.hanging.clear();
        self.drain_queue();
        *self.meta.lock() = TreeMeta::default();
        self.dirty.store(false, Ordering::SeqCst);
        self.poisoned.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn cache_stats(&self) -> CacheStats {
        CacheStats {
            cached_nodes: self.nodes.len(),
            committed_entries: self.committed.len(),
            pending_entries: self.pending.len(),
            hanging_levels: self.hanging.len(),
        }
    }

    /// Fast-forward this tree to match `source`.
    fn update(&self, source: &Shared) -> Result<()> {
        self.ensure_open()?;
        source.ensure_open()?;

        // Both write locks are needed. Take them in address order so a pair
        // of trees updating from each other concurrently cannot deadlock.
        let (_guard, _source_guard) = if (self as *const Shared) < (source as *const Shared) {
            let this = self.write_lock.lock();
            let that = source.write_lock.lock();
            (this, that)
        } else {
            let that = source.write_lock.lock();
            let this = self.write_lock.lock();
            (this, that)
        };

        let source_root = source.root_hash()?;
        let self_root = self.root_hash()?;

        if source_root.is_none() {
            if self_root.is_none() {
                return Ok(());
            }
            return self.clear_locked();
        }

        let disk_root = self.root_hash_on_disk()?;
        let source_disk_root = source.root_hash_on_disk()?;

        if disk_root == source_disk_root {
            // Identical durable state; only the RAM caches differ.
            log::info!(
                "updating merkle tree {} from {} by copying caches",
                self.name,
                source.name
            );
            self.copy_cache(source);
            TREES_UPDATED_WITHOUT_CLONE.fetch_add(1, Ordering::Relaxed);
        } else {
            log::info!(
                "updating merkle tree {} from {} by replacing the snapshot",
                self.name,
                source.name
            );

            // Release our handle before touching the directory underneath it.
            *self.store.write() = None;

            source.flush_locked()?;

            std::fs::remove_dir_all(&self.path)?;
            source.with_store(|store| store.checkpoint_to(&self.path))?;

            let store = Store::open(&self.path)?;

            self.nodes.clear();
            self.committed.clear();
            self.load_metadata(&store)?;
            *self.store.write() = Some(store);

            self.dirty.store(false, Ordering::SeqCst);
            self.poisoned.store(false, Ordering::SeqCst);
            TREES_CLONED.fetch_add(1, Ordering::Relaxed);
        }

        Ok(())
    }

    /// Flush and release every resource owned by this tree. Idempotent.
    pub(crate) fn close(&self) -> Result<()> {
        if self.is_closed() {
            return Ok(());
        }
        let _guard = self.write_lock.lock();
        if self.is_closed() {
            return Ok(());
        }

        if self.poisoned.load(Ordering::SeqCst) {
            log::warn!(
                "closing poisoned merkle tree {} without flushing",
                self.name
            );
        } else {
            self.flush_locked()?;
        }

        let _ = self.queue_tx.send(WorkerCommand::Shutdown);
        self.closed.store(true, Ordering::SeqCst);
        // Wake any thread parked on the latch so it observes the closure.
        self.drained.signal();

        *self.store.write() = None;
        OPEN_TREES.lock().remove(&self.name);
        Ok(())
    }
}

/// A handle on an open merkle tree.
///
/// At most one live instance exists per tree name; a second
/// [`open`](MerkleTree::open) of the same name fails with
/// [`MerkleError::Conflict`]. Dropping the handle closes the tree.
pub struct MerkleTree {
    shared: Arc<Shared>,
}

impl MerkleTree {
    /// Open the tree named `name` under the default base directory, creating
    /// it if absent.
    pub fn open(name: &str) -> Result<Self> {
        Self::open_with(name, Options::new())
    }

    /// Open the tree named `name` with the given options.
    pub fn open_with(name: &str, options: Options) -> Result<Self> {
        if name.is_empty() {
            return Err(MerkleError::InvalidArgument(
                "tree name cannot be empty".into(),
            ));
        }

        let mut registry = OPEN_TREES.lock();
        if registry.contains_key(name) {
            return Err(MerkleError::Conflict(format!(
                "there is already an open instance of tree {name}"
            )));
        }

        let path = options.base_dir.join(name);
        std::fs::create_dir_all(&path)?;
        let store = Store::open(&path)?;

        let (queue_tx, queue_rx) = crossbeam_channel::unbounded();
        let shared = Arc::new(Shared {
            name: name.to_string(),
            base_dir: options.base_dir,
            path,
            store: RwLock::new(Some(store)),
            nodes: DashMap::new(),
            hanging: DashMap::new(),
            pending: DashMap::new(),
            committed: DashMap::new(),
            meta: Mutex::new(TreeMeta::default()),
            queue_tx,
            queue_rx,
            drained: EventLatch::new(),
            write_lock: Mutex::new(()),
            closed: AtomicBool::new(false),
            dirty: AtomicBool::new(false),
            processing: AtomicBool::new(false),
            poisoned: AtomicBool::new(false),
        });

        shared.with_store(|store| shared.load_metadata(store))?;

        registry.insert(name.to_string(), shared.clone());
        drop(registry);

        if let Err(err) = commit::spawn_worker(shared.clone()) {
            OPEN_TREES.lock().remove(name);
            return Err(err);
        }

        Ok(MerkleTree { shared })
    }

    /// The name this tree was opened under.
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// The directory holding this tree's database.
    pub fn path(&self) -> &Path {
        &self.shared.path
    }

    /// Stage a write of `value` under `key`.
    ///
    /// The entry is immediately visible to [`get`](Self::get); the merkle
    /// root reflects it once the commit worker has drained past it, which
    /// [`root_hash`](Self::root_hash) waits for.
    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.shared.put(key, value)
    }

    /// Look up a key, checking staged writes first, then committed ones,
    /// then durable storage.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.shared.get(key)
    }

    /// Look up a key, skipping writes not yet folded into the tree.
    pub fn get_committed(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.shared.get_committed(key)
    }

    /// Whether `key` exists in durable storage. Staged and committed caches
    /// are not consulted.
    pub fn contains_key(&self, key: &[u8]) -> Result<bool> {
        self.shared.contains_key(key)
    }

    /// The current root hash, or `None` for an empty tree.
    ///
    /// Blocks until all staged writes have been folded into the tree.
    pub fn root_hash(&self) -> Result<Option<NodeHash>> {
        self.shared.root_hash()
    }

    /// The root hash currently persisted on disk, bypassing all caches.
    /// Does not block.
    pub fn root_hash_on_disk(&self) -> Result<Option<NodeHash>> {
        self.shared.root_hash_on_disk()
    }

    /// Number of leaves in the tree.
    pub fn num_leaves(&self) -> Result<u32> {
        self.shared.num_leaves()
    }

    /// Edges from the root to the leaf level; 0 for a tree of at most one
    /// leaf.
    pub fn depth(&self) -> Result<u32> {
        self.shared.depth()
    }

    /// All durable keys, in engine order.
    pub fn all_keys(&self) -> Result<Vec<Vec<u8>>> {
        self.shared.ensure_open()?;
        self.shared.with_store(|store| store.all_keys())
    }

    /// All durable values, in engine order.
    pub fn all_values(&self) -> Result<Vec<Vec<u8>>> {
        self.shared.ensure_open()?;
        self.shared.with_store(|store| store.all_values())
    }

    /// All durable keys paired with their values, in engine order.
    pub fn keys_and_values(&self) -> Result<(Vec<Vec<u8>>, Vec<Vec<u8>>)> {
        self.shared.ensure_open()?;
        self.shared.with_store(|store| store.keys_and_values())
    }

    /// Every node of the tree as persisted on disk. Flushes first.
    pub fn all_nodes(&self) -> Result<HashSet<Node>> {
        self.shared.all_nodes()
    }

    /// Persist all in-memory changes in one atomic batch.
    pub fn flush(&self) -> Result<()> {
        self.shared.flush()
    }

    /// Throw away all unflushed changes and reload the tree from disk.
    pub fn revert(&self) -> Result<()> {
        self.shared.revert()
    }

    /// Delete every entry and reset the tree to empty.
    pub fn clear(&self) -> Result<()> {
        self.shared.clear()
    }

    /// Close the tree, flushing it first. Idempotent.
    pub fn close(&self) -> Result<()> {
        self.shared.close()
    }

    /// Whether this tree has been closed.
    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    /// Whether a commit failure left this tree in an inconsistent state.
    ///
    /// A poisoned tree rejects `put` and `flush`; `revert` or `clear`
    /// restore consistency.
    pub fn is_poisoned(&self) -> bool {
        self.shared.poisoned.load(Ordering::SeqCst)
    }

    /// A snapshot of cache occupancy, for diagnostics.
    pub fn cache_stats(&self) -> CacheStats {
        self.shared.cache_stats()
    }

    /// Clone this tree into a new tree named `new_name` and open it.
    ///
    /// Flushes self, then produces a hardlink-based checkpoint at the target
    /// path. An open tree already registered under `new_name` is closed
    /// first, and any stale target directory is removed.
    pub fn clone_to(&self, new_name: &str) -> Result<MerkleTree> {
        log::info!(
            "cloning merkle tree {} to new tree {new_name}",
            self.shared.name
        );
        self.shared.ensure_open()?;
        if new_name.is_empty() {
            return Err(MerkleError::InvalidArgument(
                "new tree name cannot be empty".into(),
            ));
        }

        let _guard = self.shared.write_lock.lock();

        let existing = OPEN_TREES.lock().get(new_name).cloned();
        if let Some(tree) = existing {
            tree.close()?;
        }

        let dest = self.shared.base_dir.join(new_name);
        if dest.exists() {
            std::fs::remove_dir_all(&dest)?;
        } else if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)?;
        }

        self.shared.flush_locked()?;
        self.shared
            .with_store(|store| store.checkpoint_to(&dest))?;

        let mut options = Options::new();
        options.base_dir(self.shared.base_dir.clone());
        MerkleTree::open_with(new_name, options)
    }

    /// Fast-forward this tree to match `source`.
    ///
    /// When the durable state of both trees is already identical, only the
    /// in-memory caches are copied; otherwise this tree's database is
    /// replaced wholesale by a checkpoint of the source.
    pub fn update(&self, source: &MerkleTree) -> Result<()> {
        if Arc::ptr_eq(&self.shared, &source.shared) {
            return Ok(());
        }
        self.shared.update(&source.shared)
    }
}

impl Drop for MerkleTree {
    fn drop(&mut self) {
        if let Err(err) = self.shared.close() {
            log::warn!("error closing merkle tree {}: {err}", self.shared.name);
        }
    }
}
