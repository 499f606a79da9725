//! The write-staging and commit pipeline.
//!
//! Writes accepted by `put` land in the pending cache and on an unbounded
//! queue. A dedicated worker thread per tree drains the queue in FIFO order,
//! folding each change into the merkle structure and migrating the entry from
//! the pending cache to the committed cache. Readers that need the root
//! block on an auto-resetting latch which the worker fires whenever the
//! pending cache empties.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;

use merkledb_core::{hasher, node::Node};

use crate::error::{MerkleError, Result};
use crate::tree::CachedNode;
use crate::{NodeHash, Shared};

/// A queued write, or an order for the worker to stop.
pub(crate) enum WorkerCommand {
    Apply { key: Vec<u8>, value: Vec<u8> },
    Shutdown,
}

/// Start the commit worker for a tree. The worker runs until it receives
/// [`WorkerCommand::Shutdown`].
pub(crate) fn spawn_worker(shared: Arc<Shared>) -> Result<()> {
    let rx = shared.queue_rx.clone();
    thread::Builder::new()
        .name(format!("merkledb-commit-{}", shared.name))
        .spawn(move || {
            while let Ok(command) = rx.recv() {
                match command {
                    WorkerCommand::Shutdown => break,
                    WorkerCommand::Apply { key, value } => {
                        if shared.is_closed() {
                            continue;
                        }
                        shared.process(key, value);
                    }
                }
            }
        })?;
    Ok(())
}

impl Shared {
    /// Stage a write. The entry is visible to `get` immediately and folded
    /// into the tree by the worker.
    pub(crate) fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.ensure_open()?;
        self.ensure_not_poisoned()?;

        let _guard = self.write_lock.lock();
        // A close may have slipped in while we waited for the lock.
        self.ensure_open()?;

        // Cache before queueing so the worker can never observe the queued
        // item without its pending entry.
        self.pending.insert(key.to_vec(), value.to_vec());
        self.queue_tx
            .send(WorkerCommand::Apply {
                key: key.to_vec(),
                value: value.to_vec(),
            })
            .map_err(|_| MerkleError::TreeClosed)?;
        self.dirty.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Worker-side handling of one dequeued change.
    pub(crate) fn process(&self, key: Vec<u8>, value: Vec<u8>) {
        self.processing.store(true, Ordering::SeqCst);

        if let Err(err) = self.apply(&key, &value) {
            log::error!(
                "error processing pending change in merkle tree {}: {err}",
                self.name
            );
            self.poisoned.store(true, Ordering::SeqCst);
            // Drop the entry so waiters on the latch cannot wedge.
            self.pending.remove_if(&key, |_, staged| *staged == value);
        }

        if self.pending.is_empty() {
            self.processing.store(false, Ordering::SeqCst);
            self.drained.signal();
        }
    }

    fn apply(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.with_store(|store| {
            let existing = match self.committed.get(key) {
                Some(entry) => Some(entry.value().clone()),
                None => store.value(key)?,
            };
            let old_leaf_hash = existing.map(|data| hasher::hash256_pair(key, &data));
            let new_leaf_hash = hasher::hash256_pair(key, value);

            match old_leaf_hash {
                Some(old) if old == new_leaf_hash => {
                    // The leaf already holds this value; no structural change.
                }
                Some(old) => self.update_leaf(store, old, new_leaf_hash)?,
                None => self.add_leaf(store, Node::leaf(new_leaf_hash))?,
            }

            self.committed.insert(key.to_vec(), value.to_vec());
            self.pending.remove_if(key, |_, staged| staged == value);
            Ok(())
        })
    }

    /// Block until the pending cache is empty and no change is mid-apply.
    pub(crate) fn wait_pending_drained(&self) -> Result<()> {
        loop {
            let generation = self.drained.generation();
            if self.pending.is_empty() && !self.processing.load(Ordering::SeqCst) {
                return Ok(());
            }
            if self.is_closed() {
                return Err(MerkleError::Interrupted);
            }
            self.drained.wait_past(generation);
        }
    }

    /// Block until a change currently mid-apply finishes. Queued work that
    /// has not been picked up yet is not waited for.
    pub(crate) fn wait_processing_idle(&self) -> Result<()> {
        loop {
            let generation = self.drained.generation();
            if !self.processing.load(Ordering::SeqCst) {
                return Ok(());
            }
            if self.is_closed() {
                return Err(MerkleError::Interrupted);
            }
            self.drained.wait_past(generation);
        }
    }

    /// The current root hash, after all staged writes have been applied.
    pub(crate) fn root_hash(&self) -> Result<Option<NodeHash>> {
        self.ensure_open()?;
        if !self.pending.is_empty() {
            log::debug!(
                "merkle tree {} has pending changes, waiting before returning root hash",
                self.name
            );
            self.wait_pending_drained()?;
        }
        Ok(self.meta.lock().root_hash)
    }

    /// Flush all in-memory changes to durable storage in one atomic batch.
    pub(crate) fn flush(&self) -> Result<()> {
        self.ensure_open()?;
        self.ensure_not_poisoned()?;
        let _guard = self.write_lock.lock();
        self.flush_locked()
    }

    /// Flush body; the caller holds the write lock.
    pub(crate) fn flush_locked(&self) -> Result<()> {
        self.wait_pending_drained()?;
        if !self.dirty.load(Ordering::SeqCst) {
            return Ok(());
        }

        self.with_store(|store| {
            let tree_meta = self.meta.lock().clone();
            let hanging: Vec<(u32, NodeHash)> = self
                .hanging
                .iter()
                .map(|entry| (*entry.key(), *entry.value()))
                .collect();
            let nodes: Vec<CachedNode> =
                self.nodes.iter().map(|entry| entry.value().clone()).collect();
            let values: Vec<(Vec<u8>, Vec<u8>)> = self
                .committed
                .iter()
                .map(|entry| (entry.key().clone(), entry.value().clone()))
                .collect();
            store.write_snapshot(&tree_meta, &hanging, &nodes, &values)
        })?;

        self.nodes.clear();
        self.committed.clear();
        self.dirty.store(false, Ordering::SeqCst);
        Ok(())
    }

    /// Throw away all unflushed changes and reload the tree from disk.
    pub(crate) fn revert(&self) -> Result<()> {
        self.ensure_open()?;
        if !self.dirty.load(Ordering::SeqCst) && !self.poisoned.load(Ordering::SeqCst) {
            return Ok(());
        }

        let _guard = self.write_lock.lock();

        // Empty the staging area first: once the pending cache is clear, a
        // change still mid-apply will signal the latch when it completes.
        self.pending.clear();
        self.drain_queue();
        self.wait_processing_idle()?;

        self.nodes.clear();
        self.hanging.clear();
        self.committed.clear();

        self.with_store(|store| self.load_metadata(store))?;

        self.dirty.store(false, Ordering::SeqCst);
        self.poisoned.store(false, Ordering::SeqCst);
        Ok(())
    }

    /// Discard queued work that the worker has not picked up.
    pub(crate) fn drain_queue(&self) {
        while self.queue_rx.try_recv().is_ok() {}
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    use crate::{MerkleError, MerkleTree, Options};

    #[test]
    fn waiter_is_interrupted_when_the_tree_closes_underneath_it() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut options = Options::new();
        options.base_dir(dir.path());
        let tree = MerkleTree::open_with("interrupted-waiter", options).unwrap();
        let shared = tree.shared.clone();

        // Stage an entry directly, with no queued work behind it, so the
        // pending cache stays occupied for as long as we need. Poisoning
        // makes close skip its own drain instead of blocking on it.
        shared.pending.insert(b"k".to_vec(), b"v".to_vec());
        shared.poisoned.store(true, Ordering::SeqCst);

        let waiter = {
            let shared = shared.clone();
            std::thread::spawn(move || shared.root_hash())
        };

        // Give the waiter time to park on the latch; if close still wins
        // the race, the waiter observes the closed flag instead of the
        // signal and the outcome is the same.
        std::thread::sleep(Duration::from_millis(100));
        tree.close().unwrap();

        let result = waiter.join().unwrap();
        assert!(matches!(result, Err(MerkleError::Interrupted)));
    }

    #[test]
    fn flush_waiter_is_interrupted_too() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut options = Options::new();
        options.base_dir(dir.path());
        let tree = MerkleTree::open_with("interrupted-flusher", options).unwrap();
        let shared = tree.shared.clone();

        shared.pending.insert(b"k".to_vec(), b"v".to_vec());
        shared.dirty.store(true, Ordering::SeqCst);
        shared.poisoned.store(true, Ordering::SeqCst);

        // Drive the flush body directly rather than through `flush`, which
        // would hold the write lock close also needs.
        let waiter = {
            let shared = shared.clone();
            std::thread::spawn(move || shared.flush_locked())
        };

        std::thread::sleep(Duration::from_millis(100));
        tree.close().unwrap();

        let result = waiter.join().unwrap();
        assert!(matches!(result, Err(MerkleError::Interrupted)));
    }
}
