//! A corruption-guarded key-value store.
//!
//! A thin wrapper over a single-column-family RocksDB instance. Every stored
//! value carries a trailing Keccak-224 digest of the value bytes, verified on
//! each read. This store is independent of the merkle trees; it shares only
//! the hash primitives and the error type.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::{Mutex, RwLock};
use rocksdb::{checkpoint::Checkpoint, IteratorMode, Options as DbOptions, WriteBatch, DB};

use merkledb_core::hasher;

use crate::error::{MerkleError, Result};

const GUARD_LENGTH: usize = 28;

/// Registry of live instances, one per database path.
static OPEN_STORES: Lazy<Mutex<HashMap<PathBuf, GuardedDb>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

fn db_options() -> DbOptions {
    let mut opts = DbOptions::default();
    opts.create_if_missing(true);
    opts.set_paranoid_checks(true);
    opts.set_max_open_files(1000);
    opts.set_max_background_jobs(1);
    opts.set_max_total_wal_size(45 * 1024 * 1024);
    opts
}

fn add_guard(value: &[u8]) -> Vec<u8> {
    let mut framed = Vec::with_capacity(value.len() + GUARD_LENGTH);
    framed.extend_from_slice(value);
    framed.extend_from_slice(&hasher::hash224(value));
    framed
}

/// A key-value store whose values are verified against a Keccak-224 digest
/// on every read.
///
/// Handles are cheap to clone; all clones share one database. At most one
/// live instance exists per path, and [`open`](Self::open) returns the
/// existing handle when the path is already open.
#[derive(Clone)]
pub struct GuardedDb {
    shared: Arc<GuardedShared>,
}

struct GuardedShared {
    path: PathBuf,
    db: RwLock<Option<DB>>,
}

impl GuardedDb {
    /// Open or create the store at `path`.
    pub fn open(path: impl Into<PathBuf>) -> Result<GuardedDb> {
        let path = path.into();

        let mut registry = OPEN_STORES.lock();
        if let Some(existing) = registry.get(&path) {
            return Ok(existing.clone());
        }

        std::fs::create_dir_all(&path)?;
        let db = DB::open(&db_options(), &path)?;

        let handle = GuardedDb {
            shared: Arc::new(GuardedShared {
                path: path.clone(),
                db: RwLock::new(Some(db)),
            }),
        };
        registry.insert(path, handle.clone());
        Ok(handle)
    }

    /// The directory holding this store's database.
    pub fn path(&self) -> &Path {
        &self.shared.path
    }

    fn with_db<T>(&self, f: impl FnOnce(&DB) -> Result<T>) -> Result<T> {
        let guard = self.shared.db.read();
        match guard.as_ref() {
            Some(db) => f(db),
            None => Err(MerkleError::TreeClosed),
        }
    }

    fn verify_and_strip(&self, key: &[u8], mut framed: Vec<u8>) -> Result<Vec<u8>> {
        if framed.len() < GUARD_LENGTH {
            log::error!(
                "corruption guard failed for key {}: record of {} bytes is shorter than the guard",
                hex::encode(key),
                framed.len()
            );
            return Err(MerkleError::CorruptState(format!(
                "value under key {} is shorter than its corruption guard",
                hex::encode(key)
            )));
        }

        let split = framed.len() - GUARD_LENGTH;
        let expected = hasher::hash224(&framed[..split]);
        if framed[split..] != expected {
            log::error!(
                "corruption guard failed for key {}: {} bytes of corrupted data: {}",
                hex::encode(key),
                framed.len(),
                hex::encode(&framed)
            );
            return Err(MerkleError::CorruptState(format!(
                "corruption guard mismatch for key {}",
                hex::encode(key)
            )));
        }

        framed.truncate(split);
        Ok(framed)
    }

    /// Store `value` under `key`, framed with its corruption guard.
    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.with_db(|db| {
            db.put(key, add_guard(value))?;
            Ok(())
        })
    }

    /// Load and verify the value under `key`.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.with_db(|db| match db.get(key)? {
            Some(framed) => Ok(Some(self.verify_and_strip(key, framed)?)),
            None => Ok(None),
        })
    }

    /// Delete the entry under `key`.
    pub fn delete(&self, key: &[u8]) -> Result<()> {
        self.with_db(|db| {
            db.delete(key)?;
            Ok(())
        })
    }

    /// All keys in the store, in engine order.
    pub fn get_all_keys(&self) -> Result<Vec<Vec<u8>>> {
        self.with_db(|db| {
            let mut keys = Vec::new();
            for item in db.iterator(IteratorMode::Start) {
                let (key, _) = item?;
                keys.push(key.into_vec());
            }
            Ok(keys)
        })
    }

    /// All entries with their guards verified and stripped, in engine order.
    pub fn entries(&self) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        self.with_db(|db| {
            let mut entries = Vec::new();
            for item in db.iterator(IteratorMode::Start) {
                let (key, framed) = item?;
                let value = self.verify_and_strip(&key, framed.into_vec())?;
                entries.push((key.into_vec(), value));
            }
            Ok(entries)
        })
    }

    /// Close the store and deregister it. Idempotent.
    pub fn close(&self) -> Result<()> {
        *self.shared.db.write() = None;
        OPEN_STORES.lock().remove(&self.shared.path);
        Ok(())
    }

    /// Whether this store has been closed.
    pub fn is_closed(&self) -> bool {
        self.shared.db.read().is_none()
    }

    /// Replace `dest`'s contents wholesale with a checkpoint of `source`.
    pub fn clone_store(source: &GuardedDb, dest: &GuardedDb) -> Result<()> {
        if Arc::ptr_eq(&source.shared, &dest.shared) || source.shared.path == dest.shared.path {
            return Ok(());
        }

        let source_guard = source.shared.db.read();
        let source_db = source_guard.as_ref().ok_or(MerkleError::TreeClosed)?;

        let mut dest_guard = dest.shared.db.write();
        *dest_guard = None;
        if dest.shared.path.exists() {
            std::fs::remove_dir_all(&dest.shared.path)?;
        }

        let checkpoint = Checkpoint::new(source_db)?;
        checkpoint.create_checkpoint(&dest.shared.path)?;

        *dest_guard = Some(DB::open(&db_options(), &dest.shared.path)?);
        Ok(())
    }

    /// Apply the values of `keys` from `source` to `dest` in one atomic
    /// batch, then compact both stores.
    pub fn update_store(source: &GuardedDb, dest: &GuardedDb, keys: &[Vec<u8>]) -> Result<()> {
        if Arc::ptr_eq(&source.shared, &dest.shared) || source.shared.path == dest.shared.path {
            return Ok(());
        }

        let mut batch = WriteBatch::default();
        for key in keys {
            match source.get(key)? {
                Some(value) => batch.put(key, add_guard(&value)),
                None => batch.delete(key),
            }
        }

        dest.with_db(|db| {
            db.write(batch)?;
            db.compact_range::<&[u8], &[u8]>(None, None);
            Ok(())
        })?;
        source.with_db(|db| {
            db.compact_range::<&[u8], &[u8]>(None, None);
            Ok(())
        })
    }
}
