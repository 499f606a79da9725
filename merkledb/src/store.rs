//! A wrapper around RocksDB, keeping engine-specific code out of the rest of
//! the crate.
//!
//! Each tree owns one database with three column families: `metaData` for the
//! record anchoring the tree across restarts, `nodes` mapping a node hash to
//! its encoded record, and `keyData` mapping user keys to raw values.

use std::collections::HashSet;
use std::path::Path;

use rocksdb::{
    checkpoint::Checkpoint, BlockBasedOptions, Cache, ColumnFamily, ColumnFamilyDescriptor,
    DBCompressionType, IteratorMode, Options as DbOptions, WriteBatch, DB,
};

use merkledb_core::{node::Node, NodeHash};

use crate::error::{MerkleError, Result};
use crate::meta::{self, TreeMeta};
use crate::tree::CachedNode;

const METADATA_CF: &str = "metaData";
const NODES_CF: &str = "nodes";
const KEY_DATA_CF: &str = "keyData";

const KEY_ROOT_HASH: &[u8] = b"rootHash";
const KEY_NUM_LEAVES: &[u8] = b"numLeaves";
const KEY_DEPTH: &[u8] = b"depth";
const KEY_HANGING_NODE_PREFIX: &str = "hangingNode";

fn hanging_node_key(level: u32) -> Vec<u8> {
    format!("{}{}", KEY_HANGING_NODE_PREFIX, level).into_bytes()
}

pub(crate) struct Store {
    db: DB,
}

impl Store {
    /// Open or create the database at `path` with all column families.
    pub fn open(path: &Path) -> Result<Self> {
        let mut db_opts = DbOptions::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(1000);
        db_opts.set_max_background_jobs(1);
        db_opts.set_allow_mmap_reads(true);
        db_opts.set_allow_mmap_writes(false);

        let mut table_opts = BlockBasedOptions::default();
        table_opts.set_block_cache(&Cache::new_lru_cache(16 * 1024 * 1024));
        table_opts.set_bloom_filter(10.0, false);
        table_opts.set_block_size(32 * 1024);
        table_opts.set_format_version(5);
        table_opts.set_cache_index_and_filter_blocks(true);
        table_opts.set_pin_l0_filter_and_index_blocks_in_cache(true);

        let mut cf_opts = DbOptions::default();
        cf_opts.set_block_based_table_factory(&table_opts);
        cf_opts.set_compression_type(DBCompressionType::None);
        cf_opts.set_bottommost_compression_type(DBCompressionType::None);
        cf_opts.set_write_buffer_size(8 * 1024 * 1024);
        cf_opts.set_max_write_buffer_number(1);
        cf_opts.set_min_write_buffer_number_to_merge(1);
        cf_opts.optimize_universal_style_compaction(8 * 1024 * 1024);
        cf_opts.optimize_for_point_lookup(16);

        let cf_descriptors = vec![
            ColumnFamilyDescriptor::new(rocksdb::DEFAULT_COLUMN_FAMILY_NAME, cf_opts.clone()),
            ColumnFamilyDescriptor::new(METADATA_CF, cf_opts.clone()),
            ColumnFamilyDescriptor::new(NODES_CF, cf_opts.clone()),
            ColumnFamilyDescriptor::new(KEY_DATA_CF, cf_opts),
        ];
        let db = DB::open_cf_descriptors(&db_opts, path, cf_descriptors)?;

        // Shrink the startup footprint. Nothing depends on this succeeding.
        db.compact_range::<&[u8], &[u8]>(None, None);

        Ok(Store { db })
    }

    fn cf(&self, name: &str) -> Result<&ColumnFamily> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| MerkleError::CorruptState(format!("missing column family {name}")))
    }

    /// Read the metadata record. Missing keys decode to an empty tree.
    pub fn read_meta(&self) -> Result<TreeMeta> {
        let cf = self.cf(METADATA_CF)?;

        let root_hash = match self.db.get_cf(cf, KEY_ROOT_HASH)? {
            Some(bytes) => Some(meta::decode_hash(&bytes)?),
            None => None,
        };
        let num_leaves = match self.db.get_cf(cf, KEY_NUM_LEAVES)? {
            Some(bytes) => meta::decode_u32(&bytes)?,
            None => 0,
        };
        let depth = match self.db.get_cf(cf, KEY_DEPTH)? {
            Some(bytes) => meta::decode_u32(&bytes)?,
            None => 0,
        };

        Ok(TreeMeta {
            root_hash,
            num_leaves,
            depth,
        })
    }

    /// The root hash currently persisted, bypassing all caches.
    pub fn root_hash_on_disk(&self) -> Result<Option<NodeHash>> {
        let cf = self.cf(METADATA_CF)?;
        match self.db.get_cf(cf, KEY_ROOT_HASH)? {
            Some(bytes) => Ok(Some(meta::decode_hash(&bytes)?)),
            None => Ok(None),
        }
    }

    /// The persisted hanging-node hash for `level`, if any.
    pub fn hanging_node(&self, level: u32) -> Result<Option<NodeHash>> {
        let cf = self.cf(METADATA_CF)?;
        match self.db.get_cf(cf, hanging_node_key(level))? {
            Some(bytes) => Ok(Some(meta::decode_hash(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Load and decode the node stored under `hash`.
    pub fn node(&self, hash: &NodeHash) -> Result<Option<Node>> {
        let cf = self.cf(NODES_CF)?;
        match self.db.get_cf(cf, hash)? {
            Some(bytes) => Ok(Some(Node::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Load the durable value stored under a user key.
    pub fn value(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let cf = self.cf(KEY_DATA_CF)?;
        Ok(self.db.get_cf(cf, key)?)
    }

    /// Whether a user key exists in durable storage.
    pub fn contains_key(&self, key: &[u8]) -> Result<bool> {
        let cf = self.cf(KEY_DATA_CF)?;
        Ok(self.db.get_pinned_cf(cf, key)?.is_some())
    }

    /// All durable user keys, in engine order.
    pub fn all_keys(&self) -> Result<Vec<Vec<u8>>> {
        let cf = self.cf(KEY_DATA_CF)?;
        let mut keys = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (key, _) = item?;
            keys.push(key.into_vec());
        }
        Ok(keys)
    }

    /// All durable user values, in engine order.
    pub fn all_values(&self) -> Result<Vec<Vec<u8>>> {
        let cf = self.cf(KEY_DATA_CF)?;
        let mut values = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (_, value) = item?;
            values.push(value.into_vec());
        }
        Ok(values)
    }

    /// All durable keys with their values, in engine order.
    pub fn keys_and_values(&self) -> Result<(Vec<Vec<u8>>, Vec<Vec<u8>>)> {
        let cf = self.cf(KEY_DATA_CF)?;
        let mut keys = Vec::new();
        let mut values = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (key, value) = item?;
            keys.push(key.into_vec());
            values.push(value.into_vec());
        }
        Ok((keys, values))
    }

    /// Decode every node persisted in the `nodes` column family.
    pub fn all_nodes(&self) -> Result<HashSet<Node>> {
        let cf = self.cf(NODES_CF)?;
        let mut nodes = HashSet::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (_, value) = item?;
            nodes.insert(Node::decode(&value)?);
        }
        Ok(nodes)
    }

    /// Persist the full in-memory state in one atomic batch.
    ///
    /// The previous metadata record is deleted wholesale before the new one
    /// is written, so stale hanging-node keys cannot survive a flush. Each
    /// cached node is written under its current hash; a node rehashed since
    /// the last flush also deletes the record under its stale hash.
    pub fn write_snapshot(
        &self,
        tree_meta: &TreeMeta,
        hanging: &[(u32, NodeHash)],
        nodes: &[CachedNode],
        values: &[(Vec<u8>, Vec<u8>)],
    ) -> Result<()> {
        let metadata_cf = self.cf(METADATA_CF)?;
        let nodes_cf = self.cf(NODES_CF)?;
        let key_data_cf = self.cf(KEY_DATA_CF)?;

        let mut batch = WriteBatch::default();

        for item in self.db.iterator_cf(metadata_cf, IteratorMode::Start) {
            let (key, _) = item?;
            batch.delete_cf(metadata_cf, key);
        }

        match tree_meta.root_hash {
            Some(root) => batch.put_cf(metadata_cf, KEY_ROOT_HASH, root),
            None => batch.delete_cf(metadata_cf, KEY_ROOT_HASH),
        }
        batch.put_cf(
            metadata_cf,
            KEY_NUM_LEAVES,
            meta::encode_u32(tree_meta.num_leaves),
        );
        batch.put_cf(metadata_cf, KEY_DEPTH, meta::encode_u32(tree_meta.depth));
        for (level, hash) in hanging {
            batch.put_cf(metadata_cf, hanging_node_key(*level), hash);
        }

        for cached in nodes {
            batch.put_cf(nodes_cf, cached.node.hash, cached.node.encode());
            if let Some(stale) = &cached.stale {
                batch.delete_cf(nodes_cf, stale);
            }
        }

        for (key, value) in values {
            batch.put_cf(key_data_cf, key, value);
        }

        self.db.write(batch)?;
        Ok(())
    }

    /// Produce a hardlink-based snapshot of this database at `path`.
    ///
    /// The target directory must not exist; the engine creates it.
    pub fn checkpoint_to(&self, path: &Path) -> Result<()> {
        let checkpoint = Checkpoint::new(&self.db)?;
        checkpoint.create_checkpoint(path)?;
        Ok(())
    }

    /// Range-delete every entry in all three column families, then compact
    /// the reclaimed ranges.
    pub fn clear_all(&self) -> Result<()> {
        let start: &[u8] = &[];
        let end: &[u8] = &[0xFF];

        for name in [METADATA_CF, NODES_CF, KEY_DATA_CF] {
            let cf = self.cf(name)?;
            self.db.delete_range_cf(cf, start, end)?;
        }
        for name in [METADATA_CF, NODES_CF, KEY_DATA_CF] {
            let cf = self.cf(name)?;
            self.db.compact_range_cf(cf, None::<&[u8]>, None::<&[u8]>);
        }
        Ok(())
    }
}
