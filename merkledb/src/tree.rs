//! The structural tree mutator.
//!
//! The tree grows one leaf at a time in insertion order. Every level keeps at
//! most one hanging node, a node still awaiting its sibling. A new node at a
//! level either becomes the hanging node there (growing a single-child parent
//! chain toward the root), pairs up with the hanging node under a fresh
//! parent, or fills the free slot of the hanging node's parent. Rehashing a
//! node propagates through parent links up to the root.
//!
//! All methods take the storage handle explicitly; nodes absent from the
//! cache are faulted in from the `nodes` column family.

use std::sync::atomic::Ordering;

use merkledb_core::{node::Node, NodeHash};

use crate::error::{MerkleError, Result};
use crate::store::Store;
use crate::Shared;

/// A node resident in the write-through cache.
#[derive(Debug, Clone)]
pub(crate) struct CachedNode {
    pub node: Node,
    /// The hash this node is stored under on disk when that differs from its
    /// current hash. The stale record is deleted at the next flush.
    pub stale: Option<NodeHash>,
}

impl CachedNode {
    fn new(node: Node) -> Self {
        CachedNode { node, stale: None }
    }
}

impl Shared {
    /// Fetch a node by hash, from the cache or from storage. A node loaded
    /// from storage is cached as a side effect.
    pub(crate) fn node_by_hash(
        &self,
        store: &Store,
        hash: &NodeHash,
    ) -> Result<Option<CachedNode>> {
        if let Some(cached) = self.nodes.get(hash) {
            return Ok(Some(cached.clone()));
        }
        match store.node(hash)? {
            Some(node) => {
                let cached = CachedNode::new(node);
                self.nodes.insert(*hash, cached.clone());
                Ok(Some(cached))
            }
            None => Ok(None),
        }
    }

    fn cache_new(&self, node: Node) {
        self.nodes.insert(node.hash, CachedNode::new(node));
    }

    fn set_parent(&self, store: &Store, hash: &NodeHash, parent: NodeHash) -> Result<()> {
        let mut cached = self
            .node_by_hash(store, hash)?
            .ok_or_else(|| MerkleError::NotFound(format!("node {}", hex::encode(hash))))?;
        cached.node.parent = Some(parent);
        self.nodes.insert(*hash, cached);
        Ok(())
    }

    /// Insert a new leaf into the tree. The very first leaf becomes the root
    /// directly.
    pub(crate) fn add_leaf(&self, store: &Store, leaf: Node) -> Result<()> {
        let leaf_hash = leaf.hash;
        self.cache_new(leaf);

        if self.meta.lock().num_leaves == 0 {
            self.hanging.insert(0, leaf_hash);
            self.meta.lock().root_hash = Some(leaf_hash);
        } else {
            let hanging_hash = self.hanging.get(&0).map(|entry| *entry.value());
            let hanging_leaf = match hanging_hash {
                Some(hash) => self.node_by_hash(store, &hash)?,
                None => None,
            };

            match hanging_leaf {
                None => {
                    // No leaf awaiting a sibling. Hang this one and grow a
                    // single-child parent chain toward the root.
                    self.hanging.insert(0, leaf_hash);
                    let parent = Node::internal(leaf_hash, None);
                    self.cache_new(parent.clone());
                    self.set_parent(store, &leaf_hash, parent.hash)?;
                    self.add_node(store, 1, parent)?;
                }
                Some(hanging) => {
                    match hanging.node.parent {
                        None => {
                            // The hanging leaf is the root. Pair both leaves
                            // under a fresh parent.
                            let parent = Node::internal(hanging.node.hash, Some(leaf_hash));
                            self.cache_new(parent.clone());
                            self.set_parent(store, &hanging.node.hash, parent.hash)?;
                            self.set_parent(store, &leaf_hash, parent.hash)?;
                            self.add_node(store, 1, parent)?;
                        }
                        Some(parent_hash) => {
                            let parent =
                                self.node_by_hash(store, &parent_hash)?.ok_or_else(|| {
                                    MerkleError::NotFound(format!(
                                        "parent of hanging leaf {}",
                                        hex::encode(hanging.node.hash)
                                    ))
                                })?;
                            self.attach_child(store, parent, leaf_hash)?;
                        }
                    }
                    self.hanging.remove(&0);
                }
            }
        }

        self.meta.lock().num_leaves += 1;
        Ok(())
    }

    /// Place `node` at `level`, growing the tree upward as needed.
    fn add_node(&self, store: &Store, level: u32, node: Node) -> Result<()> {
        {
            let mut meta = self.meta.lock();
            if level > meta.depth {
                meta.depth = level;
            }
        }

        let hanging_hash = self.hanging.get(&level).map(|entry| *entry.value());
        let hanging_node = match hanging_hash {
            Some(hash) => self.node_by_hash(store, &hash)?,
            None => None,
        };

        match hanging_node {
            None => {
                self.hanging.insert(level, node.hash);

                let depth = self.meta.lock().depth;
                if level >= depth {
                    self.meta.lock().root_hash = Some(node.hash);
                } else {
                    let parent = Node::internal(node.hash, None);
                    self.cache_new(parent.clone());
                    self.set_parent(store, &node.hash, parent.hash)?;
                    self.add_node(store, level + 1, parent)?;
                }
            }
            Some(hanging) => match hanging.node.parent {
                None => {
                    let parent = Node::internal(hanging.node.hash, Some(node.hash));
                    self.cache_new(parent.clone());
                    self.set_parent(store, &hanging.node.hash, parent.hash)?;
                    self.set_parent(store, &node.hash, parent.hash)?;
                    self.hanging.remove(&level);
                    self.add_node(store, level + 1, parent)?;
                }
                Some(parent_hash) => match self.node_by_hash(store, &parent_hash)? {
                    Some(parent) => {
                        self.attach_child(store, parent, node.hash)?;
                        self.hanging.remove(&level);
                    }
                    None => {
                        // The hanging node's parent is not stored; pair the
                        // two nodes under a fresh parent instead.
                        let parent = Node::internal(hanging.node.hash, Some(node.hash));
                        self.cache_new(parent.clone());
                        self.set_parent(store, &hanging.node.hash, parent.hash)?;
                        self.set_parent(store, &node.hash, parent.hash)?;
                        self.hanging.remove(&level);
                        self.add_node(store, level + 1, parent)?;
                    }
                },
            },
        }

        Ok(())
    }

    /// Attach `child_hash` as the missing child of `parent`, then recompute
    /// hashes up to the root. The child picks up its parent link when the
    /// rehash repoints the parent's children.
    fn attach_child(&self, store: &Store, mut parent: CachedNode, child_hash: NodeHash) -> Result<()> {
        if self.node_by_hash(store, &child_hash)?.is_none() {
            return Err(MerkleError::NotFound(format!(
                "child node {}",
                hex::encode(child_hash)
            )));
        }

        if parent.node.left.is_none() {
            parent.node.left = Some(child_hash);
        } else if parent.node.right.is_none() {
            parent.node.right = Some(child_hash);
        } else {
            return Err(MerkleError::CorruptState(format!(
                "node {} already has two children",
                hex::encode(parent.node.hash)
            )));
        }

        self.nodes.insert(parent.node.hash, parent.clone());

        let new_hash = parent.node.compute_hash().ok_or_else(|| {
            MerkleError::CorruptState("no child hashes to recompute after attach".into())
        })?;
        self.update_node_hash(store, parent, new_hash)
    }

    /// Replace the hash of a leaf and rehash its ancestors.
    pub(crate) fn update_leaf(&self, store: &Store, old: NodeHash, new: NodeHash) -> Result<()> {
        if old == new {
            return Err(MerkleError::InvalidArgument(
                "old and new leaf hashes are equal".into(),
            ));
        }
        let leaf = self
            .node_by_hash(store, &old)?
            .ok_or_else(|| MerkleError::NotFound(format!("leaf {}", hex::encode(old))))?;
        self.update_node_hash(store, leaf, new)
    }

    /// Rehash `cached` to `new_hash` in place and propagate the change
    /// upward to the root.
    fn update_node_hash(
        &self,
        store: &Store,
        mut cached: CachedNode,
        new_hash: NodeHash,
    ) -> Result<()> {
        // Only the first rehash records the on-disk hash; later rehashes
        // replace cache entries that were never persisted.
        if cached.stale.is_none() {
            cached.stale = Some(cached.node.hash);
        }

        let old_hash = cached.node.hash;
        cached.node.hash = new_hash;

        let hanging_level = self
            .hanging
            .iter()
            .find(|entry| *entry.value() == old_hash)
            .map(|entry| *entry.key());
        if let Some(level) = hanging_level {
            self.hanging.insert(level, new_hash);
        }

        self.nodes.remove(&old_hash);
        self.nodes.insert(new_hash, cached.clone());

        let is_leaf = cached.node.is_leaf();
        let is_root = cached.node.parent.is_none();

        if is_root {
            self.meta.lock().root_hash = Some(new_hash);
            self.repoint_children(store, &cached.node, new_hash)?;
        }

        if is_leaf && !is_root {
            self.update_parent(store, &cached.node, old_hash, new_hash)?;
        } else if !is_leaf && !is_root {
            self.repoint_children(store, &cached.node, new_hash)?;
            self.update_parent(store, &cached.node, old_hash, new_hash)?;
        }

        Ok(())
    }

    /// Point the parent link of each existing child of `node` at
    /// `parent_hash`, keeping downward links consistent after a rehash.
    fn repoint_children(&self, store: &Store, node: &Node, parent_hash: NodeHash) -> Result<()> {
        for child in [node.left, node.right].into_iter().flatten() {
            if let Some(mut cached) = self.node_by_hash(store, &child)? {
                cached.node.parent = Some(parent_hash);
                self.nodes.insert(child, cached);
            }
        }
        Ok(())
    }

    /// Rewrite the child link in the parent of a rehashed node, then rehash
    /// the parent recursively.
    fn update_parent(
        &self,
        store: &Store,
        node: &Node,
        old_hash: NodeHash,
        new_hash: NodeHash,
    ) -> Result<()> {
        let parent_hash = match node.parent {
            Some(hash) => hash,
            None => return Ok(()),
        };
        let mut parent = match self.node_by_hash(store, &parent_hash)? {
            Some(parent) => parent,
            None => return Ok(()),
        };

        if !parent.node.replace_child(&old_hash, new_hash) {
            return Err(MerkleError::InvalidArgument(format!(
                "hash {} not found among children of {}",
                hex::encode(old_hash),
                hex::encode(parent.node.hash)
            )));
        }
        self.nodes.insert(parent.node.hash, parent.clone());

        let parent_new_hash = parent.node.compute_hash().ok_or_else(|| {
            MerkleError::CorruptState("parent node has no children to hash".into())
        })?;
        self.update_node_hash(store, parent, parent_new_hash)
    }

    /// Reload the metadata record and hanging-node table from disk. Hanging
    /// nodes are faulted into the cache and must resolve.
    pub(crate) fn load_metadata(&self, store: &Store) -> Result<()> {
        let tree_meta = store.read_meta()?;

        self.hanging.clear();
        for level in 0..=tree_meta.depth {
            if let Some(hash) = store.hanging_node(level)? {
                if self.node_by_hash(store, &hash)?.is_none() {
                    return Err(MerkleError::CorruptState(format!(
                        "hanging node {} at level {level} is not stored",
                        hex::encode(hash)
                    )));
                }
                self.hanging.insert(level, hash);
            }
        }

        *self.meta.lock() = tree_meta;
        Ok(())
    }

    /// Replace this tree's in-memory state with a deep copy of `source`'s.
    pub(crate) fn copy_cache(&self, source: &Shared) {
        self.nodes.clear();
        self.committed.clear();
        self.hanging.clear();

        for entry in source.nodes.iter() {
            self.nodes.insert(*entry.key(), entry.value().clone());
        }
        for entry in source.committed.iter() {
            self.committed.insert(entry.key().clone(), entry.value().clone());
        }
        for entry in source.hanging.iter() {
            self.hanging.insert(*entry.key(), *entry.value());
        }

        *self.meta.lock() = source.meta.lock().clone();
        self.dirty
            .store(source.dirty.load(Ordering::SeqCst), Ordering::SeqCst);
    }
}
