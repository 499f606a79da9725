//! Core types and operations for the merkledb authenticated key-value store.
//!
//! This crate defines the hash primitives and the on-disk node record in a
//! backend-agnostic manner. The tree itself is an incrementally grown binary
//! merkle tree: leaves are hashes of user key-value pairs, and every internal
//! node hashes the concatenation of its children. A node with a single child
//! duplicates that child for hashing, so the tree never contains placeholder
//! hashes.
//!
//! Nothing in this crate touches storage. The [`node::Node`] record links to
//! related nodes by hash rather than by reference, which is what allows the
//! storage layer to move nodes freely between cache, disk, and cloned trees.

#![warn(missing_docs)]

pub mod hasher;
pub mod node;

/// The hash of a tree node. Always 256 bits.
pub type NodeHash = [u8; 32];
