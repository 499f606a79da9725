//! The tree node record and its storage codec.

use crate::{hasher, NodeHash};

/// Length of a node hash in bytes.
pub const HASH_LENGTH: usize = 32;

/// A single vertex of the merkle tree.
///
/// A leaf has neither child and carries an externally supplied hash. A
/// non-leaf has at least one child and its hash follows the odd-arity rule:
/// an absent child is replaced by the present one for hashing.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Node {
    /// The digest identifying this node.
    pub hash: NodeHash,
    /// Hash of the left child, if any.
    pub left: Option<NodeHash>,
    /// Hash of the right child, if any.
    pub right: Option<NodeHash>,
    /// Hash of the parent node. `None` for the root.
    pub parent: Option<NodeHash>,
}

/// Failure to decode a node record.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("node record length mismatch: expected {expected} bytes, got {actual}")]
pub struct NodeDecodeError {
    /// The length the record should have had given its flag bytes.
    pub expected: usize,
    /// The length actually observed.
    pub actual: usize,
}

impl Node {
    /// Create a leaf node with an externally supplied hash.
    pub fn leaf(hash: NodeHash) -> Self {
        Node {
            hash,
            left: None,
            right: None,
            parent: None,
        }
    }

    /// Create an internal node over one or two children.
    ///
    /// The node hash is computed with the odd-arity rule: a missing right
    /// child is duplicated from the left.
    pub fn internal(left: NodeHash, right: Option<NodeHash>) -> Self {
        let hash = hasher::hash256_pair(&left, &right.unwrap_or(left));
        Node {
            hash,
            left: Some(left),
            right,
            parent: None,
        }
    }

    /// Whether this node is a leaf, i.e. has no children.
    pub fn is_leaf(&self) -> bool {
        self.left.is_none() && self.right.is_none()
    }

    /// Recompute the hash of a non-leaf node from its children, applying the
    /// odd-arity rule. Returns `None` for a leaf, whose hash is supplied
    /// externally.
    pub fn compute_hash(&self) -> Option<NodeHash> {
        let left = self.left.or(self.right)?;
        let right = self.right.or(self.left)?;
        Some(hasher::hash256_pair(&left, &right))
    }

    /// Rewrite whichever child link equals `old` to `new`.
    ///
    /// Returns false when neither child matches, which callers treat as a
    /// broken parent link.
    pub fn replace_child(&mut self, old: &NodeHash, new: NodeHash) -> bool {
        if self.left.as_ref() == Some(old) {
            self.left = Some(new);
            true
        } else if self.right.as_ref() == Some(old) {
            self.right = Some(new);
            true
        } else {
            false
        }
    }

    /// Encode the node for storage.
    ///
    /// Layout: the 32-byte hash, three single-byte presence flags for left,
    /// right and parent in that order, then each present link. The three
    /// separate flag bytes are part of the on-disk format.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HASH_LENGTH * 4 + 3);
        buf.extend_from_slice(&self.hash);
        buf.push(self.left.is_some() as u8);
        buf.push(self.right.is_some() as u8);
        buf.push(self.parent.is_some() as u8);
        if let Some(left) = &self.left {
            buf.extend_from_slice(left);
        }
        if let Some(right) = &self.right {
            buf.extend_from_slice(right);
        }
        if let Some(parent) = &self.parent {
            buf.extend_from_slice(parent);
        }
        buf
    }

    /// Decode a node record. Any length mismatch is a corruption fault.
    pub fn decode(buf: &[u8]) -> Result<Self, NodeDecodeError> {
        const HEADER: usize = HASH_LENGTH + 3;
        if buf.len() < HEADER {
            return Err(NodeDecodeError {
                expected: HEADER,
                actual: buf.len(),
            });
        }

        let has_left = buf[HASH_LENGTH] == 1;
        let has_right = buf[HASH_LENGTH + 1] == 1;
        let has_parent = buf[HASH_LENGTH + 2] == 1;

        let links = has_left as usize + has_right as usize + has_parent as usize;
        let expected = HEADER + links * HASH_LENGTH;
        if buf.len() != expected {
            return Err(NodeDecodeError {
                expected,
                actual: buf.len(),
            });
        }

        let mut hash = [0u8; HASH_LENGTH];
        hash.copy_from_slice(&buf[..HASH_LENGTH]);

        let mut offset = HEADER;
        let mut read_link = |present: bool| {
            if !present {
                return None;
            }
            let mut link = [0u8; HASH_LENGTH];
            link.copy_from_slice(&buf[offset..offset + HASH_LENGTH]);
            offset += HASH_LENGTH;
            Some(link)
        };

        let left = read_link(has_left);
        let right = read_link(has_right);
        let parent = read_link(has_parent);

        Ok(Node {
            hash,
            left,
            right,
            parent,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn h(byte: u8) -> NodeHash {
        [byte; 32]
    }

    #[test]
    fn encode_decode_round_trip() {
        let links = [None, Some(h(7))];
        for left in links {
            for right in links.map(|l| l.map(|_| h(8))) {
                for parent in links.map(|l| l.map(|_| h(9))) {
                    let node = Node {
                        hash: h(1),
                        left,
                        right,
                        parent,
                    };
                    let encoded = node.encode();
                    assert_eq!(Node::decode(&encoded).unwrap(), node);
                    assert_eq!(Node::decode(&encoded).unwrap().encode(), encoded);
                }
            }
        }
    }

    #[test]
    fn encoding_layout() {
        let node = Node {
            hash: h(1),
            left: Some(h(2)),
            right: None,
            parent: Some(h(3)),
        };
        let encoded = node.encode();
        assert_eq!(encoded.len(), 32 + 3 + 64);
        assert_eq!(&encoded[..32], &h(1));
        assert_eq!(&encoded[32..35], &[1, 0, 1]);
        assert_eq!(&encoded[35..67], &h(2));
        assert_eq!(&encoded[67..99], &h(3));
    }

    #[test]
    fn decode_rejects_bad_lengths() {
        let node = Node {
            hash: h(1),
            left: Some(h(2)),
            right: Some(h(3)),
            parent: None,
        };
        let mut encoded = node.encode();
        encoded.pop();
        let err = Node::decode(&encoded).unwrap_err();
        assert_eq!(err.expected, 99);
        assert_eq!(err.actual, 98);

        assert!(Node::decode(&[0u8; 10]).is_err());
    }

    #[test]
    fn internal_node_applies_odd_arity_rule() {
        let only_child = Node::internal(h(4), None);
        assert_eq!(
            only_child.hash,
            crate::hasher::hash256_pair(&h(4), &h(4)),
        );

        let full = Node::internal(h(4), Some(h(5)));
        assert_eq!(full.hash, crate::hasher::hash256_pair(&h(4), &h(5)));
        assert_eq!(full.compute_hash(), Some(full.hash));
    }

    #[test]
    fn leaf_has_no_computed_hash() {
        assert_eq!(Node::leaf(h(6)).compute_hash(), None);
        assert!(Node::leaf(h(6)).is_leaf());
    }

    #[test]
    fn replace_child_rewrites_matching_link() {
        let mut node = Node::internal(h(1), Some(h(2)));
        assert!(node.replace_child(&h(2), h(9)));
        assert_eq!(node.right, Some(h(9)));
        assert!(!node.replace_child(&h(2), h(9)));
    }
}
