//! The in-memory mirror of the persisted metadata record.

use merkledb_core::NodeHash;

use crate::error::{MerkleError, Result};

/// The metadata record anchoring a tree across restarts.
///
/// Rewritten in full on every flush; the hanging-node table is persisted
/// separately under one metadata key per level.
#[derive(Debug, Clone, Default)]
pub(crate) struct TreeMeta {
    /// The current root hash. `None` for an empty tree.
    pub root_hash: Option<NodeHash>,
    /// Number of leaves inserted so far.
    pub num_leaves: u32,
    /// Edges from the root to the leaf level. 0 for a single-node tree.
    pub depth: u32,
}

/// Metadata integers are stored as 4-byte big-endian values.
pub(crate) fn encode_u32(value: u32) -> [u8; 4] {
    value.to_be_bytes()
}

pub(crate) fn decode_u32(bytes: &[u8]) -> Result<u32> {
    let bytes: [u8; 4] = bytes.try_into().map_err(|_| {
        MerkleError::CorruptState(format!(
            "metadata integer has length {}, expected 4",
            bytes.len()
        ))
    })?;
    Ok(u32::from_be_bytes(bytes))
}

pub(crate) fn decode_hash(bytes: &[u8]) -> Result<NodeHash> {
    bytes.try_into().map_err(|_| {
        MerkleError::CorruptState(format!(
            "metadata hash has length {}, expected 32",
            bytes.len()
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn u32_round_trip_is_big_endian() {
        assert_eq!(encode_u32(1), [0, 0, 0, 1]);
        assert_eq!(decode_u32(&encode_u32(7_654_321)).unwrap(), 7_654_321);
        assert!(decode_u32(&[1, 2, 3]).is_err());
    }

    #[test]
    fn hash_decoding_checks_length() {
        assert!(decode_hash(&[0u8; 32]).is_ok());
        assert!(decode_hash(&[0u8; 31]).is_err());
    }
}
