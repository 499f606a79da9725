//! Keccak hash primitives.
//!
//! The tree uses the 256-bit variant for node and leaf hashes. The 224-bit
//! variant exists only for the corruption guard of the adjunct key-value
//! wrapper in the main crate.

use sha3::{Digest, Keccak224, Keccak256};

use crate::NodeHash;

/// Keccak-256 digest of a single buffer.
pub fn hash256(data: &[u8]) -> NodeHash {
    Keccak256::digest(data).into()
}

/// Keccak-256 digest of the concatenation of two buffers.
///
/// Equivalent to calling [`hash256`] on the two buffers joined together,
/// without materializing the joined buffer. The leaf hash of a user pair is
/// `hash256_pair(key, value)`.
pub fn hash256_pair(a: &[u8], b: &[u8]) -> NodeHash {
    let mut hasher = Keccak256::new();
    hasher.update(a);
    hasher.update(b);
    hasher.finalize().into()
}

/// Keccak-224 digest of a single buffer.
pub fn hash224(data: &[u8]) -> [u8; 28] {
    Keccak224::digest(data).into()
}

/// A Keccak-256 digest of 32 bytes of OS randomness.
pub fn random256() -> NodeHash {
    use rand::RngCore as _;

    let mut buf = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut buf);
    hash256(&buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use hex_literal::hex;

    #[test]
    fn known_keccak256_vectors() {
        assert_eq!(
            hash256(b""),
            hex!("c5d2460186f7233c927e7db2dcc703c0e500b653ca82273b7bfad8045d85a470"),
        );
        assert_eq!(
            hash256(b"abc"),
            hex!("4e03657aea45a94fc7d47ba826c8d667c0d1e6e33a64a036ec44f58fa12d6c45"),
        );
    }

    #[test]
    fn pair_equals_concatenation() {
        let a = b"hello ".as_slice();
        let b = b"world".as_slice();
        assert_eq!(hash256_pair(a, b), hash256(b"hello world"));
        assert_eq!(hash256_pair(b"", b"x"), hash256(b"x"));
    }

    #[test]
    fn hash224_is_28_bytes_and_deterministic() {
        let d1 = hash224(b"payload");
        let d2 = hash224(b"payload");
        assert_eq!(d1, d2);
        assert_ne!(hash224(b"payload"), hash224(b"payloae"));
    }

    #[test]
    fn random256_varies() {
        assert_ne!(random256(), random256());
    }
}
