//! Domain-separated SHA-256 hashing and the RFC 6962 split-point helper.
//!
//! Two hash functions are used throughout the log, never interchangeably:
//! [`leaf_hash`] for the value stored at level 0 of the tree, and
//! [`node_hash`] for every interior node. Mixing them up would let an
//! attacker forge a leaf that collides with an internal node.

use sha2::{Digest, Sha256};

/// A SHA-256 digest, 32 bytes.
pub type Hash = [u8; 32];

const LEAF_PREFIX: u8 = 0x00;
const NODE_PREFIX: u8 = 0x01;

/// `SHA-256(0x00 || data)`.
pub fn leaf_hash(data: &[u8]) -> Hash {
    let mut hasher = Sha256::new();
    hasher.update([LEAF_PREFIX]);
    hasher.update(data);
    hasher.finalize().into()
}

/// `SHA-256(0x01 || l || r)`.
pub fn node_hash(left: &Hash, right: &Hash) -> Hash {
    let mut hasher = Sha256::new();
    hasher.update([NODE_PREFIX]);
    hasher.update(left);
    hasher.update(right);
    hasher.finalize().into()
}

/// `SHA-256(data)`, used for the statement dedup key and the entry-tile preimage.
pub fn sha256(data: &[u8]) -> Hash {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// The largest power of two strictly less than `n`.
///
/// This is the RFC 6962 `k` split point: for any `n >= 2` there is a unique
/// `k` with `k < n <= 2k`, and every tree-shape recursion in this crate
/// (root computation, inclusion proofs, consistency proofs) splits ranges
/// at this point.
pub fn split_point(n: u64) -> u64 {
    debug_assert!(n >= 2, "split_point is undefined for n < 2");
    1u64 << (63 - (n - 1).leading_zeros())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn leaf_and_node_hash_are_domain_separated() {
        let data = b"same bytes";
        let as_leaf = leaf_hash(data);
        // node_hash's first input byte is 0x01, never equal to a leaf hash
        // of the same bytes, by construction of the prefixes.
        let mut hasher = Sha256::new();
        hasher.update([0x00u8]);
        hasher.update(data);
        let expected: Hash = hasher.finalize().into();
        assert_eq!(as_leaf, expected);
    }

    #[test]
    fn split_point_matches_known_values() {
        assert_eq!(split_point(2), 1);
        assert_eq!(split_point(3), 2);
        assert_eq!(split_point(4), 2);
        assert_eq!(split_point(5), 4);
        assert_eq!(split_point(8), 4);
        assert_eq!(split_point(9), 8);
        assert_eq!(split_point(300), 256);
    }
}
