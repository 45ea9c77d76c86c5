//! Merkle root computation over transaction ids.

use bchu_consensus::Hash256;

use crate::hash::sha256d;

/// Computes the merkle root of the given txids. Also reports whether the tree
/// contains a duplicated final hash in some layer, which makes two distinct
/// transaction lists commit to the same root (CVE-2012-2459). Callers must
/// reject blocks whose tree is mutated.
pub fn merkle_root(txids: &[Hash256]) -> (Hash256, bool) {
    if txids.is_empty() {
        return ([0u8; 32], false);
    }
    let mut layer = txids.to_vec();
    let mut mutated = false;
    while layer.len() > 1 {
        let size = layer.len();
        let mut next = Vec::with_capacity(size.div_ceil(2));
        let mut i = 0usize;
        while i < size {
            let i2 = if i + 1 < size { i + 1 } else { i };
            if i2 == i + 1 && i2 + 1 == size && layer[i] == layer[i2] {
                mutated = true;
            }
            let mut data = Vec::with_capacity(64);
            data.extend_from_slice(&layer[i]);
            data.extend_from_slice(&layer[i2]);
            next.push(sha256d(&data));
            i += 2;
        }
        layer = next;
    }
    (layer[0], mutated)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_txid_is_root() {
        let txid = [3u8; 32];
        let (root, mutated) = merkle_root(&[txid]);
        assert_eq!(root, txid);
        assert!(!mutated);
    }

    #[test]
    fn pair_hashes_together() {
        let a = [1u8; 32];
        let b = [2u8; 32];
        let mut data = Vec::new();
        data.extend_from_slice(&a);
        data.extend_from_slice(&b);
        let (root, mutated) = merkle_root(&[a, b]);
        assert_eq!(root, sha256d(&data));
        assert!(!mutated);
    }

    #[test]
    fn odd_count_duplicates_last() {
        let a = [1u8; 32];
        let b = [2u8; 32];
        let c = [3u8; 32];
        let (root3, mutated) = merkle_root(&[a, b, c]);
        assert!(!mutated);
        // Explicitly duplicating the last txid yields the same root but is
        // flagged as mutated.
        let (root4, mutated_dup) = merkle_root(&[a, b, c, c]);
        assert_eq!(root3, root4);
        assert!(mutated_dup);
    }

    #[test]
    fn root_depends_on_order() {
        let a = [1u8; 32];
        let b = [2u8; 32];
        assert_ne!(merkle_root(&[a, b]).0, merkle_root(&[b, a]).0);
    }
}
