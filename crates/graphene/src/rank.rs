//! Bit-packed rank vectors.
//!
//! When canonical ordering is not negotiated, the sender transmits the block
//! order as a permutation of sorted short IDs, packed at the minimum bit
//! width for the item count.

use bchu_primitives::DecodeError;

/// Bits needed to index `n_items` positions. At least 1.
pub fn rank_bits(n_items: u64) -> u8 {
    let mut bits = 1u8;
    while (1u64 << bits) < n_items {
        bits += 1;
    }
    bits
}

/// Packs each index at `bits_per_item` bits, low-order bit first.
pub fn encode_rank(indices: &[u64], bits_per_item: u8) -> Vec<u8> {
    let total_bits = indices.len() * bits_per_item as usize;
    let mut out = vec![0u8; total_bits.div_ceil(8)];
    let mut bit = 0usize;
    for &index in indices {
        for offset in 0..bits_per_item {
            if (index >> offset) & 1 == 1 {
                out[bit >> 3] |= 1 << (bit & 7);
            }
            bit += 1;
        }
    }
    out
}

pub fn decode_rank(
    bytes: &[u8],
    n_items: usize,
    bits_per_item: u8,
) -> Result<Vec<u64>, DecodeError> {
    let total_bits = n_items * bits_per_item as usize;
    if bytes.len() * 8 < total_bits {
        return Err(DecodeError::UnexpectedEof);
    }
    let mut out = Vec::with_capacity(n_items);
    let mut bit = 0usize;
    for _ in 0..n_items {
        let mut index = 0u64;
        for offset in 0..bits_per_item {
            if (bytes[bit >> 3] >> (bit & 7)) & 1 == 1 {
                index |= 1 << offset;
            }
            bit += 1;
        }
        out.push(index);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_at_thirteen_bits() {
        let indices = vec![1u64, 20, 500, 7000];
        let packed = encode_rank(&indices, 13);
        assert_eq!(packed.len(), 7);
        assert_eq!(decode_rank(&packed, 4, 13).unwrap(), indices);
    }

    #[test]
    fn round_trip_permutation() {
        let indices: Vec<u64> = (0..29).rev().collect();
        let bits = rank_bits(indices.len() as u64);
        assert_eq!(bits, 5);
        let packed = encode_rank(&indices, bits);
        assert_eq!(decode_rank(&packed, indices.len(), bits).unwrap(), indices);
    }

    #[test]
    fn short_input_is_rejected() {
        let packed = encode_rank(&[3, 1, 2], 2);
        assert_eq!(
            decode_rank(&packed, 5, 2),
            Err(DecodeError::UnexpectedEof)
        );
    }

    #[test]
    fn rank_bits_covers_item_count() {
        assert_eq!(rank_bits(1), 1);
        assert_eq!(rank_bits(2), 1);
        assert_eq!(rank_bits(3), 2);
        assert_eq!(rank_bits(4096), 12);
        assert_eq!(rank_bits(4097), 13);
    }
}
