//! Classic Bloom filter over 256-bit tx hashes.

use std::io::Cursor;

use bchu_consensus::Hash256;
use bchu_primitives::{Decodable, DecodeError, Decoder, Encodable, Encoder};

use crate::{LN2, LN2SQUARED};

const MAX_FILTER_BYTES: usize = 36_000;
const MAX_HASH_FUNCS: u32 = 50;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BloomFilter {
    data: Vec<u8>,
    n_hash_funcs: u32,
    tweak: u32,
}

/// Bytes the standard sizing formula allocates for `n_elements` at rate
/// `fpr`, before the protocol cap.
pub fn bloom_bytes(n_elements: u64, fpr: f64) -> f64 {
    let n = n_elements.max(1) as f64;
    (-1.0 / LN2SQUARED * n * fpr.ln() / 8.0).floor().max(1.0)
}

impl BloomFilter {
    pub fn new(n_elements: u64, fpr: f64, tweak: u32) -> Self {
        let n = n_elements.max(1) as f64;
        let n_bytes = (bloom_bytes(n_elements, fpr) as usize).min(MAX_FILTER_BYTES);
        let n_hash_funcs = ((n_bytes as f64 * 8.0 / n * LN2) as u32).clamp(1, MAX_HASH_FUNCS);
        Self {
            data: vec![0u8; n_bytes],
            n_hash_funcs,
            tweak,
        }
    }

    fn bit_index(&self, n: u32, hash: &Hash256) -> usize {
        let seed = n.wrapping_mul(0xFBA4_C795).wrapping_add(self.tweak);
        let value = murmur3::murmur3_32(&mut Cursor::new(&hash[..]), seed).unwrap_or(0);
        value as usize % (self.data.len() * 8)
    }

    pub fn insert(&mut self, hash: &Hash256) {
        for n in 0..self.n_hash_funcs {
            let index = self.bit_index(n, hash);
            self.data[index >> 3] |= 1 << (index & 7);
        }
    }

    pub fn contains(&self, hash: &Hash256) -> bool {
        (0..self.n_hash_funcs).all(|n| {
            let index = self.bit_index(n, hash);
            self.data[index >> 3] & (1 << (index & 7)) != 0
        })
    }

    pub fn size_bytes(&self) -> usize {
        self.data.len()
    }

    pub fn n_hash_funcs(&self) -> u32 {
        self.n_hash_funcs
    }
}

impl Encodable for BloomFilter {
    fn consensus_encode(&self, encoder: &mut Encoder) {
        encoder.write_var_bytes(&self.data);
        encoder.write_u32_le(self.n_hash_funcs);
        encoder.write_u32_le(self.tweak);
    }
}

impl Decodable for BloomFilter {
    fn consensus_decode(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        let data = decoder.read_var_bytes()?;
        if data.is_empty() || data.len() > MAX_FILTER_BYTES {
            return Err(DecodeError::InvalidData("bloom filter size out of range"));
        }
        let n_hash_funcs = decoder.read_u32_le()?;
        if n_hash_funcs == 0 || n_hash_funcs > MAX_HASH_FUNCS {
            return Err(DecodeError::InvalidData("bloom hash count out of range"));
        }
        let tweak = decoder.read_u32_le()?;
        Ok(Self {
            data,
            n_hash_funcs,
            tweak,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bchu_primitives::{decode, encode};

    fn hash_of(i: u32) -> Hash256 {
        bchu_primitives::sha256d(&i.to_le_bytes())
    }

    #[test]
    fn inserted_items_are_found() {
        let mut filter = BloomFilter::new(50, 0.01, 7);
        for i in 0..50 {
            filter.insert(&hash_of(i));
        }
        for i in 0..50 {
            assert!(filter.contains(&hash_of(i)));
        }
    }

    #[test]
    fn sizing_follows_formula() {
        let filter = BloomFilter::new(100, 0.01, 0);
        // -100 ln(0.01) / (8 ln^2 2) = 119.8 bytes
        assert_eq!(filter.size_bytes(), 119);
        assert_eq!(filter.n_hash_funcs(), 6);
    }

    #[test]
    fn tiny_inputs_get_one_byte_minimum() {
        let filter = BloomFilter::new(1, 0.999, 0);
        assert_eq!(filter.size_bytes(), 1);
        // 8 bits over one element still caps at floor(8 ln 2) functions.
        assert_eq!(filter.n_hash_funcs(), 5);
    }

    #[test]
    fn wire_round_trip() {
        let mut filter = BloomFilter::new(10, 0.1, 99);
        filter.insert(&hash_of(1));
        let bytes = encode(&filter);
        let decoded: BloomFilter = decode(&bytes).unwrap();
        assert_eq!(decoded, filter);
        assert!(decoded.contains(&hash_of(1)));
    }

    #[test]
    fn rejects_oversize_filter() {
        let mut encoder = bchu_primitives::Encoder::new();
        encoder.write_var_bytes(&vec![0u8; MAX_FILTER_BYTES + 1]);
        encoder.write_u32_le(3);
        encoder.write_u32_le(0);
        assert!(decode::<BloomFilter>(&encoder.into_inner()).is_err());
    }
}
