//! Variable-rate fast filter.
//!
//! Cheaper membership filter for compute-optimized relay: bit positions come
//! straight from 32-bit words of the item hash instead of per-function
//! MurmurHash passes. Sized by the same formula as the Bloom filter so the
//! combined summary stays byte-compatible across the two modes.

use bchu_consensus::Hash256;
use bchu_primitives::{Decodable, DecodeError, Decoder, Encodable, Encoder};

use crate::LN2;

const MIN_HASH_FUNCS: u32 = 1;
const MAX_HASH_FUNCS: u32 = 32;
const MAX_FILTER_BYTES: u64 = 4_000_000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FastFilter {
    data: Vec<u8>,
    n_hash_funcs: u32,
    n_filter_items: u64,
}

/// Bytes allocated for `n_elements` at rate `fpr`. Must stay byte-identical
/// to the Bloom path so switching filter modes never changes summary sizes.
pub fn fast_filter_bytes(n_elements: u64, fpr: f64) -> f64 {
    crate::bloom::bloom_bytes(n_elements, fpr)
}

impl FastFilter {
    pub fn new(n_elements: u64, fpr: f64) -> Self {
        let n = n_elements.max(1) as f64;
        let n_bytes = fast_filter_bytes(n_elements, fpr) as usize;
        let n_filter_items = 8 * n_bytes as u64;
        let n_hash_funcs =
            ((n_bytes as f64 * 8.0 / n * LN2) as u32).clamp(MIN_HASH_FUNCS, MAX_HASH_FUNCS);
        Self {
            data: vec![0u8; n_bytes],
            n_hash_funcs,
            n_filter_items,
        }
    }

    fn bit_index(&self, n: u32, hash: &Hash256) -> usize {
        let word_start = (n as usize % 8) * 4;
        let mut word_bytes = [0u8; 4];
        word_bytes.copy_from_slice(&hash[word_start..word_start + 4]);
        let mut word = u32::from_le_bytes(word_bytes);
        // The item hash only holds eight 32-bit words; later functions reuse
        // them with a distinct additive constant per pass.
        if n >= 8 {
            word = word.wrapping_add((n / 8).wrapping_mul(0x9E37_79B9));
        }
        (word as u64 % (self.n_filter_items - 1)) as usize
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

impl Encodable for FastFilter {
    fn consensus_encode(&self, encoder: &mut Encoder) {
        encoder.write_var_bytes(&self.data);
        encoder.write_u8(self.n_hash_funcs as u8);
        encoder.write_u64_le(self.n_filter_items);
    }
}

impl Decodable for FastFilter {
    fn consensus_decode(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        let data = decoder.read_var_bytes()?;
        if data.is_empty() || data.len() as u64 > MAX_FILTER_BYTES {
            return Err(DecodeError::InvalidData("fast filter size out of range"));
        }
        let n_hash_funcs = decoder.read_u8()? as u32;
        if n_hash_funcs < MIN_HASH_FUNCS || n_hash_funcs > MAX_HASH_FUNCS {
            return Err(DecodeError::InvalidData("fast filter hash count invalid"));
        }
        let n_filter_items = decoder.read_u64_le()?;
        if n_filter_items != 8 * data.len() as u64 {
            return Err(DecodeError::InvalidData("fast filter item count invalid"));
        }
        Ok(Self {
            data,
            n_hash_funcs,
            n_filter_items,
        })
    }
}
