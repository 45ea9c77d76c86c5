//! Short transaction identifiers.
//!
//! Protocol versions below 2 use a "cheap hash", the low 64 bits of the tx
//! hash. From version 2 on, short IDs are keyed SipHash-2-4 values truncated
//! to 48 bits, with the key pair derived from the block header and a random
//! per-block nonce so a third party cannot precompute colliding pairs.

use std::hash::Hasher;

use bchu_consensus::Hash256;
use bchu_primitives::{encode, BlockHeader};
use siphasher::sip::SipHasher24;

pub const SHORT_ID_MASK: u64 = 0xffff_ffff_ffff;

/// Low 64 bits of the tx hash, little endian.
pub fn cheap_hash(full_hash: &Hash256) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&full_hash[0..8]);
    u64::from_le_bytes(bytes)
}

/// Derives the per-block SipHash key pair from the serialized header and the
/// sender's nonce. Both sides must compute the identical pair.
pub fn derive_sip_keys(header: &BlockHeader, nonce: u64) -> (u64, u64) {
    let mut data = encode(header);
    data.extend_from_slice(&nonce.to_le_bytes());
    let digest = bchu_primitives::sha256(&data);
    let mut k0 = [0u8; 8];
    let mut k1 = [0u8; 8];
    k0.copy_from_slice(&digest[0..8]);
    k1.copy_from_slice(&digest[8..16]);
    (u64::from_le_bytes(k0), u64::from_le_bytes(k1))
}

pub fn short_id(k0: u64, k1: u64, full_hash: &Hash256, version: u64) -> u64 {
    if version < 2 {
        return cheap_hash(full_hash);
    }
    let mut hasher = SipHasher24::new_with_keys(k0, k1);
    hasher.write(full_hash);
    hasher.finish() & SHORT_ID_MASK
}
