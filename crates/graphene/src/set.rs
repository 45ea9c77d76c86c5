//! The Graphene set: a membership filter plus an IBLT over short IDs, sized
//! so that `filter bytes + iblt bytes` is minimal for the peers' pool sizes.
//!
//! The sender builds one per block; the receiver deserializes it, streams its
//! candidate pool through `reconcile`, and gets back exactly the sender's
//! short-ID set (or a typed failure that drives the recovery protocol).

use std::collections::{BTreeSet, HashSet};

use bchu_consensus::{Hash256, MAX_BLOCK_TXS};
use bchu_log::log_debug;
use bchu_primitives::{Decodable, DecodeError, Decoder, Encodable, Encoder};

use crate::bloom::{bloom_bytes, BloomFilter};
use crate::fastfilter::FastFilter;
use crate::iblt::Iblt;
use crate::iblt_params::optimal_params;
use crate::rank::{decode_rank, encode_rank, rank_bits};
use crate::shortid::short_id;
use crate::LN2SQUARED;

pub const FILTER_CELL_SIZE: f64 = 1.0;
/// Serialized cell width of the legacy (version < 2) IBLT.
pub const IBLT_CELL_SIZE: f64 = 17.0;
/// Cell width excluding the checksum, version >= 2.
pub const IBLT_FIXED_CELL_SIZE: f64 = 12.0;
pub const IBLT_CELL_MINIMUM: u64 = 2;
pub const IBLT_DEFAULT_OVERHEAD: f64 = 1.5;
pub const FILTER_FPR_MAX: f64 = 0.999;
pub const LARGE_MEM_POOL_SIZE: u64 = 10_000_000;
pub const DEFAULT_CHECKSUM_BITS: u32 = 32;
/// Tolerated expected count of undetected false cell resolutions (2^-11).
pub const CHECKSUM_TOLERANCE: f64 = 0.000_488_281_25;

const APPROX_ITEMS_THRESH: u64 = 600;
const APPROX_EXCESS_RATE: u64 = 4;
const WORD_BITS: f64 = 8.0;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SetBuildError {
    EmptyBlock,
    TooManyItems,
    /// Version >= 2 requires a nonzero SipHash key pair.
    MissingKeys,
    /// Two block transactions mapped to one short ID.
    ShortIdCollision,
}

impl std::fmt::Display for SetBuildError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SetBuildError::EmptyBlock => write!(f, "graphene set over empty block"),
            SetBuildError::TooManyItems => write!(f, "too many block transactions"),
            SetBuildError::MissingKeys => write!(f, "sip keys required but zero"),
            SetBuildError::ShortIdCollision => write!(f, "short id collision in block"),
        }
    }
}

impl std::error::Error for SetBuildError {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileError {
    /// Two candidate transactions mapped to one short ID.
    ShortIdCollision,
    /// The symmetric difference did not decode.
    IbltDecodeFailure,
    /// Decoded set disagrees with the transmitted ordering data.
    OrderingMismatch,
}

impl std::fmt::Display for ReconcileError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReconcileError::ShortIdCollision => write!(f, "short id collision in pool"),
            ReconcileError::IbltDecodeFailure => write!(f, "iblt decode failure"),
            ReconcileError::OrderingMismatch => write!(f, "rank data inconsistent"),
        }
    }
}

impl std::error::Error for ReconcileError {}

// ---------------------------------------------------------------------------
// Sizing engine
// ---------------------------------------------------------------------------

fn membership_fpr(a: f64, excess: u64) -> f64 {
    if excess == 0 {
        return FILTER_FPR_MAX;
    }
    (a / excess as f64).min(FILTER_FPR_MAX)
}

fn filter_bytes(a: f64, n_block: u64, excess: u64) -> f64 {
    FILTER_CELL_SIZE * bloom_bytes(n_block, membership_fpr(a, excess))
}

fn iblt_cell_bytes(checksum_bits: u32) -> f64 {
    (checksum_bits as f64 + WORD_BITS * IBLT_FIXED_CELL_SIZE) / WORD_BITS
}

fn iblt_bytes(version: u64, a: f64, checksum_bits: u32) -> f64 {
    if version < 2 {
        let (overhead, n_hash) = optimal_params(a.ceil().max(1.0) as u64);
        n_hash as f64 * (overhead * a / n_hash as f64).ceil() * IBLT_CELL_SIZE
    } else {
        (a * IBLT_DEFAULT_OVERHEAD).ceil() * iblt_cell_bytes(checksum_bits)
    }
}

/// Checksum width keeping the expected number of undetected false cell
/// resolutions (`n_hash * pool * fpr` candidate evaluations) below
/// `tolerance`. Clamped to a serializable 1..=32 bits.
pub fn n_checksum_bits(n_hash_funcs: u32, n_receiver_pool: u64, fpr: f64, tolerance: f64) -> u32 {
    let failures = n_hash_funcs as f64 * n_receiver_pool.max(1) as f64 * fpr;
    let bits = (failures / tolerance).log2().ceil() as i64;
    bits.clamp(1, 32) as u32
}

/// Closed-form minimizer of `filter_bytes(a) + iblt_bytes(a)`; the continuous
/// optimum of the version >= 2 cost model.
pub fn approx_optimal_sym_diff(n_block: u64, checksum_bits: u32) -> f64 {
    let denom = (checksum_bits as f64 + WORD_BITS * IBLT_FIXED_CELL_SIZE)
        * IBLT_DEFAULT_OVERHEAD
        * LN2SQUARED;
    (FILTER_CELL_SIZE * n_block as f64 / denom).round().max(1.0)
}

pub fn brute_force_sym_diff(version: u64, n_block: u64, excess: u64, checksum_bits: u32) -> f64 {
    let mut best_a = 1.0f64;
    let mut best_total = f64::MAX;
    for a in 1..=excess.max(1) {
        let a = a as f64;
        let total = filter_bytes(a, n_block, excess) + iblt_bytes(version, a, checksum_bits);
        if total < best_total {
            best_total = total;
            best_a = a;
        }
    }
    best_a
}

/// Symmetric-difference parameter used to size the summary. Brute force for
/// small blocks, closed form once the scan would be long and the excess is
/// large enough for the continuous model to hold.
pub fn optimal_sym_diff(version: u64, n_block: u64, excess: u64, checksum_bits: u32) -> f64 {
    if version >= 2 && n_block >= APPROX_ITEMS_THRESH && excess >= n_block / APPROX_EXCESS_RATE {
        approx_optimal_sym_diff(n_block, checksum_bits)
    } else {
        brute_force_sym_diff(version, n_block, excess, checksum_bits)
    }
}

// ---------------------------------------------------------------------------
// Failure recovery bounds
// ---------------------------------------------------------------------------

/// Chernoff lower tail: with probability `beta`, at least this many of the
/// receiver's `n` filter positives are true block members.
pub fn lower_bound_true_positives(n: u64, beta: f64) -> u64 {
    let mu = n as f64;
    if mu == 0.0 {
        return 0;
    }
    let delta = (2.0 * (1.0 / (1.0 - beta)).ln() / mu).sqrt();
    (mu * (1.0 - delta)).ceil().max(0.0) as u64
}

/// Chernoff upper tail: with probability `beta`, at most this many of `z`
/// non-members pass a filter with rate `fpr`.
pub fn upper_bound_false_positives(z: u64, fpr: f64, beta: f64) -> u64 {
    let mu = z as f64 * fpr;
    if mu <= 0.0 {
        return 0;
    }
    let c = (1.0 / (1.0 - beta)).ln() / mu;
    let delta = (c + (c * c + 8.0 * c).sqrt()) / 2.0;
    (mu * (1.0 + delta)).ceil() as u64
}

// ---------------------------------------------------------------------------
// GrapheneSet
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum MemberFilter {
    Regular(BloomFilter),
    Fast(FastFilter),
}

impl MemberFilter {
    fn insert(&mut self, hash: &Hash256) {
        match self {
            MemberFilter::Regular(filter) => filter.insert(hash),
            MemberFilter::Fast(filter) => filter.insert(hash),
        }
    }

    pub fn contains(&self, hash: &Hash256) -> bool {
        match self {
            MemberFilter::Regular(filter) => filter.contains(hash),
            MemberFilter::Fast(filter) => filter.contains(hash),
        }
    }

    pub fn size_bytes(&self) -> usize {
        match self {
            MemberFilter::Regular(filter) => filter.size_bytes(),
            MemberFilter::Fast(filter) => filter.size_bytes(),
        }
    }

    pub fn is_fast(&self) -> bool {
        matches!(self, MemberFilter::Fast(_))
    }

    pub fn n_hash_funcs(&self) -> u32 {
        match self {
            MemberFilter::Regular(filter) => filter.n_hash_funcs(),
            MemberFilter::Fast(filter) => filter.n_hash_funcs(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct GrapheneSetParams {
    pub version: u64,
    pub receiver_pool_size: u64,
    pub sender_universe_size: u64,
    pub k0: u64,
    pub k1: u64,
    pub compute_optimized: bool,
    pub canonical_order: bool,
    /// Deterministic source for the IBLT salt and Bloom tweak.
    pub seed: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GrapheneSet {
    version: u64,
    n_items: u64,
    receiver_universe: u64,
    ordered: bool,
    fpr: f64,
    filter: MemberFilter,
    iblt: Iblt,
    encoded_rank: Vec<u8>,
    k0: u64,
    k1: u64,
}

fn checksum_mask(bits: u32) -> u32 {
    if bits >= 32 {
        u32::MAX
    } else {
        (1u32 << bits) - 1
    }
}

impl GrapheneSet {
    pub fn new(params: &GrapheneSetParams, block_hashes: &[Hash256]) -> Result<Self, SetBuildError> {
        let n = block_hashes.len() as u64;
        if n == 0 {
            return Err(SetBuildError::EmptyBlock);
        }
        if n > MAX_BLOCK_TXS as u64 {
            return Err(SetBuildError::TooManyItems);
        }
        if params.version >= 2 && params.k0 == 0 && params.k1 == 0 {
            return Err(SetBuildError::MissingKeys);
        }

        let m = params.receiver_pool_size.min(LARGE_MEM_POOL_SIZE);
        let universe = params.sender_universe_size.max(n);
        let excess = (universe - n).min(m);
        let missing = (n + excess).saturating_sub(m).max(1);

        let mut sym_diff = missing as f64;
        if n <= m + missing {
            sym_diff = optimal_sym_diff(params.version, n, excess, DEFAULT_CHECKSUM_BITS);
        }
        let fpr = if sym_diff >= excess as f64 {
            FILTER_FPR_MAX
        } else {
            membership_fpr(sym_diff, excess)
        };
        // The filter passes roughly sym_diff strangers; the IBLT must absorb
        // those plus whatever the receiver is genuinely missing.
        let sym_diff = sym_diff + missing as f64;
        let n_iblt_cells = (sym_diff.ceil() as u64).max(IBLT_CELL_MINIMUM);

        let salt = params.seed as u32;
        let tweak = (params.seed >> 32) as u32;
        let mut filter = if params.compute_optimized && params.version >= 2 {
            MemberFilter::Fast(FastFilter::new(n, fpr))
        } else {
            MemberFilter::Regular(BloomFilter::new(n, fpr, tweak))
        };
        // Checksum width follows the filter rate: the IBLT only has to detect
        // false resolutions among the candidates the filter lets through.
        let checksum_bits = if params.version >= 2 {
            n_checksum_bits(filter.n_hash_funcs(), m, fpr, CHECKSUM_TOLERANCE)
        } else {
            DEFAULT_CHECKSUM_BITS
        };
        let mut iblt = Iblt::new(
            params.version,
            n_iblt_cells,
            0,
            salt,
            checksum_mask(checksum_bits),
        );

        let mut seen: HashSet<u64> = HashSet::with_capacity(block_hashes.len());
        let mut ids = Vec::with_capacity(block_hashes.len());
        for hash in block_hashes {
            let id = short_id(params.k0, params.k1, hash, params.version);
            if !seen.insert(id) {
                return Err(SetBuildError::ShortIdCollision);
            }
            filter.insert(hash);
            iblt.insert(id, &[]);
            ids.push(id);
        }

        let (ordered, encoded_rank) = if params.canonical_order {
            (false, Vec::new())
        } else {
            // rank[i] = block position of the i-th smallest short ID, so the
            // receiver can restore block order from its sorted decode.
            let mut order: Vec<u64> = (0..ids.len() as u64).collect();
            order.sort_by_key(|&i| ids[i as usize]);
            (true, encode_rank(&order, rank_bits(n)))
        };

        log_debug!(
            "built graphene set: {} items, fpr {:.6}, {} filter bytes, {} iblt cells",
            n,
            fpr,
            filter.size_bytes(),
            iblt.len()
        );

        Ok(Self {
            version: params.version,
            n_items: n,
            receiver_universe: m,
            ordered,
            fpr,
            filter,
            iblt,
            encoded_rank,
            k0: params.k0,
            k1: params.k1,
        })
    }

    /// Recovers the sender's short-ID set from the receiver's candidates.
    /// Consumes nothing; the set is read-only after construction or decode.
    pub fn reconcile(&self, candidates: &[Hash256]) -> Result<Vec<u64>, ReconcileError> {
        let mut seen: HashSet<u64> = HashSet::with_capacity(candidates.len());
        let mut receiver_set: BTreeSet<u64> = BTreeSet::new();
        let mut local_iblt = self.iblt.cloned_empty();
        for hash in candidates {
            let id = self.get_short_id(hash);
            if !seen.insert(id) {
                return Err(ReconcileError::ShortIdCollision);
            }
            if self.filter.contains(hash) {
                receiver_set.insert(id);
                local_iblt.insert(id, &[]);
            }
        }

        let diff = self
            .iblt
            .subtract(&local_iblt)
            .map_err(|_| ReconcileError::IbltDecodeFailure)?;
        let (sender_has, receiver_has) = match diff.list_entries() {
            Ok(entries) => entries,
            Err(err) => {
                log_debug!("graphene reconcile failed: {err}");
                return Err(ReconcileError::IbltDecodeFailure);
            }
        };
        for (id, _) in receiver_has {
            receiver_set.remove(&id);
        }
        for (id, _) in sender_has {
            receiver_set.insert(id);
        }

        let sorted: Vec<u64> = receiver_set.into_iter().collect();
        if sorted.len() as u64 != self.n_items {
            log_debug!(
                "graphene reconcile returned {} ids, wanted {}",
                sorted.len(),
                self.n_items
            );
            return Err(ReconcileError::IbltDecodeFailure);
        }
        if !self.ordered {
            return Ok(sorted);
        }

        let ranks = decode_rank(&self.encoded_rank, sorted.len(), rank_bits(self.n_items))
            .map_err(|_| ReconcileError::OrderingMismatch)?;
        let mut ordered = vec![0u64; sorted.len()];
        let mut placed = vec![false; sorted.len()];
        for (sorted_index, &rank) in ranks.iter().enumerate() {
            let slot = rank as usize;
            if slot >= ordered.len() || placed[slot] {
                return Err(ReconcileError::OrderingMismatch);
            }
            ordered[slot] = sorted[sorted_index];
            placed[slot] = true;
        }
        Ok(ordered)
    }

    pub fn get_short_id(&self, hash: &Hash256) -> u64 {
        short_id(self.k0, self.k1, hash, self.version)
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn n_items(&self) -> u64 {
        self.n_items
    }

    pub fn fpr(&self) -> f64 {
        self.fpr
    }

    pub fn set_fpr(&mut self, fpr: f64) {
        self.fpr = fpr;
    }

    /// The decoded set arrives keyless; the embedding message carries the key
    /// pair and installs it before reconciliation.
    pub fn set_keys(&mut self, k0: u64, k1: u64) {
        self.k0 = k0;
        self.k1 = k1;
    }

    pub fn filter(&self) -> &MemberFilter {
        &self.filter
    }

    pub fn filter_size_bytes(&self) -> usize {
        self.filter.size_bytes()
    }

    pub fn iblt_cells(&self) -> usize {
        self.iblt.len()
    }

    pub fn iblt_key_check_mask(&self) -> u32 {
        self.iblt.key_check_mask()
    }

    pub fn rank_size_bytes(&self) -> usize {
        self.encoded_rank.len()
    }

    pub fn encode_into(&self, encoder: &mut Encoder) {
        encoder.write_varint(self.n_items);
        encoder.write_varint(self.receiver_universe);
        encoder.write_bool(self.ordered);
        encoder.write_var_bytes(&self.encoded_rank);
        match &self.filter {
            MemberFilter::Regular(filter) => {
                encoder.write_u8(0);
                filter.consensus_encode(encoder);
            }
            MemberFilter::Fast(filter) => {
                encoder.write_u8(1);
                filter.consensus_encode(encoder);
            }
        }
        self.iblt.consensus_encode(encoder);
    }

    pub fn decode_from(decoder: &mut Decoder, version: u64) -> Result<Self, DecodeError> {
        let n_items = decoder.read_varint()?;
        if n_items == 0 || n_items > MAX_BLOCK_TXS as u64 {
            return Err(DecodeError::InvalidData("graphene item count out of range"));
        }
        let receiver_universe = decoder.read_varint()?;
        if receiver_universe > LARGE_MEM_POOL_SIZE {
            return Err(DecodeError::InvalidData("receiver universe too large"));
        }
        let ordered = decoder.read_bool()?;
        let encoded_rank = decoder.read_var_bytes()?;
        if ordered {
            let need = (n_items as usize * rank_bits(n_items) as usize).div_ceil(8);
            if encoded_rank.len() != need {
                return Err(DecodeError::InvalidData("rank data length mismatch"));
            }
        } else if !encoded_rank.is_empty() {
            return Err(DecodeError::InvalidData("rank data on unordered set"));
        }
        let filter = match decoder.read_u8()? {
            0 => MemberFilter::Regular(BloomFilter::consensus_decode(decoder)?),
            1 if version >= 2 => MemberFilter::Fast(FastFilter::consensus_decode(decoder)?),
            _ => return Err(DecodeError::InvalidData("unknown membership filter kind")),
        };
        let iblt = Iblt::consensus_decode(decoder)?;
        Ok(Self {
            version,
            n_items,
            receiver_universe,
            ordered,
            fpr: 0.0,
            filter,
            iblt,
            encoded_rank,
            k0: 0,
            k1: 0,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checksum_bits_regression() {
        assert_eq!(n_checksum_bits(2, 1, 0.5, 2f64.powi(-11)), 11);
    }

    #[test]
    fn checksum_bits_stay_serializable() {
        assert_eq!(n_checksum_bits(4, 1, 1e-12, 0.5), 1);
        assert_eq!(n_checksum_bits(32, LARGE_MEM_POOL_SIZE, 0.999, 1e-9), 32);
    }

    #[test]
    fn recovery_bounds_regression() {
        assert_eq!(lower_bound_true_positives(10, 0.9), 4);
        assert_eq!(upper_bound_false_positives(10, 0.1, 0.9), 5);
    }

    #[test]
    fn recovery_bounds_degenerate_inputs() {
        assert_eq!(lower_bound_true_positives(0, 0.9), 0);
        assert_eq!(upper_bound_false_positives(0, 0.5, 0.9), 0);
        assert_eq!(upper_bound_false_positives(100, 0.0, 0.9), 0);
    }

    #[test]
    fn approximation_tracks_brute_force() {
        for n in [1000u64, 2000, 10_000] {
            let brute = brute_force_sym_diff(2, n, n, DEFAULT_CHECKSUM_BITS);
            let approx = approx_optimal_sym_diff(n, DEFAULT_CHECKSUM_BITS);
            let ratio = (approx - brute).abs() / brute;
            assert!(ratio <= 0.15, "n={n} brute={brute} approx={approx}");
        }
    }

    #[test]
    fn sizing_is_identical_across_filter_modes() {
        for optimized in [false, true] {
            let params = GrapheneSetParams {
                version: 2,
                receiver_pool_size: 220,
                sender_universe_size: 220,
                k0: 0xfeed,
                k1: 0xbead,
                compute_optimized: optimized,
                canonical_order: true,
                seed: 0x0dd5_eed0_0dd5_eed0,
            };
            let hashes: Vec<Hash256> =
                (0u32..200).map(|i| bchu_primitives::sha256d(&i.to_le_bytes())).collect();
            let set = GrapheneSet::new(&params, &hashes).unwrap();
            assert_eq!(set.filter().is_fast(), optimized);
            let reference = GrapheneSet::new(
                &GrapheneSetParams {
                    compute_optimized: false,
                    ..params
                },
                &hashes,
            )
            .unwrap();
            assert_eq!(set.filter_size_bytes(), reference.filter_size_bytes());
            assert_eq!(set.iblt_cells(), reference.iblt_cells());
        }
    }

    #[test]
    fn checksum_mask_tracks_filter_rate() {
        let params = GrapheneSetParams {
            version: 6,
            receiver_pool_size: 220,
            sender_universe_size: 239,
            k0: 0xfeed,
            k1: 0xbead,
            compute_optimized: false,
            canonical_order: true,
            seed: 7,
        };
        let hashes: Vec<Hash256> =
            (0u32..20).map(|i| bchu_primitives::sha256d(&i.to_le_bytes())).collect();
        let set = GrapheneSet::new(&params, &hashes).unwrap();
        let bits = n_checksum_bits(
            set.filter().n_hash_funcs(),
            params.receiver_pool_size,
            set.fpr(),
            CHECKSUM_TOLERANCE,
        );
        assert_eq!(bits, 14);
        assert_eq!(set.iblt_key_check_mask(), checksum_mask(bits));
        assert_eq!(set.reconcile(&hashes).unwrap().len(), 20);
    }

    #[test]
    fn rejects_empty_block_and_zero_keys() {
        let params = GrapheneSetParams {
            version: 2,
            receiver_pool_size: 10,
            sender_universe_size: 10,
            k0: 0,
            k1: 0,
            compute_optimized: false,
            canonical_order: true,
            seed: 1,
        };
        assert_eq!(
            GrapheneSet::new(&params, &[]),
            Err(SetBuildError::EmptyBlock)
        );
        let hash = bchu_primitives::sha256d(b"tx");
        assert_eq!(
            GrapheneSet::new(&params, &[hash]),
            Err(SetBuildError::MissingKeys)
        );
    }

    #[test]
    fn detects_block_side_collision() {
        // Version 1 short IDs are the low hash bytes, so two hashes sharing a
        // prefix collide.
        let mut a = [0u8; 32];
        let mut b = [0u8; 32];
        a[8] = 1;
        b[8] = 2;
        let params = GrapheneSetParams {
            version: 1,
            receiver_pool_size: 10,
            sender_universe_size: 10,
            k0: 0,
            k1: 0,
            compute_optimized: false,
            canonical_order: true,
            seed: 1,
        };
        assert_eq!(
            GrapheneSet::new(&params, &[a, b]),
            Err(SetBuildError::ShortIdCollision)
        );
    }
}
