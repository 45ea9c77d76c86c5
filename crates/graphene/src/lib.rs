//! Graphene set reconciliation.
//!
//! A sender summarizes a block's transaction set as a membership filter plus
//! an invertible Bloom lookup table, both sized from the peers' pool sizes so
//! that the expected symmetric difference decodes with high probability. The
//! receiver filters its own pools through the summary and recovers exactly
//! the sender's short-ID set, then re-requests whatever it still lacks.

pub mod bloom;
pub mod fastfilter;
pub mod iblt;
pub mod iblt_params;
pub mod rank;
pub mod set;
pub mod shortid;

pub use bloom::BloomFilter;
pub use fastfilter::FastFilter;
pub use iblt::{Iblt, IbltError};
pub use rank::{decode_rank, encode_rank, rank_bits};
pub use set::{
    approx_optimal_sym_diff, lower_bound_true_positives, n_checksum_bits, optimal_sym_diff,
    upper_bound_false_positives, GrapheneSet, GrapheneSetParams, MemberFilter, ReconcileError,
    SetBuildError,
};
pub use shortid::{cheap_hash, derive_sip_keys, short_id, SHORT_ID_MASK};

pub(crate) const LN2: f64 = std::f64::consts::LN_2;
pub(crate) const LN2SQUARED: f64 = 0.480_453_013_918_201_4;
