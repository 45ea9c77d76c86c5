//! Graphene block relay for the node.
//!
//! `relay` runs the per-peer protocol loop; `session` holds the state machine
//! it drives; everything else is supporting plumbing (wire messages,
//! capability negotiation, tx pools, request tracking, statistics).

pub mod mempool;
pub mod messages;
pub mod negotiation;
pub mod relay;
pub mod session;
pub mod stats;
pub mod thinrelay;

pub type PeerId = u64;

#[derive(Clone, Debug)]
pub struct GrapheneConfig {
    pub enabled: bool,
    /// Offer the compute-optimized membership filter during negotiation.
    pub prefer_fast_filter: bool,
    /// Hard cap on the byte size of a block assembled from relayed parts.
    pub max_reconstructed_bytes: usize,
}

impl Default for GrapheneConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            prefer_fast_filter: false,
            max_reconstructed_bytes: session::default_max_reconstructed_bytes(),
        }
    }
}
