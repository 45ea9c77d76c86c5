//! Consensus-wide constants shared across the node.

pub mod constants;

pub use constants::*;

/// A 256 bit hash stored in little-endian byte order, as serialized on the wire.
pub type Hash256 = [u8; 32];
