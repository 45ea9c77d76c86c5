//! Network-wide constants used by block relay.

/// Maximum serialized block size accepted from the network (network rule).
pub const MAX_BLOCK_SIZE: u64 = 32_000_000;
/// Smallest plausible serialized transaction, used to bound per-block tx counts.
pub const MIN_TX_SIZE: u64 = 100;
/// Maximum number of transactions a relayed block may claim to carry.
pub const MAX_BLOCK_TXS: u64 = MAX_BLOCK_SIZE / MIN_TX_SIZE;

/// Current network protocol version for P2P messages.
pub const PROTOCOL_VERSION: i32 = 80_003;

/// Oldest graphene protocol version this node can speak.
pub const GRAPHENE_MIN_VERSION_SUPPORTED: u64 = 0;
/// Newest graphene protocol version this node can speak.
pub const GRAPHENE_MAX_VERSION_SUPPORTED: u64 = 6;
/// First graphene version that runs a failure recovery round instead of
/// falling straight back to a less compressed block type.
pub const GRAPHENE_RECOVERY_MIN_VERSION: u64 = 5;
/// Target success probability for the failure recovery round.
pub const FAILURE_RECOVERY_SUCCESS_RATE: f64 = 0.999;

/// Misbehavior score at which peers are banned.
pub const BAN_SCORE_THRESHOLD: u32 = 100;
