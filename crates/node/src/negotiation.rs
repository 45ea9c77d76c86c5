//! Graphene capability negotiation over the extended handshake.
//!
//! Each side advertises a key/value map during the version exchange; the two
//! relevant keys carry the maximum Graphene version and the membership filter
//! preference. Everything downstream keys off the agreed capability table, so
//! it is computed once per peer.

use std::collections::BTreeMap;

use bchu_consensus::{
    GRAPHENE_MAX_VERSION_SUPPORTED, GRAPHENE_MIN_VERSION_SUPPORTED, GRAPHENE_RECOVERY_MIN_VERSION,
};

pub const XVER_GRAPHENE_MAX_VERSION: u64 = 0x0000_0002;
pub const XVER_GRAPHENE_FILTER_PREF: u64 = 0x0000_0003;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FilterSupport {
    Either,
    Fast,
    Regular,
}

impl FilterSupport {
    pub fn as_u64(self) -> u64 {
        match self {
            FilterSupport::Either => 0,
            FilterSupport::Fast => 1,
            FilterSupport::Regular => 2,
        }
    }

    pub fn from_u64(raw: u64) -> Self {
        match raw {
            1 => FilterSupport::Fast,
            2 => FilterSupport::Regular,
            _ => FilterSupport::Either,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VersionOffer {
    pub max_version: u64,
    pub filter_support: FilterSupport,
}

impl Default for VersionOffer {
    fn default() -> Self {
        Self {
            max_version: GRAPHENE_MAX_VERSION_SUPPORTED,
            filter_support: FilterSupport::Either,
        }
    }
}

impl VersionOffer {
    pub fn to_xversion_map(&self) -> BTreeMap<u64, u64> {
        let mut map = BTreeMap::new();
        map.insert(XVER_GRAPHENE_MAX_VERSION, self.max_version);
        map.insert(XVER_GRAPHENE_FILTER_PREF, self.filter_support.as_u64());
        map
    }

    /// Missing keys read as version 0 with no filter preference, which keeps
    /// peers that predate the handshake extension parseable.
    pub fn from_xversion_map(map: &BTreeMap<u64, u64>) -> Self {
        Self {
            max_version: map.get(&XVER_GRAPHENE_MAX_VERSION).copied().unwrap_or(0),
            filter_support: FilterSupport::from_u64(
                map.get(&XVER_GRAPHENE_FILTER_PREF).copied().unwrap_or(0),
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NegotiationError {
    /// One side insists on the fast filter, the other on the classic one.
    /// A protocol failure, never a ban.
    IncompatibleFilterPreference,
}

impl std::fmt::Display for NegotiationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NegotiationError::IncompatibleFilterPreference => {
                write!(f, "irreconcilable membership filter preferences")
            }
        }
    }
}

impl std::error::Error for NegotiationError {}

/// Everything version-dependent, resolved once at handshake time.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RelayCapabilities {
    pub version: u64,
    /// Version >= 2: keyed 48-bit short IDs instead of cheap hashes.
    pub sip_short_ids: bool,
    /// Version >= 1: both sides sort non-coinbase txs by hash, no rank data.
    pub canonical_order: bool,
    pub fast_filter: bool,
    pub supports_recovery: bool,
    pub serializes_fpr: bool,
}

pub fn negotiate(
    ours: &VersionOffer,
    theirs: &VersionOffer,
) -> Result<RelayCapabilities, NegotiationError> {
    let version = ours
        .max_version
        .min(theirs.max_version)
        .clamp(GRAPHENE_MIN_VERSION_SUPPORTED, GRAPHENE_MAX_VERSION_SUPPORTED);
    let fast_filter = match (ours.filter_support, theirs.filter_support) {
        (FilterSupport::Fast, FilterSupport::Regular)
        | (FilterSupport::Regular, FilterSupport::Fast) => {
            return Err(NegotiationError::IncompatibleFilterPreference)
        }
        (FilterSupport::Fast, _) | (_, FilterSupport::Fast) => true,
        _ => false,
    };
    Ok(RelayCapabilities {
        version,
        sip_short_ids: version >= 2,
        canonical_order: version >= 1,
        fast_filter: fast_filter && version >= 2,
        supports_recovery: version >= GRAPHENE_RECOVERY_MIN_VERSION,
        serializes_fpr: version >= 6,
    })
}
