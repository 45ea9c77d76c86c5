//! Thin block request coordination.
//!
//! At most one thin-type request may be in flight per block per peer; when a
//! method fails the next one in the preference chain is tried. Expedited
//! peers may push blocks without a request.

use std::collections::{HashMap, HashSet};

use bchu_consensus::Hash256;

use crate::PeerId;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ThinType {
    Graphene,
    Xthin,
    Compact,
    Full,
}

impl ThinType {
    /// Next method to try after this one fails.
    pub fn failover(self) -> Option<ThinType> {
        match self {
            ThinType::Graphene => Some(ThinType::Xthin),
            ThinType::Xthin => Some(ThinType::Compact),
            ThinType::Compact => Some(ThinType::Full),
            ThinType::Full => None,
        }
    }
}

#[derive(Default)]
pub struct ThinRelayManager {
    in_flight: HashMap<(PeerId, Hash256), ThinType>,
    expedited: HashSet<PeerId>,
}

impl ThinRelayManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a request unless one is already outstanding for this block
    /// with this peer.
    pub fn try_start(&mut self, peer: PeerId, block_hash: Hash256, kind: ThinType) -> bool {
        match self.in_flight.entry((peer, block_hash)) {
            std::collections::hash_map::Entry::Occupied(_) => false,
            std::collections::hash_map::Entry::Vacant(slot) => {
                slot.insert(kind);
                true
            }
        }
    }

    pub fn in_flight(&self, peer: PeerId, block_hash: &Hash256) -> Option<ThinType> {
        self.in_flight.get(&(peer, *block_hash)).copied()
    }

    /// Clears the slot on delivery or failure so another method or peer can
    /// take over, returning what was in flight.
    pub fn clear(&mut self, peer: PeerId, block_hash: &Hash256) -> Option<ThinType> {
        self.in_flight.remove(&(peer, *block_hash))
    }

    pub fn clear_peer(&mut self, peer: PeerId) {
        self.in_flight.retain(|(p, _), _| *p != peer);
    }

    pub fn add_expedited(&mut self, peer: PeerId) {
        self.expedited.insert(peer);
    }

    pub fn remove_expedited(&mut self, peer: PeerId) {
        self.expedited.remove(&peer);
    }

    /// Expedited peers may send blocks unsolicited without penalty.
    pub fn is_expedited(&self, peer: PeerId) -> bool {
        self.expedited.contains(&peer)
    }
}
