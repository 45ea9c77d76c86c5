//! Per-peer Graphene block relay sessions.
//!
//! The receiver drives one session per requested block through
//! summary -> (missing txs) -> (recovery) -> reconstruction -> delivery.
//! Messages arriving in the wrong state are ignored; failures either fail the
//! session over to the next thin relay method (no penalty) or surface a
//! `SessionError` whose severity the connection layer applies.
//!
//! Lock discipline: `handle_summary` takes the pool snapshot and runs
//! reconciliation inside the caller's single pool lock scope. Reconstruction
//! and the merkle check run in a separate, later scope.

use std::collections::{BTreeSet, HashMap, HashSet};

use bchu_consensus::{Hash256, FAILURE_RECOVERY_SUCCESS_RATE, MAX_BLOCK_SIZE};
use bchu_graphene::{
    derive_sip_keys, upper_bound_false_positives, FastFilter, GrapheneSet, GrapheneSetParams, Iblt,
};
use bchu_log::{log_debug, log_warn};
use bchu_primitives::{encode, merkle_root, Block, BlockHeader, Encoder, Transaction};

use crate::messages::{
    GetGrapheneBlock, GetGrapheneRecovery, GetGrapheneTx, GrapheneBlockMsg, GrapheneRecovery,
    GrapheneTx, MemPoolInfo,
};
use crate::mempool::TxPools;
use crate::negotiation::RelayCapabilities;
use crate::GrapheneConfig;

/// Rate of the receiver's recovery-round filter over its filter positives.
const RECOVERY_FILTER_FPR: f64 = 1.0 - FAILURE_RECOVERY_SUCCESS_RATE;
const IBLT_CELL_MINIMUM: u64 = 2;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Severity {
    /// No penalty; fail over or retry.
    Recoverable,
    /// Add to the peer's misbehavior score.
    Misbehavior(u32),
    /// Drop the connection immediately.
    Disconnect,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SessionError {
    /// A thin block message we never asked for, from a non-expedited peer.
    Unsolicited,
    /// Structurally valid but semantically impossible contents.
    MalformedMessage(&'static str),
    /// The block's coinbase was not supplied with the summary.
    MissingCoinbase,
    /// Two slots in the reconstructed block resolved to one txid.
    DuplicateTransaction,
    /// Running reconstruction size exceeded the configured budget.
    OversizeReconstruction,
}

impl SessionError {
    pub fn severity(&self) -> Severity {
        match self {
            SessionError::Unsolicited => Severity::Misbehavior(10),
            SessionError::MalformedMessage(_) => Severity::Misbehavior(100),
            SessionError::MissingCoinbase => Severity::Misbehavior(100),
            SessionError::DuplicateTransaction => Severity::Misbehavior(10),
            SessionError::OversizeReconstruction => Severity::Disconnect,
        }
    }
}

impl std::fmt::Display for SessionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionError::Unsolicited => write!(f, "unsolicited thin block message"),
            SessionError::MalformedMessage(what) => write!(f, "malformed message: {what}"),
            SessionError::MissingCoinbase => write!(f, "coinbase missing from summary"),
            SessionError::DuplicateTransaction => write!(f, "duplicate txid in reconstruction"),
            SessionError::OversizeReconstruction => write!(f, "reconstructed block too large"),
        }
    }
}

impl std::error::Error for SessionError {}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    AwaitingSummary,
    AwaitingMissing,
    AwaitingRecovery,
    ReadyToReconstruct,
    Delivered,
    Failed,
}

/// What the connection layer should do next.
#[derive(Clone, Debug, PartialEq)]
pub enum SessionAction {
    /// Wrong state or wrong block; drop the message.
    Ignored,
    RequestMissing(GetGrapheneTx),
    RequestRecovery(GetGrapheneRecovery),
    /// Session failed; try the next thin relay method for this block.
    Failover,
    /// The difference table failed to decode with no recovery round left;
    /// count the failure, then fail over.
    FailedDecode,
    /// Everything resolved at the short-ID level; run `try_reconstruct`.
    Reconstruct,
    Delivered(ReconstructedBlock),
}

#[derive(Clone, Debug, PartialEq)]
pub struct ReconstructedBlock {
    pub block: Block,
    /// Txids that skipped mempool validation and must be checked downstream.
    pub unverified: Vec<Hash256>,
}

pub struct GrapheneSession {
    block_hash: Hash256,
    caps: RelayCapabilities,
    state: SessionState,
    header: Option<BlockHeader>,
    set: Option<GrapheneSet>,
    n_block_txs: u64,
    block_ids: Vec<u64>,
    id_to_hash: HashMap<u64, Hash256>,
    /// Txs received over the relay itself: additional, re-requested,
    /// recovery. All unverified.
    extra_txs: HashMap<Hash256, Transaction>,
    missing: Vec<u64>,
    filter_positives: Vec<Hash256>,
    recovery_tried: bool,
}

impl GrapheneSession {
    /// Starts a session and produces the request carrying our pool size
    /// (plus one for the coinbase we can never have).
    pub fn request(
        block_hash: Hash256,
        caps: RelayCapabilities,
        pool_count: u64,
    ) -> (Self, GetGrapheneBlock) {
        let session = Self {
            block_hash,
            caps,
            state: SessionState::AwaitingSummary,
            header: None,
            set: None,
            n_block_txs: 0,
            block_ids: Vec::new(),
            id_to_hash: HashMap::new(),
            extra_txs: HashMap::new(),
            missing: Vec::new(),
            filter_positives: Vec::new(),
            recovery_tried: false,
        };
        let request = GetGrapheneBlock {
            block_hash,
            mempool_info: MemPoolInfo {
                n_tx: pool_count + 1,
            },
        };
        (session, request)
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn block_hash(&self) -> &Hash256 {
        &self.block_hash
    }

    /// Header from the summary, once one has arrived.
    pub fn header(&self) -> Option<&BlockHeader> {
        self.header.as_ref()
    }

    pub fn is_finished(&self) -> bool {
        matches!(self.state, SessionState::Delivered | SessionState::Failed)
    }

    /// Tip advance or peer disconnect: abandon the session.
    pub fn cancel(&mut self) {
        self.state = SessionState::Failed;
    }

    fn fail(&mut self) -> SessionAction {
        self.state = SessionState::Failed;
        SessionAction::Failover
    }

    /// Processes the block summary. The caller holds the pool lock across
    /// this call; nothing here blocks or re-locks.
    pub fn handle_summary(
        &mut self,
        msg: GrapheneBlockMsg,
        pools: &TxPools,
    ) -> Result<SessionAction, SessionError> {
        if self.state != SessionState::AwaitingSummary {
            return Ok(SessionAction::Ignored);
        }
        if msg.header.hash() != self.block_hash {
            return Ok(SessionAction::Ignored);
        }

        let (k0, k1) = if self.caps.sip_short_ids {
            derive_sip_keys(&msg.header, msg.nonce)
        } else {
            (0, 0)
        };
        let mut set = msg.set;
        set.set_keys(k0, k1);
        if self.caps.serializes_fpr {
            set.set_fpr(msg.fpr);
        }

        for tx in msg.additional_txs {
            self.extra_txs.insert(tx.txid(), tx);
        }
        if !self.extra_txs.values().any(Transaction::is_coinbase) {
            self.state = SessionState::Failed;
            return Err(SessionError::MissingCoinbase);
        }

        self.header = Some(msg.header);
        self.n_block_txs = msg.n_block_txs;

        let snapshot = pools.snapshot_candidates();
        match set.reconcile(&snapshot) {
            Ok(ids) => self.finish_reconciliation(ids, &snapshot, set),
            Err(err) => {
                log_debug!("graphene reconciliation failed for block: {err}");
                if self.caps.supports_recovery && !self.recovery_tried {
                    let action = self.start_recovery(&snapshot, &set);
                    self.set = Some(set);
                    Ok(action)
                } else {
                    self.state = SessionState::Failed;
                    Ok(SessionAction::FailedDecode)
                }
            }
        }
    }

    fn start_recovery(&mut self, snapshot: &[Hash256], set: &GrapheneSet) -> SessionAction {
        let positives: Vec<Hash256> = snapshot
            .iter()
            .filter(|hash| set.filter().contains(hash))
            .copied()
            .collect();
        let mut filter = FastFilter::new(positives.len().max(1) as u64, RECOVERY_FILTER_FPR);
        for hash in &positives {
            filter.insert(hash);
        }
        let request = GetGrapheneRecovery {
            block_hash: self.block_hash,
            filter,
            n_filter_positives: positives.len() as u64,
        };
        self.filter_positives = positives;
        self.recovery_tried = true;
        self.state = SessionState::AwaitingRecovery;
        SessionAction::RequestRecovery(request)
    }

    fn finish_reconciliation(
        &mut self,
        ids: Vec<u64>,
        snapshot: &[Hash256],
        set: GrapheneSet,
    ) -> Result<SessionAction, SessionError> {
        let wanted: HashSet<u64> = ids.iter().copied().collect();
        for hash in snapshot {
            let id = set.get_short_id(hash);
            if wanted.contains(&id) {
                self.id_to_hash.insert(id, *hash);
            }
        }
        for hash in self.extra_txs.keys() {
            self.id_to_hash.insert(set.get_short_id(hash), *hash);
        }

        let coinbase_present = self
            .extra_txs
            .iter()
            .filter(|(_, tx)| tx.is_coinbase())
            .any(|(hash, _)| wanted.contains(&set.get_short_id(hash)));
        if !coinbase_present {
            self.state = SessionState::Failed;
            return Err(SessionError::MissingCoinbase);
        }

        self.block_ids = ids;
        self.set = Some(set);
        self.missing = self
            .block_ids
            .iter()
            .filter(|id| !self.id_to_hash.contains_key(*id))
            .copied()
            .collect();
        if self.missing.is_empty() {
            self.state = SessionState::ReadyToReconstruct;
            Ok(SessionAction::Reconstruct)
        } else {
            log_debug!("graphene: {} txs missing, re-requesting", self.missing.len());
            self.state = SessionState::AwaitingMissing;
            Ok(SessionAction::RequestMissing(GetGrapheneTx {
                block_hash: self.block_hash,
                short_ids: self.missing.clone(),
            }))
        }
    }

    pub fn handle_missing_txs(&mut self, msg: GrapheneTx) -> Result<SessionAction, SessionError> {
        if self.state != SessionState::AwaitingMissing || msg.block_hash != self.block_hash {
            return Ok(SessionAction::Ignored);
        }
        if msg.txs.is_empty() {
            self.state = SessionState::Failed;
            return Err(SessionError::MalformedMessage("empty tx response"));
        }
        let set = match self.set.as_ref() {
            Some(set) => set,
            None => return Ok(self.fail()),
        };
        let mut supplied = HashMap::new();
        for tx in msg.txs {
            let hash = tx.txid();
            supplied.insert(set.get_short_id(&hash), (hash, tx));
        }
        self.missing.retain(|id| match supplied.remove(id) {
            Some((hash, tx)) => {
                self.id_to_hash.insert(*id, hash);
                self.extra_txs.insert(hash, tx);
                false
            }
            None => true,
        });
        if !supplied.is_empty() {
            self.state = SessionState::Failed;
            return Err(SessionError::MalformedMessage(
                "transactions that were never requested",
            ));
        }
        if !self.missing.is_empty() {
            log_warn!(
                "graphene: peer answered with {} txs still missing",
                self.missing.len()
            );
            return Ok(self.fail());
        }
        self.state = SessionState::ReadyToReconstruct;
        Ok(SessionAction::Reconstruct)
    }

    pub fn handle_recovery(&mut self, msg: GrapheneRecovery) -> Result<SessionAction, SessionError> {
        if self.state != SessionState::AwaitingRecovery || msg.block_hash != self.block_hash {
            return Ok(SessionAction::Ignored);
        }
        let set = match self.set.take() {
            Some(set) => set,
            None => return Ok(self.fail()),
        };

        for tx in msg.txs {
            self.extra_txs.insert(tx.txid(), tx);
        }

        let mut candidates: BTreeSet<u64> = BTreeSet::new();
        for hash in &self.filter_positives {
            let id = set.get_short_id(hash);
            self.id_to_hash.insert(id, *hash);
            candidates.insert(id);
        }
        for hash in self.extra_txs.keys() {
            let id = set.get_short_id(hash);
            self.id_to_hash.insert(id, *hash);
            candidates.insert(id);
        }

        let mut local = msg.revised_iblt.cloned_empty();
        for id in &candidates {
            local.insert(*id, &[]);
        }
        let diff = match msg.revised_iblt.subtract(&local) {
            Ok(diff) => diff,
            Err(err) => {
                log_warn!("graphene recovery: {err}");
                return Ok(self.fail());
            }
        };
        let (sender_has, receiver_has) = match diff.list_entries() {
            Ok(entries) => entries,
            Err(err) => {
                log_debug!("graphene recovery decode failed: {err}");
                return Ok(self.fail());
            }
        };
        for (id, _) in receiver_has {
            candidates.remove(&id);
        }
        for (id, _) in sender_has {
            candidates.insert(id);
        }
        if candidates.len() as u64 != self.n_block_txs {
            log_debug!(
                "graphene recovery resolved {} ids, wanted {}",
                candidates.len(),
                self.n_block_txs
            );
            return Ok(self.fail());
        }

        let ids: Vec<u64> = candidates.into_iter().collect();
        let snapshot: Vec<Hash256> = Vec::new();
        self.finish_reconciliation(ids, &snapshot, set)
    }

    /// Orders, verifies and resolves the block. Runs outside the snapshot
    /// lock scope; the caller re-locks the pools just for this call.
    pub fn try_reconstruct(
        &mut self,
        pools: &TxPools,
        config: &GrapheneConfig,
    ) -> Result<SessionAction, SessionError> {
        if self.state != SessionState::ReadyToReconstruct {
            return Ok(SessionAction::Ignored);
        }
        let header = match self.header.clone() {
            Some(header) => header,
            None => return Ok(self.fail()),
        };
        let set = match self.set.as_ref() {
            Some(set) => set,
            None => return Ok(self.fail()),
        };

        let mut hashes = Vec::with_capacity(self.block_ids.len());
        for id in &self.block_ids {
            match self.id_to_hash.get(id) {
                Some(hash) => hashes.push(*hash),
                None => return Ok(self.fail()),
            }
        }

        // Coinbase takes slot 0, located by short ID; the rest follows
        // canonical (ascending txid) order when negotiated, otherwise the
        // transmitted rank order is already in place.
        let coinbase_hash = self
            .extra_txs
            .iter()
            .find(|(_, tx)| tx.is_coinbase())
            .map(|(hash, _)| *hash);
        let coinbase_hash = match coinbase_hash {
            Some(hash) => hash,
            None => {
                self.state = SessionState::Failed;
                return Err(SessionError::MissingCoinbase);
            }
        };
        let coinbase_id = set.get_short_id(&coinbase_hash);
        match self
            .block_ids
            .iter()
            .position(|id| *id == coinbase_id)
        {
            Some(position) => hashes.swap(0, position),
            None => {
                self.state = SessionState::Failed;
                return Err(SessionError::MissingCoinbase);
            }
        }
        if self.caps.canonical_order && hashes.len() > 1 {
            hashes[1..].sort_unstable();
        }

        let (root, mutated) = merkle_root(&hashes);
        if mutated || root != header.merkle_root {
            log_debug!("graphene: merkle root mismatch after reconstruction");
            return Ok(self.fail());
        }

        let mut seen: HashSet<Hash256> = HashSet::with_capacity(hashes.len());
        let mut transactions = Vec::with_capacity(hashes.len());
        let mut unverified = Vec::new();
        let mut total_bytes = 0usize;
        for hash in &hashes {
            if !seen.insert(*hash) {
                self.state = SessionState::Failed;
                return Err(SessionError::DuplicateTransaction);
            }
            let (tx, verified) = if let Some(tx) = self.extra_txs.get(hash) {
                (tx.clone(), false)
            } else if let Some((tx, source)) = pools.lookup(hash) {
                (tx.clone(), source.is_verified())
            } else {
                log_debug!("graphene: tx vanished between snapshot and rebuild");
                return Ok(self.fail());
            };
            total_bytes += tx.serialized_size();
            if total_bytes > config.max_reconstructed_bytes {
                self.state = SessionState::Failed;
                return Err(SessionError::OversizeReconstruction);
            }
            if !verified {
                unverified.push(*hash);
            }
            transactions.push(tx);
        }

        self.state = SessionState::Delivered;
        Ok(SessionAction::Delivered(ReconstructedBlock {
            block: Block {
                header,
                transactions,
            },
            unverified,
        }))
    }
}

// ---------------------------------------------------------------------------
// Sender side
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq)]
pub enum SenderOutcome {
    Graphene(GrapheneBlockMsg),
    /// The summary would not be smaller than the raw block (or could not be
    /// built); send the block itself.
    FullBlock,
}

/// Builds the block summary for a `getgrblk` request, or signals that a full
/// block is cheaper.
pub fn build_graphene_block(
    block: &Block,
    receiver_info: &MemPoolInfo,
    own_pool_count: u64,
    caps: &RelayCapabilities,
    nonce: u64,
    seed: u64,
) -> SenderOutcome {
    let coinbase = match block.transactions.first() {
        Some(tx) if tx.is_coinbase() => tx.clone(),
        _ => return SenderOutcome::FullBlock,
    };
    let txids: Vec<Hash256> = block.transactions.iter().map(Transaction::txid).collect();
    let (k0, k1) = if caps.sip_short_ids {
        derive_sip_keys(&block.header, nonce)
    } else {
        (0, 0)
    };
    // Everything we might hold that the receiver could also hold: our pool
    // plus the block, minus the coinbase no pool ever has.
    let sender_universe = own_pool_count + txids.len() as u64 - 1;
    let params = GrapheneSetParams {
        version: caps.version,
        receiver_pool_size: receiver_info.n_tx,
        sender_universe_size: sender_universe,
        k0,
        k1,
        compute_optimized: caps.fast_filter,
        canonical_order: caps.canonical_order,
        seed,
    };
    let set = match GrapheneSet::new(&params, &txids) {
        Ok(set) => set,
        Err(err) => {
            log_warn!("graphene summary build failed, sending full block: {err}");
            return SenderOutcome::FullBlock;
        }
    };
    let fpr = set.fpr();
    let msg = GrapheneBlockMsg {
        header: block.header.clone(),
        nonce,
        n_block_txs: txids.len() as u64,
        additional_txs: vec![coinbase],
        set,
        fpr,
    };
    let mut encoder = Encoder::new();
    msg.encode_with_version(&mut encoder, caps.version);
    if encoder.len() >= block.serialized_size() {
        log_debug!(
            "graphene summary ({} bytes) not smaller than block, sending full block",
            encoder.len()
        );
        return SenderOutcome::FullBlock;
    }
    SenderOutcome::Graphene(msg)
}

/// Answers a `getgrblktx` re-request from the stored block.
pub fn answer_tx_request(
    block: &Block,
    request: &GetGrapheneTx,
    caps: &RelayCapabilities,
    k0: u64,
    k1: u64,
) -> GrapheneTx {
    let wanted: HashSet<u64> = request.short_ids.iter().copied().collect();
    let txs = block
        .transactions
        .iter()
        .filter(|tx| {
            wanted.contains(&bchu_graphene::short_id(k0, k1, &tx.txid(), caps.version))
        })
        .cloned()
        .collect();
    GrapheneTx {
        block_hash: request.block_hash,
        txs,
    }
}

/// Answers a recovery request: sends outright every block tx absent from the
/// receiver's positives filter, plus an IBLT over the whole block sized for
/// the revised difference estimate.
pub fn answer_recovery_request(
    block: &Block,
    request: &GetGrapheneRecovery,
    caps: &RelayCapabilities,
    k0: u64,
    k1: u64,
    sender_fpr: f64,
    seed: u64,
) -> GrapheneRecovery {
    let n_block = block.transactions.len() as u64;
    let expected_diff = upper_bound_false_positives(
        n_block,
        RECOVERY_FILTER_FPR,
        FAILURE_RECOVERY_SUCCESS_RATE,
    ) + upper_bound_false_positives(
        request.n_filter_positives,
        sender_fpr,
        FAILURE_RECOVERY_SUCCESS_RATE,
    );
    let mut revised_iblt = Iblt::new(
        caps.version,
        expected_diff.max(IBLT_CELL_MINIMUM),
        0,
        seed as u32,
        u32::MAX,
    );
    let mut txs = Vec::new();
    for tx in &block.transactions {
        let hash = tx.txid();
        revised_iblt.insert(bchu_graphene::short_id(k0, k1, &hash, caps.version), &[]);
        if !request.filter.contains(&hash) {
            txs.push(tx.clone());
        }
    }
    GrapheneRecovery {
        block_hash: request.block_hash,
        txs,
        revised_iblt,
    }
}

/// Serialized size of a tx batch, for the re-request statistics.
pub fn tx_batch_bytes(txs: &[Transaction]) -> u64 {
    txs.iter().map(|tx| encode(tx).len() as u64).sum()
}

pub fn default_max_reconstructed_bytes() -> usize {
    MAX_BLOCK_SIZE as usize
}
