//! Per-peer Graphene relay protocol loop.
//!
//! Frames are length-prefixed bitcoin-style messages. `PeerRelay` is the
//! synchronous core: it consumes one inbound frame at a time and yields the
//! frames to send back, so the whole protocol can be exercised in tests by
//! shuttling byte buffers between two instances. `run_peer` wraps it in the
//! async socket loop.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use bchu_consensus::{Hash256, BAN_SCORE_THRESHOLD, MAX_BLOCK_SIZE};
use bchu_log::{log_debug, log_info, log_trace, log_warn};
use bchu_primitives::{decode, encode, Block, BlockHeader, Decoder, Encoder};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};

use crate::mempool::TxPools;
use crate::messages::{
    GetGrapheneBlock, GetGrapheneRecovery, GetGrapheneTx, GrapheneBlockMsg, GrapheneRecovery,
    GrapheneTx, MSG_GET_GRAPHENE, MSG_GET_GRAPHENE_RECOVERY, MSG_GET_GRAPHENE_TX,
    MSG_GRAPHENE_BLOCK, MSG_GRAPHENE_RECOVERY, MSG_GRAPHENE_TX,
};
use crate::negotiation::{negotiate, RelayCapabilities, VersionOffer};
use crate::session::{
    answer_recovery_request, answer_tx_request, build_graphene_block, tx_batch_bytes,
    GrapheneSession, ReconstructedBlock, SenderOutcome, SessionAction, SessionError, Severity,
};
use crate::stats::GrapheneStats;
use crate::thinrelay::{ThinRelayManager, ThinType};
use crate::{GrapheneConfig, PeerId};

pub const MSG_XVERSION: &str = "xversion";
pub const MSG_BLOCK: &str = "block";

const FRAME_MAGIC: [u8; 4] = [0xe3, 0xe1, 0xf3, 0xe8];
const COMMAND_BYTES: usize = 12;
const MAX_FRAME_BYTES: u64 = MAX_BLOCK_SIZE + 10_000;
/// Serialized width of one empty IBLT cell, for the stats split.
const IBLT_WIRE_CELL_BYTES: u64 = 17;
const STATS_LOG_INTERVAL_SECS: u64 = 600;

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or(0)
}

/// Chain access the relay needs: stored blocks to serve, and tip context to
/// reject summaries for stale or unknown chains before doing any work.
pub trait ChainView: Send + Sync {
    fn block_by_hash(&self, hash: &Hash256) -> Option<Block>;
    /// Contextless header checks: proof of work against the claimed target
    /// and a sane timestamp. Runs before any reconciliation work.
    fn header_valid(&self, header: &BlockHeader) -> bool;
    fn extends_best_tip(&self, header: &BlockHeader) -> bool;
}

/// State shared by every peer loop on the node.
pub struct RelayShared {
    pub config: GrapheneConfig,
    pub pools: Mutex<TxPools>,
    pub manager: Mutex<ThinRelayManager>,
    pub stats: Mutex<GrapheneStats>,
}

impl RelayShared {
    pub fn new(config: GrapheneConfig) -> Self {
        Self {
            config,
            pools: Mutex::new(TxPools::new()),
            manager: Mutex::new(ThinRelayManager::new()),
            stats: Mutex::new(GrapheneStats::new()),
        }
    }
}

fn lock<'a, T>(mutex: &'a Mutex<T>, what: &str) -> Result<std::sync::MutexGuard<'a, T>, String> {
    mutex.lock().map_err(|_| format!("{what} lock poisoned"))
}

#[derive(Clone, Debug, PartialEq)]
pub struct OutboundFrame {
    pub command: &'static str,
    pub payload: Vec<u8>,
}

impl OutboundFrame {
    fn new(command: &'static str, payload: Vec<u8>) -> Self {
        Self { command, payload }
    }
}

struct SentSummary {
    nonce: u64,
    fpr: f64,
}

#[derive(Clone, Copy, Default)]
struct SummaryBytes {
    filter: u64,
    iblt: u64,
    rank: u64,
}

pub struct PeerRelay {
    peer: PeerId,
    caps: RelayCapabilities,
    /// At most one receive session may be open per peer; a new block is
    /// refused until the current one delivers, fails, or is cancelled.
    session: Option<GrapheneSession>,
    summary_bytes: Option<SummaryBytes>,
    sent: HashMap<Hash256, SentSummary>,
    misbehavior: u32,
    delivered: Vec<ReconstructedBlock>,
}

impl PeerRelay {
    pub fn new(peer: PeerId, caps: RelayCapabilities) -> Self {
        Self {
            peer,
            caps,
            session: None,
            summary_bytes: None,
            sent: HashMap::new(),
            misbehavior: 0,
            delivered: Vec::new(),
        }
    }

    pub fn peer(&self) -> PeerId {
        self.peer
    }

    pub fn caps(&self) -> &RelayCapabilities {
        &self.caps
    }

    pub fn misbehavior(&self) -> u32 {
        self.misbehavior
    }

    /// Blocks reconstructed since the last call.
    pub fn take_delivered(&mut self) -> Vec<ReconstructedBlock> {
        std::mem::take(&mut self.delivered)
    }

    /// Kicks off a Graphene request for `block_hash` unless another thin
    /// request for it is already in flight with this peer.
    pub fn request_block(
        &mut self,
        shared: &RelayShared,
        block_hash: Hash256,
    ) -> Result<Option<OutboundFrame>, String> {
        if !shared.config.enabled {
            return Ok(None);
        }
        if self.session.as_ref().is_some_and(|s| !s.is_finished()) {
            return Ok(None);
        }
        {
            let mut manager = lock(&shared.manager, "thin relay")?;
            if !manager.try_start(self.peer, block_hash, ThinType::Graphene) {
                return Ok(None);
            }
        }
        let pool_count = lock(&shared.pools, "tx pools")?.candidate_count();
        let (session, request) = GrapheneSession::request(block_hash, self.caps, pool_count);
        self.session = Some(session);
        Ok(Some(OutboundFrame::new(MSG_GET_GRAPHENE, encode(&request))))
    }

    /// Called when the node's best tip advances: a pending session for a
    /// block that no longer extends the tip is cancelled and its request
    /// slot freed.
    pub fn handle_tip_advance(
        &mut self,
        shared: &RelayShared,
        chain: &dyn ChainView,
    ) -> Result<(), String> {
        let stale = match &self.session {
            Some(session) if !session.is_finished() => session
                .header()
                .map(|header| !chain.extends_best_tip(header))
                .unwrap_or(false),
            _ => false,
        };
        if !stale {
            return Ok(());
        }
        if let Some(mut session) = self.session.take() {
            session.cancel();
            self.summary_bytes = None;
            lock(&shared.manager, "thin relay")?.clear(self.peer, session.block_hash());
            log_debug!("abandoned graphene session for a block behind the tip");
        }
        Ok(())
    }

    fn penalize(&mut self, severity: Severity) -> Result<(), String> {
        match severity {
            Severity::Recoverable => Ok(()),
            Severity::Misbehavior(score) => {
                self.misbehavior += score;
                if self.misbehavior >= BAN_SCORE_THRESHOLD {
                    Err(format!(
                        "peer {} banned at misbehavior score {}",
                        self.peer, self.misbehavior
                    ))
                } else {
                    Ok(())
                }
            }
            Severity::Disconnect => Err(format!("disconnecting peer {}", self.peer)),
        }
    }

    fn failover(&mut self, shared: &RelayShared, block_hash: &Hash256) -> Result<(), String> {
        if self.session.as_ref().is_some_and(|s| s.block_hash() == block_hash) {
            self.session = None;
            self.summary_bytes = None;
        }
        let mut manager = lock(&shared.manager, "thin relay")?;
        if let Some(next) = manager
            .clear(self.peer, block_hash)
            .and_then(ThinType::failover)
        {
            log_info!("graphene relay failed, next thin type {next:?}");
        }
        Ok(())
    }

    fn session_failure(
        &mut self,
        err: SessionError,
        block_hash: &Hash256,
        shared: &RelayShared,
    ) -> Result<(), String> {
        log_warn!("graphene session error from peer {}: {err}", self.peer);
        let severity = err.severity();
        self.failover(shared, block_hash)?;
        self.penalize(severity)
    }

    fn apply_action(
        &mut self,
        mut action: SessionAction,
        block_hash: Hash256,
        shared: &RelayShared,
    ) -> Result<Vec<OutboundFrame>, String> {
        loop {
            match action {
                SessionAction::Ignored => return Ok(Vec::new()),
                SessionAction::RequestMissing(request) => {
                    return Ok(vec![OutboundFrame::new(
                        MSG_GET_GRAPHENE_TX,
                        encode(&request),
                    )]);
                }
                SessionAction::RequestRecovery(request) => {
                    lock(&shared.stats, "stats")?.note_decode_failure();
                    return Ok(vec![OutboundFrame::new(
                        MSG_GET_GRAPHENE_RECOVERY,
                        encode(&request),
                    )]);
                }
                SessionAction::Failover => {
                    self.failover(shared, &block_hash)?;
                    return Ok(Vec::new());
                }
                SessionAction::FailedDecode => {
                    lock(&shared.stats, "stats")?.note_decode_failure();
                    self.failover(shared, &block_hash)?;
                    return Ok(Vec::new());
                }
                SessionAction::Reconstruct => {
                    let result = {
                        let pools = lock(&shared.pools, "tx pools")?;
                        let session = match self
                            .session
                            .as_mut()
                            .filter(|s| s.block_hash() == &block_hash)
                        {
                            Some(session) => session,
                            None => return Ok(Vec::new()),
                        };
                        session.try_reconstruct(&pools, &shared.config)
                    };
                    match result {
                        Ok(next) => action = next,
                        Err(err) => {
                            self.session_failure(err, &block_hash, shared)?;
                            return Ok(Vec::new());
                        }
                    }
                }
                SessionAction::Delivered(block) => {
                    let summary = self.summary_bytes.take().unwrap_or_default();
                    {
                        let mut stats = lock(&shared.stats, "stats")?;
                        stats.note_block_received(
                            unix_now(),
                            summary.filter,
                            summary.iblt,
                            summary.rank,
                            block.block.serialized_size() as u64,
                        );
                    }
                    self.session = None;
                    lock(&shared.manager, "thin relay")?.clear(self.peer, &block_hash);
                    log_info!(
                        "graphene block reconstructed: {} txs, {} unverified",
                        block.block.transactions.len(),
                        block.unverified.len()
                    );
                    self.delivered.push(block);
                    return Ok(Vec::new());
                }
            }
        }
    }

    /// Consumes one inbound frame and yields the frames to send back.
    /// `Err` means the connection must be dropped.
    pub fn handle_frame(
        &mut self,
        command: &str,
        payload: &[u8],
        shared: &RelayShared,
        chain: &dyn ChainView,
    ) -> Result<Vec<OutboundFrame>, String> {
        match command {
            MSG_GET_GRAPHENE => self.on_get_graphene(payload, shared, chain),
            MSG_GRAPHENE_BLOCK => self.on_graphene_block(payload, shared, chain),
            MSG_GET_GRAPHENE_TX => self.on_get_graphene_tx(payload, chain),
            MSG_GRAPHENE_TX => self.on_graphene_tx(payload, shared),
            MSG_GET_GRAPHENE_RECOVERY => self.on_get_recovery(payload, chain),
            MSG_GRAPHENE_RECOVERY => self.on_recovery(payload, shared),
            other => {
                log_trace!("ignoring {other} frame from peer {}", self.peer);
                Ok(Vec::new())
            }
        }
    }

    fn on_get_graphene(
        &mut self,
        payload: &[u8],
        shared: &RelayShared,
        chain: &dyn ChainView,
    ) -> Result<Vec<OutboundFrame>, String> {
        let request: GetGrapheneBlock = match decode(payload) {
            Ok(request) => request,
            Err(err) => {
                log_warn!("malformed getgrblk from peer {}: {err}", self.peer);
                self.penalize(Severity::Misbehavior(100))?;
                return Ok(Vec::new());
            }
        };
        let block = match chain.block_by_hash(&request.block_hash) {
            Some(block) => block,
            None => {
                log_debug!("peer {} requested unknown block", self.peer);
                return Ok(Vec::new());
            }
        };
        let own_pool_count = lock(&shared.pools, "tx pools")?.candidate_count();
        let nonce = rand::random();
        let seed = rand::random();
        match build_graphene_block(
            &block,
            &request.mempool_info,
            own_pool_count,
            &self.caps,
            nonce,
            seed,
        ) {
            SenderOutcome::Graphene(msg) => {
                self.sent.insert(
                    request.block_hash,
                    SentSummary {
                        nonce: msg.nonce,
                        fpr: msg.fpr,
                    },
                );
                lock(&shared.stats, "stats")?.note_block_sent(unix_now());
                let mut encoder = Encoder::new();
                msg.encode_with_version(&mut encoder, self.caps.version);
                Ok(vec![OutboundFrame::new(
                    MSG_GRAPHENE_BLOCK,
                    encoder.into_inner(),
                )])
            }
            SenderOutcome::FullBlock => {
                Ok(vec![OutboundFrame::new(MSG_BLOCK, encode(&block))])
            }
        }
    }

    fn on_graphene_block(
        &mut self,
        payload: &[u8],
        shared: &RelayShared,
        chain: &dyn ChainView,
    ) -> Result<Vec<OutboundFrame>, String> {
        let mut decoder = Decoder::new(payload);
        let msg = match GrapheneBlockMsg::decode_with_version(&mut decoder, self.caps.version) {
            Ok(msg) => msg,
            Err(err) => {
                log_warn!("malformed grblk from peer {}: {err}", self.peer);
                self.penalize(Severity::Misbehavior(100))?;
                return Ok(Vec::new());
            }
        };
        let block_hash = msg.header.hash();

        if !chain.header_valid(&msg.header) {
            log_warn!("invalid block header in summary from peer {}", self.peer);
            self.failover(shared, &block_hash)?;
            self.penalize(Severity::Misbehavior(100))?;
            return Ok(Vec::new());
        }

        let have_session = self
            .session
            .as_ref()
            .is_some_and(|s| s.block_hash() == &block_hash && !s.is_finished());
        if !have_session {
            let expedited = lock(&shared.manager, "thin relay")?.is_expedited(self.peer);
            if !expedited {
                self.penalize(SessionError::Unsolicited.severity())?;
                return Ok(Vec::new());
            }
            if self.session.as_ref().is_some_and(|s| !s.is_finished()) {
                log_debug!("expedited summary while a session is open, dropping");
                return Ok(Vec::new());
            }
            if !lock(&shared.manager, "thin relay")?.try_start(
                self.peer,
                block_hash,
                ThinType::Graphene,
            ) {
                return Ok(Vec::new());
            }
            let pool_count = lock(&shared.pools, "tx pools")?.candidate_count();
            let (session, _) = GrapheneSession::request(block_hash, self.caps, pool_count);
            self.session = Some(session);
        }

        if !chain.extends_best_tip(&msg.header) {
            log_debug!("graphene summary does not extend the best tip, failing over");
            self.failover(shared, &block_hash)?;
            return Ok(Vec::new());
        }

        self.summary_bytes = Some(SummaryBytes {
            filter: msg.set.filter_size_bytes() as u64,
            iblt: msg.set.iblt_cells() as u64 * IBLT_WIRE_CELL_BYTES,
            rank: msg.set.rank_size_bytes() as u64,
        });

        let result = {
            let pools = lock(&shared.pools, "tx pools")?;
            let session = match self
                .session
                .as_mut()
                .filter(|s| s.block_hash() == &block_hash)
            {
                Some(session) => session,
                None => return Ok(Vec::new()),
            };
            session.handle_summary(msg, &pools)
        };
        match result {
            Ok(action) => self.apply_action(action, block_hash, shared),
            Err(err) => {
                self.session_failure(err, &block_hash, shared)?;
                Ok(Vec::new())
            }
        }
    }

    fn on_get_graphene_tx(
        &mut self,
        payload: &[u8],
        chain: &dyn ChainView,
    ) -> Result<Vec<OutboundFrame>, String> {
        let request: GetGrapheneTx = match decode(payload) {
            Ok(request) => request,
            Err(err) => {
                log_warn!("malformed getgrblktx from peer {}: {err}", self.peer);
                self.penalize(Severity::Misbehavior(100))?;
                return Ok(Vec::new());
            }
        };
        let sent = match self.sent.get(&request.block_hash) {
            Some(sent) => sent,
            None => {
                self.penalize(SessionError::Unsolicited.severity())?;
                return Ok(Vec::new());
            }
        };
        let block = match chain.block_by_hash(&request.block_hash) {
            Some(block) => block,
            None => return Ok(Vec::new()),
        };
        let (k0, k1) = if self.caps.sip_short_ids {
            bchu_graphene::derive_sip_keys(&block.header, sent.nonce)
        } else {
            (0, 0)
        };
        let response = answer_tx_request(&block, &request, &self.caps, k0, k1);
        Ok(vec![OutboundFrame::new(MSG_GRAPHENE_TX, encode(&response))])
    }

    fn on_graphene_tx(
        &mut self,
        payload: &[u8],
        shared: &RelayShared,
    ) -> Result<Vec<OutboundFrame>, String> {
        let msg: GrapheneTx = match decode(payload) {
            Ok(msg) => msg,
            Err(err) => {
                log_warn!("malformed grblktx from peer {}: {err}", self.peer);
                self.penalize(Severity::Misbehavior(100))?;
                return Ok(Vec::new());
            }
        };
        let block_hash = msg.block_hash;
        let session = match self
            .session
            .as_mut()
            .filter(|s| s.block_hash() == &block_hash)
        {
            Some(session) => session,
            None => {
                self.penalize(SessionError::Unsolicited.severity())?;
                return Ok(Vec::new());
            }
        };
        lock(&shared.stats, "stats")?.note_rerequest(unix_now(), tx_batch_bytes(&msg.txs));
        match session.handle_missing_txs(msg) {
            Ok(action) => self.apply_action(action, block_hash, shared),
            Err(err) => {
                self.session_failure(err, &block_hash, shared)?;
                Ok(Vec::new())
            }
        }
    }

    fn on_get_recovery(
        &mut self,
        payload: &[u8],
        chain: &dyn ChainView,
    ) -> Result<Vec<OutboundFrame>, String> {
        let request: GetGrapheneRecovery = match decode(payload) {
            Ok(request) => request,
            Err(err) => {
                log_warn!("malformed getgrrec from peer {}: {err}", self.peer);
                self.penalize(Severity::Misbehavior(100))?;
                return Ok(Vec::new());
            }
        };
        let sent = match self.sent.get(&request.block_hash) {
            Some(sent) if self.caps.supports_recovery => sent,
            _ => {
                self.penalize(SessionError::Unsolicited.severity())?;
                return Ok(Vec::new());
            }
        };
        let block = match chain.block_by_hash(&request.block_hash) {
            Some(block) => block,
            None => return Ok(Vec::new()),
        };
        let (k0, k1) = if self.caps.sip_short_ids {
            bchu_graphene::derive_sip_keys(&block.header, sent.nonce)
        } else {
            (0, 0)
        };
        let response = answer_recovery_request(
            &block,
            &request,
            &self.caps,
            k0,
            k1,
            sent.fpr,
            rand::random(),
        );
        Ok(vec![OutboundFrame::new(
            MSG_GRAPHENE_RECOVERY,
            encode(&response),
        )])
    }

    fn on_recovery(
        &mut self,
        payload: &[u8],
        shared: &RelayShared,
    ) -> Result<Vec<OutboundFrame>, String> {
        let msg: GrapheneRecovery = match decode(payload) {
            Ok(msg) => msg,
            Err(err) => {
                log_warn!("malformed grrec from peer {}: {err}", self.peer);
                self.penalize(Severity::Misbehavior(100))?;
                return Ok(Vec::new());
            }
        };
        let block_hash = msg.block_hash;
        let session = match self
            .session
            .as_mut()
            .filter(|s| s.block_hash() == &block_hash)
        {
            Some(session) => session,
            None => {
                self.penalize(SessionError::Unsolicited.severity())?;
                return Ok(Vec::new());
            }
        };
        match session.handle_recovery(msg) {
            Ok(action) => self.apply_action(action, block_hash, shared),
            Err(err) => {
                self.session_failure(err, &block_hash, shared)?;
                Ok(Vec::new())
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Wire framing and the async loop
// ---------------------------------------------------------------------------

pub async fn write_frame<S>(stream: &mut S, command: &str, payload: &[u8]) -> Result<(), String>
where
    S: AsyncWrite + Unpin,
{
    let mut header = [0u8; 4 + COMMAND_BYTES + 4];
    header[..4].copy_from_slice(&FRAME_MAGIC);
    header[4..4 + command.len().min(COMMAND_BYTES)]
        .copy_from_slice(&command.as_bytes()[..command.len().min(COMMAND_BYTES)]);
    header[4 + COMMAND_BYTES..].copy_from_slice(&(payload.len() as u32).to_le_bytes());
    stream
        .write_all(&header)
        .await
        .map_err(|err| format!("frame write failed: {err}"))?;
    stream
        .write_all(payload)
        .await
        .map_err(|err| format!("frame write failed: {err}"))
}

pub async fn read_frame<S>(stream: &mut S) -> Result<(String, Vec<u8>), String>
where
    S: AsyncRead + Unpin,
{
    let mut header = [0u8; 4 + COMMAND_BYTES + 4];
    stream
        .read_exact(&mut header)
        .await
        .map_err(|err| format!("frame read failed: {err}"))?;
    if header[..4] != FRAME_MAGIC {
        return Err("bad frame magic".to_string());
    }
    let command_end = header[4..4 + COMMAND_BYTES]
        .iter()
        .position(|byte| *byte == 0)
        .map(|end| 4 + end)
        .unwrap_or(4 + COMMAND_BYTES);
    let command = std::str::from_utf8(&header[4..command_end])
        .map_err(|_| "non-ascii frame command".to_string())?
        .to_string();
    let mut length = [0u8; 4];
    length.copy_from_slice(&header[4 + COMMAND_BYTES..]);
    let length = u32::from_le_bytes(length) as u64;
    if length > MAX_FRAME_BYTES {
        return Err(format!("oversize frame: {length} bytes"));
    }
    let mut payload = vec![0u8; length as usize];
    stream
        .read_exact(&mut payload)
        .await
        .map_err(|err| format!("frame read failed: {err}"))?;
    Ok((command, payload))
}

pub fn encode_xversion(offer: &VersionOffer) -> Vec<u8> {
    let map = offer.to_xversion_map();
    let mut encoder = Encoder::new();
    encoder.write_varint(map.len() as u64);
    for (key, value) in map {
        encoder.write_u64_le(key);
        encoder.write_u64_le(value);
    }
    encoder.into_inner()
}

pub fn decode_xversion(payload: &[u8]) -> Result<VersionOffer, String> {
    let mut decoder = Decoder::new(payload);
    let count = decoder
        .read_varint()
        .map_err(|err| format!("bad xversion: {err}"))?;
    if count > 64 {
        return Err("oversized xversion map".to_string());
    }
    let mut map = std::collections::BTreeMap::new();
    for _ in 0..count {
        let key = decoder
            .read_u64_le()
            .map_err(|err| format!("bad xversion: {err}"))?;
        let value = decoder
            .read_u64_le()
            .map_err(|err| format!("bad xversion: {err}"))?;
        map.insert(key, value);
    }
    Ok(VersionOffer::from_xversion_map(&map))
}

async fn handshake<S>(
    stream: &mut S,
    local_offer: &VersionOffer,
) -> Result<RelayCapabilities, String>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    write_frame(stream, MSG_XVERSION, &encode_xversion(local_offer)).await?;
    let (command, payload) = read_frame(stream).await?;
    if command != MSG_XVERSION {
        return Err(format!("expected xversion, got {command}"));
    }
    let theirs = decode_xversion(&payload)?;
    negotiate(local_offer, &theirs).map_err(|err| format!("negotiation failed: {err}"))
}

/// Runs one peer connection to completion: handshake, then frames until the
/// peer hangs up, misbehaves, or shutdown is signalled.
pub async fn run_peer<S>(
    mut stream: S,
    peer: PeerId,
    shared: Arc<RelayShared>,
    chain: Arc<dyn ChainView>,
    local_offer: VersionOffer,
    delivered: mpsc::UnboundedSender<ReconstructedBlock>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), String>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let caps = handshake(&mut stream, &local_offer).await?;
    log_debug!("peer {peer} negotiated graphene version {}", caps.version);
    let mut relay = PeerRelay::new(peer, caps);

    let result = loop {
        tokio::select! {
            frame = read_frame(&mut stream) => {
                let (command, payload) = match frame {
                    Ok(frame) => frame,
                    Err(err) => break Err(err),
                };
                match relay.handle_frame(&command, &payload, &shared, chain.as_ref()) {
                    Ok(outgoing) => {
                        let mut write_error = None;
                        for frame in outgoing {
                            if let Err(err) =
                                write_frame(&mut stream, frame.command, &frame.payload).await
                            {
                                write_error = Some(err);
                                break;
                            }
                        }
                        if let Some(err) = write_error {
                            break Err(err);
                        }
                        for block in relay.take_delivered() {
                            // A closed channel just means the node is shutting
                            // down; nothing to report.
                            let _ = delivered.send(block);
                        }
                    }
                    Err(err) => break Err(err),
                }
            }
            _ = shutdown.changed() => break Ok(()),
        }
    };

    if let Ok(mut manager) = shared.manager.lock() {
        manager.clear_peer(peer);
        manager.remove_expedited(peer);
    }
    result
}

/// Accept loop with periodic stats logging; stops on ctrl-c.
pub async fn serve(
    listener: TcpListener,
    shared: Arc<RelayShared>,
    chain: Arc<dyn ChainView>,
    local_offer: VersionOffer,
    delivered: mpsc::UnboundedSender<ReconstructedBlock>,
) -> Result<(), String> {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut stats_interval =
        tokio::time::interval(std::time::Duration::from_secs(STATS_LOG_INTERVAL_SECS));
    stats_interval.tick().await;
    let mut next_peer: PeerId = 0;

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, addr) = accepted.map_err(|err| format!("accept failed: {err}"))?;
                let peer = next_peer;
                next_peer += 1;
                log_info!("peer {peer} connected from {addr}");
                let shared = Arc::clone(&shared);
                let chain = Arc::clone(&chain);
                let offer = local_offer;
                let delivered = delivered.clone();
                let shutdown = shutdown_rx.clone();
                tokio::spawn(async move {
                    if let Err(err) =
                        run_peer(stream, peer, shared, chain, offer, delivered, shutdown).await
                    {
                        log_warn!("peer {peer} dropped: {err}");
                    }
                });
            }
            _ = stats_interval.tick() => {
                let snapshot = lock(&shared.stats, "stats")?.snapshot(unix_now());
                match serde_json::to_string(&snapshot) {
                    Ok(json) => log_info!("graphene stats: {json}"),
                    Err(err) => log_warn!("stats serialization failed: {err}"),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                log_info!("shutdown requested");
                let _ = shutdown_tx.send(true);
                break;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::negotiation::FilterSupport;

    #[test]
    fn xversion_round_trip() {
        let offer = VersionOffer {
            max_version: 5,
            filter_support: FilterSupport::Regular,
        };
        let decoded = decode_xversion(&encode_xversion(&offer)).unwrap();
        assert_eq!(decoded, offer);
    }

    #[tokio::test]
    async fn frame_round_trip() {
        let (mut a, mut b) = tokio::io::duplex(1 << 16);
        write_frame(&mut a, MSG_GET_GRAPHENE, &[1, 2, 3]).await.unwrap();
        let (command, payload) = read_frame(&mut b).await.unwrap();
        assert_eq!(command, MSG_GET_GRAPHENE);
        assert_eq!(payload, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn handshake_negotiates_over_duplex() {
        let (mut a, mut b) = tokio::io::duplex(1 << 16);
        let ours = VersionOffer::default();
        let theirs = VersionOffer {
            max_version: 4,
            filter_support: FilterSupport::Either,
        };
        let (left, right) = tokio::join!(handshake(&mut a, &ours), handshake(&mut b, &theirs));
        let left = left.unwrap();
        let right = right.unwrap();
        assert_eq!(left.version, 4);
        assert_eq!(left, right);
    }
}
