//! Graphene wire messages.
//!
//! Field layout is versioned by the negotiated Graphene version, which the
//! session supplies at decode time; the payloads themselves never carry it.

use bchu_consensus::{Hash256, MAX_BLOCK_SIZE, MIN_TX_SIZE};
use bchu_graphene::{FastFilter, GrapheneSet, Iblt};
use bchu_primitives::{
    Decodable, DecodeError, Decoder, Encodable, Encoder, BlockHeader, Transaction,
};

pub const MSG_GET_GRAPHENE: &str = "getgrblk";
pub const MSG_GRAPHENE_BLOCK: &str = "grblk";
pub const MSG_GET_GRAPHENE_TX: &str = "getgrblktx";
pub const MSG_GRAPHENE_TX: &str = "grblktx";
pub const MSG_GET_GRAPHENE_RECOVERY: &str = "getgrrec";
pub const MSG_GRAPHENE_RECOVERY: &str = "grrec";

const MAX_ADDITIONAL_TXS: u64 = 10_000;
const MAX_REQUESTED_IDS: u64 = MAX_BLOCK_SIZE as u64 / MIN_TX_SIZE as u64;

fn read_tx_vec(decoder: &mut Decoder, bound: u64) -> Result<Vec<Transaction>, DecodeError> {
    let count = decoder.read_varint()?;
    if count > bound {
        return Err(DecodeError::InvalidData("transaction count out of range"));
    }
    let mut txs = Vec::with_capacity(count as usize);
    for _ in 0..count {
        txs.push(Transaction::consensus_decode(decoder)?);
    }
    Ok(txs)
}

fn write_tx_vec(encoder: &mut Encoder, txs: &[Transaction]) {
    encoder.write_varint(txs.len() as u64);
    for tx in txs {
        tx.consensus_encode(encoder);
    }
}

/// Receiver pool summary sent along with a Graphene request so the sender can
/// size the summary. Counts the mempool, orphan pool and commit queue, plus
/// one for the coinbase the receiver can never have.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MemPoolInfo {
    pub n_tx: u64,
}

impl Encodable for MemPoolInfo {
    fn consensus_encode(&self, encoder: &mut Encoder) {
        encoder.write_u64_le(self.n_tx);
    }
}

impl Decodable for MemPoolInfo {
    fn consensus_decode(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        Ok(Self {
            n_tx: decoder.read_u64_le()?,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GetGrapheneBlock {
    pub block_hash: Hash256,
    pub mempool_info: MemPoolInfo,
}

impl Encodable for GetGrapheneBlock {
    fn consensus_encode(&self, encoder: &mut Encoder) {
        encoder.write_hash_le(&self.block_hash);
        self.mempool_info.consensus_encode(encoder);
    }
}

impl Decodable for GetGrapheneBlock {
    fn consensus_decode(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        Ok(Self {
            block_hash: decoder.read_hash_le()?,
            mempool_info: MemPoolInfo::consensus_decode(decoder)?,
        })
    }
}

/// The block summary. The SipHash key pair is not transmitted; both sides
/// derive it from the header and the nonce.
#[derive(Clone, Debug, PartialEq)]
pub struct GrapheneBlockMsg {
    pub header: BlockHeader,
    pub nonce: u64,
    pub n_block_txs: u64,
    pub additional_txs: Vec<Transaction>,
    pub set: GrapheneSet,
    pub fpr: f64,
}

impl GrapheneBlockMsg {
    pub fn encode_with_version(&self, encoder: &mut Encoder, version: u64) {
        self.header.consensus_encode(encoder);
        if version >= 2 {
            encoder.write_u64_le(self.nonce);
        }
        encoder.write_varint(self.n_block_txs);
        write_tx_vec(encoder, &self.additional_txs);
        self.set.encode_into(encoder);
        if version >= 6 {
            encoder.write_f64_le(self.fpr);
        }
    }

    pub fn decode_with_version(
        decoder: &mut Decoder,
        version: u64,
    ) -> Result<Self, DecodeError> {
        let header = BlockHeader::consensus_decode(decoder)?;
        let nonce = if version >= 2 { decoder.read_u64_le()? } else { 0 };
        let n_block_txs = decoder.read_varint()?;
        if n_block_txs == 0 || n_block_txs > MAX_BLOCK_SIZE as u64 / MIN_TX_SIZE as u64 {
            return Err(DecodeError::InvalidData("block tx count out of range"));
        }
        let additional_txs = read_tx_vec(decoder, MAX_ADDITIONAL_TXS)?;
        let set = GrapheneSet::decode_from(decoder, version)?;
        if set.n_items() != n_block_txs {
            return Err(DecodeError::InvalidData("summary size disagrees with count"));
        }
        let fpr = if version >= 6 {
            let fpr = decoder.read_f64_le()?;
            if !(0.0..=1.0).contains(&fpr) {
                return Err(DecodeError::InvalidData("fpr outside unit interval"));
            }
            fpr
        } else {
            0.0
        };
        Ok(Self {
            header,
            nonce,
            n_block_txs,
            additional_txs,
            set,
            fpr,
        })
    }
}

/// Re-request for transactions the receiver could not source locally,
/// identified by short ID.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GetGrapheneTx {
    pub block_hash: Hash256,
    pub short_ids: Vec<u64>,
}

impl Encodable for GetGrapheneTx {
    fn consensus_encode(&self, encoder: &mut Encoder) {
        encoder.write_hash_le(&self.block_hash);
        encoder.write_varint(self.short_ids.len() as u64);
        for id in &self.short_ids {
            encoder.write_u64_le(*id);
        }
    }
}

impl Decodable for GetGrapheneTx {
    fn consensus_decode(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        let block_hash = decoder.read_hash_le()?;
        let count = decoder.read_varint()?;
        if count == 0 || count > MAX_REQUESTED_IDS {
            return Err(DecodeError::InvalidData("short id count out of range"));
        }
        let mut short_ids = Vec::with_capacity(count as usize);
        for _ in 0..count {
            short_ids.push(decoder.read_u64_le()?);
        }
        Ok(Self {
            block_hash,
            short_ids,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GrapheneTx {
    pub block_hash: Hash256,
    pub txs: Vec<Transaction>,
}

impl Encodable for GrapheneTx {
    fn consensus_encode(&self, encoder: &mut Encoder) {
        encoder.write_hash_le(&self.block_hash);
        write_tx_vec(encoder, &self.txs);
    }
}

impl Decodable for GrapheneTx {
    fn consensus_decode(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        Ok(Self {
            block_hash: decoder.read_hash_le()?,
            txs: read_tx_vec(decoder, MAX_REQUESTED_IDS)?,
        })
    }
}

/// First half of the failure recovery round: the receiver sends a compact
/// summary of the hashes that passed the sender's filter.
#[derive(Clone, Debug, PartialEq)]
pub struct GetGrapheneRecovery {
    pub block_hash: Hash256,
    pub filter: FastFilter,
    pub n_filter_positives: u64,
}

impl Encodable for GetGrapheneRecovery {
    fn consensus_encode(&self, encoder: &mut Encoder) {
        encoder.write_hash_le(&self.block_hash);
        self.filter.consensus_encode(encoder);
        encoder.write_varint(self.n_filter_positives);
    }
}

impl Decodable for GetGrapheneRecovery {
    fn consensus_decode(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        Ok(Self {
            block_hash: decoder.read_hash_le()?,
            filter: FastFilter::consensus_decode(decoder)?,
            n_filter_positives: decoder.read_varint()?,
        })
    }
}

/// Second half: transactions the receiver definitely lacks, plus an IBLT over
/// the whole block sized for the revised difference estimate.
#[derive(Clone, Debug, PartialEq)]
pub struct GrapheneRecovery {
    pub block_hash: Hash256,
    pub txs: Vec<Transaction>,
    pub revised_iblt: Iblt,
}

impl Encodable for GrapheneRecovery {
    fn consensus_encode(&self, encoder: &mut Encoder) {
        encoder.write_hash_le(&self.block_hash);
        write_tx_vec(encoder, &self.txs);
        self.revised_iblt.consensus_encode(encoder);
    }
}

impl Decodable for GrapheneRecovery {
    fn consensus_decode(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        Ok(Self {
            block_hash: decoder.read_hash_le()?,
            txs: read_tx_vec(decoder, MAX_REQUESTED_IDS)?,
            revised_iblt: Iblt::consensus_decode(decoder)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bchu_graphene::GrapheneSetParams;
    use bchu_primitives::{decode, encode};

    fn txid(i: u32) -> Hash256 {
        bchu_primitives::sha256d(&i.to_le_bytes())
    }

    fn sample_header() -> BlockHeader {
        BlockHeader {
            version: 4,
            prev_block: [3u8; 32],
            merkle_root: [4u8; 32],
            time: 1_700_000_000,
            bits: 0x207f_ffff,
            nonce: 9,
        }
    }

    #[test]
    fn get_graphene_round_trip() {
        let msg = GetGrapheneBlock {
            block_hash: txid(1),
            mempool_info: MemPoolInfo { n_tx: 501 },
        };
        let decoded: GetGrapheneBlock = decode(&encode(&msg)).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn graphene_block_round_trip_latest_version() {
        let block: Vec<Hash256> = (0..12).map(txid).collect();
        let set = GrapheneSet::new(
            &GrapheneSetParams {
                version: 6,
                receiver_pool_size: 20,
                sender_universe_size: 20,
                k0: 5,
                k1: 6,
                compute_optimized: false,
                canonical_order: true,
                seed: 42,
            },
            &block,
        )
        .unwrap();
        let msg = GrapheneBlockMsg {
            header: sample_header(),
            nonce: 777,
            n_block_txs: 12,
            additional_txs: Vec::new(),
            set: set.clone(),
            fpr: set.fpr(),
        };
        let mut encoder = Encoder::new();
        msg.encode_with_version(&mut encoder, 6);
        let bytes = encoder.into_inner();
        let mut decoder = Decoder::new(&bytes);
        let decoded = GrapheneBlockMsg::decode_with_version(&mut decoder, 6).unwrap();
        assert!(decoder.is_empty());
        assert_eq!(decoded.nonce, 777);
        assert_eq!(decoded.n_block_txs, 12);
        assert_eq!(decoded.fpr, set.fpr());
    }

    #[test]
    fn legacy_version_omits_nonce_and_fpr() {
        let block: Vec<Hash256> = (0..4).map(txid).collect();
        let set = GrapheneSet::new(
            &GrapheneSetParams {
                version: 1,
                receiver_pool_size: 10,
                sender_universe_size: 10,
                k0: 0,
                k1: 0,
                compute_optimized: false,
                canonical_order: true,
                seed: 42,
            },
            &block,
        )
        .unwrap();
        let msg = GrapheneBlockMsg {
            header: sample_header(),
            nonce: 0,
            n_block_txs: 4,
            additional_txs: Vec::new(),
            set,
            fpr: 0.0,
        };
        let mut with_v1 = Encoder::new();
        msg.encode_with_version(&mut with_v1, 1);
        let mut with_v6 = Encoder::new();
        msg.encode_with_version(&mut with_v6, 6);
        assert_eq!(with_v6.len(), with_v1.len() + 8 + 8);

        let bytes = with_v1.into_inner();
        let mut decoder = Decoder::new(&bytes);
        let decoded = GrapheneBlockMsg::decode_with_version(&mut decoder, 1).unwrap();
        assert!(decoder.is_empty());
        assert_eq!(decoded.nonce, 0);
    }

    #[test]
    fn tx_request_round_trip() {
        let msg = GetGrapheneTx {
            block_hash: txid(7),
            short_ids: vec![1, 99, 0xffff_ffff_ffff],
        };
        let decoded: GetGrapheneTx = decode(&encode(&msg)).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn empty_tx_request_is_rejected() {
        let msg = GetGrapheneTx {
            block_hash: txid(7),
            short_ids: Vec::new(),
        };
        assert!(decode::<GetGrapheneTx>(&encode(&msg)).is_err());
    }

    #[test]
    fn count_mismatch_with_summary_is_rejected() {
        let block: Vec<Hash256> = (0..12).map(txid).collect();
        let set = GrapheneSet::new(
            &GrapheneSetParams {
                version: 6,
                receiver_pool_size: 20,
                sender_universe_size: 20,
                k0: 5,
                k1: 6,
                compute_optimized: false,
                canonical_order: true,
                seed: 42,
            },
            &block,
        )
        .unwrap();
        let msg = GrapheneBlockMsg {
            header: sample_header(),
            nonce: 777,
            n_block_txs: 13,
            additional_txs: Vec::new(),
            set,
            fpr: 0.1,
        };
        let mut encoder = Encoder::new();
        msg.encode_with_version(&mut encoder, 6);
        let bytes = encoder.into_inner();
        let mut decoder = Decoder::new(&bytes);
        assert!(GrapheneBlockMsg::decode_with_version(&mut decoder, 6).is_err());
    }
}
