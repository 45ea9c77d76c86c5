//! Reconciliation behavior across candidate pool shapes.

use bchu_consensus::Hash256;
use bchu_graphene::{short_id, GrapheneSet, GrapheneSetParams, ReconcileError};
use bchu_primitives::{Decoder, Encoder};

const K0: u64 = 0x1111;
const K1: u64 = 0x2222;
const SEED: u64 = 0x00c0_ffee_00c0_ffee;

fn txid(i: u32) -> Hash256 {
    bchu_primitives::sha256d(&i.to_le_bytes())
}

fn block_hashes() -> Vec<Hash256> {
    (0..20).map(txid).collect()
}

fn params(receiver_pool: u64, universe: u64) -> GrapheneSetParams {
    GrapheneSetParams {
        version: 2,
        receiver_pool_size: receiver_pool,
        sender_universe_size: universe,
        k0: K0,
        k1: K1,
        compute_optimized: false,
        canonical_order: true,
        seed: SEED,
    }
}

fn expected_sorted(block: &[Hash256], version: u64) -> Vec<u64> {
    let mut ids: Vec<u64> = block
        .iter()
        .map(|hash| short_id(K0, K1, hash, version))
        .collect();
    ids.sort_unstable();
    ids
}

#[test]
fn superset_pool_recovers_block_ids() {
    let block = block_hashes();
    let mut pool = block.clone();
    pool.extend((100..110).map(txid));
    let set = GrapheneSet::new(&params(30, 30), &block).unwrap();
    assert_eq!(set.reconcile(&pool).unwrap(), expected_sorted(&block, 2));
}

#[test]
fn rank_mode_restores_block_order() {
    let block = block_hashes();
    let mut pool = block.clone();
    pool.extend((100..110).map(txid));
    let set = GrapheneSet::new(
        &GrapheneSetParams {
            canonical_order: false,
            ..params(30, 30)
        },
        &block,
    )
    .unwrap();
    let in_block_order: Vec<u64> = block
        .iter()
        .map(|hash| short_id(K0, K1, hash, 2))
        .collect();
    assert_eq!(set.reconcile(&pool).unwrap(), in_block_order);
}

#[test]
fn ten_times_excess_still_decodes() {
    let block = block_hashes();
    let mut pool = block.clone();
    pool.extend((1000..1200).map(txid));
    let set = GrapheneSet::new(&params(220, 220), &block).unwrap();
    assert_eq!(set.reconcile(&pool).unwrap(), expected_sorted(&block, 2));
}

#[test]
fn fast_filter_mode_decodes_identically() {
    let block = block_hashes();
    let mut pool = block.clone();
    pool.extend((1000..1200).map(txid));
    let set = GrapheneSet::new(
        &GrapheneSetParams {
            compute_optimized: true,
            ..params(220, 220)
        },
        &block,
    )
    .unwrap();
    assert_eq!(set.reconcile(&pool).unwrap(), expected_sorted(&block, 2));
}

#[test]
fn disjoint_pool_recovers_everything_from_iblt() {
    let block = block_hashes();
    let pool: Vec<Hash256> = (2000..2030).map(txid).collect();
    let set = GrapheneSet::new(&params(30, 50), &block).unwrap();
    assert_eq!(set.reconcile(&pool).unwrap(), expected_sorted(&block, 2));
}

#[test]
fn exact_pool_match_decodes() {
    let block = block_hashes();
    let set = GrapheneSet::new(&params(20, 30), &block).unwrap();
    assert_eq!(set.reconcile(&block).unwrap(), expected_sorted(&block, 2));
}

#[test]
fn legacy_version_uses_cheap_hashes() {
    let block = block_hashes();
    let mut pool = block.clone();
    pool.extend((100..110).map(txid));
    let set = GrapheneSet::new(
        &GrapheneSetParams {
            version: 1,
            k0: 0,
            k1: 0,
            ..params(30, 30)
        },
        &block,
    )
    .unwrap();
    let mut want: Vec<u64> = block
        .iter()
        .map(|hash| short_id(0, 0, hash, 1))
        .collect();
    want.sort_unstable();
    assert_eq!(set.reconcile(&pool).unwrap(), want);
}

#[test]
fn oversized_pool_fails_decodably() {
    // Sized for one excess tx, fed five hundred. The filter rate degrades to
    // its cap, the tiny IBLT overloads, and the failure must be reported
    // rather than a wrong set returned.
    let block = block_hashes();
    let mut pool = block.clone();
    pool.extend((3000..3500).map(txid));
    let set = GrapheneSet::new(&params(20, 21), &block).unwrap();
    assert_eq!(
        set.reconcile(&pool),
        Err(ReconcileError::IbltDecodeFailure)
    );
}

#[test]
fn serialization_preserves_reconciliation() {
    let block = block_hashes();
    let mut pool = block.clone();
    pool.extend((100..110).map(txid));
    let set = GrapheneSet::new(&params(30, 30), &block).unwrap();

    let mut encoder = Encoder::new();
    set.encode_into(&mut encoder);
    let bytes = encoder.into_inner();

    let mut decoder = Decoder::new(&bytes);
    let mut decoded = GrapheneSet::decode_from(&mut decoder, 2).unwrap();
    assert!(decoder.is_empty());
    decoded.set_keys(K0, K1);
    decoded.set_fpr(set.fpr());

    assert_eq!(decoded.reconcile(&pool).unwrap(), set.reconcile(&pool).unwrap());
}
