//! Transaction pools feeding Graphene reconciliation.
//!
//! Three containers share one lock at the node level: the verified mempool,
//! the orphan pool, and the commit queue (txs accepted but not yet flushed to
//! the mempool proper). Candidate snapshots must see all three in a single
//! critical section; a tx migrating between pools mid-snapshot would
//! otherwise be missed or double counted.

use std::collections::HashMap;

use bchu_consensus::Hash256;
use bchu_primitives::Transaction;

#[derive(Clone, Debug)]
pub struct PoolEntry {
    pub tx: Transaction,
    pub size: usize,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TxSource {
    CommitQueue,
    Mempool,
    Orphan,
}

impl TxSource {
    /// Orphans have not passed input validation; downstream block processing
    /// must re-check them.
    pub fn is_verified(self) -> bool {
        !matches!(self, TxSource::Orphan)
    }
}

#[derive(Default)]
pub struct TxPools {
    mempool: HashMap<Hash256, PoolEntry>,
    orphans: HashMap<Hash256, PoolEntry>,
    commit_queue: HashMap<Hash256, PoolEntry>,
}

impl TxPools {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(tx: Transaction) -> (Hash256, PoolEntry) {
        let txid = tx.txid();
        let size = tx.serialized_size();
        (txid, PoolEntry { tx, size })
    }

    pub fn insert_mempool(&mut self, tx: Transaction) -> Hash256 {
        let (txid, entry) = Self::entry(tx);
        self.orphans.remove(&txid);
        self.mempool.insert(txid, entry);
        txid
    }

    pub fn insert_orphan(&mut self, tx: Transaction) -> Hash256 {
        let (txid, entry) = Self::entry(tx);
        if !self.mempool.contains_key(&txid) && !self.commit_queue.contains_key(&txid) {
            self.orphans.insert(txid, entry);
        }
        txid
    }

    pub fn insert_commit_queue(&mut self, tx: Transaction) -> Hash256 {
        let (txid, entry) = Self::entry(tx);
        self.mempool.remove(&txid);
        self.orphans.remove(&txid);
        self.commit_queue.insert(txid, entry);
        txid
    }

    pub fn remove(&mut self, txid: &Hash256) {
        self.mempool.remove(txid);
        self.orphans.remove(txid);
        self.commit_queue.remove(txid);
    }

    pub fn contains(&self, txid: &Hash256) -> bool {
        self.mempool.contains_key(txid)
            || self.orphans.contains_key(txid)
            || self.commit_queue.contains_key(txid)
    }

    pub fn candidate_count(&self) -> u64 {
        (self.mempool.len() + self.orphans.len() + self.commit_queue.len()) as u64
    }

    /// Every candidate txid across all three pools. One call, one lock scope.
    pub fn snapshot_candidates(&self) -> Vec<Hash256> {
        let mut out = Vec::with_capacity(self.candidate_count() as usize);
        out.extend(self.commit_queue.keys().copied());
        out.extend(self.mempool.keys().copied());
        for txid in self.orphans.keys() {
            if !self.commit_queue.contains_key(txid) && !self.mempool.contains_key(txid) {
                out.push(*txid);
            }
        }
        out
    }

    /// Reconstruction lookup. Commit queue wins over the mempool so a tx
    /// mid-migration resolves to the copy block processing will see.
    pub fn lookup(&self, txid: &Hash256) -> Option<(&Transaction, TxSource)> {
        if let Some(entry) = self.commit_queue.get(txid) {
            return Some((&entry.tx, TxSource::CommitQueue));
        }
        if let Some(entry) = self.mempool.get(txid) {
            return Some((&entry.tx, TxSource::Mempool));
        }
        self.orphans
            .get(txid)
            .map(|entry| (&entry.tx, TxSource::Orphan))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bchu_primitives::{OutPoint, TxIn, TxOut};

    fn tx(i: u32) -> Transaction {
        Transaction {
            version: 1,
            vin: vec![TxIn {
                prevout: OutPoint {
                    txid: bchu_primitives::sha256d(&i.to_le_bytes()),
                    vout: 0,
                },
                script_sig: vec![0x51],
                sequence: u32::MAX,
            }],
            vout: vec![TxOut {
                value: 1000 + i as i64,
                script_pubkey: vec![0xac],
            }],
            lock_time: 0,
        }
    }

    #[test]
    fn snapshot_covers_all_pools_without_duplicates() {
        let mut pools = TxPools::new();
        let a = pools.insert_mempool(tx(1));
        let b = pools.insert_orphan(tx(2));
        let c = pools.insert_commit_queue(tx(3));
        assert_eq!(pools.candidate_count(), 3);
        let mut snapshot = pools.snapshot_candidates();
        snapshot.sort_unstable();
        let mut expected = vec![a, b, c];
        expected.sort_unstable();
        assert_eq!(snapshot, expected);
    }

    #[test]
    fn commit_queue_shadows_mempool_in_lookup() {
        let mut pools = TxPools::new();
        let txid = pools.insert_mempool(tx(1));
        pools.insert_commit_queue(tx(1));
        let (_, source) = pools.lookup(&txid).unwrap();
        assert_eq!(source, TxSource::CommitQueue);
        assert_eq!(pools.candidate_count(), 1);
    }

    #[test]
    fn orphans_resolve_unverified() {
        let mut pools = TxPools::new();
        let txid = pools.insert_orphan(tx(5));
        let (_, source) = pools.lookup(&txid).unwrap();
        assert!(!source.is_verified());
        pools.insert_mempool(tx(5));
        let (_, source) = pools.lookup(&txid).unwrap();
        assert!(source.is_verified());
    }

    #[test]
    fn remove_clears_every_pool() {
        let mut pools = TxPools::new();
        let txid = pools.insert_mempool(tx(9));
        pools.remove(&txid);
        assert!(!pools.contains(&txid));
        assert_eq!(pools.candidate_count(), 0);
    }
}
