//! Bandwidth and reliability statistics for Graphene relay.
//!
//! A single owned accumulator; per-event byte counts are kept in
//! second-resolution series and expired against a 24 hour window whenever new
//! data arrives or a snapshot is taken.

use std::collections::BTreeMap;

use serde::Serialize;

const WINDOW_SECS: u64 = 24 * 60 * 60;

#[derive(Default)]
struct ByteSeries {
    points: BTreeMap<u64, u64>,
    total: u64,
}

impl ByteSeries {
    fn add(&mut self, now: u64, bytes: u64) {
        *self.points.entry(now).or_insert(0) += bytes;
        self.total = self.total.saturating_add(bytes);
    }

    fn expire(&mut self, now: u64) {
        let cutoff = now.saturating_sub(WINDOW_SECS);
        self.points = self.points.split_off(&cutoff);
    }

    fn window_sum(&self) -> u64 {
        self.points.values().sum()
    }
}

#[derive(Default)]
pub struct GrapheneStats {
    filter_bytes: ByteSeries,
    iblt_bytes: ByteSeries,
    rank_bytes: ByteSeries,
    block_bytes: ByteSeries,
    rerequested_tx_bytes: ByteSeries,
    blocks_received: u64,
    blocks_sent: u64,
    decode_failures: u64,
    rerequests: u64,
}

/// Point-in-time view, serialized for the node's stats surface.
#[derive(Clone, Debug, Serialize)]
pub struct GrapheneStatsSnapshot {
    pub blocks_received: u64,
    pub blocks_sent: u64,
    pub decode_failures: u64,
    pub rerequests: u64,
    pub window_filter_bytes: u64,
    pub window_iblt_bytes: u64,
    pub window_rank_bytes: u64,
    pub window_block_bytes: u64,
    pub window_rerequested_tx_bytes: u64,
    /// Summary bytes over full block bytes for the window; below 1.0 means
    /// Graphene saved bandwidth.
    pub compression_ratio: f64,
    pub rerequest_rate: f64,
}

impl GrapheneStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn note_block_received(
        &mut self,
        now: u64,
        filter_bytes: u64,
        iblt_bytes: u64,
        rank_bytes: u64,
        full_block_bytes: u64,
    ) {
        self.blocks_received += 1;
        self.filter_bytes.add(now, filter_bytes);
        self.iblt_bytes.add(now, iblt_bytes);
        self.rank_bytes.add(now, rank_bytes);
        self.block_bytes.add(now, full_block_bytes);
        self.expire(now);
    }

    pub fn note_block_sent(&mut self, now: u64) {
        self.blocks_sent += 1;
        self.expire(now);
    }

    pub fn note_rerequest(&mut self, now: u64, tx_bytes: u64) {
        self.rerequests += 1;
        self.rerequested_tx_bytes.add(now, tx_bytes);
        self.expire(now);
    }

    pub fn note_decode_failure(&mut self) {
        self.decode_failures += 1;
    }

    pub fn decode_failures(&self) -> u64 {
        self.decode_failures
    }

    fn expire(&mut self, now: u64) {
        self.filter_bytes.expire(now);
        self.iblt_bytes.expire(now);
        self.rank_bytes.expire(now);
        self.block_bytes.expire(now);
        self.rerequested_tx_bytes.expire(now);
    }

    pub fn snapshot(&mut self, now: u64) -> GrapheneStatsSnapshot {
        self.expire(now);
        let summary = self.filter_bytes.window_sum()
            + self.iblt_bytes.window_sum()
            + self.rank_bytes.window_sum()
            + self.rerequested_tx_bytes.window_sum();
        let block = self.block_bytes.window_sum();
        let compression_ratio = if block == 0 {
            0.0
        } else {
            summary as f64 / block as f64
        };
        let rerequest_rate = if self.blocks_received == 0 {
            0.0
        } else {
            self.rerequests as f64 / self.blocks_received as f64
        };
        GrapheneStatsSnapshot {
            blocks_received: self.blocks_received,
            blocks_sent: self.blocks_sent,
            decode_failures: self.decode_failures,
            rerequests: self.rerequests,
            window_filter_bytes: self.filter_bytes.window_sum(),
            window_iblt_bytes: self.iblt_bytes.window_sum(),
            window_rank_bytes: self.rank_bytes.window_sum(),
            window_block_bytes: block,
            window_rerequested_tx_bytes: self.rerequested_tx_bytes.window_sum(),
            compression_ratio,
            rerequest_rate,
        }
    }
}
