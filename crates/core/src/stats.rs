// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Node statistics tracking and reporting.
//!
//! Updates are throttled (every 10 seconds or 1000 received packets) so a busy
//! muxer does not flood the monitoring channel.

use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant, SystemTime};
use tokio::sync::mpsc;
use ts_rs::TS;

/// Runtime packet counters for a node.
#[derive(Debug, Clone, Default, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct NodeStats {
    /// Packets received on all input pins
    pub received: u64,
    /// Packets delivered on all output pins
    pub sent: u64,
    /// Packets dropped without processing
    pub discarded: u64,
    /// Non-fatal processing errors
    pub errored: u64,
    /// Seconds since the node started
    pub duration_secs: f64,
}

/// A statistics snapshot sent by a node.
#[derive(Debug, Clone)]
pub struct NodeStatsUpdate {
    pub node_id: String,
    pub stats: NodeStats,
    pub timestamp: SystemTime,
}

/// Accumulates [`NodeStats`] and sends throttled snapshots.
pub struct NodeStatsTracker {
    stats: NodeStats,
    start_time: Instant,
    last_send: Instant,
    node_id: String,
    stats_tx: Option<mpsc::Sender<NodeStatsUpdate>>,
}

impl NodeStatsTracker {
    const SEND_INTERVAL: Duration = Duration::from_secs(10);
    const SEND_PACKET_THRESHOLD: u64 = 1000;

    pub fn new(node_id: String, stats_tx: Option<mpsc::Sender<NodeStatsUpdate>>) -> Self {
        let now = Instant::now();
        Self { stats: NodeStats::default(), start_time: now, last_send: now, node_id, stats_tx }
    }

    #[inline]
    pub const fn received(&mut self) {
        self.stats.received += 1;
    }

    #[inline]
    pub const fn sent(&mut self) {
        self.stats.sent += 1;
    }

    #[inline]
    pub const fn discarded(&mut self) {
        self.stats.discarded += 1;
    }

    #[inline]
    pub const fn errored(&mut self) {
        self.stats.errored += 1;
    }

    /// Adds errors that were counted elsewhere (e.g. swallowed muxer write failures).
    #[inline]
    pub const fn errored_n(&mut self, count: u64) {
        self.stats.errored += count;
    }

    pub const fn snapshot(&self) -> &NodeStats {
        &self.stats
    }

    /// Sends a snapshot if the interval elapsed or the packet threshold was crossed.
    pub fn maybe_send(&mut self) {
        let should_send = self.last_send.elapsed() >= Self::SEND_INTERVAL
            || self.stats.received.is_multiple_of(Self::SEND_PACKET_THRESHOLD);

        if should_send {
            self.force_send();
        }
    }

    /// Sends a snapshot now (used for final updates).
    pub fn force_send(&mut self) {
        if let Some(ref stats_tx) = self.stats_tx {
            self.stats.duration_secs = self.start_time.elapsed().as_secs_f64();

            let _ = stats_tx.try_send(NodeStatsUpdate {
                node_id: self.node_id.clone(),
                stats: self.stats.clone(),
                timestamp: SystemTime::now(),
            });
            self.last_send = Instant::now();
        }
    }
}
