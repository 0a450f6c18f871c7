//! Shared daemon counters.
//!
//! All fields use `Relaxed` ordering — these are sampling metrics, not
//! synchronisation. The packet path, the sweeper and the metrics exporter
//! share one `Arc<Counters>`; `snapshot()` produces the plain struct the
//! exporter serializes.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering::Relaxed};
use std::sync::Arc;

pub struct Counters {
    /// Every frame delivered by the packet source, well-formed or not.
    pub total_packets: AtomicU64,
    /// SYN packets that entered the detection pipeline.
    pub syn_packets: AtomicU64,
    /// Confirmed attacks (one per `Blocked` event).
    pub detections: AtomicU64,
    /// Threshold crossings the kernel state did not confirm
    /// (one per `Suspicious` event).
    pub false_positives: AtomicU64,
    /// SYNs short-circuited by the whitelist.
    pub whitelist_hits: AtomicU64,
    /// Addresses currently in the kernel block set; refreshed by the sweeper.
    pub blocked_current: AtomicU64,
    /// Tracker records alive; refreshed alongside `blocked_current`.
    pub tracker_entries: AtomicU64,
    /// Tracker records in the blocked state.
    pub tracker_blocked: AtomicU64,
    /// Frames skipped because they could not be parsed as IPv4 TCP SYN.
    pub malformed_packets: AtomicU64,
    /// Events discarded because the sink channel was full.
    pub events_dropped: AtomicU64,
}

/// Plain-struct snapshot of [`Counters`] for export (no atomics).
#[derive(Debug, Clone, Serialize)]
pub struct CountersSnapshot {
    pub total_packets: u64,
    pub syn_packets: u64,
    pub detections: u64,
    pub false_positives: u64,
    pub whitelist_hits: u64,
    pub blocked_current: u64,
    pub tracker_entries: u64,
    pub tracker_blocked: u64,
    pub malformed_packets: u64,
    pub events_dropped: u64,
}

impl Counters {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            total_packets: AtomicU64::new(0),
            syn_packets: AtomicU64::new(0),
            detections: AtomicU64::new(0),
            false_positives: AtomicU64::new(0),
            whitelist_hits: AtomicU64::new(0),
            blocked_current: AtomicU64::new(0),
            tracker_entries: AtomicU64::new(0),
            tracker_blocked: AtomicU64::new(0),
            malformed_packets: AtomicU64::new(0),
            events_dropped: AtomicU64::new(0),
        })
    }

    pub fn snapshot(&self) -> CountersSnapshot {
        CountersSnapshot {
            total_packets: self.total_packets.load(Relaxed),
            syn_packets: self.syn_packets.load(Relaxed),
            detections: self.detections.load(Relaxed),
            false_positives: self.false_positives.load(Relaxed),
            whitelist_hits: self.whitelist_hits.load(Relaxed),
            blocked_current: self.blocked_current.load(Relaxed),
            tracker_entries: self.tracker_entries.load(Relaxed),
            tracker_blocked: self.tracker_blocked.load(Relaxed),
            malformed_packets: self.malformed_packets.load(Relaxed),
            events_dropped: self.events_dropped.load(Relaxed),
        }
    }
}
