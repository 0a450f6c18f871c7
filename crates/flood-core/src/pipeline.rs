//! Per-packet detection pipeline.
//!
//! One operation: [`Pipeline::on_syn`]. The decision sequence is fixed:
//! whitelist → tracker touch → window arithmetic → threshold test →
//! kernel-state confirmation → block. The packet itself is always accepted;
//! enforcement is the kernel set's match, not ours. Nothing on this path
//! panics or propagates an error — transient failures are logged
//! (rate-limited) and absorbed.

use arc_swap::ArcSwap;
use std::net::Ipv4Addr;
use std::sync::atomic::Ordering::Relaxed;
use std::sync::{Arc, RwLock};

use crate::blockset::BlockSet;
use crate::config::DetectorConfig;
use crate::conntrack::HalfOpenProbe;
use crate::counters::Counters;
use crate::events::{Event, EventSink, LogLimiter};
use crate::tracker::TrackerTable;
use crate::whitelist::Whitelist;

/// The configuration + whitelist pair, published as one unit so a reload is
/// seen consistently or not at all by concurrent packet processing.
pub struct EngineSnapshot {
    pub config: DetectorConfig,
    pub whitelist: Whitelist,
}

pub struct Pipeline {
    snapshot: Arc<ArcSwap<EngineSnapshot>>,
    tracker: Arc<RwLock<TrackerTable>>,
    probe: Arc<dyn HalfOpenProbe>,
    blockset: Arc<dyn BlockSet>,
    sink: Arc<EventSink>,
    counters: Arc<Counters>,
    limiter: LogLimiter,
}

impl Pipeline {
    pub fn new(
        snapshot: Arc<ArcSwap<EngineSnapshot>>,
        tracker: Arc<RwLock<TrackerTable>>,
        probe: Arc<dyn HalfOpenProbe>,
        blockset: Arc<dyn BlockSet>,
        sink: Arc<EventSink>,
        counters: Arc<Counters>,
    ) -> Self {
        Self {
            snapshot,
            tracker,
            probe,
            blockset,
            sink,
            counters,
            limiter: LogLimiter::new(),
        }
    }

    /// Process one observed SYN from `addr` at monotonic time `now`.
    pub fn on_syn(&self, addr: Ipv4Addr, now: u64) {
        let snap = self.snapshot.load();
        let cfg = &snap.config;

        // Trusted sources never touch tracker state.
        if snap.whitelist.contains(addr) {
            self.counters.whitelist_hits.fetch_add(1, Relaxed);
            self.sink.emit(Event::Whitelisted { addr });
            return;
        }

        let mut tracker = self.tracker.write().unwrap();
        let rec = tracker.get_or_create(addr, now);
        rec.last_seen = now;

        // Reset-on-overflow window: strictly greater-than, and the SYN that
        // opens a fresh window is counted in it.
        if now.saturating_sub(rec.window_start) > cfg.window_ns() {
            rec.syn_count = 1;
            rec.window_start = now;
        } else {
            rec.syn_count += 1;
        }

        // An already-blocked record keeps counting but is not re-evaluated
        // until the sweeper releases it.
        if rec.syn_count > cfg.syn_threshold && !rec.blocked {
            let half_open = self.probe.count_half_open(Some(addr));
            let syn_count = rec.syn_count;

            if half_open > cfg.syn_threshold / 2 {
                // The add and the record flip happen under the same tracker
                // write guard: no reader can observe a successful add with
                // `blocked` still false.
                match self.blockset.add(addr, cfg.block_duration_s) {
                    Ok(()) => {
                        rec.blocked = true;
                        rec.block_expiry = now + cfg.block_duration_ns();
                        self.counters.detections.fetch_add(1, Relaxed);
                        self.sink.emit(Event::Blocked {
                            addr,
                            syn_count,
                            half_open,
                        });
                    }
                    Err(e) => {
                        // Record stays unblocked; the next qualifying SYN
                        // retries the add.
                        self.limiter
                            .warn(now, &format!("block-set add {addr} failed: {e}"));
                    }
                }
            } else {
                self.counters.false_positives.fetch_add(1, Relaxed);
                self.sink.emit(Event::Suspicious {
                    addr,
                    syn_count,
                    half_open,
                });
            }
        }

        self.counters.syn_packets.fetch_add(1, Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::{bail, Result};
    use crossbeam_channel::Receiver;
    use std::collections::HashMap;
    use std::sync::atomic::AtomicBool;
    use std::sync::Mutex;

    struct FixedProbe(u32);

    impl HalfOpenProbe for FixedProbe {
        fn count_half_open(&self, _filter: Option<Ipv4Addr>) -> u32 {
            self.0
        }
    }

    struct MemBlockSet {
        entries: Mutex<HashMap<Ipv4Addr, u32>>,
        fail_adds: AtomicBool,
    }

    impl MemBlockSet {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                entries: Mutex::new(HashMap::new()),
                fail_adds: AtomicBool::new(false),
            })
        }
    }

    impl BlockSet for MemBlockSet {
        fn add(&self, addr: Ipv4Addr, ttl_s: u32) -> Result<()> {
            if self.fail_adds.load(Relaxed) {
                bail!("injected add failure");
            }
            self.entries.lock().unwrap().insert(addr, ttl_s);
            Ok(())
        }

        fn remove(&self, addr: Ipv4Addr) -> Result<()> {
            self.entries.lock().unwrap().remove(&addr);
            Ok(())
        }

        fn test(&self, addr: Ipv4Addr) -> Result<bool> {
            Ok(self.entries.lock().unwrap().contains_key(&addr))
        }

        fn flush(&self) -> Result<()> {
            self.entries.lock().unwrap().clear();
            Ok(())
        }

        fn count(&self) -> Result<u32> {
            Ok(self.entries.lock().unwrap().len() as u32)
        }

        fn shutdown(&self) {}
    }

    struct Rig {
        pipeline: Pipeline,
        blockset: Arc<MemBlockSet>,
        tracker: Arc<RwLock<TrackerTable>>,
        counters: Arc<Counters>,
        events: Receiver<Event>,
    }

    fn rig(cfg: DetectorConfig, whitelist: &[&str], half_open: u32) -> Rig {
        let (whitelist, _) = Whitelist::from_lines(whitelist.iter().copied());
        let snapshot = Arc::new(ArcSwap::from_pointee(EngineSnapshot {
            config: cfg.clone(),
            whitelist,
        }));
        let tracker = Arc::new(RwLock::new(TrackerTable::new(
            cfg.hash_buckets,
            cfg.max_tracked_ips,
        )));
        let blockset = MemBlockSet::new();
        let counters = Counters::new();
        let (tx, events) = crossbeam_channel::bounded(65536);
        let sink = EventSink::new(tx, counters.clone());
        let pipeline = Pipeline::new(
            snapshot,
            tracker.clone(),
            Arc::new(FixedProbe(half_open)),
            blockset.clone(),
            sink,
            counters.clone(),
        );
        Rig {
            pipeline,
            blockset,
            tracker,
            counters,
            events,
        }
    }

    fn drain(rx: &Receiver<Event>) -> Vec<Event> {
        rx.try_iter().collect()
    }

    fn blocked_events(events: &[Event]) -> usize {
        events
            .iter()
            .filter(|e| matches!(e, Event::Blocked { .. }))
            .count()
    }

    const MS: u64 = 1_000_000;

    #[test]
    fn test_basic_block_confirmed_attack() {
        // Threshold 100, probe 75 > 50: the burst gets exactly one block.
        let r = rig(DetectorConfig::default(), &[], 75);
        let attacker = Ipv4Addr::new(203, 0, 113, 100);
        for i in 0..150u64 {
            r.pipeline.on_syn(attacker, i * 5 * MS);
        }

        let mut t = r.tracker.write().unwrap();
        let rec = t.get(attacker).unwrap();
        assert!(rec.blocked);
        assert_eq!(rec.syn_count, 150);
        assert_eq!(rec.block_expiry, 100 * 5 * MS + 300_000_000_000);
        drop(t);

        assert!(r.blockset.test(attacker).unwrap());
        assert_eq!(r.blockset.entries.lock().unwrap()[&attacker], 300);
        let events = drain(&r.events);
        assert_eq!(blocked_events(&events), 1);
        assert_eq!(r.counters.snapshot().detections, 1);
        assert_eq!(r.counters.snapshot().syn_packets, 150);
    }

    #[test]
    fn test_whitelist_immunity() {
        let r = rig(DetectorConfig::default(), &["192.168.0.0/16"], 75);
        let trusted = Ipv4Addr::new(192, 168, 1, 50);
        for _ in 0..1000 {
            r.pipeline.on_syn(trusted, 0);
        }
        assert_eq!(r.counters.snapshot().whitelist_hits, 1000);
        assert_eq!(r.counters.snapshot().syn_packets, 0);
        assert!(r.tracker.write().unwrap().get(trusted).is_none());
        assert_eq!(r.blockset.count().unwrap(), 0);
        let events = drain(&r.events);
        assert_eq!(events.len(), 1000);
        assert!(events
            .iter()
            .all(|e| matches!(e, Event::Whitelisted { addr } if *addr == trusted)));
    }

    #[test]
    fn test_window_reset_after_gap() {
        // 50 SYNs at t=0, 50 more at t=1100ms: the gap exceeds the window,
        // so the second batch starts a fresh count.
        let r = rig(DetectorConfig::default(), &[], 75);
        let addr = Ipv4Addr::new(10, 0, 0, 1);
        for _ in 0..50 {
            r.pipeline.on_syn(addr, 0);
        }
        for _ in 0..50 {
            r.pipeline.on_syn(addr, 1100 * MS);
        }
        let mut t = r.tracker.write().unwrap();
        let rec = t.get(addr).unwrap();
        assert_eq!(rec.syn_count, 50);
        assert_eq!(rec.window_start, 1100 * MS);
        assert!(!rec.blocked);
        drop(t);
        assert_eq!(r.blockset.count().unwrap(), 0);
    }

    #[test]
    fn test_window_tie_does_not_reset() {
        // now - window_start == window_ns is NOT a reset (strict >).
        let r = rig(DetectorConfig::default(), &[], 75);
        let addr = Ipv4Addr::new(10, 0, 0, 2);
        r.pipeline.on_syn(addr, 0);
        r.pipeline.on_syn(addr, 1000 * MS);
        let mut t = r.tracker.write().unwrap();
        let rec = t.get(addr).unwrap();
        assert_eq!(rec.syn_count, 2);
        assert_eq!(rec.window_start, 0);
        // Past the window it does reset.
        drop(t);
        r.pipeline.on_syn(addr, 2001 * MS);
        let mut t = r.tracker.write().unwrap();
        let rec = t.get(addr).unwrap();
        assert_eq!(rec.syn_count, 1);
    }

    #[test]
    fn test_suspicious_not_confirmed() {
        // Probe reports 10 half-open, below T/2 = 50: no block.
        let r = rig(DetectorConfig::default(), &[], 10);
        let addr = Ipv4Addr::new(198, 51, 100, 7);
        for i in 0..150u64 {
            r.pipeline.on_syn(addr, i * 5 * MS);
        }
        assert!(!r.blockset.test(addr).unwrap());
        let mut t = r.tracker.write().unwrap();
        assert!(!t.get(addr).unwrap().blocked);
        drop(t);
        let events = drain(&r.events);
        assert_eq!(blocked_events(&events), 0);
        let suspicious = events
            .iter()
            .filter(|e| matches!(e, Event::Suspicious { .. }))
            .count();
        assert_eq!(suspicious as u64, r.counters.snapshot().false_positives);
        assert!(suspicious >= 1);
    }

    #[test]
    fn test_threshold_is_strictly_greater() {
        let cfg = DetectorConfig {
            syn_threshold: 5,
            ..Default::default()
        };
        let r = rig(cfg, &[], 100);
        let addr = Ipv4Addr::new(10, 0, 0, 3);
        for _ in 0..5 {
            r.pipeline.on_syn(addr, 0);
        }
        // Exactly at threshold: nothing yet.
        assert_eq!(r.blockset.count().unwrap(), 0);
        r.pipeline.on_syn(addr, 0);
        // One past: blocked.
        assert!(r.blockset.test(addr).unwrap());
    }

    #[test]
    fn test_threshold_one_triggers_on_second_syn() {
        let cfg = DetectorConfig {
            syn_threshold: 1,
            ..Default::default()
        };
        let r = rig(cfg, &[], 1);
        let addr = Ipv4Addr::new(10, 0, 0, 4);
        r.pipeline.on_syn(addr, 0);
        assert_eq!(r.blockset.count().unwrap(), 0);
        r.pipeline.on_syn(addr, MS);
        // half_open = 1 > 1/2 = 0 confirms.
        assert!(r.blockset.test(addr).unwrap());
    }

    #[test]
    fn test_blocked_record_not_reevaluated() {
        let r = rig(DetectorConfig::default(), &[], 75);
        let addr = Ipv4Addr::new(203, 0, 113, 50);
        for i in 0..200u64 {
            r.pipeline.on_syn(addr, i * MS);
        }
        let events = drain(&r.events);
        assert_eq!(blocked_events(&events), 1);
        assert_eq!(r.counters.snapshot().detections, 1);
        // Counter keeps accumulating past the block.
        let mut t = r.tracker.write().unwrap();
        assert_eq!(t.get(addr).unwrap().syn_count, 200);
    }

    #[test]
    fn test_failed_add_retries_on_next_syn() {
        let r = rig(DetectorConfig::default(), &[], 75);
        let addr = Ipv4Addr::new(203, 0, 113, 60);
        r.blockset.fail_adds.store(true, Relaxed);
        for i in 0..110u64 {
            r.pipeline.on_syn(addr, i * MS);
        }
        let mut t = r.tracker.write().unwrap();
        assert!(!t.get(addr).unwrap().blocked);
        drop(t);
        assert_eq!(r.counters.snapshot().detections, 0);

        // The driver recovers; the very next qualifying SYN blocks.
        r.blockset.fail_adds.store(false, Relaxed);
        r.pipeline.on_syn(addr, 111 * MS);
        assert!(r.blockset.test(addr).unwrap());
        let mut t = r.tracker.write().unwrap();
        assert!(t.get(addr).unwrap().blocked);
    }

    #[test]
    fn test_probe_zero_means_not_confirmed() {
        // A dead probe (reads as 0) must never confirm a block.
        let r = rig(DetectorConfig::default(), &[], 0);
        let addr = Ipv4Addr::new(198, 51, 100, 8);
        for i in 0..150u64 {
            r.pipeline.on_syn(addr, i * MS);
        }
        assert_eq!(r.blockset.count().unwrap(), 0);
        assert!(r.counters.snapshot().false_positives >= 1);
    }

    #[test]
    fn test_record_invariants_hold() {
        let r = rig(DetectorConfig::default(), &[], 75);
        for i in 0..50u32 {
            let addr = Ipv4Addr::from(0xCB00_7100 + (i % 7));
            r.pipeline.on_syn(addr, (i as u64) * 37 * MS);
        }
        let t = r.tracker.read().unwrap();
        let stats = t.stats();
        assert!(stats.total <= DetectorConfig::default().max_tracked_ips);
        drop(t);
        let mut t = r.tracker.write().unwrap();
        for i in 0..7u32 {
            let addr = Ipv4Addr::from(0xCB00_7100 + i);
            let rec = t.get(addr).unwrap();
            assert!(rec.window_start <= rec.last_seen);
            assert!(rec.syn_count >= 1);
            if rec.blocked {
                assert!(rec.block_expiry > rec.window_start);
            }
        }
    }

    #[test]
    fn test_reblock_after_manual_release() {
        // Invariant: once the sweeper (simulated here) releases a block, a
        // fresh burst can produce a second Blocked event.
        let r = rig(DetectorConfig::default(), &[], 75);
        let addr = Ipv4Addr::new(203, 0, 113, 100);
        for i in 0..110u64 {
            r.pipeline.on_syn(addr, i * MS);
        }
        assert_eq!(r.counters.snapshot().detections, 1);

        // Sweeper-equivalent release.
        r.blockset.remove(addr).unwrap();
        {
            let mut t = r.tracker.write().unwrap();
            let rec = t.get(addr).unwrap();
            rec.blocked = false;
            rec.block_expiry = 0;
        }

        let base = 400_000 * MS;
        for i in 0..110u64 {
            r.pipeline.on_syn(addr, base + i * MS);
        }
        assert_eq!(r.counters.snapshot().detections, 2);
        assert!(r.blockset.test(addr).unwrap());
    }
}
