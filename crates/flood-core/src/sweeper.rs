//! Expired-block sweeper.
//!
//! A dedicated thread that periodically scans the tracker for blocks whose
//! expiry has passed, removes them from the kernel set, clears the record's
//! block state, and refreshes the gauge counters. The kernel's own TTL would
//! eventually drop the set entries anyway; sweeping keeps the tracker and
//! the operator's view in step with it. Sleeping happens in 1-second slices
//! so shutdown latency stays bounded.

use arc_swap::ArcSwap;
use std::sync::atomic::{AtomicBool, Ordering::Relaxed};
use std::sync::{Arc, RwLock};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::info;

use crate::blockset::BlockSet;
use crate::clock;
use crate::counters::Counters;
use crate::events::{Event, EventSink, LogLimiter};
use crate::pipeline::EngineSnapshot;
use crate::tracker::TrackerTable;

/// Expired addresses drained per scan; a storm of simultaneous expirations
/// is worked off by repeating the scan while batches come back full.
const BATCH: usize = 1024;

pub struct Sweeper {
    snapshot: Arc<ArcSwap<EngineSnapshot>>,
    tracker: Arc<RwLock<TrackerTable>>,
    blockset: Arc<dyn BlockSet>,
    sink: Arc<EventSink>,
    counters: Arc<Counters>,
    limiter: LogLimiter,
}

pub struct SweeperHandle {
    stop: Arc<AtomicBool>,
    thread: JoinHandle<()>,
}

impl SweeperHandle {
    pub fn stop_and_join(self) {
        self.stop.store(true, Relaxed);
        let _ = self.thread.join();
    }
}

impl Sweeper {
    pub fn new(
        snapshot: Arc<ArcSwap<EngineSnapshot>>,
        tracker: Arc<RwLock<TrackerTable>>,
        blockset: Arc<dyn BlockSet>,
        sink: Arc<EventSink>,
        counters: Arc<Counters>,
    ) -> Self {
        Self {
            snapshot,
            tracker,
            blockset,
            sink,
            counters,
            limiter: LogLimiter::new(),
        }
    }

    /// Start the sweep loop on its own thread.
    pub fn spawn(self) -> SweeperHandle {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = stop.clone();
        let thread = std::thread::Builder::new()
            .name("block-sweeper".into())
            .spawn(move || {
                info!("sweeper started");
                while !stop_flag.load(Relaxed) {
                    // The interval follows config reloads; re-read each cycle.
                    let interval = self.snapshot.load().config.sweep_interval_s;
                    for _ in 0..interval {
                        if stop_flag.load(Relaxed) {
                            return;
                        }
                        std::thread::sleep(Duration::from_secs(1));
                    }
                    if stop_flag.load(Relaxed) {
                        return;
                    }
                    self.sweep_once(clock::now_ns());
                }
            })
            .expect("failed to spawn sweeper thread");
        SweeperHandle { stop, thread }
    }

    /// One full sweep at time `now`. Returns the number of released blocks.
    pub fn sweep_once(&self, now: u64) -> usize {
        let mut released = 0usize;
        let mut batch = Vec::with_capacity(BATCH);

        loop {
            let filled = {
                let tracker = self.tracker.read().unwrap();
                tracker.expired_blocks(now, &mut batch, BATCH)
            };

            let mut progressed = 0usize;
            for &addr in &batch {
                match self.blockset.remove(addr) {
                    Ok(()) => {
                        {
                            let mut tracker = self.tracker.write().unwrap();
                            // A concurrent clear may have raced us; the
                            // missing record is a silent no-op.
                            if let Some(rec) = tracker.get(addr) {
                                rec.blocked = false;
                                rec.block_expiry = 0;
                            }
                        }
                        self.sink.emit(Event::Unblocked { addr });
                        released += 1;
                        progressed += 1;
                    }
                    Err(e) => {
                        // Still blocked, still expired; the next sweep
                        // retries it.
                        self.limiter
                            .warn(now, &format!("block-set remove {addr} failed: {e}"));
                    }
                }
            }

            // Drain storms: rescan while the batch came back full, but bail
            // if nothing moved (every remove failing) to avoid spinning.
            if filled < BATCH || progressed == 0 {
                break;
            }
        }

        self.refresh_gauges();
        released
    }

    fn refresh_gauges(&self) {
        if let Ok(n) = self.blockset.count() {
            self.counters.blocked_current.store(n as u64, Relaxed);
        }
        let stats = self.tracker.read().unwrap().stats();
        self.counters.tracker_entries.store(stats.total as u64, Relaxed);
        self.counters.tracker_blocked.store(stats.blocked as u64, Relaxed);
    }
}
