//! Daemon supervisor: signal intents, the packet loop's service hook,
//! configuration reload, and ordered shutdown.
//!
//! Signal handlers write one static atomic each and nothing else; the packet
//! loop services the intents between packets. Reload re-parses config and
//! whitelist through a caller-supplied closure and publishes the new pair
//! with a single pointer swap, so concurrent packet processing sees the old
//! pair or the new pair, never a mix.

use anyhow::{bail, Context, Result};
use arc_swap::ArcSwap;
use std::sync::atomic::{AtomicBool, Ordering::SeqCst};
use std::sync::{Arc, RwLock};
use tracing::{error, info, warn};

use crate::blockset::BlockSet;
use crate::config::DetectorConfig;
use crate::conntrack::HalfOpenProbe;
use crate::counters::Counters;
use crate::events::{Event, EventSink};
use crate::pipeline::{EngineSnapshot, Pipeline};
use crate::source::{LoopControl, SynSource};
use crate::sweeper::Sweeper;
use crate::tracker::TrackerTable;
use crate::whitelist::Whitelist;

static SHUTDOWN_INTENT: AtomicBool = AtomicBool::new(false);
static RELOAD_INTENT: AtomicBool = AtomicBool::new(false);

/// Re-parse configuration and whitelist; invoked on a reload intent.
pub type ReloadFn = Box<dyn FnMut() -> Result<(DetectorConfig, Whitelist)> + Send>;

extern "C" fn intent_handler(sig: libc::c_int) {
    // Async-signal-safe: a single atomic store, nothing else.
    match sig {
        libc::SIGINT | libc::SIGTERM => SHUTDOWN_INTENT.store(true, SeqCst),
        libc::SIGHUP => RELOAD_INTENT.store(true, SeqCst),
        _ => {}
    }
}

/// Map SIGINT/SIGTERM to the shutdown intent and SIGHUP to reload.
/// Installed without SA_RESTART so a signal wakes blocking reads with EINTR.
pub fn install_signal_handlers() -> Result<()> {
    // SAFETY: the handler only stores to static atomics; sigaction fields
    // are fully initialized before the call.
    unsafe {
        let mut action: libc::sigaction = std::mem::zeroed();
        action.sa_sigaction = intent_handler as usize;
        libc::sigemptyset(&mut action.sa_mask);
        action.sa_flags = 0;
        for sig in [libc::SIGINT, libc::SIGTERM, libc::SIGHUP] {
            if libc::sigaction(sig, &action, std::ptr::null_mut()) != 0 {
                bail!(
                    "failed to install handler for signal {sig}: {}",
                    std::io::Error::last_os_error()
                );
            }
        }
    }
    Ok(())
}

pub fn request_shutdown() {
    SHUTDOWN_INTENT.store(true, SeqCst);
}

pub fn shutdown_requested() -> bool {
    SHUTDOWN_INTENT.load(SeqCst)
}

pub struct Daemon {
    snapshot: Arc<ArcSwap<EngineSnapshot>>,
    tracker: Arc<RwLock<TrackerTable>>,
    blockset: Arc<dyn BlockSet>,
    probe: Arc<dyn HalfOpenProbe>,
    counters: Arc<Counters>,
    sink: Arc<EventSink>,
}

impl Daemon {
    /// Assemble the engine around an initial configuration + whitelist pair.
    /// The tracker is sized from this snapshot and lives until shutdown;
    /// reloads change thresholds and the whitelist, not the table shape.
    pub fn new(
        initial: EngineSnapshot,
        blockset: Arc<dyn BlockSet>,
        probe: Arc<dyn HalfOpenProbe>,
        counters: Arc<Counters>,
        sink: Arc<EventSink>,
    ) -> Self {
        let tracker = Arc::new(RwLock::new(TrackerTable::new(
            initial.config.hash_buckets,
            initial.config.max_tracked_ips,
        )));
        Self {
            snapshot: Arc::new(ArcSwap::from_pointee(initial)),
            tracker,
            blockset,
            probe,
            counters,
            sink,
        }
    }

    /// Drive the packet loop to completion. Returns when a shutdown intent
    /// (or a fatal source error) ends the loop; components are then torn
    /// down in reverse init order. The kernel set survives on purpose.
    pub fn run(self, mut source: Box<dyn SynSource>, reload: ReloadFn) -> Result<()> {
        install_signal_handlers().context("failed to install signal handlers")?;

        let pipeline = Pipeline::new(
            self.snapshot.clone(),
            self.tracker.clone(),
            self.probe.clone(),
            self.blockset.clone(),
            self.sink.clone(),
            self.counters.clone(),
        );

        let sweeper = Sweeper::new(
            self.snapshot.clone(),
            self.tracker.clone(),
            self.blockset.clone(),
            self.sink.clone(),
            self.counters.clone(),
        )
        .spawn();

        let mut control = SupervisorControl {
            snapshot: self.snapshot.clone(),
            tracker: self.tracker.clone(),
            blockset: self.blockset.clone(),
            sink: self.sink.clone(),
            reload,
        };

        info!(source = source.name(), "packet loop starting");
        let result = source.run(&mut |addr, now| pipeline.on_syn(addr, now), &mut control);

        info!("packet loop stopped, tearing down");
        sweeper.stop_and_join();
        self.blockset.shutdown();
        self.tracker.write().unwrap().clear();
        // The snapshot (configuration + whitelist) drops with the daemon;
        // the event writer is joined by the caller after this returns.
        result
    }
}

struct SupervisorControl {
    snapshot: Arc<ArcSwap<EngineSnapshot>>,
    tracker: Arc<RwLock<TrackerTable>>,
    blockset: Arc<dyn BlockSet>,
    sink: Arc<EventSink>,
    reload: ReloadFn,
}

impl LoopControl for SupervisorControl {
    fn service(&mut self) -> bool {
        if SHUTDOWN_INTENT.load(SeqCst) {
            return false;
        }
        if RELOAD_INTENT.swap(false, SeqCst) {
            self.apply_reload();
        }
        true
    }
}

impl SupervisorControl {
    fn apply_reload(&mut self) {
        let (config, whitelist) = match (self.reload)() {
            Ok(pair) => pair,
            Err(e) => {
                error!("configuration reload failed, keeping previous: {e:#}");
                return;
            }
        };
        if let Err(e) = config.validate() {
            error!("reloaded configuration invalid, keeping previous: {e:#}");
            return;
        }

        info!(
            whitelist_entries = whitelist.len(),
            syn_threshold = config.syn_threshold,
            "configuration reloaded"
        );
        self.snapshot.store(Arc::new(EngineSnapshot { config, whitelist }));
        self.purge_whitelisted();
    }

    /// Sources that became trusted on this reload must leave the tracker,
    /// and blocked ones must leave the kernel set too.
    fn purge_whitelisted(&self) {
        let snap = self.snapshot.load();
        let candidates: Vec<_> = {
            let tracker = self.tracker.read().unwrap();
            tracker
                .keys()
                .into_iter()
                .filter(|a| snap.whitelist.contains(*a))
                .collect()
        };

        for addr in candidates {
            let was_blocked = {
                let mut tracker = self.tracker.write().unwrap();
                let was_blocked = tracker.get(addr).map(|r| r.blocked).unwrap_or(false);
                tracker.remove(addr);
                was_blocked
            };
            if was_blocked {
                if let Err(e) = self.blockset.remove(addr) {
                    warn!("failed to unblock newly whitelisted {addr}: {e}");
                } else {
                    self.sink.emit(Event::Unblocked { addr });
                }
            }
        }
    }
}
