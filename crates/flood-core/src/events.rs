//! Structured decision events and their sink.
//!
//! Every consequential decision produces one [`Event`]. The hot path hands
//! events to [`EventSink::emit`], which logs them and forwards them over a
//! bounded channel to a writer thread that appends JSONL; a full channel
//! drops the event and bumps a counter so the packet loop never blocks.

use crossbeam_channel::{Receiver, Sender, TrySendError};
use serde::Serialize;
use std::fs::OpenOptions;
use std::io::{BufWriter, Write};
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::atomic::Ordering::Relaxed;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use tracing::{debug, info, warn};

use crate::counters::Counters;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Event {
    /// SYN short-circuited by the whitelist; no tracker state touched.
    Whitelisted { addr: Ipv4Addr },
    /// Threshold crossed but the kernel's half-open count did not confirm.
    Suspicious {
        addr: Ipv4Addr,
        syn_count: u32,
        half_open: u32,
    },
    /// Confirmed attack; the address was added to the kernel block set.
    Blocked {
        addr: Ipv4Addr,
        syn_count: u32,
        half_open: u32,
    },
    /// Block expired and was removed from the kernel set by the sweeper.
    Unblocked { addr: Ipv4Addr },
}

/// Wire form written to the events log: the event plus a wall-clock stamp.
#[derive(Serialize)]
struct EventLine<'a> {
    ts: String,
    #[serde(flatten)]
    event: &'a Event,
}

pub struct EventSink {
    tx: Sender<Event>,
    counters: Arc<Counters>,
}

impl EventSink {
    /// Sink over a caller-supplied channel; the caller owns the receiver.
    pub fn new(tx: Sender<Event>, counters: Arc<Counters>) -> Arc<Self> {
        Arc::new(Self { tx, counters })
    }

    /// Create the sink and its writer thread. `log_path = None` keeps the
    /// tracing output but skips the JSONL file.
    pub fn start(
        log_path: Option<PathBuf>,
        counters: Arc<Counters>,
    ) -> (Arc<Self>, JoinHandle<()>) {
        let (tx, rx) = crossbeam_channel::bounded::<Event>(4096);
        let handle = spawn_event_writer(rx, log_path);
        (Self::new(tx, counters), handle)
    }

    pub fn emit(&self, event: Event) {
        match &event {
            Event::Whitelisted { addr } => debug!(%addr, "whitelisted source"),
            Event::Suspicious {
                addr,
                syn_count,
                half_open,
            } => info!(%addr, syn_count, half_open, "suspicious source, not confirmed"),
            Event::Blocked {
                addr,
                syn_count,
                half_open,
            } => info!(%addr, syn_count, half_open, "attack confirmed, source blocked"),
            Event::Unblocked { addr } => info!(%addr, "block expired, source released"),
        }

        if let Err(TrySendError::Full(_)) = self.tx.try_send(event) {
            self.counters.events_dropped.fetch_add(1, Relaxed);
        }
    }
}

fn spawn_event_writer(rx: Receiver<Event>, log_path: Option<PathBuf>) -> JoinHandle<()> {
    std::thread::Builder::new()
        .name("event-writer".into())
        .spawn(move || {
            let mut writer = log_path.and_then(|path| {
                match OpenOptions::new().create(true).append(true).open(&path) {
                    Ok(f) => Some(BufWriter::new(f)),
                    Err(e) => {
                        warn!("events log {} unavailable: {}", path.display(), e);
                        None
                    }
                }
            });

            for event in &rx {
                let Some(w) = writer.as_mut() else { continue };
                let line = EventLine {
                    ts: chrono::Utc::now().to_rfc3339(),
                    event: &event,
                };
                if let Ok(json) = serde_json::to_string(&line) {
                    if writeln!(w, "{}", json).and_then(|_| w.flush()).is_err() {
                        // Disk trouble; stop writing but keep draining so the
                        // channel never backs up into the packet path.
                        writer = None;
                    }
                }
            }
        })
        .expect("failed to spawn event-writer thread")
}

// ───────────────────────────────────────────────────────────────────────────
// Rate-limited warning logs
// ───────────────────────────────────────────────────────────────────────────

/// Levels subject to the per-minute cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitedLevel {
    Warn,
    Error,
}

/// Outcome of a [`LogLimiter::check`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Under the cap; log normally.
    Log,
    /// Window rolled over with suppressed lines; log, prefixed by a summary
    /// of how many lines the previous window swallowed.
    LogWithSummary(u64),
    /// Over the cap for this window; drop the line.
    Suppress,
}

struct LevelWindow {
    window_start: u64,
    logged: u32,
    suppressed: u64,
}

/// Caps warn-and-above log lines to 100 per minute per level.
pub struct LogLimiter {
    windows: Mutex<[LevelWindow; 2]>,
}

const MAX_PER_WINDOW: u32 = 100;
const WINDOW_NS: u64 = 60_000_000_000;

impl LogLimiter {
    pub fn new() -> Self {
        Self {
            windows: Mutex::new([
                LevelWindow {
                    window_start: 0,
                    logged: 0,
                    suppressed: 0,
                },
                LevelWindow {
                    window_start: 0,
                    logged: 0,
                    suppressed: 0,
                },
            ]),
        }
    }

    pub fn check(&self, level: LimitedLevel, now_ns: u64) -> Verdict {
        let idx = match level {
            LimitedLevel::Warn => 0,
            LimitedLevel::Error => 1,
        };
        let mut windows = self.windows.lock().unwrap();
        let w = &mut windows[idx];

        if now_ns.saturating_sub(w.window_start) > WINDOW_NS {
            let suppressed = w.suppressed;
            w.window_start = now_ns;
            w.logged = 1;
            w.suppressed = 0;
            return if suppressed > 0 {
                Verdict::LogWithSummary(suppressed)
            } else {
                Verdict::Log
            };
        }

        if w.logged < MAX_PER_WINDOW {
            w.logged += 1;
            Verdict::Log
        } else {
            w.suppressed += 1;
            Verdict::Suppress
        }
    }

    /// Log a transient-failure warning, honoring the cap.
    pub fn warn(&self, now_ns: u64, msg: &str) {
        match self.check(LimitedLevel::Warn, now_ns) {
            Verdict::Log => warn!("{}", msg),
            Verdict::LogWithSummary(n) => {
                warn!("{} warning(s) suppressed in the last minute", n);
                warn!("{}", msg);
            }
            Verdict::Suppress => {}
        }
    }
}

impl Default for LogLimiter {
    fn default() -> Self {
        Self::new()
    }
}
