//! `synwarden run` — wire the engine together and drive it.
//!
//! Builds every component from the configuration file, starts the metrics
//! snapshot thread, and hands control to the core daemon until a shutdown
//! signal lands. Fatal init errors propagate out and exit non-zero; the
//! kernel address set is left in place on exit so blocks survive restarts.

use anyhow::{Context, Result};
use flood_core::{
    BlockSet, Counters, CountersSnapshot, Daemon, EngineSnapshot, EventSink, HalfOpenProbe,
    IpsetDriver, NfqueueSource, ProcTcpProbe, RawSockSource, ReloadFn, SynSource, Whitelist,
};
use serde::Serialize;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering::Relaxed};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{info, warn};

use crate::config::{DaemonConfig, IngestMode};

#[derive(Serialize)]
struct MetricsLine {
    ts: u64,
    started_at: u64,
    #[serde(flatten)]
    counters: CountersSnapshot,
}

pub fn run(config_path: &Path) -> Result<()> {
    let cfg = DaemonConfig::load(config_path)?;
    let detector = cfg.detector_config();

    let (whitelist, stats) = Whitelist::from_file(&cfg.whitelist_path)?;
    if stats.skipped > 0 {
        warn!(
            skipped = stats.skipped,
            path = %cfg.whitelist_path.display(),
            "whitelist has malformed lines"
        );
    }
    info!(
        entries = stats.entries,
        threshold = detector.syn_threshold,
        window_ms = detector.window_ms,
        "synwarden starting"
    );

    let counters = Counters::new();
    let (sink, event_writer) = EventSink::start(Some(cfg.events_log.clone()), counters.clone());

    let blockset: Arc<dyn BlockSet> = Arc::new(IpsetDriver::init(
        &detector.set_name,
        detector.block_duration_s,
        cfg.blockset.max_elements,
    )?);
    let probe: Arc<dyn HalfOpenProbe> = Arc::new(ProcTcpProbe::new());

    let source: Box<dyn SynSource> = match cfg.ingest.mode {
        IngestMode::Nfqueue => Box::new(NfqueueSource::new(cfg.ingest.queue_num, counters.clone())?),
        IngestMode::Rawsock => {
            Box::new(RawSockSource::new(&cfg.ingest.interface, counters.clone())?)
        }
    };

    let metrics_stop = Arc::new(AtomicBool::new(false));
    let metrics_thread = spawn_metrics_writer(
        cfg.metrics_log.clone(),
        cfg.metrics_interval_s,
        counters.clone(),
        metrics_stop.clone(),
    );

    let daemon = Daemon::new(
        EngineSnapshot {
            config: detector,
            whitelist,
        },
        blockset,
        probe,
        counters,
        sink.clone(),
    );

    let reload_path = config_path.to_path_buf();
    let reload: ReloadFn = Box::new(move || {
        let cfg = DaemonConfig::load(&reload_path)?;
        let (whitelist, stats) = Whitelist::from_file(&cfg.whitelist_path)?;
        if stats.skipped > 0 {
            warn!(
                skipped = stats.skipped,
                "whitelist has malformed lines after reload"
            );
        }
        Ok((cfg.detector_config(), whitelist))
    });

    let result = daemon.run(source, reload);

    metrics_stop.store(true, Relaxed);
    let _ = metrics_thread.join();
    // Dropping the last sink closes the event channel; the writer drains
    // whatever is left and exits.
    drop(sink);
    let _ = event_writer.join();

    info!("synwarden stopped");
    result
}

/// `synwarden check` — validate config and whitelist without starting.
pub fn check(config_path: &Path) -> Result<()> {
    let cfg = DaemonConfig::load(config_path)?;
    let (_, stats) = Whitelist::from_file(&cfg.whitelist_path)
        .with_context(|| "whitelist check failed".to_string())?;
    println!(
        "config ok: {} ({} whitelist entries, {} malformed lines skipped)",
        config_path.display(),
        stats.entries,
        stats.skipped
    );
    Ok(())
}

/// Append a counter snapshot to the metrics log every `interval_s` seconds.
/// The log is truncated at startup so `status` reflects the current run.
fn spawn_metrics_writer(
    log_path: PathBuf,
    interval_s: u64,
    counters: Arc<Counters>,
    stop: Arc<AtomicBool>,
) -> JoinHandle<()> {
    std::thread::Builder::new()
        .name("metrics-writer".into())
        .spawn(move || {
            let started_at = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs();

            if let Ok(f) = std::fs::File::create(&log_path) {
                drop(f);
            }

            while !stop.load(Relaxed) {
                for _ in 0..interval_s {
                    if stop.load(Relaxed) {
                        return;
                    }
                    std::thread::sleep(Duration::from_secs(1));
                }

                let ts = SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .unwrap_or_default()
                    .as_secs();
                let line = MetricsLine {
                    ts,
                    started_at,
                    counters: counters.snapshot(),
                };

                if let Ok(mut file) = OpenOptions::new().create(true).append(true).open(&log_path) {
                    if let Ok(json) = serde_json::to_string(&line) {
                        let _ = writeln!(file, "{}", json);
                    }
                }
            }
        })
        .expect("failed to spawn metrics-writer thread")
}
