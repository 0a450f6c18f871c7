//! `synwarden status` — show the most recent snapshot from the metrics log.
//!
//! Reads the last line of the metrics JSONL log and prints a static one-shot
//! summary, plus the tail of the events log. Use this to check on the
//! running daemon without touching it.

use anyhow::Result;
use chrono::{TimeZone, Utc};
use std::path::Path;

use crate::config::DaemonConfig;

/// Events shown from the tail of the events log.
const EVENT_TAIL: usize = 10;

pub fn run(config_path: &Path) -> Result<()> {
    let cfg = DaemonConfig::load(config_path)?;

    let content = match std::fs::read_to_string(&cfg.metrics_log) {
        Ok(c) => c,
        Err(_) => {
            eprintln!("No metrics log found at {}.", cfg.metrics_log.display());
            eprintln!("Start the daemon first:  synwarden run");
            return Ok(());
        }
    };

    let line = match content.lines().filter(|l| !l.is_empty()).last() {
        Some(l) => l,
        None => {
            eprintln!("Metrics log is empty — daemon may just be starting.");
            return Ok(());
        }
    };

    let entry: serde_json::Value = serde_json::from_str(line)?;
    let ts = entry["ts"].as_u64().unwrap_or(0) as i64;
    let time_str = Utc
        .timestamp_opt(ts, 0)
        .single()
        .map(|d| d.format("%Y-%m-%d %H:%M:%S UTC").to_string())
        .unwrap_or_else(|| "unknown".into());

    let started_at = entry["started_at"].as_u64().unwrap_or(0) as i64;
    let uptime_str = if started_at > 0 {
        format_uptime((ts - started_at).max(0) as u64)
    } else {
        "—".into()
    };

    let width = 64;
    println!("{:=<width$}", "");
    println!("{:^width$}", format!(" SYNWARDEN STATUS  {} ", time_str));
    println!("{:=<width$}", "");
    println!("  Uptime: {}", uptime_str);
    println!();

    let counter = |key: &str| entry[key].as_u64().unwrap_or(0);
    println!("  {:<28}{:>12}", "total packets", counter("total_packets"));
    println!("  {:<28}{:>12}", "SYN packets", counter("syn_packets"));
    println!("  {:<28}{:>12}", "whitelist hits", counter("whitelist_hits"));
    println!("  {:<28}{:>12}", "detections (blocked)", counter("detections"));
    println!(
        "  {:<28}{:>12}",
        "suspicious (not confirmed)",
        counter("false_positives")
    );
    println!(
        "  {:<28}{:>12}",
        "currently blocked",
        counter("blocked_current")
    );
    println!(
        "  {:<28}{:>12}",
        "tracked sources",
        counter("tracker_entries")
    );
    println!(
        "  {:<28}{:>12}",
        "tracked blocked",
        counter("tracker_blocked")
    );
    println!(
        "  {:<28}{:>12}",
        "malformed packets",
        counter("malformed_packets")
    );
    println!("  {:<28}{:>12}", "events dropped", counter("events_dropped"));
    println!("{:-<width$}", "");

    if let Ok(events) = std::fs::read_to_string(&cfg.events_log) {
        let lines: Vec<&str> = events.lines().filter(|l| !l.is_empty()).collect();
        if !lines.is_empty() {
            println!();
            println!("RECENT EVENTS (last {}):", EVENT_TAIL.min(lines.len()));
            for line in lines.iter().rev().take(EVENT_TAIL).rev() {
                match serde_json::from_str::<serde_json::Value>(line) {
                    Ok(ev) => println!(
                        "  {}  {:<12} {}",
                        ev["ts"].as_str().unwrap_or("?"),
                        ev["event"].as_str().unwrap_or("?"),
                        ev["addr"].as_str().unwrap_or("")
                    ),
                    Err(_) => println!("  {}", line),
                }
            }
        }
    }

    println!();
    println!("Log: {}", cfg.metrics_log.display());
    Ok(())
}

fn format_uptime(secs: u64) -> String {
    let h = secs / 3600;
    let m = (secs % 3600) / 60;
    let s = secs % 60;
    if h > 0 {
        format!("{}h {}m {}s", h, m, s)
    } else if m > 0 {
        format!("{}m {}s", m, s)
    } else {
        format!("{}s", s)
    }
}
