//! `synwarden.toml` configuration for the daemon.

use anyhow::{bail, Context, Result};
use flood_core::DetectorConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Top-level daemon configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DaemonConfig {
    /// Whitelist file: one CIDR per line, `#` comments allowed.
    #[serde(default = "DaemonConfig::default_whitelist_path")]
    pub whitelist_path: PathBuf,
    /// Structured decision events are appended here as JSONL.
    #[serde(default = "DaemonConfig::default_events_log")]
    pub events_log: PathBuf,
    /// Counter snapshots are appended here as JSONL; `synwarden status`
    /// reads this file.
    #[serde(default = "DaemonConfig::default_metrics_log")]
    pub metrics_log: PathBuf,
    /// Seconds between counter snapshots.
    #[serde(default = "DaemonConfig::default_metrics_interval")]
    pub metrics_interval_s: u64,

    #[serde(default)]
    pub detector: DetectorSection,
    #[serde(default)]
    pub ingest: IngestSection,
    #[serde(default)]
    pub blockset: BlocksetSection,
}

/// Detection thresholds and table sizing.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DetectorSection {
    /// A window's SYN count must exceed this (strictly) to suspect an attack.
    #[serde(default = "DetectorSection::default_syn_threshold")]
    pub syn_threshold: u32,
    /// Sliding window length in milliseconds.
    #[serde(default = "DetectorSection::default_window_ms")]
    pub window_ms: u32,
    /// How long a confirmed attacker stays blocked, in seconds.
    #[serde(default = "DetectorSection::default_block_duration_s")]
    pub block_duration_s: u32,
    /// Most source addresses tracked at once; the least recently seen falls
    /// out first.
    #[serde(default = "DetectorSection::default_max_tracked_ips")]
    pub max_tracked_ips: u32,
    /// Tracker bucket count; must be a power of two.
    #[serde(default = "DetectorSection::default_hash_buckets")]
    pub hash_buckets: u32,
    /// Seconds between expired-block sweeps.
    #[serde(default = "DetectorSection::default_sweep_interval_s")]
    pub sweep_interval_s: u32,
}

impl DetectorSection {
    fn default_syn_threshold() -> u32 {
        100
    }
    fn default_window_ms() -> u32 {
        1000
    }
    fn default_block_duration_s() -> u32 {
        300
    }
    fn default_max_tracked_ips() -> u32 {
        10_000
    }
    fn default_hash_buckets() -> u32 {
        1024
    }
    fn default_sweep_interval_s() -> u32 {
        5
    }
}

impl Default for DetectorSection {
    fn default() -> Self {
        Self {
            syn_threshold: Self::default_syn_threshold(),
            window_ms: Self::default_window_ms(),
            block_duration_s: Self::default_block_duration_s(),
            max_tracked_ips: Self::default_max_tracked_ips(),
            hash_buckets: Self::default_hash_buckets(),
            sweep_interval_s: Self::default_sweep_interval_s(),
        }
    }
}

/// Which packet source feeds the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum IngestMode {
    /// netfilter queue (primary); the operator redirects inbound SYNs into
    /// the numbered queue.
    Nfqueue,
    /// Raw packet socket with a kernel SYN filter (fallback); no queue rule
    /// needed, but no verdict channel either.
    Rawsock,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct IngestSection {
    #[serde(default = "IngestSection::default_mode")]
    pub mode: IngestMode,
    /// Queue number (nfqueue mode).
    #[serde(default)]
    pub queue_num: u16,
    /// Interface to listen on (rawsock mode); empty means all interfaces.
    #[serde(default)]
    pub interface: String,
}

impl IngestSection {
    fn default_mode() -> IngestMode {
        IngestMode::Nfqueue
    }
}

impl Default for IngestSection {
    fn default() -> Self {
        Self {
            mode: Self::default_mode(),
            queue_num: 0,
            interface: String::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BlocksetSection {
    /// Name of the kernel address set; the operator's drop rule matches it.
    #[serde(default = "BlocksetSection::default_set_name")]
    pub set_name: String,
    /// Capacity passed to the kernel at set creation.
    #[serde(default = "BlocksetSection::default_max_elements")]
    pub max_elements: u32,
}

impl BlocksetSection {
    fn default_set_name() -> String {
        "synwarden-block".into()
    }
    fn default_max_elements() -> u32 {
        65_536
    }
}

impl Default for BlocksetSection {
    fn default() -> Self {
        Self {
            set_name: Self::default_set_name(),
            max_elements: Self::default_max_elements(),
        }
    }
}

impl DaemonConfig {
    fn default_whitelist_path() -> PathBuf {
        "/etc/synwarden/whitelist.txt".into()
    }
    fn default_events_log() -> PathBuf {
        "/var/log/synwarden-events.jsonl".into()
    }
    fn default_metrics_log() -> PathBuf {
        "/var/log/synwarden-metrics.jsonl".into()
    }
    fn default_metrics_interval() -> u64 {
        5
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let cfg: Self = toml::from_str(&text)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// The typed snapshot the engine consumes.
    pub fn detector_config(&self) -> DetectorConfig {
        DetectorConfig {
            syn_threshold: self.detector.syn_threshold,
            window_ms: self.detector.window_ms,
            block_duration_s: self.detector.block_duration_s,
            max_tracked_ips: self.detector.max_tracked_ips,
            hash_buckets: self.detector.hash_buckets,
            sweep_interval_s: self.detector.sweep_interval_s,
            set_name: self.blockset.set_name.clone(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        self.detector_config().validate()?;
        if self.blockset.max_elements == 0 {
            bail!("blockset.max_elements must be > 0");
        }
        if self.metrics_interval_s == 0 {
            bail!("metrics_interval_s must be > 0");
        }
        Ok(())
    }

    /// The config `synwarden init` prints.
    pub fn default_example() -> Self {
        Self {
            whitelist_path: Self::default_whitelist_path(),
            events_log: Self::default_events_log(),
            metrics_log: Self::default_metrics_log(),
            metrics_interval_s: Self::default_metrics_interval(),
            detector: DetectorSection::default(),
            ingest: IngestSection::default(),
            blockset: BlocksetSection::default(),
        }
    }
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self::default_example()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_example_round_trips() {
        let example = DaemonConfig::default_example();
        let text = toml::to_string_pretty(&example).unwrap();
        let parsed: DaemonConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed.detector.syn_threshold, 100);
        assert_eq!(parsed.ingest.mode, IngestMode::Nfqueue);
        assert_eq!(parsed.blockset.set_name, "synwarden-block");
        assert!(parsed.validate().is_ok());
    }

    #[test]
    fn test_empty_file_gets_all_defaults() {
        let cfg: DaemonConfig = toml::from_str("").unwrap();
        assert_eq!(cfg.detector.window_ms, 1000);
        assert_eq!(cfg.metrics_interval_s, 5);
        assert!(cfg.ingest.interface.is_empty());
    }

    #[test]
    fn test_partial_override() {
        let cfg: DaemonConfig = toml::from_str(
            r#"
            [detector]
            syn_threshold = 40

            [ingest]
            mode = "rawsock"
            interface = "eth0"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.detector.syn_threshold, 40);
        assert_eq!(cfg.detector.window_ms, 1000);
        assert_eq!(cfg.ingest.mode, IngestMode::Rawsock);
        assert_eq!(cfg.ingest.interface, "eth0");
    }

    #[test]
    fn test_unknown_mode_rejected() {
        let result = toml::from_str::<DaemonConfig>(
            r#"
            [ingest]
            mode = "pcap"
            "#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_invalid_values_rejected() {
        let cfg: DaemonConfig = toml::from_str(
            r#"
            [detector]
            hash_buckets = 1000
            "#,
        )
        .unwrap();
        assert!(cfg.validate().is_err());

        let cfg: DaemonConfig = toml::from_str(
            r#"
            [blockset]
            set_name = ""
            "#,
        )
        .unwrap();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_load_from_file() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "[detector]").unwrap();
        writeln!(f, "syn_threshold = 25").unwrap();
        let cfg = DaemonConfig::load(f.path()).unwrap();
        assert_eq!(cfg.detector.syn_threshold, 25);
        assert_eq!(cfg.detector_config().syn_threshold, 25);
    }

    #[test]
    fn test_load_missing_file_errors() {
        assert!(DaemonConfig::load(Path::new("/nonexistent/synwarden.toml")).is_err());
    }
}
