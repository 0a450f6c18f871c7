//! SYN-flood detection engine.
//!
//! Everything between the packet sources and the kernel block set: the
//! monotonic clock, the CIDR whitelist, the capacity-bounded per-source
//! tracker, the half-open socket probe, the ipset driver, the per-packet
//! detection pipeline, the expiration sweeper, and the supervisor that
//! wires them together under signal control. The binary crate owns the
//! configuration file, CLI and metrics log on top of this.

pub mod blockset;
pub mod clock;
pub mod config;
pub mod conntrack;
pub mod counters;
pub mod daemon;
pub mod events;
pub mod netlink;
pub mod nfqueue;
pub mod pipeline;
pub mod rawsock;
pub mod source;
pub mod sweeper;
pub mod tracker;
pub mod whitelist;

pub use blockset::{BlockSet, IpsetDriver};
pub use config::DetectorConfig;
pub use conntrack::{HalfOpenProbe, ProcTcpProbe};
pub use counters::{Counters, CountersSnapshot};
pub use daemon::{Daemon, ReloadFn};
pub use events::{Event, EventSink};
pub use nfqueue::NfqueueSource;
pub use pipeline::EngineSnapshot;
pub use rawsock::RawSockSource;
pub use source::SynSource;
pub use whitelist::Whitelist;
