//! Half-open socket probe.
//!
//! Confirms a suspected flood against the kernel's own TCP socket table:
//! `/proc/net/tcp` rows in state `SYN_RECV` are connections that got our
//! SYN-ACK and never completed the handshake. The table dumps addresses as
//! native-endian hex of the big-endian value, so every parsed address (and
//! the filter input) is normalized to `Ipv4Addr` before comparison — one
//! canonical domain for both the filtered and unfiltered paths.

use std::net::Ipv4Addr;
use std::path::PathBuf;
use tracing::warn;

/// TCP_SYN_RECV in the kernel's state column.
const STATE_SYN_RECV: u8 = 0x03;

/// Counts kernel sockets in the half-open state.
pub trait HalfOpenProbe: Send + Sync {
    /// Count half-open sockets, optionally only those whose peer address
    /// equals `filter`. Probe failure surfaces as 0, never as an error.
    fn count_half_open(&self, filter: Option<Ipv4Addr>) -> u32;
}

/// Probe backed by the procfs TCP socket table.
pub struct ProcTcpProbe {
    path: PathBuf,
}

impl ProcTcpProbe {
    pub fn new() -> Self {
        Self {
            path: PathBuf::from("/proc/net/tcp"),
        }
    }

    /// Probe an alternate table path (tests point this at a fixture file).
    pub fn with_path<P: Into<PathBuf>>(path: P) -> Self {
        Self { path: path.into() }
    }
}

impl Default for ProcTcpProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl HalfOpenProbe for ProcTcpProbe {
    fn count_half_open(&self, filter: Option<Ipv4Addr>) -> u32 {
        let text = match std::fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(e) => {
                warn!("cannot read {}: {}", self.path.display(), e);
                return 0;
            }
        };
        count_rows(&text, filter)
    }
}

fn count_rows(table: &str, filter: Option<Ipv4Addr>) -> u32 {
    let mut count = 0u32;
    // First line is the column header.
    for line in table.lines().skip(1) {
        let Some((peer, state)) = parse_row(line) else {
            continue;
        };
        if state != STATE_SYN_RECV {
            continue;
        }
        if filter.map_or(true, |f| f == peer) {
            count += 1;
        }
    }
    count
}

/// Extract (peer address, state) from one socket-table row; `None` for rows
/// that do not parse.
fn parse_row(line: &str) -> Option<(Ipv4Addr, u8)> {
    let mut fields = line.split_whitespace();
    let _sl = fields.next()?;
    let _local = fields.next()?;
    let rem = fields.next()?;
    let st = fields.next()?;

    let (addr_hex, _port_hex) = rem.split_once(':')?;
    if addr_hex.len() != 8 {
        return None;
    }
    let raw = u32::from_str_radix(addr_hex, 16).ok()?;
    // The kernel prints the big-endian address value as a native-endian
    // integer; reinterpreting the native bytes recovers the octets on
    // either host endianness.
    let peer = Ipv4Addr::from(raw.to_ne_bytes());

    let state = u8::from_str_radix(st, 16).ok()?;
    Some((peer, state))
}
