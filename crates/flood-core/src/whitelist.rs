//! Trusted-source whitelist.
//!
//! A set of IPv4 CIDR prefixes loaded from a text file: one entry per line,
//! `a.b.c.d` or `a.b.c.d/len`, `#` comments and blank lines ignored.
//! Malformed lines are skipped and counted, never fatal. Lookup is the OR
//! over all entries; overlapping prefixes are fine. The tree is immutable
//! after construction — reload builds a new one and swaps the shared pointer.

use anyhow::{Context, Result};
use ipnet::Ipv4Net;
use std::net::Ipv4Addr;
use std::path::Path;

#[derive(Debug, Clone, Default)]
pub struct Whitelist {
    entries: Vec<Ipv4Net>,
}

/// What a build pass saw: entries kept and lines it had to skip.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParseStats {
    pub entries: usize,
    pub skipped: usize,
}

impl Whitelist {
    /// Build from text lines. Never fails: malformed lines are counted in
    /// the returned stats and logged once per pass by the caller.
    pub fn from_lines<'a, I>(lines: I) -> (Self, ParseStats)
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut entries = Vec::new();
        let mut skipped = 0usize;

        for raw in lines {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            match parse_entry(line) {
                Some(net) => entries.push(net),
                None => skipped += 1,
            }
        }

        let stats = ParseStats {
            entries: entries.len(),
            skipped,
        };
        (Self { entries }, stats)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<(Self, ParseStats)> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read whitelist file: {}", path.display()))?;
        Ok(Self::from_lines(text.lines()))
    }

    /// True iff any stored prefix covers `addr`. Deterministic, side-effect
    /// free; an empty whitelist answers false for every address.
    #[inline]
    pub fn contains(&self, addr: Ipv4Addr) -> bool {
        self.entries.iter().any(|net| net.contains(&addr))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Parse one whitelist line: a CIDR, or a bare address meaning `/32`.
fn parse_entry(line: &str) -> Option<Ipv4Net> {
    if line.contains('/') {
        line.parse::<Ipv4Net>().ok()
    } else {
        line.parse::<Ipv4Addr>()
            .ok()
            .map(|addr| Ipv4Net::new(addr, 32).expect("/32 is always a valid prefix length"))
    }
}
