//! Per-source SYN tracker.
//!
//! A fixed-bucket hash table keyed by source address, capacity-bounded with
//! LRU eviction on `last_seen`. Bucket count is a power of two fixed at
//! creation; the address key is scrambled through a SplitMix64-style
//! finalizer so sequential or patterned sources spread across buckets
//! instead of piling into one chain.
//!
//! The table itself is not synchronized — the owner wraps it in an `RwLock`
//! and the record references returned here are only valid while that guard
//! is held.

use std::net::Ipv4Addr;

/// One tracked source address.
///
/// Records are created on SYN observation only, so `syn_count >= 1` for any
/// record the pipeline has finished touching, and `window_start <= last_seen`
/// always holds. `block_expiry` is meaningful only while `blocked` is true.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackerRecord {
    pub key: Ipv4Addr,
    /// SYNs attributed to the current window.
    pub syn_count: u32,
    /// Monotonic-ns timestamp of the first SYN in the current window.
    pub window_start: u64,
    /// Monotonic-ns timestamp of the most recent SYN; drives LRU eviction.
    pub last_seen: u64,
    pub blocked: bool,
    /// Monotonic-ns timestamp at which the block is eligible for release.
    pub block_expiry: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackerStats {
    pub total: u32,
    pub blocked: u32,
}

pub struct TrackerTable {
    buckets: Vec<Vec<TrackerRecord>>,
    bucket_mask: u64,
    max_entries: u32,
    len: u32,
}

/// SplitMix64-style finalizer. Not the identity: adjacent addresses must not
/// land in adjacent buckets.
#[inline]
fn scramble(key: u32) -> u64 {
    let mut x = key as u64;
    x ^= x >> 30;
    x = x.wrapping_mul(0xbf58476d1ce4e5b9);
    x ^= x >> 27;
    x = x.wrapping_mul(0x94d049bb133111eb);
    x ^= x >> 31;
    x
}

impl TrackerTable {
    /// `bucket_count` must be a power of two (validated by config before the
    /// table is built).
    pub fn new(bucket_count: u32, max_entries: u32) -> Self {
        debug_assert!(bucket_count.is_power_of_two());
        debug_assert!(max_entries > 0);
        Self {
            buckets: (0..bucket_count).map(|_| Vec::new()).collect(),
            bucket_mask: bucket_count as u64 - 1,
            max_entries,
            len: 0,
        }
    }

    #[inline]
    fn bucket_index(&self, addr: Ipv4Addr) -> usize {
        (scramble(u32::from(addr)) & self.bucket_mask) as usize
    }

    /// Look up `addr`, creating a fresh record if absent. Updates `last_seen`
    /// on an existing record. At capacity, the record with the minimum
    /// `last_seen` is evicted first (ties broken by bucket scan order, so
    /// eviction is deterministic within a run).
    pub fn get_or_create(&mut self, addr: Ipv4Addr, now: u64) -> &mut TrackerRecord {
        let idx = self.bucket_index(addr);
        let pos = self.buckets[idx].iter().position(|r| r.key == addr);
        if let Some(pos) = pos {
            let rec = &mut self.buckets[idx][pos];
            rec.last_seen = now;
            return rec;
        }

        if self.len >= self.max_entries {
            self.evict_lru();
        }

        self.buckets[idx].push(TrackerRecord {
            key: addr,
            syn_count: 0,
            window_start: now,
            last_seen: now,
            blocked: false,
            block_expiry: 0,
        });
        self.len += 1;
        self.buckets[idx]
            .last_mut()
            .expect("bucket push cannot leave the bucket empty")
    }

    /// Look up `addr` without creating.
    pub fn get(&mut self, addr: Ipv4Addr) -> Option<&mut TrackerRecord> {
        let idx = self.bucket_index(addr);
        self.buckets[idx].iter_mut().find(|r| r.key == addr)
    }

    /// Remove `addr`; returns whether a record existed.
    pub fn remove(&mut self, addr: Ipv4Addr) -> bool {
        let idx = self.bucket_index(addr);
        let pos = self.buckets[idx].iter().position(|r| r.key == addr);
        match pos {
            Some(pos) => {
                self.buckets[idx].swap_remove(pos);
                self.len -= 1;
                true
            }
            None => false,
        }
    }

    /// Fill `out` with at most `cap` addresses whose blocks have expired
    /// (`blocked && block_expiry <= now`). Pure read; the caller drives the
    /// subsequent state transitions.
    pub fn expired_blocks(&self, now: u64, out: &mut Vec<Ipv4Addr>, cap: usize) -> usize {
        out.clear();
        'scan: for bucket in &self.buckets {
            for rec in bucket {
                if rec.blocked && rec.block_expiry <= now {
                    out.push(rec.key);
                    if out.len() >= cap {
                        break 'scan;
                    }
                }
            }
        }
        out.len()
    }

    /// Destroy all records.
    pub fn clear(&mut self) {
        for bucket in &mut self.buckets {
            bucket.clear();
        }
        self.len = 0;
    }

    pub fn stats(&self) -> TrackerStats {
        let blocked = self
            .buckets
            .iter()
            .flatten()
            .filter(|r| r.blocked)
            .count() as u32;
        TrackerStats {
            total: self.len,
            blocked,
        }
    }

    /// Addresses of all live records, in bucket scan order. Used by the
    /// reload path to purge sources that became whitelisted.
    pub fn keys(&self) -> Vec<Ipv4Addr> {
        self.buckets.iter().flatten().map(|r| r.key).collect()
    }

    /// Evict the record with the minimum `last_seen`. First minimum in
    /// bucket scan order wins ties.
    fn evict_lru(&mut self) {
        let mut victim: Option<(usize, usize, u64)> = None;
        for (bi, bucket) in self.buckets.iter().enumerate() {
            for (ri, rec) in bucket.iter().enumerate() {
                let better = match victim {
                    None => true,
                    Some((_, _, seen)) => rec.last_seen < seen,
                };
                if better {
                    victim = Some((bi, ri, rec.last_seen));
                }
            }
        }
        if let Some((bi, ri, _)) = victim {
            self.buckets[bi].swap_remove(ri);
            self.len -= 1;
        }
    }
}
