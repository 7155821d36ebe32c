//! TTL-bounded IP -> domain cache fed by observed DNS responses.

use dashmap::DashMap;
use rustc_hash::FxBuildHasher;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

const MIN_TTL: Duration = Duration::from_secs(30);
const MAX_TTL: Duration = Duration::from_secs(3600);

struct CacheEntry {
    domain: String,
    expires_at: Instant,
}

/// Concurrent map of resolved addresses to the domain that produced them.
///
/// The cache is a hint: a `cleanup` racing a `put` may drop a fresh insert,
/// and that is acceptable. Per-key reads and writes are linearisable.
pub struct DomainCache {
    entries: DashMap<IpAddr, CacheEntry, FxBuildHasher>,
    queries_seen: AtomicU64,
    responses_seen: AtomicU64,
}

impl Default for DomainCache {
    fn default() -> Self {
        Self::new()
    }
}

impl DomainCache {
    pub fn new() -> Self {
        Self {
            entries: DashMap::with_hasher(FxBuildHasher),
            queries_seen: AtomicU64::new(0),
            responses_seen: AtomicU64::new(0),
        }
    }

    /// Insert a mapping, clamping `ttl_seconds` into `[30, 3600]`.
    pub fn put(&self, ip: IpAddr, domain: &str, ttl_seconds: u32) {
        let ttl = Duration::from_secs(u64::from(ttl_seconds)).clamp(MIN_TTL, MAX_TTL);
        self.entries.insert(
            ip,
            CacheEntry {
                domain: domain.to_string(),
                expires_at: Instant::now() + ttl,
            },
        );
    }

    /// Return the domain for `ip` if the entry is unexpired; an expired entry
    /// is removed on the way out.
    pub fn get(&self, ip: &IpAddr) -> Option<String> {
        let now = Instant::now();
        if let Some(entry) = self.entries.get(ip) {
            if entry.expires_at > now {
                return Some(entry.domain.clone());
            }
        } else {
            return None;
        }
        self.entries.remove_if(ip, |_, entry| entry.expires_at <= now);
        None
    }

    /// Drop every expired entry. Safe to call concurrently with `get`/`put`.
    pub fn cleanup(&self) {
        let now = Instant::now();
        self.entries.retain(|_, entry| entry.expires_at > now);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn record_query(&self) {
        self.queries_seen.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_response(&self) {
        self.responses_seen.fetch_add(1, Ordering::Relaxed);
    }

    pub fn queries_seen(&self) -> u64 {
        self.queries_seen.load(Ordering::Relaxed)
    }

    pub fn responses_seen(&self) -> u64 {
        self.responses_seen.load(Ordering::Relaxed)
    }

    #[cfg(test)]
    pub(crate) fn remaining_ttl(&self, ip: &IpAddr) -> Option<Duration> {
        self.entries
            .get(ip)
            .map(|entry| entry.expires_at.saturating_duration_since(Instant::now()))
    }

    #[cfg(test)]
    pub(crate) fn force_expire(&self, ip: &IpAddr) {
        if let Some(mut entry) = self.entries.get_mut(ip) {
            entry.expires_at = Instant::now() - Duration::from_secs(1);
        }
    }
}
