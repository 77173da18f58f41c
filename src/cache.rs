//! Short-lived response cache with TTL-based expiration.
//!
//! Stores prepared answer records keyed by (normalized name, qtype) in a
//! 2-level map (qtype -> name -> entry). Expiry is lazy: a lookup that finds
//! a stale entry removes it, there is no background sweep. An optional entry
//! cap bounds growth; a full table first purges expired entries, then evicts
//! the soonest-expiring one.

use rustc_hash::FxHashMap;
use std::sync::RwLock;
use std::time::{Duration, Instant};

use crate::dns::DnsRecord;

struct CacheEntry {
    answers: Vec<DnsRecord>,
    expires_at: Instant,
}

/// TTL-based cache of prepared answers.
pub struct ResponseCache {
    entries: RwLock<FxHashMap<u16, FxHashMap<String, CacheEntry>>>,
    /// Zero means unbounded.
    max_entries: usize,
}

impl ResponseCache {
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: RwLock::new(FxHashMap::default()),
            max_entries,
        }
    }

    /// Look up cached answers for a query.
    pub fn get(&self, name: &str, qtype: u16) -> Option<Vec<DnsRecord>> {
        self.get_at(name, qtype, Instant::now())
    }

    /// `get` with an explicit clock, for deterministic tests.
    pub fn get_at(&self, name: &str, qtype: u16, now: Instant) -> Option<Vec<DnsRecord>> {
        {
            let Ok(entries) = self.entries.read() else {
                return None;
            };
            if let Some(inner) = entries.get(&qtype) {
                if let Some(entry) = inner.get(name) {
                    if now < entry.expires_at {
                        return Some(entry.answers.clone());
                    }
                }
            }
        }

        // Stale hit: re-check under the write lock and drop it
        let Ok(mut entries) = self.entries.write() else {
            return None;
        };
        if let Some(inner) = entries.get_mut(&qtype) {
            if let Some(entry) = inner.get(name) {
                if now >= entry.expires_at {
                    inner.remove(name);
                }
            }
        }
        None
    }

    /// Store answers for a query, overwriting any existing entry.
    pub fn put(&self, name: &str, qtype: u16, answers: Vec<DnsRecord>, ttl: Duration) {
        self.put_at(name, qtype, answers, ttl, Instant::now())
    }

    pub fn put_at(
        &self,
        name: &str,
        qtype: u16,
        answers: Vec<DnsRecord>,
        ttl: Duration,
        now: Instant,
    ) {
        let Ok(mut entries) = self.entries.write() else {
            return;
        };

        let existing = entries
            .get(&qtype)
            .is_some_and(|inner| inner.contains_key(name));
        if !existing && self.max_entries > 0 && total_len(&entries) >= self.max_entries {
            purge_expired(&mut entries, now);
            if total_len(&entries) >= self.max_entries {
                evict_soonest_expiring(&mut entries);
            }
        }

        let inner = entries.entry(qtype).or_default();
        inner.insert(
            name.to_string(),
            CacheEntry {
                answers,
                expires_at: now + ttl,
            },
        );
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|e| total_len(&e)).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn total_len(entries: &FxHashMap<u16, FxHashMap<String, CacheEntry>>) -> usize {
    entries.values().map(|inner| inner.len()).sum()
}

fn purge_expired(entries: &mut FxHashMap<u16, FxHashMap<String, CacheEntry>>, now: Instant) {
    for inner in entries.values_mut() {
        inner.retain(|_, entry| now < entry.expires_at);
    }
}

fn evict_soonest_expiring(entries: &mut FxHashMap<u16, FxHashMap<String, CacheEntry>>) {
    let victim = entries
        .iter()
        .flat_map(|(qtype, inner)| {
            inner
                .iter()
                .map(|(name, entry)| (*qtype, name.clone(), entry.expires_at))
        })
        .min_by_key(|(_, _, expires_at)| *expires_at);
    if let Some((qtype, name, _)) = victim {
        if let Some(inner) = entries.get_mut(&qtype) {
            inner.remove(&name);
        }
    }
}
