//! Fixed-size, zero-growth DNS cache: 256 entries, at most 8 addresses each,
//! oldest-expiring-first eviction when a lookup needs a slot and the table
//! is full.

use std::net::IpAddr;

/// Cache capacity, fixed at compile time to match the original prototype's
/// zero-allocation cache array.
pub const MAX_CACHE_ENTRIES: usize = 256;
/// Maximum addresses retained per hostname.
pub const MAX_ADDRESSES_PER_ENTRY: usize = 8;
/// Default time-to-live for a freshly stored entry.
pub const DEFAULT_CACHE_TTL_MS: u64 = 60_000;
/// Longest hostname this cache will store; longer names are rejected rather
/// than truncated.
pub const MAX_HOSTNAME_LEN: usize = 255;

/// A resolved socket address. `is_ipv6` is derived from the `IpAddr` variant
/// rather than stored, so it can never desync from the address it reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedAddress(pub IpAddr);

impl ResolvedAddress {
    /// True if this address is IPv6.
    pub fn is_ipv6(&self) -> bool {
        self.0.is_ipv6()
    }
}

#[derive(Clone)]
struct DnsCacheEntry {
    hostname: Box<str>,
    expires_at_ms: u64,
    addresses: [Option<ResolvedAddress>; MAX_ADDRESSES_PER_ENTRY],
    address_count: u8,
    valid: bool,
}

impl DnsCacheEntry {
    fn empty() -> DnsCacheEntry {
        DnsCacheEntry {
            hostname: Box::from(""),
            expires_at_ms: 0,
            addresses: [None; MAX_ADDRESSES_PER_ENTRY],
            address_count: 0,
            valid: false,
        }
    }
}

/// Error returned when a hostname or address list cannot be stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheInsertError {
    /// Hostname exceeds [`MAX_HOSTNAME_LEN`] bytes.
    HostnameTooLong,
}

/// A fixed 256-slot DNS cache with oldest-expiring eviction. All operations
/// are plain linear scans over the flat entry array; this is intentional —
/// the cache is confined to a single (reactor) thread and is never large
/// enough for a hash index to pay for itself.
pub struct DnsCache {
    entries: Box<[DnsCacheEntry; MAX_CACHE_ENTRIES]>,
    ttl_ms: u64,
    hits: u64,
    misses: u64,
}

impl DnsCache {
    /// Creates an empty cache with the given entry TTL.
    pub fn new(ttl_ms: u64) -> Self {
        DnsCache {
            entries: Box::new(std::array::from_fn(|_| DnsCacheEntry::empty())),
            ttl_ms,
            hits: 0,
            misses: 0,
        }
    }

    /// Looks up `hostname`, returning its cached addresses if present and
    /// not yet expired as of `now_ms`. Updates hit/miss counters.
    pub fn find(&mut self, hostname: &str, now_ms: u64) -> Option<Vec<ResolvedAddress>> {
        let hit = self.entries.iter().find(|e| {
            e.valid && e.expires_at_ms > now_ms && e.hostname.as_ref() == hostname
        });

        match hit {
            Some(entry) => {
                self.hits += 1;
                Some(
                    entry.addresses[..entry.address_count as usize]
                        .iter()
                        .filter_map(|a| *a)
                        .collect(),
                )
            }
            None => {
                self.misses += 1;
                None
            }
        }
    }

    /// Stores `addresses` for `hostname`, expiring at `now_ms + ttl_ms`.
    /// Only the first [`MAX_ADDRESSES_PER_ENTRY`] addresses are kept. Fails
    /// if the hostname is too long to store.
    pub fn store(
        &mut self,
        hostname: &str,
        addresses: &[ResolvedAddress],
        now_ms: u64,
    ) -> Result<(), CacheInsertError> {
        if hostname.len() > MAX_HOSTNAME_LEN {
            return Err(CacheInsertError::HostnameTooLong);
        }

        let slot = self.find_slot_for_insert(now_ms);
        let mut stored = [None; MAX_ADDRESSES_PER_ENTRY];
        let count = addresses.len().min(MAX_ADDRESSES_PER_ENTRY);
        stored[..count].copy_from_slice(&addresses[..count]);

        self.entries[slot] = DnsCacheEntry {
            hostname: hostname.into(),
            expires_at_ms: now_ms.saturating_add(self.ttl_ms),
            addresses: stored,
            address_count: count as u8,
            valid: true,
        };
        Ok(())
    }

    /// Finds a slot for a fresh insert: an invalid slot if one exists,
    /// otherwise the slot with the earliest expiration (oldest-expiring
    /// eviction), otherwise slot 0.
    fn find_slot_for_insert(&self, now_ms: u64) -> usize {
        if let Some(i) = self.entries.iter().position(|e| !e.valid) {
            return i;
        }
        if let Some(i) = self
            .entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.expires_at_ms <= now_ms)
            .min_by_key(|(_, e)| e.expires_at_ms)
            .map(|(i, _)| i)
        {
            return i;
        }
        self.entries
            .iter()
            .enumerate()
            .min_by_key(|(_, e)| e.expires_at_ms)
            .map(|(i, _)| i)
            .unwrap_or(0)
    }

    /// Invalidates every cached entry.
    pub fn clear(&mut self) {
        for entry in self.entries.iter_mut() {
            *entry = DnsCacheEntry::empty();
        }
    }

    /// Total cache hits since creation (or the last [`DnsCache::clear`]'s
    /// counters are untouched — only entries are cleared).
    pub fn hits(&self) -> u64 {
        self.hits
    }

    /// Total cache misses since creation.
    pub fn misses(&self) -> u64 {
        self.misses
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn addr(a: u8, b: u8, c: u8, d: u8) -> ResolvedAddress {
        ResolvedAddress(IpAddr::V4(Ipv4Addr::new(a, b, c, d)))
    }

    #[test]
    fn miss_then_hit() {
        let mut cache = DnsCache::new(60_000);
        assert!(cache.find("example.com", 0).is_none());
        cache.store("example.com", &[addr(1, 2, 3, 4)], 0).unwrap();
        let found = cache.find("example.com", 0).unwrap();
        assert_eq!(found, vec![addr(1, 2, 3, 4)]);
        assert_eq!(cache.hits(), 1);
        assert_eq!(cache.misses(), 1);
    }

    #[test]
    fn expired_entry_is_a_miss() {
        let mut cache = DnsCache::new(1000);
        cache.store("example.com", &[addr(1, 1, 1, 1)], 0).unwrap();
        assert!(cache.find("example.com", 1000).is_none());
    }

    #[test]
    fn rejects_overlong_hostname() {
        let mut cache = DnsCache::new(1000);
        let long = "a".repeat(300);
        assert_eq!(
            cache.store(&long, &[addr(1, 1, 1, 1)], 0),
            Err(CacheInsertError::HostnameTooLong)
        );
    }

    #[test]
    fn truncates_to_max_addresses_per_entry() {
        let mut cache = DnsCache::new(60_000);
        let many: Vec<_> = (0..20u8).map(|i| addr(10, 0, 0, i)).collect();
        cache.store("many.example.com", &many, 0).unwrap();
        let found = cache.find("many.example.com", 0).unwrap();
        assert_eq!(found.len(), MAX_ADDRESSES_PER_ENTRY);
    }

    #[test]
    fn fills_then_evicts_oldest_expiring() {
        let mut cache = DnsCache::new(1000);
        for i in 0..MAX_CACHE_ENTRIES {
            cache
                .store(&format!("host{i}.example.com"), &[addr(1, 1, 1, 1)], i as u64)
                .unwrap();
        }
        // host0 has the earliest expiration (0 + 1000); inserting one more
        // entry after every slot is full should evict it first.
        cache
            .store("newcomer.example.com", &[addr(2, 2, 2, 2)], 2000)
            .unwrap();
        assert!(cache.find("host0.example.com", 2000).is_none());
        assert!(cache.find("newcomer.example.com", 2000).is_some());
    }
}
