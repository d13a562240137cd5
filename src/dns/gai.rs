//! Blocking `getaddrinfo`-backed resolution, hopped onto a `tokio`
//! blocking-pool worker so it never runs on the reactor thread.

use std::net::ToSocketAddrs;

use crate::error::{Error, Result};

use super::cache::ResolvedAddress;

/// Resolves a hostname using the system resolver on a blocking-pool thread.
///
/// This is the only piece of the DNS subsystem allowed to block: callers on
/// the reactor thread must go through [`crate::dns::Resolver::resolve_async`],
/// never this function directly.
#[derive(Debug, Default, Clone, Copy)]
pub struct GaiResolver;

impl GaiResolver {
    /// Creates a new resolver. Stateless; cheap to clone or construct
    /// per-call.
    pub fn new() -> Self {
        GaiResolver
    }

    /// Resolves `host` on a `tokio` blocking-pool thread, returning every
    /// address the system resolver reports for port `0` (the caller
    /// supplies the real port when connecting).
    pub async fn resolve(&self, host: String) -> Result<Vec<ResolvedAddress>> {
        tokio::task::spawn_blocking(move || blocking_resolve(&host))
            .await
            .map_err(Error::resolution)?
    }
}

fn blocking_resolve(host: &str) -> Result<Vec<ResolvedAddress>> {
    let raw = (host, 0u16).to_socket_addrs().map_err(Error::resolution)?;
    let deduped = dedupe_addresses(raw.map(|a| ResolvedAddress(a.ip())));
    if deduped.is_empty() {
        return Err(Error::resolution(format!("{host} resolved to no usable addresses")));
    }
    Ok(deduped)
}

/// Drops duplicate addresses — `getaddrinfo` commonly repeats the same IP
/// once per socket type it supports. `ResolvedAddress` only ever wraps an
/// `IpAddr`, so every entry here is already a supported family; there is
/// nothing else to filter out.
fn dedupe_addresses(addrs: impl Iterator<Item = ResolvedAddress>) -> Vec<ResolvedAddress> {
    let mut out: Vec<ResolvedAddress> = Vec::new();
    for addr in addrs {
        if !out.contains(&addr) {
            out.push(addr);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn resolves_a_literal_ip() {
        let resolver = GaiResolver::new();
        let addrs = resolver.resolve("127.0.0.1".to_string()).await.unwrap();
        assert_eq!(addrs.len(), 1);
        assert!(!addrs[0].is_ipv6());
    }

    #[tokio::test]
    async fn rejects_unparseable_host() {
        let resolver = GaiResolver::new();
        let result = resolver.resolve("".to_string()).await;
        assert!(result.is_err());
    }

    #[test]
    fn dedupe_drops_repeated_addresses() {
        let a = ResolvedAddress(std::net::IpAddr::V4(std::net::Ipv4Addr::LOCALHOST));
        let b = ResolvedAddress(std::net::IpAddr::V4(std::net::Ipv4Addr::new(127, 0, 0, 2)));
        let deduped = dedupe_addresses(vec![a, a, b, a].into_iter());
        assert_eq!(deduped, vec![a, b]);
    }
}
