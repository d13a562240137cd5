//! Tunable knobs for the reactor, resolver, and connection pool.
//!
//! This crate does not parse CLI flags or configuration files — picking
//! values up from the environment is collaborator territory, left to
//! whatever embeds this substrate. [`Config`] is just the typed,
//! documented set of numbers those layers would otherwise have to agree on.

/// Every tunable this crate reads, gathered in one place so constructing a
/// [`crate::pool::ConnectionPool`] or [`crate::reactor::Reactor`] only needs
/// one value to thread through.
#[derive(Debug, Clone, Copy)]
pub struct Config {
    /// Ceiling on the number of connections a single host pool may hold.
    pub max_connections_per_host: usize,
    /// Ceiling on concurrently active streams per connection.
    pub max_streams_per_connection: usize,
    /// Milliseconds an idle connection may sit before `cleanup_idle` closes
    /// it.
    pub idle_timeout_ms: u64,
    /// Milliseconds a non-blocking connect attempt is allowed before it is
    /// treated as failed.
    pub connect_timeout_ms: u64,
    /// Time-to-live for a positive DNS cache entry.
    pub dns_cache_ttl_ms: u64,
    /// Hint for the reactor's per-`poll` event buffer capacity.
    pub reactor_max_events: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            max_connections_per_host: 8,
            max_streams_per_connection: 100,
            idle_timeout_ms: 60_000,
            connect_timeout_ms: 30_000,
            dns_cache_ttl_ms: 60_000,
            reactor_max_events: 1_024,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_documented_table() {
        let config = Config::default();
        assert_eq!(config.max_connections_per_host, 8);
        assert_eq!(config.max_streams_per_connection, 100);
        assert_eq!(config.idle_timeout_ms, 60_000);
        assert_eq!(config.connect_timeout_ms, 30_000);
        assert_eq!(config.dns_cache_ttl_ms, 60_000);
        assert_eq!(config.reactor_max_events, 1_024);
    }
}
