//! CLI argument parsing and runtime configuration.
//!
//! Mirrors the donor CLI's `clap`-derived configuration: flags with
//! environment-variable fallbacks, loaded once at startup into a plain
//! struct that is cloned into the dependency container (`AppState`)
//! rather than read from a global.

use std::time::Duration;

use clap::Parser;

/// Reverse-tunnel relay node.
#[derive(Parser, Clone, Debug)]
#[command(name = "hub-relayd", version, about)]
pub struct Config {
    /// This node's address on the cluster's internal network, e.g.
    /// `10.0.4.12:7070`. Used to detect cross-node forwarding loops and
    /// as the `node-address` written into `ConnectionOwnership` records.
    #[arg(long, env = "RELAY_INTERNAL_ADDR")]
    pub internal_addr: String,

    /// Bind address for public HTTP/WebSocket traffic (clients and hubs).
    #[arg(long, env = "RELAY_PUBLIC_ADDR", default_value = "0.0.0.0:8080")]
    pub public_addr: String,

    /// Redis URL backing the `ConnectionStore`.
    #[arg(long, env = "RELAY_REDIS_URL", default_value = "redis://127.0.0.1:6379")]
    pub redis_url: String,

    /// `ConnectionOwnership` expiry, in seconds. The owning node renews at
    /// strictly less than half this interval.
    #[arg(long, env = "RELAY_LOCK_TTL_SECS", default_value_t = 300)]
    pub lock_ttl_secs: u64,

    /// Hub channel keepalive ping interval, in seconds.
    #[arg(long, env = "RELAY_KEEPALIVE_SECS", default_value_t = 25)]
    pub keepalive_secs: u64,

    /// Dead-peer detection window, in seconds (no frame, including pong,
    /// observed within this window tears the session down).
    #[arg(long, env = "RELAY_DEAD_PEER_SECS", default_value_t = 60)]
    pub dead_peer_secs: u64,

    /// Per-session outbound frame buffer capacity — the backpressure bound
    /// described in `spec.md` §5.
    #[arg(long, env = "RELAY_MAX_PENDING_PER_SESSION", default_value_t = 256)]
    pub max_pending_per_session: usize,

    /// Alternate host substituted for requests whose path begins with
    /// `/remote/` (the prefix is stripped before forwarding).
    #[arg(long, env = "RELAY_REMOTE_HOST")]
    pub remote_host: Option<String>,

    /// Public hostname set on the forwarded `host` header for all other
    /// paths.
    #[arg(long, env = "RELAY_PUBLIC_HOST", default_value = "home.myopenhab.org")]
    pub public_host: String,

    /// Per-node lookup cache TTL, in seconds (`spec.md` §4.1).
    #[arg(long, env = "RELAY_LOOKUP_CACHE_SECS", default_value_t = 30)]
    pub lookup_cache_secs: u64,

    /// PendingRequest and cross-node-forward timeout, in seconds.
    #[arg(long, env = "RELAY_REQUEST_TIMEOUT_SECS", default_value_t = 600)]
    pub request_timeout_secs: u64,

    /// Protocol-violation threshold per minute before a misbehaving hub
    /// session is torn down (`spec.md` §7).
    #[arg(long, env = "RELAY_VIOLATION_THRESHOLD", default_value_t = 100)]
    pub violation_threshold_per_min: u32,
}

impl Config {
    /// `lock_ttl_secs` as a [`Duration`].
    #[must_use]
    pub fn lock_ttl(&self) -> Duration {
        Duration::from_secs(self.lock_ttl_secs)
    }

    /// The renewal interval: strictly less than half the lock TTL, per
    /// `spec.md` §4.1 ("MUST renew at an interval strictly less than half
    /// the ttl").
    #[must_use]
    pub fn renewal_interval(&self) -> Duration {
        Duration::from_secs(self.lock_ttl_secs / 3)
    }

    #[must_use]
    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_secs(self.keepalive_secs)
    }

    #[must_use]
    pub fn dead_peer_timeout(&self) -> Duration {
        Duration::from_secs(self.dead_peer_secs)
    }

    #[must_use]
    pub fn lookup_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.lookup_cache_secs)
    }

    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Config built from explicit values, for tests — bypasses `clap`
    /// parsing and environment lookups. Not behind `#[cfg(test)]` since
    /// integration tests under `tests/` link against the ordinary build.
    #[must_use]
    pub fn for_test(internal_addr: &str) -> Self {
        Self {
            internal_addr: internal_addr.to_string(),
            public_addr: "127.0.0.1:0".to_string(),
            redis_url: "redis://127.0.0.1:6379".to_string(),
            lock_ttl_secs: 300,
            keepalive_secs: 25,
            dead_peer_secs: 60,
            max_pending_per_session: 256,
            remote_host: Some("remote.example.org".to_string()),
            public_host: "home.example.org".to_string(),
            lookup_cache_secs: 30,
            request_timeout_secs: 600,
            violation_threshold_per_min: 100,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renewal_interval_is_strictly_less_than_half_ttl() {
        let cfg = Config::for_test("10.0.0.1:7000");
        assert!(cfg.renewal_interval() < cfg.lock_ttl() / 2);
    }
}
