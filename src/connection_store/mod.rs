//! Distributed record of which hub is connected to which cluster node.
//!
//! `ConnectionStore` is the trait every component talks to; `redis_store`
//! and `memory_store` are the two implementations (`spec.md` §4.1).
//! `cache` wraps either one with the short-TTL per-node lookup cache.

mod cache;
mod memory_store;
mod redis_store;

pub use cache::LookupCache;
pub use memory_store::InMemoryConnectionStore;
pub use redis_store::RedisConnectionStore;

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Result of an `acquire` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireOutcome {
    /// Lock was free; this caller now owns it.
    Ok,
    /// Lock is already held (by this or another connection-id).
    AlreadyHeld,
}

/// Result of a `renew` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenewOutcome {
    /// The stored connection-id still matched; expiry was extended.
    Ok,
    /// The stored connection-id no longer matches (or the record is gone).
    /// The caller MUST tear its session down.
    Lost,
}

/// Distributed record that at most one node holds per hub-id (`spec.md`
/// invariant I1/I4).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConnectionOwnership {
    /// Opaque nonce identifying this particular channel instance. Compared
    /// on `renew`/`release` so a stale owner can never clobber a newer one.
    pub connection_id: String,
    /// `"host:port"` reachable on the cluster's internal network.
    pub node_address: String,
    /// Version string reported by the hub at handshake (`openhabversion`).
    pub hub_software_version: Option<String>,
    /// Unix-epoch seconds at which this ownership expires absent renewal.
    pub expires_at_unix: u64,
}

impl ConnectionOwnership {
    #[must_use]
    pub fn is_expired(&self, now: SystemTime) -> bool {
        let now_unix = now
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        now_unix >= self.expires_at_unix
    }
}

/// Short-lived record preventing a hub uuid from being accepted
/// (`spec.md` §3 `BlockRecord`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockRecord {
    pub reason: String,
    pub expires_at_unix: u64,
}

fn expires_at(ttl: Duration) -> u64 {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    (now + ttl).as_secs()
}

/// The distributed key-value surface described in `spec.md` §4.1.
///
/// Implementations MUST make `acquire`/`renew`/`release` atomic
/// compare-and-swap operations — never client-side read-modify-write
/// (`spec.md` §5, "rely on the store's native conditional primitives").
#[async_trait]
pub trait ConnectionStore: Send + Sync + 'static {
    /// Atomically insert ownership only if absent. Never blocks.
    async fn acquire(
        &self,
        hub_id: &str,
        connection_id: &str,
        node_address: &str,
        hub_software_version: Option<String>,
        ttl: Duration,
    ) -> anyhow::Result<AcquireOutcome>;

    /// Compare-and-extend: succeeds only if the stored connection-id still
    /// matches.
    async fn renew(
        &self,
        hub_id: &str,
        connection_id: &str,
        ttl: Duration,
    ) -> anyhow::Result<RenewOutcome>;

    /// Compare-and-delete; silently no-op on mismatch.
    async fn release(&self, hub_id: &str, connection_id: &str) -> anyhow::Result<()>;

    /// Single read. No caching at this layer — see [`LookupCache`].
    async fn lookup(&self, hub_id: &str) -> anyhow::Result<Option<ConnectionOwnership>>;

    /// Insert a short-lived block on a uuid.
    async fn block(&self, uuid: &str, reason: &str, ttl: Duration) -> anyhow::Result<()>;

    /// Whether a uuid currently carries a block record.
    async fn is_blocked(&self, uuid: &str) -> anyhow::Result<Option<BlockRecord>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ownership_expiry_is_based_on_wall_clock() {
        let ownership = ConnectionOwnership {
            connection_id: "c1".into(),
            node_address: "10.0.0.1:9000".into(),
            hub_software_version: None,
            expires_at_unix: expires_at(Duration::from_secs(0)),
        };
        // Already expired the moment it's created with a zero TTL.
        std::thread::sleep(Duration::from_millis(10));
        assert!(ownership.is_expired(SystemTime::now()));
    }
}
