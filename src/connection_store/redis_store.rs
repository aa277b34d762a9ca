//! Redis-backed `ConnectionStore`.
//!
//! Grounded on the pack's Redis cluster-sync precedent (a shared
//! `redis::aio::MultiplexedConnection` behind a `tokio::sync::Mutex`,
//! reused across calls instead of opening a fresh connection per
//! operation). `acquire` is a plain `SET NX PX`; `renew` and `release`
//! are compare-and-(extend|delete) `redis::Script`s so the check and the
//! mutation happen atomically server-side — the only correct way to do
//! CAS against a plain key with the `redis` crate.

use std::time::Duration;

use async_trait::async_trait;
use redis::AsyncCommands;

use super::{expires_at, AcquireOutcome, BlockRecord, ConnectionOwnership, ConnectionStore, RenewOutcome};

fn ownership_key(hub_id: &str) -> String {
    format!("relay:hub:{hub_id}:ownership")
}

fn block_key(uuid: &str) -> String {
    format!("relay:hub:{uuid}:block")
}

// Renews only if the stored connection_id matches KEYS[1]'s payload.
// ARGV: connection_id, ttl_ms, new_value
const RENEW_SCRIPT: &str = r"
local current = redis.call('GET', KEYS[1])
if current == false then
    return 0
end
local ok, decoded = pcall(cjson.decode, current)
if not ok or decoded.connection_id ~= ARGV[1] then
    return 0
end
redis.call('SET', KEYS[1], ARGV[3], 'PX', ARGV[2])
return 1
";

// Deletes only if the stored connection_id matches ARGV[1].
const RELEASE_SCRIPT: &str = r"
local current = redis.call('GET', KEYS[1])
if current == false then
    return 0
end
local ok, decoded = pcall(cjson.decode, current)
if ok and decoded.connection_id == ARGV[1] then
    redis.call('DEL', KEYS[1])
end
return 1
";

/// `ConnectionStore` backed by a Redis (or Redis-compatible) server.
pub struct RedisConnectionStore {
    client: redis::Client,
    conn: tokio::sync::Mutex<redis::aio::MultiplexedConnection>,
    renew_script: redis::Script,
    release_script: redis::Script,
}

impl RedisConnectionStore {
    /// Opens a connection to `redis_url`. Fails fast if the initial
    /// connection cannot be established.
    pub async fn connect(redis_url: &str) -> anyhow::Result<Self> {
        let client = redis::Client::open(redis_url)?;
        let conn = client.get_multiplexed_tokio_connection().await?;
        Ok(Self {
            client,
            conn: tokio::sync::Mutex::new(conn),
            renew_script: redis::Script::new(RENEW_SCRIPT),
            release_script: redis::Script::new(RELEASE_SCRIPT),
        })
    }

    async fn reconnect(&self) -> anyhow::Result<redis::aio::MultiplexedConnection> {
        Ok(self.client.get_multiplexed_tokio_connection().await?)
    }
}

#[async_trait]
impl ConnectionStore for RedisConnectionStore {
    async fn acquire(
        &self,
        hub_id: &str,
        connection_id: &str,
        node_address: &str,
        hub_software_version: Option<String>,
        ttl: Duration,
    ) -> anyhow::Result<AcquireOutcome> {
        let ownership = ConnectionOwnership {
            connection_id: connection_id.to_string(),
            node_address: node_address.to_string(),
            hub_software_version,
            expires_at_unix: expires_at(ttl),
        };
        let payload = serde_json::to_string(&ownership)?;

        let mut conn = self.conn.lock().await;
        let ttl_ms: u64 = ttl.as_millis().try_into().unwrap_or(u64::MAX);
        let result: Option<String> = conn
            .set_options(
                ownership_key(hub_id),
                payload,
                redis::SetOptions::default()
                    .conditional_set(redis::ExistenceCheck::NX)
                    .with_expiration(redis::SetExpiry::PX(ttl_ms)),
            )
            .await?;

        Ok(if result.is_some() {
            AcquireOutcome::Ok
        } else {
            AcquireOutcome::AlreadyHeld
        })
    }

    async fn renew(
        &self,
        hub_id: &str,
        connection_id: &str,
        ttl: Duration,
    ) -> anyhow::Result<RenewOutcome> {
        // Re-read current node_address/version so the renewed record keeps
        // the same fields with only the expiry refreshed.
        let existing = self.lookup(hub_id).await?;
        let Some(existing) = existing else {
            return Ok(RenewOutcome::Lost);
        };
        if existing.connection_id != connection_id {
            return Ok(RenewOutcome::Lost);
        }

        let refreshed = ConnectionOwnership {
            expires_at_unix: expires_at(ttl),
            ..existing
        };
        let payload = serde_json::to_string(&refreshed)?;
        let ttl_ms: u64 = ttl.as_millis().try_into().unwrap_or(u64::MAX);

        let mut conn = self.conn.lock().await;
        let applied: i32 = self
            .renew_script
            .key(ownership_key(hub_id))
            .arg(connection_id)
            .arg(ttl_ms)
            .arg(payload)
            .invoke_async(&mut *conn)
            .await?;

        Ok(if applied == 1 {
            RenewOutcome::Ok
        } else {
            RenewOutcome::Lost
        })
    }

    async fn release(&self, hub_id: &str, connection_id: &str) -> anyhow::Result<()> {
        let mut conn = self.conn.lock().await;
        let _: i32 = self
            .release_script
            .key(ownership_key(hub_id))
            .arg(connection_id)
            .invoke_async(&mut *conn)
            .await?;
        Ok(())
    }

    async fn lookup(&self, hub_id: &str) -> anyhow::Result<Option<ConnectionOwnership>> {
        let mut conn = self.conn.lock().await;
        let raw: Option<String> = match conn.get(ownership_key(hub_id)).await {
            Ok(v) => v,
            Err(e) => {
                log::warn!("[ConnectionStore] redis GET failed ({e}), reconnecting");
                *conn = self.reconnect().await?;
                conn.get(ownership_key(hub_id)).await?
            }
        };
        Ok(match raw {
            Some(s) => Some(serde_json::from_str(&s)?),
            None => None,
        })
    }

    async fn block(&self, uuid: &str, reason: &str, ttl: Duration) -> anyhow::Result<()> {
        let record = BlockRecord {
            reason: reason.to_string(),
            expires_at_unix: expires_at(ttl),
        };
        let payload = serde_json::to_string(&record)?;
        let ttl_secs: u64 = ttl.as_secs().max(1);
        let mut conn = self.conn.lock().await;
        let _: () = conn.set_ex(block_key(uuid), payload, ttl_secs).await?;
        Ok(())
    }

    async fn is_blocked(&self, uuid: &str) -> anyhow::Result<Option<BlockRecord>> {
        let mut conn = self.conn.lock().await;
        let raw: Option<String> = conn.get(block_key(uuid)).await?;
        Ok(match raw {
            Some(s) => Some(serde_json::from_str(&s)?),
            None => None,
        })
    }
}
