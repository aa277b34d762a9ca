//! Short-TTL per-node cache in front of a [`ConnectionStore`].
//!
//! `lookup` is the hot path of request dispatch (`spec.md` §4.4 step 1)
//! and is called once per incoming request, so every node keeps its own
//! small, short-lived cache rather than hitting the store on every
//! request. `acquire`/`renew`/`release`/`block` always go straight
//! through and additionally invalidate the local entry.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;

use super::{AcquireOutcome, BlockRecord, ConnectionOwnership, ConnectionStore, RenewOutcome};

struct CachedLookup {
    value: Option<ConnectionOwnership>,
    cached_at: Instant,
}

/// Wraps any [`ConnectionStore`] with a bounded-staleness read cache.
pub struct LookupCache<S: ConnectionStore> {
    inner: Arc<S>,
    ttl: Duration,
    entries: DashMap<String, CachedLookup>,
}

impl<S: ConnectionStore> LookupCache<S> {
    pub fn new(inner: Arc<S>, ttl: Duration) -> Self {
        Self {
            inner,
            ttl,
            entries: DashMap::new(),
        }
    }

    /// Drops any cached entry for `hub_id`, forcing the next lookup to
    /// hit the backing store. Called after `acquire`/`renew`/`release`
    /// so a node never serves its own stale negative/positive result.
    pub fn invalidate(&self, hub_id: &str) {
        self.entries.remove(hub_id);
    }
}

#[async_trait]
impl<S: ConnectionStore> ConnectionStore for LookupCache<S> {
    async fn acquire(
        &self,
        hub_id: &str,
        connection_id: &str,
        node_address: &str,
        hub_software_version: Option<String>,
        ttl: Duration,
    ) -> anyhow::Result<AcquireOutcome> {
        let outcome = self
            .inner
            .acquire(hub_id, connection_id, node_address, hub_software_version, ttl)
            .await?;
        self.invalidate(hub_id);
        Ok(outcome)
    }

    async fn renew(
        &self,
        hub_id: &str,
        connection_id: &str,
        ttl: Duration,
    ) -> anyhow::Result<RenewOutcome> {
        let outcome = self.inner.renew(hub_id, connection_id, ttl).await?;
        self.invalidate(hub_id);
        Ok(outcome)
    }

    async fn release(&self, hub_id: &str, connection_id: &str) -> anyhow::Result<()> {
        self.inner.release(hub_id, connection_id).await?;
        self.invalidate(hub_id);
        Ok(())
    }

    async fn lookup(&self, hub_id: &str) -> anyhow::Result<Option<ConnectionOwnership>> {
        if let Some(cached) = self.entries.get(hub_id) {
            if cached.cached_at.elapsed() < self.ttl {
                return Ok(cached.value.clone());
            }
        }
        let value = self.inner.lookup(hub_id).await?;
        self.entries.insert(
            hub_id.to_string(),
            CachedLookup {
                value: value.clone(),
                cached_at: Instant::now(),
            },
        );
        Ok(value)
    }

    async fn block(&self, uuid: &str, reason: &str, ttl: Duration) -> anyhow::Result<()> {
        self.inner.block(uuid, reason, ttl).await
    }

    async fn is_blocked(&self, uuid: &str) -> anyhow::Result<Option<BlockRecord>> {
        self.inner.is_blocked(uuid).await
    }
}
