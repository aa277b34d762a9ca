//! In-process `ConnectionStore` for tests and single-node development.
//!
//! Same CAS semantics as [`super::RedisConnectionStore`] but backed by a
//! `DashMap` — no external server needed. Never use this for a real
//! multi-node deployment: it has no visibility into other processes.

use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;

use super::{expires_at, AcquireOutcome, BlockRecord, ConnectionOwnership, ConnectionStore, RenewOutcome};

#[derive(Default)]
pub struct InMemoryConnectionStore {
    ownerships: DashMap<String, ConnectionOwnership>,
    blocks: DashMap<String, BlockRecord>,
}

impl InMemoryConnectionStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ConnectionStore for InMemoryConnectionStore {
    async fn acquire(
        &self,
        hub_id: &str,
        connection_id: &str,
        node_address: &str,
        hub_software_version: Option<String>,
        ttl: Duration,
    ) -> anyhow::Result<AcquireOutcome> {
        use dashmap::mapref::entry::Entry;

        match self.ownerships.entry(hub_id.to_string()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().is_expired(std::time::SystemTime::now()) {
                    occupied.insert(ConnectionOwnership {
                        connection_id: connection_id.to_string(),
                        node_address: node_address.to_string(),
                        hub_software_version,
                        expires_at_unix: expires_at(ttl),
                    });
                    Ok(AcquireOutcome::Ok)
                } else {
                    Ok(AcquireOutcome::AlreadyHeld)
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(ConnectionOwnership {
                    connection_id: connection_id.to_string(),
                    node_address: node_address.to_string(),
                    hub_software_version,
                    expires_at_unix: expires_at(ttl),
                });
                Ok(AcquireOutcome::Ok)
            }
        }
    }

    async fn renew(
        &self,
        hub_id: &str,
        connection_id: &str,
        ttl: Duration,
    ) -> anyhow::Result<RenewOutcome> {
        let Some(mut entry) = self.ownerships.get_mut(hub_id) else {
            return Ok(RenewOutcome::Lost);
        };
        if entry.connection_id != connection_id {
            return Ok(RenewOutcome::Lost);
        }
        entry.expires_at_unix = expires_at(ttl);
        Ok(RenewOutcome::Ok)
    }

    async fn release(&self, hub_id: &str, connection_id: &str) -> anyhow::Result<()> {
        self.ownerships
            .remove_if(hub_id, |_, v| v.connection_id == connection_id);
        Ok(())
    }

    async fn lookup(&self, hub_id: &str) -> anyhow::Result<Option<ConnectionOwnership>> {
        Ok(self.ownerships.get(hub_id).map(|e| e.clone()))
    }

    async fn block(&self, uuid: &str, reason: &str, ttl: Duration) -> anyhow::Result<()> {
        self.blocks.insert(
            uuid.to_string(),
            BlockRecord {
                reason: reason.to_string(),
                expires_at_unix: expires_at(ttl),
            },
        );
        Ok(())
    }

    async fn is_blocked(&self, uuid: &str) -> anyhow::Result<Option<BlockRecord>> {
        let Some(record) = self.blocks.get(uuid) else {
            return Ok(None);
        };
        let now_unix = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        if now_unix >= record.expires_at_unix {
            drop(record);
            self.blocks.remove(uuid);
            return Ok(None);
        }
        Ok(Some(record.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn second_acquire_is_refused_while_first_holds() {
        let store = InMemoryConnectionStore::new();
        let ttl = Duration::from_secs(60);
        assert_eq!(
            store.acquire("hub-1", "conn-a", "node-1:7000", None, ttl).await.unwrap(),
            AcquireOutcome::Ok
        );
        assert_eq!(
            store.acquire("hub-1", "conn-b", "node-2:7000", None, ttl).await.unwrap(),
            AcquireOutcome::AlreadyHeld
        );
    }

    #[tokio::test]
    async fn renew_fails_for_superseded_connection_id() {
        let store = InMemoryConnectionStore::new();
        let ttl = Duration::from_secs(60);
        store.acquire("hub-1", "conn-a", "node-1:7000", None, ttl).await.unwrap();
        assert_eq!(
            store.renew("hub-1", "conn-stale", ttl).await.unwrap(),
            RenewOutcome::Lost
        );
        assert_eq!(
            store.renew("hub-1", "conn-a", ttl).await.unwrap(),
            RenewOutcome::Ok
        );
    }

    #[tokio::test]
    async fn release_is_a_noop_for_mismatched_connection_id() {
        let store = InMemoryConnectionStore::new();
        let ttl = Duration::from_secs(60);
        store.acquire("hub-1", "conn-a", "node-1:7000", None, ttl).await.unwrap();
        store.release("hub-1", "conn-wrong").await.unwrap();
        assert!(store.lookup("hub-1").await.unwrap().is_some());
        store.release("hub-1", "conn-a").await.unwrap();
        assert!(store.lookup("hub-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn expired_block_record_is_not_returned() {
        let store = InMemoryConnectionStore::new();
        store.block("uuid-1", "abuse", Duration::from_secs(0)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(store.is_blocked("uuid-1").await.unwrap().is_none());
    }
}
