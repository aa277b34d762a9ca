//! `HubDirectory`: the collaborator interface onto account/ownership data
//! that lives outside this crate (`spec.md` §3 collaborator list).
//!
//! Implementations typically wrap a database connection pool belonging
//! to the account service; this crate only depends on the trait.

use async_trait::async_trait;

/// Durable facts about a hub uuid, independent of whether it is
/// currently connected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HubRecord {
    pub hub_id: String,
    pub account_id: String,
    pub owner_user_id: String,
    /// The shared secret presented at handshake, checked by the caller
    /// against whatever the hub sends (never logged, never returned in
    /// an error).
    pub secret_matches: bool,
}

#[async_trait]
pub trait HubDirectory: Send + Sync + 'static {
    /// Looks up a hub by its uuid. `Ok(None)` means the uuid is unknown
    /// to the account system (distinct from "known but currently
    /// disconnected").
    async fn find_hub(&self, hub_id: &str) -> anyhow::Result<Option<HubRecord>>;

    /// Verifies the secret presented by a connecting hub against the
    /// account system's stored value for `hub_id`.
    async fn verify_secret(&self, hub_id: &str, presented_secret: &secrecy::SecretString) -> anyhow::Result<bool>;
}

/// Fixed-table test double.
#[derive(Default)]
pub struct InMemoryHubDirectory {
    records: dashmap::DashMap<String, (HubRecord, String)>,
}

impl InMemoryHubDirectory {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, record: HubRecord, secret: impl Into<String>) {
        let hub_id = record.hub_id.clone();
        self.records.insert(hub_id, (record, secret.into()));
    }
}

#[async_trait]
impl HubDirectory for InMemoryHubDirectory {
    async fn find_hub(&self, hub_id: &str) -> anyhow::Result<Option<HubRecord>> {
        Ok(self.records.get(hub_id).map(|e| e.0.clone()))
    }

    async fn verify_secret(&self, hub_id: &str, presented_secret: &secrecy::SecretString) -> anyhow::Result<bool> {
        use secrecy::ExposeSecret;
        Ok(self
            .records
            .get(hub_id)
            .is_some_and(|e| e.1 == presented_secret.expose_secret()))
    }
}
