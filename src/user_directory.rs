//! `UserDirectory`: collaborator interface onto user/device data used by
//! [`crate::push_fanout`] (`spec.md` §3).

use async_trait::async_trait;

/// A single registered push endpoint for a user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceToken {
    pub endpoint: String,
    pub p256dh: String,
    pub auth: String,
}

#[async_trait]
pub trait UserDirectory: Send + Sync + 'static {
    /// All device tokens registered for `user_id`. Empty, not an error,
    /// if the user has never registered a device.
    async fn device_tokens(&self, user_id: &str) -> anyhow::Result<Vec<DeviceToken>>;

    /// Every user belonging to `account_id`, for resolving a
    /// broadcast-to-all-account-users notification recipient.
    async fn account_user_ids(&self, account_id: &str) -> anyhow::Result<Vec<String>>;
}

/// Fixed-table test double.
#[derive(Default)]
pub struct InMemoryUserDirectory {
    devices: dashmap::DashMap<String, Vec<DeviceToken>>,
    accounts: dashmap::DashMap<String, Vec<String>>,
}

impl InMemoryUserDirectory {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, user_id: impl Into<String>, token: DeviceToken) {
        self.devices.entry(user_id.into()).or_default().push(token);
    }

    /// Adds `user_id` to `account_id`'s membership list.
    pub fn add_account_user(&self, account_id: impl Into<String>, user_id: impl Into<String>) {
        self.accounts.entry(account_id.into()).or_default().push(user_id.into());
    }
}

#[async_trait]
impl UserDirectory for InMemoryUserDirectory {
    async fn device_tokens(&self, user_id: &str) -> anyhow::Result<Vec<DeviceToken>> {
        Ok(self.devices.get(user_id).map(|e| e.clone()).unwrap_or_default())
    }

    async fn account_user_ids(&self, account_id: &str) -> anyhow::Result<Vec<String>> {
        Ok(self.accounts.get(account_id).map(|e| e.clone()).unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unregistered_user_has_no_tokens() {
        let dir = InMemoryUserDirectory::new();
        assert!(dir.device_tokens("nobody").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn registered_tokens_are_returned() {
        let dir = InMemoryUserDirectory::new();
        dir.register(
            "user-1",
            DeviceToken {
                endpoint: "https://push.example/ep1".into(),
                p256dh: "p256dh-1".into(),
                auth: "auth-1".into(),
            },
        );
        assert_eq!(dir.device_tokens("user-1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn account_membership_is_returned() {
        let dir = InMemoryUserDirectory::new();
        dir.add_account_user("acct-1", "user-1");
        dir.add_account_user("acct-1", "user-2");
        let members = dir.account_user_ids("acct-1").await.unwrap();
        assert_eq!(members.len(), 2);
        assert!(dir.account_user_ids("acct-2").await.unwrap().is_empty());
    }
}
