//! Dispatches notifications raised by a hub session out to a user's
//! registered devices (`spec.md` §3 `PushFanout`, §4.6 dedup rules).

pub mod provider;
pub mod vapid;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::Serialize;

use crate::user_directory::{DeviceToken, UserDirectory};
use provider::{DeliveryOutcome, PushProvider};

/// Who a notification is addressed to, resolved to one or more user-ids
/// before delivery.
#[derive(Debug, Clone)]
pub enum Recipient {
    /// A single account user (`notification` event).
    User(String),
    /// Every user on the account (`broadcastnotification` event).
    AllAccountUsers(String),
    /// No device delivery at all — only ever paired with `log_only`.
    None,
}

#[derive(Debug, Clone, Serialize)]
pub struct ActionButton {
    pub title: String,
    pub action: String,
}

/// A notification raised by a hub session and handed to the fanout for
/// delivery.
#[derive(Debug, Clone)]
pub struct Notification {
    pub recipient: Recipient,
    pub message: String,
    pub icon: Option<String>,
    pub severity: Option<String>,
    /// Notifications sharing a tag within the dedup window supersede
    /// each other: the newer one is still delivered, alongside a
    /// "hide" delivery referencing the superseded notification's id.
    pub tag: Option<String>,
    pub title: Option<String>,
    pub on_click: Option<String>,
    pub media_url: Option<String>,
    pub action_buttons: Vec<ActionButton>,
    /// `true` for notifications that exist only to appear in the audit
    /// trail and must never reach a device (`spec.md` "log-notification").
    pub log_only: bool,
}

#[derive(Serialize)]
struct PushPayload<'a> {
    id: u64,
    kind: &'a str,
    message: Option<&'a str>,
    icon: Option<&'a str>,
    severity: Option<&'a str>,
    tag: Option<&'a str>,
    title: Option<&'a str>,
    on_click: Option<&'a str>,
    media_url: Option<&'a str>,
    action_buttons: &'a [ActionButton],
    /// Set only on a `kind: "hide"` payload: the id of the notification
    /// this delivery supersedes, so the device can dismiss it.
    hides_notification_id: Option<u64>,
}

struct TaggedDelivery {
    notification_id: u64,
    delivered_at: Instant,
}

pub struct PushFanout {
    user_directory: Arc<dyn UserDirectory>,
    provider: Arc<dyn PushProvider>,
    next_notification_id: AtomicU64,
    recent_tags: DashMap<(String, String), TaggedDelivery>,
    dedup_window: Duration,
}

impl PushFanout {
    #[must_use]
    pub fn new(user_directory: Arc<dyn UserDirectory>, provider: Arc<dyn PushProvider>) -> Self {
        Self {
            user_directory,
            provider,
            next_notification_id: AtomicU64::new(0),
            recent_tags: DashMap::new(),
            dedup_window: Duration::from_secs(60),
        }
    }

    #[must_use]
    pub fn with_dedup_window(mut self, window: Duration) -> Self {
        self.dedup_window = window;
        self
    }

    /// Resolves `notification`'s recipient and delivers it to every
    /// device registered for each resolved user, skipping dispatch
    /// entirely for log-only notifications. A notification that shares
    /// a still-fresh tag with an earlier delivery is still sent, but is
    /// followed by a `kind: "hide"` delivery referencing the earlier
    /// notification's id so the device can retire it.
    pub async fn dispatch(&self, notification: Notification) -> anyhow::Result<()> {
        if notification.log_only {
            log::info!(target: "audit", "notification (log-only, not dispatched) message={}", notification.message);
            return Ok(());
        }

        let recipients = match &notification.recipient {
            Recipient::User(user_id) => vec![user_id.clone()],
            Recipient::AllAccountUsers(account_id) => self.user_directory.account_user_ids(account_id).await?,
            Recipient::None => Vec::new(),
        };
        if recipients.is_empty() {
            return Ok(());
        }

        let notification_id = self.next_notification_id.fetch_add(1, Ordering::Relaxed);

        for user_id in &recipients {
            let tokens = self.user_directory.device_tokens(user_id).await?;
            if tokens.is_empty() {
                continue;
            }

            let superseded = notification.tag.as_ref().and_then(|tag| {
                let key = (user_id.clone(), tag.clone());
                let previous = self
                    .recent_tags
                    .get(&key)
                    .filter(|d| d.delivered_at.elapsed() < self.dedup_window)
                    .map(|d| d.notification_id);
                self.recent_tags.insert(key, TaggedDelivery { notification_id, delivered_at: Instant::now() });
                previous
            });

            let payload = serde_json::to_vec(&PushPayload {
                id: notification_id,
                kind: "notification",
                message: Some(&notification.message),
                icon: notification.icon.as_deref(),
                severity: notification.severity.as_deref(),
                tag: notification.tag.as_deref(),
                title: notification.title.as_deref(),
                on_click: notification.on_click.as_deref(),
                media_url: notification.media_url.as_deref(),
                action_buttons: &notification.action_buttons,
                hides_notification_id: None,
            })?;
            self.deliver_to(user_id, &tokens, &payload).await;

            if let Some(previous_id) = superseded {
                log::debug!(
                    "[PushFanout] notification {notification_id} (tag={:?}) supersedes {previous_id} for user={user_id}",
                    notification.tag
                );
                let hide_payload = serde_json::to_vec(&PushPayload {
                    id: notification_id,
                    kind: "hide",
                    message: None,
                    icon: None,
                    severity: None,
                    tag: notification.tag.as_deref(),
                    title: None,
                    on_click: None,
                    media_url: None,
                    action_buttons: &[],
                    hides_notification_id: Some(previous_id),
                })?;
                self.deliver_to(user_id, &tokens, &hide_payload).await;
            }
        }

        Ok(())
    }

    async fn deliver_to(&self, user_id: &str, tokens: &[DeviceToken], payload: &[u8]) {
        for token in tokens {
            match self.provider.deliver(token, payload).await {
                Ok(DeliveryOutcome::Delivered) => {}
                Ok(DeliveryOutcome::StaleEndpoint) => {
                    log::info!("[PushFanout] endpoint gone (410) for user={user_id}");
                }
                Ok(DeliveryOutcome::RateLimited) => {
                    log::warn!("[PushFanout] rate limited for user={user_id}");
                }
                Err(e) => {
                    log::warn!("[PushFanout] delivery failed for user={user_id}: {e:#}");
                }
            }
        }
    }
}
