//! `PushProvider`: collaborator interface abstracting the actual
//! delivery mechanism, and the Web Push implementation of it.
//!
//! Sending logic reused near-verbatim from the donor CLI's
//! `notifications::push::send_push_direct`: build the VAPID JWT and
//! RFC 8291 payload with `web-push`, then replay the request manually
//! through `reqwest` so `Content-Type: application/notification+json`
//! can be set (the `web-push` crate hardcodes `application/octet-stream`).

use async_trait::async_trait;

use crate::user_directory::DeviceToken;

/// Outcome of a single delivery attempt, distinguishing a stale
/// endpoint (caller should stop retrying it) from a transient failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered,
    StaleEndpoint,
    RateLimited,
}

#[async_trait]
pub trait PushProvider: Send + Sync + 'static {
    async fn deliver(&self, token: &DeviceToken, payload: &[u8]) -> anyhow::Result<DeliveryOutcome>;
}

pub struct WebPushProvider {
    client: reqwest::Client,
    vapid_private_key_b64: String,
    vapid_subject: String,
}

impl WebPushProvider {
    #[must_use]
    pub fn new(vapid_private_key_b64: String, vapid_subject: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            vapid_private_key_b64,
            vapid_subject,
        }
    }
}

#[async_trait]
impl PushProvider for WebPushProvider {
    async fn deliver(&self, token: &DeviceToken, payload: &[u8]) -> anyhow::Result<DeliveryOutcome> {
        use anyhow::Context;
        use web_push::{ContentEncoding, SubscriptionInfo, VapidSignatureBuilder, WebPushMessageBuilder};

        let sub_info = SubscriptionInfo::new(&token.endpoint, &token.p256dh, &token.auth);

        let mut sig_builder = VapidSignatureBuilder::from_base64(&self.vapid_private_key_b64, &sub_info)
            .context("failed to build VAPID signature")?;
        sig_builder.add_claim("sub", self.vapid_subject.as_str());
        let sig = sig_builder.build().context("failed to sign VAPID JWT")?;

        let mut builder = WebPushMessageBuilder::new(&sub_info);
        builder.set_payload(ContentEncoding::Aes128Gcm, payload);
        builder.set_vapid_signature(sig);
        builder.set_ttl(86400);

        let message = builder.build().context("failed to build web push message")?;

        let mut request = self
            .client
            .post(message.endpoint.to_string())
            .header("TTL", message.ttl.to_string());

        if let Some(urgency) = message.urgency {
            request = request.header("Urgency", urgency.to_string());
        }
        if let Some(topic) = message.topic {
            request = request.header("Topic", topic);
        }
        if let Some(push_payload) = message.payload {
            request = request
                .header("Content-Encoding", push_payload.content_encoding.to_str())
                .header("Content-Type", "application/notification+json");
            for (key, value) in &push_payload.crypto_headers {
                request = request.header(*key, value.as_str());
            }
            request = request.body(push_payload.content);
        }

        let response = request.send().await.context("web push HTTP request failed")?;
        let status = response.status().as_u16();

        match status {
            200..=299 => Ok(DeliveryOutcome::Delivered),
            410 => Ok(DeliveryOutcome::StaleEndpoint),
            429 => Ok(DeliveryOutcome::RateLimited),
            _ => {
                let body = response.text().await.unwrap_or_default();
                Err(anyhow::anyhow!("web push send failed (HTTP {status}): {body}"))
            }
        }
    }
}
