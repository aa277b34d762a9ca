//! Wire frames exchanged over the hub's WebSocket channel.
//!
//! JSON text frames tagged by `event`, binary payloads carried as
//! base64 inside the envelope — the Open Question on framing resolved
//! in favor of the simplest encoding consistent with the channel being
//! "typically WebSocket carrying event-name + payload".

use serde::{Deserialize, Serialize};

fn b64_encode(bytes: &[u8]) -> String {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

fn b64_decode(s: &str) -> Result<Vec<u8>, base64::DecodeError> {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD.decode(s)
}

/// A header as transmitted on the wire; re-hydrated into `http::HeaderMap`
/// at the multiplexer boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireHeader {
    pub name: String,
    pub value: String,
}

/// Frames the relay sends to a hub.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum RelayFrame {
    /// A proxied client request.
    Request {
        request_id: u64,
        method: String,
        path: String,
        headers: Vec<WireHeader>,
        #[serde(default)]
        body_b64: Option<String>,
    },
    /// A chunk of a streamed request body (e.g. a large PUT).
    RequestChunk { request_id: u64, data_b64: String },
    /// End of a streamed request body.
    RequestEnd { request_id: u64 },
    /// The client disconnected before the hub replied; abandon the
    /// request if still in flight.
    Cancel { request_id: u64 },
    Ping,
}

impl RelayFrame {
    #[must_use]
    pub fn request(request_id: u64, method: &str, path: &str, headers: Vec<WireHeader>, body: &[u8]) -> Self {
        RelayFrame::Request {
            request_id,
            method: method.to_string(),
            path: path.to_string(),
            headers,
            body_b64: if body.is_empty() { None } else { Some(b64_encode(body)) },
        }
    }
}

/// One of up to three quick-action buttons attached to a notification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionButton {
    pub title: String,
    pub action: String,
}

/// Fields shared by all three notification events (`spec.md` §6 wire
/// table, "same fields minus userId"), flattened into each variant so
/// they aren't repeated three times.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct NotificationFields {
    pub message: String,
    #[serde(default)]
    pub icon: Option<String>,
    #[serde(default)]
    pub severity: Option<String>,
    #[serde(default)]
    pub tag: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(rename = "on-click", default)]
    pub on_click: Option<String>,
    #[serde(rename = "media-attachment-url", default)]
    pub media_attachment_url: Option<String>,
    #[serde(rename = "action-button-1", default)]
    pub action_button_1: Option<ActionButton>,
    #[serde(rename = "action-button-2", default)]
    pub action_button_2: Option<ActionButton>,
    #[serde(rename = "action-button-3", default)]
    pub action_button_3: Option<ActionButton>,
}

impl NotificationFields {
    /// The three numbered slots collapsed into an ordered list.
    #[must_use]
    pub fn action_buttons(&self) -> Vec<ActionButton> {
        [&self.action_button_1, &self.action_button_2, &self.action_button_3]
            .into_iter()
            .flatten()
            .cloned()
            .collect()
    }
}

/// Frames a hub sends to the relay.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum HubFrame {
    /// Full (non-streamed) response to a prior `Request`.
    Response {
        request_id: u64,
        status: u16,
        headers: Vec<WireHeader>,
        #[serde(default)]
        body_b64: Option<String>,
        #[serde(default)]
        streaming: bool,
    },
    /// A chunk of a streamed response body.
    ResponseChunk { request_id: u64, data_b64: String },
    /// End of a streamed response body.
    ResponseEnd { request_id: u64 },
    /// The hub could not service the request (bad method, internal
    /// error on the hub side, etc).
    Error { request_id: u64, message: String },
    Pong,
    /// Targets a single account user.
    Notification {
        #[serde(rename = "userId")]
        user_id: String,
        #[serde(flatten)]
        fields: NotificationFields,
    },
    /// Targets every user on the hub's account.
    #[serde(rename = "broadcastnotification")]
    BroadcastNotification {
        #[serde(flatten)]
        fields: NotificationFields,
    },
    /// Persisted by a collaborator but never pushed to a device.
    #[serde(rename = "lognotification")]
    LogNotification {
        #[serde(flatten)]
        fields: NotificationFields,
    },
}

/// Decoded, in-memory form of a full (non-chunked) response — what
/// [`crate::request_tracker::PendingRequest::reply`] is completed with.
#[derive(Debug, Clone)]
pub struct ResponseFrame {
    pub request_id: u64,
    pub status: u16,
    pub headers: Vec<WireHeader>,
    pub body: Vec<u8>,
    pub streaming: bool,
}

impl ResponseFrame {
    pub fn decode(request_id: u64, status: u16, headers: Vec<WireHeader>, body_b64: Option<String>, streaming: bool) -> Result<Self, base64::DecodeError> {
        let body = match body_b64 {
            Some(s) => b64_decode(&s)?,
            None => Vec::new(),
        };
        Ok(Self { request_id, status, headers, body, streaming })
    }
}
