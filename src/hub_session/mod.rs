//! The duplex channel state machine for one connected hub (`spec.md`
//! §4.2).
//!
//! Mirrors the donor CLI's `hub/mod.rs` event-driven shape (a reader
//! loop pushing frames into channels, a writer task owning the sink, a
//! `Drop`-adjacent teardown path) but inverted: the donor is the hub
//! *client* side of this exact channel, this module is the relay's
//! *server* side of it.

pub mod frames;

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, oneshot};

use crate::audit;
use crate::config::Config;
use crate::connection_store::{ConnectionStore, RenewOutcome};
use crate::errors::RelayError;
use crate::push_fanout::{self, PushFanout, Recipient};
use crate::request_tracker::{PendingRequest, RequestTracker};
use crate::session_registry::SessionRegistry;
use frames::{HubFrame, RelayFrame, ResponseFrame, WireHeader};

/// Lifecycle states from `spec.md` §4.2.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Opening,
    Authenticating,
    Established,
    Active,
    Closed,
}

fn now_unix() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs()
}

/// A live, authenticated channel to one hub.
pub struct HubSession {
    pub hub_id: String,
    pub connection_id: String,
    pub node_address: String,
    /// The account this hub belongs to, resolved once at handshake time;
    /// used to fan a `broadcastnotification` out to every account user.
    pub account_id: String,
    state: parking_lot::Mutex<SessionState>,
    outbound: mpsc::Sender<Message>,
    /// Shared with every other `HubSession` on this node (`spec.md` §4.3
    /// invariant I3: request-ids are unique per node, not per session).
    pub requests: Arc<RequestTracker>,
    last_activity_unix: AtomicU64,
    violations_this_minute: AtomicU32,
    violation_window_started_unix: AtomicU64,
}

impl HubSession {
    #[must_use]
    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    fn set_state(&self, new_state: SessionState) {
        *self.state.lock() = new_state;
    }

    pub fn touch(&self) {
        self.last_activity_unix.store(now_unix(), Ordering::Relaxed);
    }

    #[must_use]
    pub fn is_dead(&self, timeout: Duration) -> bool {
        now_unix().saturating_sub(self.last_activity_unix.load(Ordering::Relaxed)) >= timeout.as_secs()
    }

    /// Counts a malformed/unexpected frame against the per-minute
    /// violation budget (`spec.md` §7). Returns `true` once the
    /// threshold is crossed, at which point the caller must close the
    /// session.
    pub fn record_violation(&self, threshold_per_min: u32) -> bool {
        let now = now_unix();
        let window_start = self.violation_window_started_unix.load(Ordering::Relaxed);
        if now.saturating_sub(window_start) >= 60 {
            self.violation_window_started_unix.store(now, Ordering::Relaxed);
            self.violations_this_minute.store(0, Ordering::Relaxed);
        }
        let count = self.violations_this_minute.fetch_add(1, Ordering::Relaxed) + 1;
        count > threshold_per_min
    }

    /// Enqueues a frame for delivery, honoring the bounded-buffer
    /// backpressure rule — fills without blocking the caller, or fails
    /// fast with `ResourceExhausted` when the hub can't keep up.
    pub async fn send_frame(&self, frame: RelayFrame) -> Result<(), RelayError> {
        let text = serde_json::to_string(&frame).map_err(|e| RelayError::ProtocolViolation(e.to_string()))?;
        self.outbound
            .try_send(Message::Text(text))
            .map_err(|_| RelayError::ResourceExhausted("hub outbound buffer full".to_string()))
    }
}

/// Registers the session and drives it until the channel closes.
/// Returns once teardown has fully run.
///
/// Authentication (`uuid`/`secret`, the blocked-uuid check, and the
/// connection-store lock acquisition) already happened against the raw
/// upgrade request before the socket was accepted — see
/// `http::hub_ws::accept` — so by the time this runs, `hub_id`,
/// `connection_id`, and `account_id` are already verified and `requests`
/// is the one tracker shared by every hub session on this node.
#[allow(clippy::too_many_arguments)]
pub async fn run(
    ws: WebSocket,
    config: Arc<Config>,
    connection_store: Arc<dyn ConnectionStore>,
    registry: Arc<SessionRegistry<HubSession>>,
    metrics: Arc<audit::Metrics>,
    push_fanout: Arc<PushFanout>,
    requests: Arc<RequestTracker>,
    hub_id: String,
    connection_id: String,
    account_id: String,
) {
    let (sink, mut stream) = ws.split();
    let ttl = config.lock_ttl();

    let (outbound_tx, mut outbound_rx) = mpsc::channel(config.max_pending_per_session);
    let session = Arc::new(HubSession {
        hub_id: hub_id.clone(),
        connection_id: connection_id.clone(),
        node_address: config.internal_addr.clone(),
        account_id,
        state: parking_lot::Mutex::new(SessionState::Established),
        outbound: outbound_tx,
        requests,
        last_activity_unix: AtomicU64::new(now_unix()),
        violations_this_minute: AtomicU32::new(0),
        violation_window_started_unix: AtomicU64::new(now_unix()),
    });

    registry.insert(hub_id.clone(), Arc::clone(&session));
    metrics.session_opened();
    audit::hub_connected(&hub_id, &connection_id, &config.internal_addr);

    let writer_task = tokio::spawn(async move {
        let mut keepalive = tokio::time::interval(config.keepalive_interval());
        loop {
            tokio::select! {
                maybe_msg = outbound_rx.recv() => {
                    match maybe_msg {
                        Some(msg) => {
                            if sink.send(msg).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    }
                }
                _ = keepalive.tick() => {
                    if sink.send(Message::Ping(Vec::new())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    let renew_session = Arc::clone(&session);
    let renew_store = Arc::clone(&connection_store);
    let renew_metrics = Arc::clone(&metrics);
    let renew_ttl = ttl;
    let renew_interval = config.renewal_interval();
    let renewal_task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(renew_interval);
        ticker.tick().await; // first tick fires immediately; skip it
        loop {
            ticker.tick().await;
            if renew_session.state() == SessionState::Closed {
                break;
            }
            match renew_store
                .renew(&renew_session.hub_id, &renew_session.connection_id, renew_ttl)
                .await
            {
                Ok(RenewOutcome::Ok) => {}
                Ok(RenewOutcome::Lost) | Err(_) => {
                    renew_metrics.lock_renewal_lost();
                    audit::lock_renewal_lost(&renew_session.hub_id, &renew_session.connection_id);
                    renew_session.set_state(SessionState::Closed);
                    break;
                }
            }
        }
    });

    reader_loop(&mut stream, &session, &config, &push_fanout).await;

    renewal_task.abort();
    session.set_state(SessionState::Closed);
    writer_task.abort();

    registry.remove_if_current(&hub_id, &session);
    let _ = connection_store.release(&hub_id, &connection_id).await;
    metrics.session_closed();

    for pending in session.requests.cancel_all_for_hub(&session.hub_id) {
        let _ = pending.reply.send(ResponseFrame {
            request_id: 0,
            status: 502,
            headers: vec![WireHeader { name: "content-type".into(), value: "text/plain".into() }],
            body: b"hub disconnected".to_vec(),
            streaming: false,
        });
    }

    audit::hub_disconnected(&hub_id, &connection_id, "channel closed");
}

/// Bridges an upgraded client WebSocket to `session` by wrapping it in
/// a single long-lived request whose body is streamed both ways as
/// `RequestChunk`/`ResponseChunk` frames — the hub channel has no raw
/// byte-stream primitive of its own, only framed requests.
pub async fn bridge_client_tunnel(client_ws: WebSocket, session: Arc<HubSession>, path: &str) {
    use base64::Engine;

    let (mut sink, mut stream) = client_ws.split();
    let (reply_tx, reply_rx) = oneshot::channel();
    let (body_tx, mut body_rx) = mpsc::channel::<Vec<u8>>(64);
    let request_id = session.requests.add(PendingRequest {
        hub_id: session.hub_id.clone(),
        reply: reply_tx,
        body_tx: Some(body_tx),
    });

    if session
        .send_frame(RelayFrame::request(request_id, "WEBSOCKET", path, vec![], &[]))
        .await
        .is_err()
    {
        session.requests.take(request_id);
        let _ = sink.send(Message::Close(None)).await;
        return;
    }

    match tokio::time::timeout(Duration::from_secs(30), reply_rx).await {
        Ok(Ok(resp)) if resp.status < 400 => {}
        _ => {
            let _ = sink.send(Message::Close(None)).await;
            return;
        }
    }

    loop {
        tokio::select! {
            client_msg = stream.next() => {
                let data_b64 = match client_msg {
                    Some(Ok(Message::Text(t))) => base64::engine::general_purpose::STANDARD.encode(t.as_bytes()),
                    Some(Ok(Message::Binary(b))) => base64::engine::general_purpose::STANDARD.encode(&b),
                    Some(Ok(Message::Close(_))) | None => {
                        let _ = session.send_frame(RelayFrame::RequestEnd { request_id }).await;
                        break;
                    }
                    _ => continue,
                };
                if session.send_frame(RelayFrame::RequestChunk { request_id, data_b64 }).await.is_err() {
                    break;
                }
            }
            chunk = body_rx.recv() => {
                match chunk {
                    Some(data) => {
                        if sink.send(Message::Binary(data)).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
        }
    }

    session.requests.take(request_id);
}

async fn reader_loop(
    stream: &mut futures_util::stream::SplitStream<WebSocket>,
    session: &Arc<HubSession>,
    config: &Config,
    push_fanout: &Arc<PushFanout>,
) {
    session.set_state(SessionState::Active);
    while let Some(msg) = stream.next().await {
        let Ok(msg) = msg else { break };
        session.touch();
        match msg {
            Message::Text(text) => {
                if dispatch_frame(&text, session, push_fanout).is_err()
                    && session.record_violation(config.violation_threshold_per_min)
                {
                    log::warn!("[HubSession {}] violation threshold exceeded, closing", session.hub_id);
                    break;
                }
            }
            Message::Pong(_) => {}
            Message::Close(_) => break,
            Message::Binary(_) | Message::Ping(_) => {}
        }
    }
}

/// Hands `notification` to the fanout on a detached task so its
/// progress doesn't depend on this session staying alive (`spec.md`
/// REDESIGN FLAGS "coroutine-free dispatch for notifications").
fn spawn_notification_dispatch(push_fanout: &Arc<PushFanout>, notification: push_fanout::Notification) {
    let push_fanout = Arc::clone(push_fanout);
    tokio::spawn(async move {
        if let Err(e) = push_fanout.dispatch(notification).await {
            log::warn!("[PushFanout] dispatch failed: {e:#}");
        }
    });
}

fn dispatch_frame(text: &str, session: &Arc<HubSession>, push_fanout: &Arc<PushFanout>) -> Result<(), ()> {
    let frame: HubFrame = serde_json::from_str(text).map_err(|_| ())?;
    match frame {
        HubFrame::Response { request_id, status, headers, body_b64, streaming } => {
            let decoded = ResponseFrame::decode(request_id, status, headers, body_b64, streaming).map_err(|_| ())?;
            if let Some(pending) = session.requests.take_if_owned_by(request_id, &session.hub_id) {
                let _ = pending.reply.send(decoded);
            }
            Ok(())
        }
        HubFrame::ResponseChunk { request_id, data_b64 } => {
            use base64::Engine;
            let data = base64::engine::general_purpose::STANDARD.decode(data_b64).map_err(|_| ())?;
            if let Some(tx) = session.requests.body_sender(request_id, &session.hub_id) {
                let _ = tx.try_send(data);
            }
            Ok(())
        }
        HubFrame::ResponseEnd { request_id } => {
            // Dropping the taken PendingRequest drops its body_tx, which
            // signals EOF to whatever is reading from body_rx.
            session.requests.take_if_owned_by(request_id, &session.hub_id);
            Ok(())
        }
        HubFrame::Error { request_id, message } => {
            if let Some(pending) = session.requests.take_if_owned_by(request_id, &session.hub_id) {
                let _ = pending.reply.send(ResponseFrame {
                    request_id,
                    status: 502,
                    headers: vec![],
                    body: message.into_bytes(),
                    streaming: false,
                });
            }
            Ok(())
        }
        HubFrame::Pong => Ok(()),
        HubFrame::Notification { user_id, fields } => {
            spawn_notification_dispatch(
                push_fanout,
                push_fanout::Notification {
                    recipient: Recipient::User(user_id),
                    message: fields.message,
                    icon: fields.icon,
                    severity: fields.severity,
                    tag: fields.tag,
                    title: fields.title,
                    on_click: fields.on_click,
                    media_url: fields.media_attachment_url,
                    action_buttons: fields
                        .action_buttons()
                        .into_iter()
                        .map(|b| push_fanout::ActionButton { title: b.title, action: b.action })
                        .collect(),
                    log_only: false,
                },
            );
            Ok(())
        }
        HubFrame::BroadcastNotification { fields } => {
            spawn_notification_dispatch(
                push_fanout,
                push_fanout::Notification {
                    recipient: Recipient::AllAccountUsers(session.account_id.clone()),
                    message: fields.message,
                    icon: fields.icon,
                    severity: fields.severity,
                    tag: fields.tag,
                    title: fields.title,
                    on_click: fields.on_click,
                    media_url: fields.media_attachment_url,
                    action_buttons: fields
                        .action_buttons()
                        .into_iter()
                        .map(|b| push_fanout::ActionButton { title: b.title, action: b.action })
                        .collect(),
                    log_only: false,
                },
            );
            Ok(())
        }
        HubFrame::LogNotification { fields } => {
            spawn_notification_dispatch(
                push_fanout,
                push_fanout::Notification {
                    recipient: Recipient::None,
                    message: fields.message,
                    icon: fields.icon,
                    severity: fields.severity,
                    tag: fields.tag,
                    title: fields.title,
                    on_click: fields.on_click,
                    media_url: fields.media_attachment_url,
                    action_buttons: vec![],
                    log_only: true,
                },
            );
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_session(max_pending: usize) -> (Arc<HubSession>, mpsc::Receiver<Message>) {
        let (tx, rx) = mpsc::channel(max_pending);
        let session = Arc::new(HubSession {
            hub_id: "hub-1".into(),
            connection_id: "conn-1".into(),
            node_address: "10.0.0.1:7000".into(),
            account_id: "acct-1".into(),
            state: parking_lot::Mutex::new(SessionState::Active),
            outbound: tx,
            requests: Arc::new(RequestTracker::new()),
            last_activity_unix: AtomicU64::new(now_unix()),
            violations_this_minute: AtomicU32::new(0),
            violation_window_started_unix: AtomicU64::new(now_unix()),
        });
        (session, rx)
    }

    #[tokio::test]
    async fn send_frame_fails_fast_when_buffer_is_full() {
        let (session, _rx) = new_session(1);
        session.send_frame(RelayFrame::Ping).await.unwrap();
        let err = session.send_frame(RelayFrame::Ping).await.unwrap_err();
        assert!(matches!(err, RelayError::ResourceExhausted(_)));
    }

    #[test]
    fn violation_threshold_trips_after_limit() {
        let (session, _rx) = new_session(8);
        for _ in 0..5 {
            assert!(!session.record_violation(5));
        }
        assert!(session.record_violation(5));
    }

    #[test]
    fn is_dead_reflects_elapsed_inactivity() {
        let (session, _rx) = new_session(8);
        session.last_activity_unix.store(now_unix() - 120, Ordering::Relaxed);
        assert!(session.is_dead(Duration::from_secs(60)));
        session.touch();
        assert!(!session.is_dead(Duration::from_secs(60)));
    }

    #[tokio::test]
    async fn response_frame_only_completes_the_owning_hubs_request() {
        let (session, _rx) = new_session(8);
        let (reply_tx, reply_rx) = oneshot::channel();
        let request_id = session.requests.add(PendingRequest {
            hub_id: "some-other-hub".into(),
            reply: reply_tx,
            body_tx: None,
        });

        let push_fanout = test_push_fanout();
        let text = format!(r#"{{"event":"response","request_id":{request_id},"status":200,"headers":[]}}"#);
        dispatch_frame(&text, &session, &push_fanout).unwrap();

        // session's hub_id ("hub-1") doesn't own this request, so it must
        // still be pending and the reply still unsent.
        assert!(session.requests.take_if_owned_by(request_id, "some-other-hub").is_some());
        drop(reply_rx);
    }

    fn test_push_fanout() -> Arc<PushFanout> {
        use crate::push_fanout::provider::{DeliveryOutcome, PushProvider};
        use crate::user_directory::{DeviceToken, InMemoryUserDirectory};

        struct NoopProvider;
        #[async_trait::async_trait]
        impl PushProvider for NoopProvider {
            async fn deliver(&self, _token: &DeviceToken, _payload: &[u8]) -> anyhow::Result<DeliveryOutcome> {
                Ok(DeliveryOutcome::Delivered)
            }
        }

        Arc::new(PushFanout::new(Arc::new(InMemoryUserDirectory::new()), Arc::new(NoopProvider)))
    }

    #[tokio::test]
    async fn notification_frame_is_accepted_and_dispatched_without_blocking_the_reader() {
        let (session, _rx) = new_session(8);
        let push_fanout = test_push_fanout();
        let text = r#"{"event":"notification","userId":"user-1","message":"hi"}"#;
        assert!(dispatch_frame(text, &session, &push_fanout).is_ok());
    }
}
