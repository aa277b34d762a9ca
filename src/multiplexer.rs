//! Converts an inbound client request into a hub frame sequence and the
//! hub's reply back into an HTTP response (`spec.md` §4.4).
//!
//! The eight dispatch steps from the spec: resolve the hub-id, look up
//! its owning node, branch local vs. cross-node, register a
//! `PendingRequest`, apply header hygiene, detect a WebSocket upgrade,
//! emit the frame, and relay the response while preserving per-request
//! ordering.

use std::sync::Arc;
use std::time::Instant;

use axum::body::Body;
use axum::http::{HeaderMap, Request, Response, StatusCode};
use tokio::sync::oneshot;

use crate::audit;
use crate::config::Config;
use crate::connection_store::ConnectionStore;
use crate::cross_node::{resolve_host_and_path, CrossNodeForwarder};
use crate::errors::RelayError;
use crate::hub_session::frames::{RelayFrame, WireHeader};
use crate::hub_session::HubSession;
use crate::request_tracker::{PendingRequest, RequestTracker};
use crate::session_registry::SessionRegistry;

/// Headers stripped before a request is relayed to a hub (`spec.md`
/// §4.4 step 4): hop-by-hop names, and anything that would otherwise
/// leak the client's own session/identity to the third-party hub
/// (cookies, bearer tokens, and the proxy-chain headers set by
/// whatever sits in front of this node).
const IGNORED_REQUEST_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "upgrade",
    "host",
    "cookie",
    "cookie2",
    "authorization",
    "x-real-ip",
    "x-forwarded-for",
    "x-forwarded-proto",
    "user-agent",
];

/// Fixed `user-agent` sent on every forwarded request, replacing the
/// client's own (`spec.md` §4.4 step 4).
const RELAY_USER_AGENT: &str = concat!("hub-relay/", env!("CARGO_PKG_VERSION"));

fn wire_headers(headers: &HeaderMap, host: &str) -> Vec<WireHeader> {
    let mut wire: Vec<WireHeader> = headers
        .iter()
        .filter(|(name, _)| !IGNORED_REQUEST_HEADERS.contains(&name.as_str()))
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| WireHeader { name: name.as_str().to_string(), value: v.to_string() })
        })
        .collect();
    wire.push(WireHeader { name: "host".to_string(), value: host.to_string() });
    wire.push(WireHeader { name: "user-agent".to_string(), value: RELAY_USER_AGENT.to_string() });
    wire
}

fn error_response(err: &RelayError) -> Response<Body> {
    Response::builder()
        .status(err.status_code())
        .header("content-type", "text/plain")
        .body(Body::from(err.body_text()))
        .unwrap_or_else(|_| Response::new(Body::empty()))
}

/// Everything the multiplexer needs from the wider application without
/// depending on the HTTP-layer `AppState` type directly.
pub struct DispatchContext {
    pub config: Arc<Config>,
    pub connection_store: Arc<dyn ConnectionStore>,
    pub registry: Arc<SessionRegistry<HubSession>>,
    pub cross_node: Arc<CrossNodeForwarder>,
    pub metrics: Arc<audit::Metrics>,
    pub request_tracker: Arc<RequestTracker>,
}

/// Dispatches a single buffered HTTP request to `hub_id`, steps 1-8 of
/// `spec.md` §4.4. Handles both the local-node and cross-node branches.
pub async fn dispatch_http(ctx: &DispatchContext, hub_id: &str, req: Request<Body>) -> Response<Body> {
    let ownership = match ctx.connection_store.lookup(hub_id).await {
        Ok(Some(o)) if !o.is_expired(std::time::SystemTime::now()) => o,
        Ok(_) => return error_response(&RelayError::HubOffline),
        Err(e) => {
            log::error!("[multiplexer] lookup failed for hub {hub_id}: {e:#}");
            return error_response(&RelayError::TransientUpstream(e.to_string()));
        }
    };

    let (host, path) = resolve_host_and_path(req.uri().path(), ctx.config.remote_host.as_deref(), &ctx.config.public_host);
    let method = req.method().clone();
    let headers = req.headers().clone();

    if ownership.node_address != ctx.config.internal_addr {
        ctx.metrics.cross_node_forward();
        audit::cross_node_forward(hub_id, &ownership.node_address);
        let body = match axum::body::to_bytes(req.into_body(), usize::MAX).await {
            Ok(b) => b.to_vec(),
            Err(e) => return error_response(&RelayError::ProtocolViolation(e.to_string())),
        };
        return match ctx
            .cross_node
            .forward_http(&ownership.node_address, method.as_str(), path, &headers, body)
            .await
        {
            Ok(resp) => resp,
            Err(e) => error_response(&e),
        };
    }

    let Some(session) = ctx.registry.get(hub_id) else {
        return error_response(&RelayError::HubOffline);
    };

    let body = match axum::body::to_bytes(req.into_body(), usize::MAX).await {
        Ok(b) => b.to_vec(),
        Err(e) => return error_response(&RelayError::ProtocolViolation(e.to_string())),
    };

    let (reply_tx, reply_rx) = oneshot::channel();
    let request_id = ctx.request_tracker.add(PendingRequest {
        hub_id: hub_id.to_string(),
        reply: reply_tx,
        body_tx: None,
    });

    ctx.metrics.request_started();
    audit::request_dispatched(hub_id, request_id, method.as_str(), path);
    let started = Instant::now();

    let frame = RelayFrame::request(request_id, method.as_str(), path, wire_headers(&headers, &host), &body);
    if let Err(e) = session.send_frame(frame).await {
        ctx.request_tracker.take(request_id);
        ctx.metrics.request_finished();
        return error_response(&e);
    }

    let response = match tokio::time::timeout(ctx.config.request_timeout(), reply_rx).await {
        Ok(Ok(resp)) => {
            ctx.metrics.request_finished();
            audit::request_completed(hub_id, request_id, resp.status, started.elapsed());
            let mut builder = Response::builder().status(
                StatusCode::from_u16(resp.status).unwrap_or(StatusCode::BAD_GATEWAY),
            );
            for header in &resp.headers {
                builder = builder.header(header.name.as_str(), header.value.as_str());
            }
            builder.body(Body::from(resp.body)).unwrap_or_else(|_| Response::new(Body::empty()))
        }
        Ok(Err(_)) => {
            // Sender dropped without replying — session tore down mid-flight.
            ctx.metrics.request_finished();
            audit::request_failed(hub_id, request_id, "session closed before reply");
            error_response(&RelayError::FatalSession("hub session closed".to_string()))
        }
        Err(_) => {
            ctx.request_tracker.take(request_id);
            ctx.metrics.request_finished();
            ctx.metrics.request_cancelled();
            audit::request_failed(hub_id, request_id, "timed out");
            let _ = session.send_frame(RelayFrame::Cancel { request_id }).await;
            error_response(&RelayError::GatewayTimeout("request timed out".to_string()))
        }
    };

    response
}

/// Whether a request is asking to upgrade to a WebSocket tunnel
/// (`spec.md` §4.4 step "WS-upgrade detection"): either an
/// `upgrade: websocket` header, or the presence of both
/// `sec-websocket-key` and `sec-websocket-version`.
#[must_use]
pub fn is_websocket_upgrade(headers: &HeaderMap) -> bool {
    let upgrade_is_websocket = headers
        .get("upgrade")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("websocket"));
    let has_sec_websocket_pair = headers.contains_key("sec-websocket-key") && headers.contains_key("sec-websocket-version");
    upgrade_is_websocket || has_sec_websocket_pair
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn websocket_upgrade_detected_via_upgrade_header() {
        let mut headers = HeaderMap::new();
        headers.insert("connection", HeaderValue::from_static("Upgrade"));
        headers.insert("upgrade", HeaderValue::from_static("websocket"));
        assert!(is_websocket_upgrade(&headers));

        let mut plain = HeaderMap::new();
        plain.insert("connection", HeaderValue::from_static("keep-alive"));
        assert!(!is_websocket_upgrade(&plain));
    }

    #[test]
    fn websocket_upgrade_detected_via_sec_websocket_headers_alone() {
        let mut headers = HeaderMap::new();
        headers.insert("sec-websocket-key", HeaderValue::from_static("dGhlIHNhbXBsZSBub25jZQ=="));
        headers.insert("sec-websocket-version", HeaderValue::from_static("13"));
        assert!(is_websocket_upgrade(&headers));

        let mut partial = HeaderMap::new();
        partial.insert("sec-websocket-key", HeaderValue::from_static("dGhlIHNhbXBsZSBub25jZQ=="));
        assert!(!is_websocket_upgrade(&partial));
    }

    #[test]
    fn wire_headers_drop_sensitive_and_hop_by_hop_names() {
        let mut headers = HeaderMap::new();
        headers.insert("host", HeaderValue::from_static("home.example.org"));
        headers.insert("accept", HeaderValue::from_static("application/json"));
        headers.insert("cookie", HeaderValue::from_static("session=secret"));
        headers.insert("authorization", HeaderValue::from_static("Bearer secret"));
        headers.insert("x-forwarded-for", HeaderValue::from_static("203.0.113.9"));
        headers.insert("user-agent", HeaderValue::from_static("curl/8.0"));
        let wire = wire_headers(&headers, "public.example.org");

        assert!(wire.iter().any(|h| h.name == "accept"));
        assert!(!wire.iter().any(|h| h.name == "cookie"));
        assert!(!wire.iter().any(|h| h.name == "authorization"));
        assert!(!wire.iter().any(|h| h.name == "x-forwarded-for"));

        let host = wire.iter().find(|h| h.name == "host").expect("host header injected");
        assert_eq!(host.value, "public.example.org");

        let ua = wire.iter().find(|h| h.name == "user-agent").expect("user-agent header injected");
        assert_eq!(ua.value, RELAY_USER_AGENT);
        assert_ne!(ua.value, "curl/8.0");
    }
}
