//! Re-proxies a request to the cluster node that actually owns the
//! target hub's channel (`spec.md` §4.5 `CrossNodeForwarder`).
//!
//! HTTP requests are re-proxied with `reqwest`, exactly as the donor's
//! `relay::http_proxy` module builds and replays an upstream request;
//! WebSocket upgrades are bridged message-by-message through
//! `tokio-tungstenite`, the same crate the donor uses for its own
//! outbound hub channel.

use axum::body::Body;
use axum::http::{HeaderMap, HeaderName, HeaderValue, Request, Response, StatusCode};
use futures_util::{SinkExt, StreamExt};

use crate::errors::RelayError;

/// Request headers that must never be forwarded verbatim to the next
/// hop — connection-specific, per RFC 7230 §6.1.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
];

fn strip_hop_by_hop(headers: &HeaderMap) -> HeaderMap {
    let mut out = HeaderMap::new();
    for (name, value) in headers {
        if !HOP_BY_HOP.contains(&name.as_str()) {
            out.insert(name.clone(), value.clone());
        }
    }
    out
}

pub struct CrossNodeForwarder {
    client: reqwest::Client,
    /// This node's own internal address, compared against the target
    /// to catch a forwarding loop (`spec.md` §7 "forwarding loop").
    internal_addr: String,
}

impl CrossNodeForwarder {
    #[must_use]
    pub fn new(internal_addr: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            internal_addr,
        }
    }

    /// Re-proxies a buffered HTTP request to `target_node_address`
    /// (`"host:port"` on the internal network) and returns the upstream
    /// response, buffered in turn.
    pub async fn forward_http(
        &self,
        target_node_address: &str,
        method: &str,
        path: &str,
        headers: &HeaderMap,
        body: Vec<u8>,
    ) -> Result<Response<Body>, RelayError> {
        if target_node_address == self.internal_addr {
            return Err(RelayError::ForwardingLoop);
        }

        let method = reqwest::Method::from_bytes(method.as_bytes())
            .map_err(|e| RelayError::ProtocolViolation(e.to_string()))?;
        let url = format!("http://{target_node_address}{path}");

        let mut req = self.client.request(method, &url);
        for (name, value) in strip_hop_by_hop(headers) {
            if let Some(name) = name {
                req = req.header(name, value);
            }
        }
        req = req.body(body);

        let upstream = req.send().await.map_err(|e| RelayError::TransientUpstream(e.to_string()))?;

        let status = StatusCode::from_u16(upstream.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
        let mut builder = Response::builder().status(status);
        for (name, value) in upstream.headers() {
            if HOP_BY_HOP.contains(&name.as_str()) {
                continue;
            }
            if let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(name.as_str().as_bytes()),
                HeaderValue::from_bytes(value.as_bytes()),
            ) {
                builder = builder.header(name, value);
            }
        }
        let body_bytes = upstream.bytes().await.map_err(|e| RelayError::TransientUpstream(e.to_string()))?;
        builder
            .body(Body::from(body_bytes))
            .map_err(|e| RelayError::ProtocolViolation(e.to_string()))
    }

    /// Bridges a client's WebSocket to the owning node's internal
    /// WebSocket endpoint for `path`, relaying messages in both
    /// directions until either side closes.
    pub async fn bridge_websocket(
        &self,
        target_node_address: &str,
        path: &str,
        client_ws: axum::extract::ws::WebSocket,
    ) -> Result<(), RelayError> {
        if target_node_address == self.internal_addr {
            return Err(RelayError::ForwardingLoop);
        }

        let url = format!("ws://{target_node_address}{path}");
        let (upstream, _resp) = tokio_tungstenite::connect_async(&url)
            .await
            .map_err(|e| RelayError::TransientUpstream(e.to_string()))?;

        let (mut client_sink, mut client_stream) = client_ws.split();
        let (mut upstream_sink, mut upstream_stream) = upstream.split();

        let client_to_upstream = async {
            while let Some(Ok(msg)) = client_stream.next().await {
                let Some(msg) = to_tungstenite(msg) else { break };
                if upstream_sink.send(msg).await.is_err() {
                    break;
                }
            }
        };
        let upstream_to_client = async {
            while let Some(Ok(msg)) = upstream_stream.next().await {
                let Some(msg) = from_tungstenite(msg) else { continue };
                if client_sink.send(msg).await.is_err() {
                    break;
                }
            }
        };

        tokio::join!(client_to_upstream, upstream_to_client);
        Ok(())
    }
}

fn to_tungstenite(msg: axum::extract::ws::Message) -> Option<tokio_tungstenite::tungstenite::Message> {
    use axum::extract::ws::Message as A;
    use tokio_tungstenite::tungstenite::Message as T;
    Some(match msg {
        A::Text(t) => T::Text(t),
        A::Binary(b) => T::Binary(b),
        A::Ping(p) => T::Ping(p),
        A::Pong(p) => T::Pong(p),
        A::Close(_) => return None,
    })
}

fn from_tungstenite(msg: tokio_tungstenite::tungstenite::Message) -> Option<axum::extract::ws::Message> {
    use axum::extract::ws::Message as A;
    use tokio_tungstenite::tungstenite::Message as T;
    Some(match msg {
        T::Text(t) => A::Text(t),
        T::Binary(b) => A::Binary(b),
        T::Ping(p) => A::Ping(p),
        T::Pong(p) => A::Pong(p),
        T::Close(_) | T::Frame(_) => return None,
    })
}

/// Given the inbound request path, decides whether it should be
/// rewritten under the `/remote/` prefix rule (`spec.md` §4.4 header
/// hygiene) and returns the `(host_header, rewritten_path)` pair.
#[must_use]
pub fn resolve_host_and_path<'a>(path: &'a str, remote_host: Option<&str>, public_host: &str) -> (String, &'a str) {
    match (remote_host, path.strip_prefix("/remote/")) {
        (Some(remote_host), Some(rest)) => (remote_host.to_string(), stripped_path(path, rest)),
        _ => (public_host.to_string(), path),
    }
}

fn stripped_path<'a>(full: &'a str, rest: &'a str) -> &'a str {
    let offset = full.len() - rest.len() - 1;
    &full[offset..]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remote_prefix_is_stripped_and_host_substituted() {
        let (host, path) = resolve_host_and_path("/remote/rest/items", Some("internal.example.org"), "home.example.org");
        assert_eq!(host, "internal.example.org");
        assert_eq!(path, "/rest/items");
    }

    #[test]
    fn non_remote_path_keeps_public_host() {
        let (host, path) = resolve_host_and_path("/rest/items", Some("internal.example.org"), "home.example.org");
        assert_eq!(host, "home.example.org");
        assert_eq!(path, "/rest/items");
    }

    #[test]
    fn hop_by_hop_headers_are_stripped() {
        let mut headers = HeaderMap::new();
        headers.insert("connection", HeaderValue::from_static("keep-alive"));
        headers.insert("accept", HeaderValue::from_static("application/json"));
        let stripped = strip_hop_by_hop(&headers);
        assert!(!stripped.contains_key("connection"));
        assert!(stripped.contains_key("accept"));
    }
}
