//! The public-facing surface clients hit: `<hub-id>.<public_host>` is
//! resolved to a hub-id and every request is handed to the multiplexer.
//!
//! Hub-id resolution from the leading label of the `Host` header
//! mirrors the production system this spec describes (a per-hub
//! subdomain rather than a path prefix).

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Request, State};
use axum::response::{IntoResponse, Response};

use crate::app_state::AppState;
use crate::errors::RelayError;
use crate::hub_resolver::SubdomainHubResolver;
use crate::multiplexer;

pub async fn dispatch(State(state): State<AppState>, ws: Option<WebSocketUpgrade>, req: Request) -> Response {
    let Some(host) = req.headers().get("host").and_then(|v| v.to_str().ok()).map(str::to_string) else {
        return (axum::http::StatusCode::BAD_REQUEST, "missing Host header").into_response();
    };
    let Some(hub_id) = SubdomainHubResolver.resolve(&host) else {
        return (axum::http::StatusCode::BAD_REQUEST, "could not resolve hub from Host header").into_response();
    };

    if multiplexer::is_websocket_upgrade(req.headers()) {
        let Some(ws) = ws else {
            return (axum::http::StatusCode::BAD_REQUEST, "malformed websocket upgrade request").into_response();
        };
        return handle_websocket_upgrade(state, hub_id, req, ws).await;
    }

    let ctx = state.dispatch_context();
    multiplexer::dispatch_http(&ctx, &hub_id, req).await.into_response()
}

async fn handle_websocket_upgrade(state: AppState, hub_id: String, req: Request, ws: WebSocketUpgrade) -> Response {
    let path = req.uri().path().to_string();

    let ownership = match state.connection_store.lookup(&hub_id).await {
        Ok(Some(o)) if !o.is_expired(std::time::SystemTime::now()) => o,
        _ => return error_response(&RelayError::HubOffline),
    };

    if ownership.node_address != state.config.internal_addr {
        let cross_node = state.cross_node;
        let target = ownership.node_address;
        return ws.on_upgrade(move |socket| async move {
            if let Err(e) = cross_node.bridge_websocket(&target, &path, socket).await {
                log::warn!("[public] cross-node websocket bridge failed: {e}");
            }
        });
    }

    // Local-node tunnel: the hub has no raw byte-stream concept, only
    // framed requests, so the upgraded connection is driven through the
    // same Request/ResponseChunk frames as a long streaming HTTP body.
    let Some(session) = state.registry.get(&hub_id) else {
        return error_response(&RelayError::HubOffline);
    };

    ws.on_upgrade(move |socket| async move {
        crate::hub_session::bridge_client_tunnel(socket, session, &path).await;
    })
}

fn error_response(err: &RelayError) -> Response {
    (err.status_code(), err.body_text()).into_response()
}

