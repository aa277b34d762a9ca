//! Accepts the hub-facing WebSocket upgrade.
//!
//! The handshake itself — `uuid` as a query parameter, `secret` as a
//! header, both presented on the upgrade request (`spec.md` §6
//! "Handshake") — is authenticated *before* the socket is accepted, so
//! every refusal (unknown uuid, blocked uuid, bad secret, lock already
//! held) comes back as an ordinary HTTP status instead of a 101 followed
//! by an immediate close.

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use serde::Deserialize;

use crate::app_state::AppState;
use crate::audit;
use crate::connection_store::AcquireOutcome;
use crate::errors::RelayError;

#[derive(Deserialize)]
pub struct HandshakeQuery {
    uuid: String,
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

pub async fn accept(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(query): Query<HandshakeQuery>,
    headers: HeaderMap,
) -> Response {
    let hub_id = query.uuid;

    let Some(secret) = header_str(&headers, "secret") else {
        audit::hub_refused(&hub_id, "missing secret header");
        return (axum::http::StatusCode::BAD_REQUEST, "missing secret header").into_response();
    };
    let openhabversion = header_str(&headers, "openhabversion").map(str::to_string);

    if let Ok(Some(block)) = state.connection_store.is_blocked(&hub_id).await {
        audit::hub_refused(&hub_id, &format!("blocked: {}", block.reason));
        return error_response(&RelayError::AuthoritativeRefusal(format!("blocked: {}", block.reason)));
    }

    let account_id = match state.hub_directory.find_hub(&hub_id).await {
        Ok(Some(record)) => record.account_id,
        Ok(None) => {
            audit::hub_refused(&hub_id, "unknown hub uuid");
            return error_response(&RelayError::AuthoritativeRefusal("unknown hub uuid".to_string()));
        }
        Err(e) => {
            log::error!("[hub_ws] find_hub failed for {hub_id}: {e:#}");
            return error_response(&RelayError::TransientUpstream(e.to_string()));
        }
    };

    match state.hub_directory.verify_secret(&hub_id, &secrecy::Secret::new(secret.to_string())).await {
        Ok(true) => {}
        Ok(false) => {
            audit::hub_refused(&hub_id, "secret mismatch");
            return error_response(&RelayError::AuthoritativeRefusal("secret mismatch".to_string()));
        }
        Err(e) => {
            log::error!("[hub_ws] verify_secret failed for {hub_id}: {e:#}");
            return error_response(&RelayError::TransientUpstream(e.to_string()));
        }
    }

    let connection_id = uuid::Uuid::new_v4().to_string();
    let ttl = state.config.lock_ttl();
    match state
        .connection_store
        .acquire(&hub_id, &connection_id, &state.config.internal_addr, openhabversion, ttl)
        .await
    {
        Ok(AcquireOutcome::Ok) => {}
        Ok(AcquireOutcome::AlreadyHeld) => {
            audit::hub_refused(&hub_id, "connection already owned elsewhere");
            return error_response(&RelayError::AuthoritativeRefusal("connection already owned elsewhere".to_string()));
        }
        Err(e) => {
            log::error!("[hub_ws] acquire failed for {hub_id}: {e:#}");
            return error_response(&RelayError::TransientUpstream(e.to_string()));
        }
    }

    ws.on_upgrade(move |socket| async move {
        crate::hub_session::run(
            socket,
            state.config,
            state.connection_store,
            state.registry,
            state.metrics,
            state.push_fanout,
            state.request_tracker,
            hub_id,
            connection_id,
            account_id,
        )
        .await;
    })
}

fn error_response(err: &RelayError) -> Response {
    (err.status_code(), err.body_text()).into_response()
}
