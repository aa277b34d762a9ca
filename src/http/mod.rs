//! HTTP/WebSocket surface: the hub-facing channel endpoint, the public
//! client-facing proxy routes, and the metrics endpoint.

pub mod hub_ws;
pub mod metrics;
pub mod public;

use axum::routing::{any, get};
use axum::Router;

use crate::app_state::AppState;

/// Builds the full router served on `config.public_addr`. A single bind
/// address carries both hub connections and client traffic, matching
/// `spec.md`'s description of one public surface distinguishing the two
/// by path rather than by port.
#[must_use]
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/hub/ws", get(hub_ws::accept))
        .route("/metrics", get(metrics::serve))
        .route("/*path", any(public::dispatch))
        .with_state(state)
}
