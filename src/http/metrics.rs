//! Prometheus text-exposition endpoint.

use axum::extract::State;

use crate::app_state::AppState;

pub async fn serve(State(state): State<AppState>) -> String {
    state.metrics.render()
}
