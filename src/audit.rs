//! Structured one-line-per-event audit records and process-wide counters.
//!
//! Audit records go through `log` at `target: "audit"` exactly like the
//! donor CLI's `log::info!` call sites — a dedicated logger/appender can
//! be pointed at that target in production without this crate knowing
//! or caring where the lines end up.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

pub fn hub_connected(hub_id: &str, connection_id: &str, node_address: &str) {
    log::info!(target: "audit", "hub_connected hub_id={hub_id} connection_id={connection_id} node={node_address}");
}

pub fn hub_disconnected(hub_id: &str, connection_id: &str, reason: &str) {
    log::info!(target: "audit", "hub_disconnected hub_id={hub_id} connection_id={connection_id} reason={reason}");
}

pub fn hub_refused(hub_id: &str, reason: &str) {
    log::warn!(target: "audit", "hub_refused hub_id={hub_id} reason={reason}");
}

pub fn request_dispatched(hub_id: &str, request_id: u64, method: &str, path: &str) {
    log::info!(target: "audit", "request_dispatched hub_id={hub_id} request_id={request_id} method={method} path={path}");
}

pub fn request_completed(hub_id: &str, request_id: u64, status: u16, elapsed: Duration) {
    log::info!(
        target: "audit",
        "request_completed hub_id={hub_id} request_id={request_id} status={status} elapsed_ms={}",
        elapsed.as_millis()
    );
}

pub fn request_failed(hub_id: &str, request_id: u64, reason: &str) {
    log::warn!(target: "audit", "request_failed hub_id={hub_id} request_id={request_id} reason={reason}");
}

pub fn cross_node_forward(hub_id: &str, target_node: &str) {
    log::info!(target: "audit", "cross_node_forward hub_id={hub_id} target_node={target_node}");
}

pub fn lock_renewal_lost(hub_id: &str, connection_id: &str) {
    log::warn!(target: "audit", "lock_renewal_lost hub_id={hub_id} connection_id={connection_id}");
}

/// Process-wide counters exposed at `/metrics` (`spec.md` §3 Metrics).
#[derive(Default)]
pub struct Metrics {
    pub active_sessions: AtomicU64,
    pub pending_requests: AtomicU64,
    pub requests_total: AtomicU64,
    pub requests_cancelled: AtomicU64,
    pub cross_node_forwards: AtomicU64,
    pub lock_renewal_losses: AtomicU64,
}

impl Metrics {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn session_opened(&self) {
        self.active_sessions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn session_closed(&self) {
        self.active_sessions.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn request_started(&self) {
        self.pending_requests.fetch_add(1, Ordering::Relaxed);
        self.requests_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn request_finished(&self) {
        self.pending_requests.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn request_cancelled(&self) {
        self.requests_cancelled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn cross_node_forward(&self) {
        self.cross_node_forwards.fetch_add(1, Ordering::Relaxed);
    }

    pub fn lock_renewal_lost(&self) {
        self.lock_renewal_losses.fetch_add(1, Ordering::Relaxed);
    }

    /// Renders the Prometheus text exposition format served by
    /// `GET /metrics` (`src/http/metrics.rs`).
    #[must_use]
    pub fn render(&self) -> String {
        format!(
            "relay_active_sessions {}\n\
             relay_pending_requests {}\n\
             relay_requests_total {}\n\
             relay_requests_cancelled_total {}\n\
             relay_cross_node_forwards_total {}\n\
             relay_lock_renewal_losses_total {}\n",
            self.active_sessions.load(Ordering::Relaxed),
            self.pending_requests.load(Ordering::Relaxed),
            self.requests_total.load(Ordering::Relaxed),
            self.requests_cancelled.load(Ordering::Relaxed),
            self.cross_node_forwards.load(Ordering::Relaxed),
            self.lock_renewal_losses.load(Ordering::Relaxed),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_includes_every_counter_name() {
        let metrics = Metrics::new();
        metrics.session_opened();
        metrics.request_started();
        let rendered = metrics.render();
        assert!(rendered.contains("relay_active_sessions 1"));
        assert!(rendered.contains("relay_pending_requests 1"));
    }

    #[test]
    fn session_closed_decrements_active_sessions() {
        let metrics = Metrics::new();
        metrics.session_opened();
        metrics.session_opened();
        metrics.session_closed();
        assert_eq!(metrics.active_sessions.load(Ordering::Relaxed), 1);
    }
}
