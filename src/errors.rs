//! Typed error kinds for the multiplexer's client-status mapping.
//!
//! `anyhow::Result` is used everywhere else in this crate, exactly as the
//! donor CLI uses it — this enum exists only at the one boundary the spec
//! requires a deterministic status mapping: the multiplexer translating a
//! hub/store failure into an HTTP response.

use axum::http::StatusCode;
use thiserror::Error;

/// The five error kinds from the propagation policy.
#[derive(Debug, Error)]
pub enum RelayError {
    /// Hub channel momentarily blocked, store timeout. Retried a bounded
    /// number of times by the caller before this is returned.
    #[error("transient upstream failure: {0}")]
    TransientUpstream(String),

    /// Lock held by another node, blocked uuid, bad secret.
    #[error("authoritative refusal: {0}")]
    AuthoritativeRefusal(String),

    /// Frame referenced an unknown request-id or was malformed.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// Outbound buffer full beyond the configured wait.
    #[error("local resource exhausted: {0}")]
    ResourceExhausted(String),

    /// Renewal loss, read error — session is in `Closed`.
    #[error("fatal session error: {0}")]
    FatalSession(String),

    /// No `ConnectionOwnership` exists for the resolved hub-id.
    #[error("hub is offline")]
    HubOffline,

    /// `CrossNodeForwarder` detected it would forward to itself.
    #[error("forwarding loop detected")]
    ForwardingLoop,

    /// A request was forcibly finalized after waiting past the
    /// configured deadline without a complete response from the hub.
    #[error("gateway timeout: {0}")]
    GatewayTimeout(String),
}

impl RelayError {
    /// Maps this error to the client-visible HTTP status, per `spec.md` §7.
    #[must_use]
    pub fn status_code(&self) -> StatusCode {
        match self {
            RelayError::HubOffline => StatusCode::INTERNAL_SERVER_ERROR,
            RelayError::TransientUpstream(_) => StatusCode::BAD_GATEWAY,
            RelayError::AuthoritativeRefusal(_) => StatusCode::FORBIDDEN,
            RelayError::ProtocolViolation(_) => StatusCode::BAD_GATEWAY,
            RelayError::ResourceExhausted(_) => StatusCode::SERVICE_UNAVAILABLE,
            RelayError::FatalSession(_) => StatusCode::BAD_GATEWAY,
            RelayError::ForwardingLoop => StatusCode::INTERNAL_SERVER_ERROR,
            RelayError::GatewayTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
        }
    }

    /// The body text the client sees. `HubOffline` reuses the donor
    /// system's exact historic wording (`spec.md` scenario 3).
    #[must_use]
    pub fn body_text(&self) -> String {
        match self {
            RelayError::HubOffline => "openHAB is offline".to_string(),
            other => other.to_string(),
        }
    }
}
