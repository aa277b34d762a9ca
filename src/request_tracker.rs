//! Per-node request-id to in-flight-request map (`spec.md` §3
//! `RequestTracker`, §4.3).
//!
//! One `RequestTracker` is shared by every `HubSession` on a node (owned
//! by `AppState`): request-ids are handed out from a single `AtomicU64`
//! counter so they are unique across the whole node for the lifetime of
//! the process (invariant I3), not merely within one hub's channel. Each
//! entry records which hub it belongs to so a session tearing down only
//! cancels its own requests, and so a frame referencing another hub's
//! request-id can't be used to complete or read someone else's request.

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::oneshot;

use crate::hub_session::frames::ResponseFrame;

/// A request awaiting its response frame(s) from the hub.
pub struct PendingRequest {
    /// The hub this request was issued to; only that hub may complete it.
    pub hub_id: String,
    /// Completed with the first response frame (headers + status, or the
    /// full body for non-streamed responses).
    pub reply: oneshot::Sender<ResponseFrame>,
    /// Streaming body chunks, if the response declared one. `None` for
    /// requests where the whole body arrived in the single reply frame.
    pub body_tx: Option<tokio::sync::mpsc::Sender<Vec<u8>>>,
}

/// Tracks every request in flight against any hub session on this node.
#[derive(Default)]
pub struct RequestTracker {
    next_id: AtomicU64,
    pending: DashMap<u64, PendingRequest>,
}

impl RequestTracker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocates a fresh, node-wide request-id and registers `pending`
    /// under it.
    #[must_use]
    pub fn add(&self, pending: PendingRequest) -> u64 {
        let request_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.pending.insert(request_id, pending);
        request_id
    }

    /// Removes and returns the pending request for `request_id`, if any.
    /// Idempotent: a second call for the same id returns `None` rather
    /// than erroring, since a frame racing a client-cancel is expected.
    /// For use only by the component that allocated `request_id` itself
    /// (the multiplexer, the client-tunnel bridge) — frames arriving off
    /// the wire must go through [`Self::take_if_owned_by`] instead.
    #[must_use]
    pub fn take(&self, request_id: u64) -> Option<PendingRequest> {
        self.pending.remove(&request_id).map(|(_, v)| v)
    }

    /// Removes and returns the pending request for `request_id` only if
    /// it was issued to `hub_id`. Used when completing a request from a
    /// frame a hub sent, so one hub's channel can never complete or peek
    /// at a request it wasn't handed.
    #[must_use]
    pub fn take_if_owned_by(&self, request_id: u64, hub_id: &str) -> Option<PendingRequest> {
        match self.pending.entry(request_id) {
            Entry::Occupied(e) if e.get().hub_id == hub_id => Some(e.remove()),
            _ => None,
        }
    }

    /// The streaming body sender for `request_id`, if it belongs to
    /// `hub_id` and declared one.
    #[must_use]
    pub fn body_sender(&self, request_id: u64, hub_id: &str) -> Option<tokio::sync::mpsc::Sender<Vec<u8>>> {
        self.pending
            .get(&request_id)
            .filter(|p| p.hub_id == hub_id)
            .and_then(|p| p.body_tx.clone())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Drains every pending request belonging to `hub_id`. Used when that
    /// hub's session tears down so every waiting client gets a prompt
    /// "hub went away" error instead of hanging until its own timeout
    /// (`spec.md` §4.2 teardown step "cancel every PendingRequest") —
    /// scoped to one hub since the tracker is shared by the whole node.
    pub fn cancel_all_for_hub(&self, hub_id: &str) -> Vec<PendingRequest> {
        let ids: Vec<u64> = self
            .pending
            .iter()
            .filter(|e| e.value().hub_id == hub_id)
            .map(|e| *e.key())
            .collect();
        ids.into_iter().filter_map(|id| self.take(id)).collect()
    }
}
