//! Per-node map of live hub sessions (`spec.md` §3 `SessionRegistry`).
//!
//! Generic over the session handle type so this module has no
//! dependency on [`crate::hub_session`]; `DashMap` already shards its
//! buckets internally, which is what satisfies §5's "never a single
//! global mutex" rule without any extra work here.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::broadcast;

/// Announces additions/removals to anything that wants to react — the
/// metrics gauge, mainly.
#[derive(Debug, Clone)]
pub enum MembershipEvent {
    Joined(String),
    Left(String),
}

pub struct SessionRegistry<H> {
    sessions: DashMap<String, Arc<H>>,
    membership: broadcast::Sender<MembershipEvent>,
}

impl<H> Default for SessionRegistry<H> {
    fn default() -> Self {
        let (membership, _) = broadcast::channel(256);
        Self {
            sessions: DashMap::new(),
            membership,
        }
    }
}

impl<H> SessionRegistry<H> {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `session` under `hub_id`, replacing and returning any
    /// session it superseded.
    pub fn insert(&self, hub_id: impl Into<String>, session: Arc<H>) -> Option<Arc<H>> {
        let hub_id = hub_id.into();
        let previous = self.sessions.insert(hub_id.clone(), session);
        let _ = self.membership.send(MembershipEvent::Joined(hub_id));
        previous
    }

    #[must_use]
    pub fn get(&self, hub_id: &str) -> Option<Arc<H>> {
        self.sessions.get(hub_id).map(|e| Arc::clone(&e))
    }

    /// Removes the session for `hub_id` only if it is still `session`
    /// itself (compared by pointer) — prevents a slow teardown task from
    /// evicting a session that already reconnected.
    pub fn remove_if_current(&self, hub_id: &str, session: &Arc<H>) {
        let removed = self
            .sessions
            .remove_if(hub_id, |_, current| Arc::ptr_eq(current, session))
            .is_some();
        if removed {
            let _ = self.membership.send(MembershipEvent::Left(hub_id.to_string()));
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<MembershipEvent> {
        self.membership.subscribe()
    }
}
