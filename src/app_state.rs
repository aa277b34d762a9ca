//! Explicit dependency container, built once in `main` and cloned
//! cheaply (all fields are already `Arc`s) into every axum handler.
//!
//! Replaces the donor CLI's `Hub` god-object: every collaborator is a
//! named field wired up at startup instead of reached through a
//! process-wide singleton (`spec.md` §9 redesign note).

use std::sync::Arc;

use crate::audit::Metrics;
use crate::config::Config;
use crate::connection_store::ConnectionStore;
use crate::cross_node::CrossNodeForwarder;
use crate::hub_directory::HubDirectory;
use crate::hub_session::HubSession;
use crate::push_fanout::PushFanout;
use crate::request_tracker::RequestTracker;
use crate::session_registry::SessionRegistry;
use crate::user_directory::UserDirectory;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub connection_store: Arc<dyn ConnectionStore>,
    pub hub_directory: Arc<dyn HubDirectory>,
    pub user_directory: Arc<dyn UserDirectory>,
    pub registry: Arc<SessionRegistry<HubSession>>,
    pub cross_node: Arc<CrossNodeForwarder>,
    pub push_fanout: Arc<PushFanout>,
    pub metrics: Arc<Metrics>,
    /// One tracker shared by every hub session on this node, so
    /// request-ids are unique node-wide (`spec.md` §4.3 invariant I3).
    pub request_tracker: Arc<RequestTracker>,
}

impl AppState {
    #[must_use]
    pub fn new(
        config: Arc<Config>,
        connection_store: Arc<dyn ConnectionStore>,
        hub_directory: Arc<dyn HubDirectory>,
        user_directory: Arc<dyn UserDirectory>,
        push_fanout: Arc<PushFanout>,
    ) -> Self {
        let cross_node = Arc::new(CrossNodeForwarder::new(config.internal_addr.clone()));
        Self {
            registry: Arc::new(SessionRegistry::new()),
            metrics: Arc::new(Metrics::new()),
            request_tracker: Arc::new(RequestTracker::new()),
            config,
            connection_store,
            hub_directory,
            user_directory,
            cross_node,
            push_fanout,
        }
    }

    #[must_use]
    pub fn dispatch_context(&self) -> crate::multiplexer::DispatchContext {
        crate::multiplexer::DispatchContext {
            config: Arc::clone(&self.config),
            connection_store: Arc::clone(&self.connection_store),
            registry: Arc::clone(&self.registry),
            cross_node: Arc::clone(&self.cross_node),
            metrics: Arc::clone(&self.metrics),
            request_tracker: Arc::clone(&self.request_tracker),
        }
    }
}
