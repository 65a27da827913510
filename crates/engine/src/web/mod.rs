//! Web listener
//!
//! Shared application state, the axum router and the request dispatcher.
//! Legacy paths and the JSON API land on the same typed commands.

pub mod cookies;
pub mod dispatcher;
pub mod files;
pub mod reply;

use std::sync::Arc;

use axum::routing::{any, post};
use axum::Router;
use dashmap::DashMap;

use cpx_agent_core::events::EventManager;
use cpx_agent_core::media::MediaHandle;
use cpx_agent_core::property::PropertyRegistry;

use crate::auth::AuthService;
use crate::config::EngineConfig;
use crate::conn::{ConnectionDeps, ConnectionHandle};
use crate::database::Store;
use crate::queue::manager::QueueManagerHandle;
use crate::session::SessionTable;

/// Everything a request handler can reach.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<EngineConfig>,
    pub sessions: Arc<SessionTable>,
    pub store: Store,
    pub auth: Arc<AuthService>,
    pub queues: QueueManagerHandle,
    pub events: EventManager,
    pub registry: Arc<PropertyRegistry>,
    pub media: MediaHandle,
    /// login → connection worker, used for agent-to-agent operations.
    pub directory: Arc<DashMap<String, ConnectionHandle>>,
}

impl AppState {
    /// Bundle of services a connection worker takes along.
    pub fn conn_deps(&self) -> ConnectionDeps {
        ConnectionDeps {
            config: self.config.clone(),
            store: self.store.clone(),
            queues: self.queues.clone(),
            events: self.events.clone(),
            registry: self.registry.clone(),
            media: self.media.clone(),
            directory: self.directory.clone(),
        }
    }
}

/// Build the router: `/api`, the legacy paths, and the file/API fallback.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api", post(dispatcher::api))
        .route("/checkcookie", any(dispatcher::check_cookie))
        .route("/getsalt", any(dispatcher::get_salt))
        .route("/login", post(dispatcher::login))
        .route("/poll", any(dispatcher::poll))
        .route("/logout", any(dispatcher::logout))
        .route("/queuelist", any(dispatcher::queue_list))
        .route("/brandlist", any(dispatcher::brand_list))
        .route("/releaseopts", any(dispatcher::release_opts))
        .route("/state/:state", any(dispatcher::set_state))
        .route("/state/:state/:data", any(dispatcher::set_state_data))
        .route("/ack/:counter", any(dispatcher::ack))
        .route("/err/:counter", any(dispatcher::err))
        .route("/err/:counter/:message", any(dispatcher::err_msg))
        .route("/dial/:number", any(dispatcher::dial))
        .route("/get_avail_agents", any(dispatcher::get_avail_agents))
        .route("/agent_transfer/:login", any(dispatcher::agent_transfer))
        .route("/agent_transfer/:login/:case", any(dispatcher::agent_transfer_case))
        .route("/queue_transfer/:queue", any(dispatcher::queue_transfer))
        .route("/init_outbound/:client/:media_type", any(dispatcher::init_outbound))
        .route("/warm_transfer/:number", any(dispatcher::warm_transfer))
        .route("/warm_transfer_complete", any(dispatcher::warm_transfer_complete))
        .route("/warm_transfer_cancel", any(dispatcher::warm_transfer_cancel))
        .route("/mediapush", any(dispatcher::mediapush))
        .route("/supervisor/*command", any(dispatcher::supervisor))
        .fallback(dispatcher::fallback)
        .with_state(state)
}
