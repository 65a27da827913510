//! Engine server
//!
//! Wires the subsystems together: config store, authentication, session
//! table, event bus, CDR sink, cluster node and queue manager, then runs
//! the axum listener. One [`CpxServer`] per node.

use std::sync::Arc;

use dashmap::DashMap;
use tracing::info;

use cpx_agent_core::events::EventManager;
use cpx_agent_core::media::MediaHandle;
use cpx_agent_core::property::PropertyRegistry;

use crate::auth::AuthService;
use crate::cdr::CdrSink;
use crate::cluster::{Cluster, NodeId};
use crate::config::EngineConfig;
use crate::database::Store;
use crate::error::{EngineError, Result};
use crate::queue::manager::{PeerMsg, QueueManager, QueueManagerHandle};
use crate::session::SessionTable;
use crate::web::{self, AppState};

pub struct CpxServer {
    config: Arc<EngineConfig>,
    state: AppState,
    cluster: Cluster<PeerMsg>,
    cdr: CdrSink,
}

impl CpxServer {
    /// Build a single-node server. The node joins a fresh in-process
    /// cluster fabric; multi-node tests assemble their own fabric and use
    /// [`CpxServer::with_cluster`].
    pub async fn new(config: EngineConfig) -> Result<Self> {
        let cluster = Cluster::new();
        Self::with_cluster(config, cluster).await
    }

    /// Build a server joining an existing fabric.
    pub async fn with_cluster(config: EngineConfig, cluster: Cluster<PeerMsg>) -> Result<Self> {
        let config = Arc::new(config);

        let store = Store::new(&config.database.url)
            .await
            .map_err(EngineError::Internal)?;
        store.seed_defaults().await.map_err(EngineError::Internal)?;
        info!("✅ config store ready");

        let auth = Arc::new(AuthService::new(store.clone(), &config.general.key_path)?);
        info!("✅ RSA key loaded");

        let events = EventManager::default();
        let cdr = CdrSink::spawn(&events);

        let node = cluster.join(NodeId(config.general.node.clone()));
        let queues = QueueManager::spawn(node, store.clone(), config.queue.clone());

        // Bring persisted queues back up.
        for def in store.list_queue_defs().await.map_err(EngineError::Internal)? {
            queues
                .add_queue(&def.name, Some(def.recipe.clone()), Some(def.weight))
                .await?;
            info!("✅ queue {} started", def.name);
        }

        let state = AppState {
            config: config.clone(),
            sessions: Arc::new(SessionTable::new()),
            store,
            auth,
            queues,
            events,
            registry: Arc::new(PropertyRegistry::new()),
            media: MediaHandle::null(),
            directory: Arc::new(DashMap::new()),
        };

        Ok(Self {
            config,
            state,
            cluster,
            cdr,
        })
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    pub fn queues(&self) -> &QueueManagerHandle {
        &self.state.queues
    }

    pub fn cdr(&self) -> &CdrSink {
        &self.cdr
    }

    pub fn cluster(&self) -> &Cluster<PeerMsg> {
        &self.cluster
    }

    /// Replace the media gateway integration (defaults to the null
    /// gateway).
    pub fn set_media_gateway(&mut self, media: MediaHandle) {
        self.state.media = media;
    }

    pub fn router(&self) -> axum::Router {
        web::router(self.state.clone())
    }

    /// Bind and serve until shutdown.
    pub async fn run(self) -> Result<()> {
        let addr = self.config.general.listen_addr;
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .map_err(|e| EngineError::Config(format!("cannot bind {addr}: {e}")))?;

        info!("🚀 cpx-engine listening on {}", addr);
        axum::serve(listener, self.router())
            .await
            .map_err(|e| EngineError::Config(format!("server error: {e}")))?;
        Ok(())
    }
}
