//! Commonly used types, re-exported

pub use crate::auth::AuthService;
pub use crate::cdr::{CdrRecord, CdrSink};
pub use crate::cluster::{Cluster, ClusterEvent, NodeId};
pub use crate::config::EngineConfig;
pub use crate::conn::{ConnectionHandle, ConnectionWorker, PollOutcome};
pub use crate::database::{Brand, QueueDef, ReleaseOpt, Store};
pub use crate::error::{EngineError, ErrCode, Result};
pub use crate::queue::{
    AddQueueResult, BindableQueue, QueueHandle, QueueManager, QueueManagerHandle, QueueWorker,
    QueuedCall, Recipe,
};
pub use crate::server::CpxServer;
pub use crate::session::{SessionEntry, SessionTable};
pub use crate::web::reply::ApiReply;
pub use crate::web::AppState;

pub use cpx_agent_core::prelude::*;
