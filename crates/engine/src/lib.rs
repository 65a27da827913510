//! # cpx-engine
//!
//! The outward-facing half of the CPX call-center stack: the web
//! dispatcher with its cookie-keyed session table and salted-RSA login
//! handshake, per-agent connection workers, the leader-elected replicated
//! queue manager, and the ambient services they need (config store,
//! authentication, CDR sink, cluster fabric).
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────┐
//! │                web (axum)                     │
//! │   dispatcher │ cookies │ files │ replies      │
//! ├──────────────┬────────────────────────────────┤
//! │ SessionTable │ ConnectionWorker (per agent)   │
//! │              │   └─ AgentFsm + channels       │
//! ├──────────────┴────────────────────────────────┤
//! │ QueueManager ── Cluster ── QueueWorkers       │
//! ├───────────────────────────────────────────────┤
//! │ Store (sqlx) │ AuthService (rsa) │ CdrSink    │
//! └───────────────────────────────────────────────┘
//!                      │
//!              cpx-agent-core (channel FSM)
//! ```

pub mod agent;
pub mod auth;
pub mod cdr;
pub mod cluster;
pub mod config;
pub mod conn;
pub mod database;
pub mod error;
pub mod prelude;
pub mod queue;
pub mod server;
pub mod session;
pub mod web;

pub use config::EngineConfig;
pub use error::{EngineError, ErrCode, Result};
pub use server::CpxServer;
