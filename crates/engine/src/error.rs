//! Error types for cpx-engine
//!
//! Internal failures are typed; what clients see is the fixed errcode
//! taxonomy. Anything without a mapping becomes `UNKNOWN_ERROR` — raw
//! internal errors are never surfaced.

use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("invalid credentials")]
    InvalidCredentials,

    #[error("no salt bound to the session")]
    NoSalt,

    #[error("decrypt failed: {0}")]
    Decrypt(String),

    #[error("bad cookie")]
    BadCookie,

    #[error("no agent connection for the session")]
    NoAgent,

    #[error("no function name in request")]
    NoFunction,

    #[error("unknown function: {0}")]
    UnknownFunction(String),

    #[error("request timed out")]
    Timeout,

    #[error("queue error: {0}")]
    Queue(String),

    #[error("cluster error: {0}")]
    Cluster(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("channel error: {0}")]
    Channel(#[from] cpx_agent_core::ChannelError),

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, EngineError>;

/// Error codes surfaced to API clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrCode {
    NoFunction,
    FunctionNoexists,
    BadCookie,
    NoAgent,
    NoSalt,
    DecryptFailed,
    AuthFailed,
    UnknownError,
}

impl ErrCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrCode::NoFunction => "NO_FUNCTION",
            ErrCode::FunctionNoexists => "FUNCTION_NOEXISTS",
            ErrCode::BadCookie => "BAD_COOKIE",
            ErrCode::NoAgent => "NO_AGENT",
            ErrCode::NoSalt => "NO_SALT",
            ErrCode::DecryptFailed => "DECRYPT_FAILED",
            ErrCode::AuthFailed => "AUTH_FAILED",
            ErrCode::UnknownError => "UNKNOWN_ERROR",
        }
    }
}

impl std::fmt::Display for ErrCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl EngineError {
    /// Map an internal error onto the client-facing taxonomy.
    pub fn errcode(&self) -> ErrCode {
        match self {
            EngineError::InvalidCredentials => ErrCode::AuthFailed,
            EngineError::NoSalt => ErrCode::NoSalt,
            EngineError::Decrypt(_) => ErrCode::DecryptFailed,
            EngineError::BadCookie => ErrCode::BadCookie,
            EngineError::NoAgent => ErrCode::NoAgent,
            EngineError::NoFunction => ErrCode::NoFunction,
            EngineError::UnknownFunction(_) => ErrCode::FunctionNoexists,
            _ => ErrCode::UnknownError,
        }
    }

    /// Message safe to hand to a client. Internal failures are masked;
    /// deliberate protocol errors keep their text.
    pub fn client_message(&self) -> String {
        match self {
            EngineError::Database(_)
            | EngineError::Migrate(_)
            | EngineError::Internal(_)
            | EngineError::Cluster(_)
            | EngineError::Timeout => "unknown error".to_string(),
            other => other.to_string(),
        }
    }
}
