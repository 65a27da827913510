//! Error types for cpx-agent-core

use thiserror::Error;

use crate::state_table::ChannelState;

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("invalid transition: {state:?} does not accept {event}")]
    InvalidTransition { state: ChannelState, event: String },

    #[error("endpoint failed to start: {0}")]
    EndpointStart(String),

    #[error("media gateway error: {0}")]
    Media(String),

    #[error("channel terminated")]
    Terminated,

    #[error("agent connection is gone")]
    AgentGone,

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, ChannelError>;
