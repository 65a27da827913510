//! # cpx-agent-core
//!
//! Agent and channel state machines for the CPX call-center stack.
//!
//! This crate holds the per-interaction machinery that everything else in
//! CPX builds on: the data model ([`types`]), the table-driven channel
//! state machine ([`state_table`], [`channel`]), the endpoint (phone
//! driver) lifecycle ([`endpoint`]), the channel property registry
//! ([`property`]), the broadcast event bus ([`events`]) and the media
//! gateway boundary ([`media`]). It knows nothing about HTTP, sessions or
//! persistence — that lives in `cpx-engine`.

pub mod channel;
pub mod endpoint;
pub mod error;
pub mod events;
pub mod media;
pub mod prelude;
pub mod property;
pub mod state_table;
pub mod types;

pub use channel::{AgentChannel, AgentLink, AgentNotice, ChannelHandle, TransitionOutcome};
pub use endpoint::{Endpoint, EndpointDescriptor, EndpointHandle, EndpointKind, EndpointOptions};
pub use error::{ChannelError, Result};
pub use events::{ChannelEvent, EventManager};
pub use media::{MediaGateway, MediaHandle, NullMediaGateway};
pub use property::{ChannelProp, PropertyRegistry};
pub use state_table::{ChannelInput, ChannelState, MASTER_TABLE};
pub use types::{
    Agent, AgentId, AgentRef, AgentSnapshot, Call, CallId, CallerId, ChannelId, Client, MediaType,
    RingPath, SecurityLevel, StateChange,
};
