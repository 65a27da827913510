//! Commonly used types, re-exported

pub use crate::channel::{AgentChannel, AgentLink, AgentNotice, ChannelHandle, TransitionOutcome};
pub use crate::endpoint::{Endpoint, EndpointDescriptor, EndpointKind, EndpointOptions};
pub use crate::error::ChannelError;
pub use crate::events::{ChannelEvent, EventManager};
pub use crate::media::{MediaGateway, MediaHandle, NullMediaGateway};
pub use crate::property::{ChannelProp, PropertyRegistry};
pub use crate::state_table::{ChannelInput, ChannelState};
pub use crate::types::{
    Agent, AgentId, AgentRef, AgentSnapshot, Call, CallId, CallerId, ChannelId, Client, MediaType,
    RingPath, SecurityLevel, StateChange,
};
