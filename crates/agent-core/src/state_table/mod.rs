//! Declarative channel transition table
//!
//! The channel state machine is table-driven: states, inputs, guards and
//! effects are data, and the runtime in [`crate::channel`] interprets them.
//! This keeps the permitted transition graph reviewable in one place
//! ([`tables`]) and makes "unknown input → invalid, no side effects" the
//! default instead of something every handler must remember.

pub mod builder;
pub mod tables;
pub mod types;

use std::sync::Arc;

use lazy_static::lazy_static;

pub use builder::StateTableBuilder;
pub use types::{
    ChannelInput, ChannelState, ChannelStateTable, Effect, Guard, InputKind, StateKey, Transition,
};

lazy_static! {
    /// The master transition table, shared by every channel.
    pub static ref MASTER_TABLE: Arc<ChannelStateTable> = Arc::new(tables::build_master_table());
}
