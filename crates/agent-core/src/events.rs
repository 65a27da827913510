//! Channel event fan-out
//!
//! Event distribution uses `tokio::sync::broadcast`: every channel emits
//! into one shared bus and each subscriber (CDR sink, connection workers,
//! supervisors) receives events in the order the emitting channel produced
//! them. No ordering is guaranteed across channels.

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use tracing::trace;

use crate::property::ChannelProp;
use crate::state_table::ChannelState;
use crate::types::{AgentId, AgentRef, Call, ChannelId};

/// Events published by channel state machines.
#[derive(Debug, Clone)]
pub enum ChannelEvent {
    /// A channel came into existence for a call.
    InitiatedChannel {
        at: DateTime<Utc>,
        channel: ChannelId,
        call: Call,
    },

    /// A channel moved between states.
    ChannelStateUpdate {
        channel: ChannelId,
        agent: AgentId,
        at: DateTime<Utc>,
        new_state: ChannelState,
        old_state: ChannelState,
        prop: ChannelProp,
    },

    /// A channel finished. `final_state` tells the CDR sink whether the
    /// call closed out of wrapup.
    TerminatedChannel {
        at: DateTime<Utc>,
        agent: AgentRef,
        call: Call,
        final_state: ChannelState,
    },
}

/// Shared broadcast bus for channel events.
#[derive(Clone)]
pub struct EventManager {
    tx: broadcast::Sender<ChannelEvent>,
}

impl EventManager {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChannelEvent> {
        self.tx.subscribe()
    }

    /// Publish an event. Delivery to zero subscribers is not an error.
    pub fn emit(&self, event: ChannelEvent) {
        trace!("channel event: {:?}", event);
        let _ = self.tx.send(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventManager {
    fn default() -> Self {
        Self::new(1024)
    }
}
