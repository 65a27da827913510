//! Per-agent availability state machine
//!
//! Tracks what an agent is doing across their channels. Availability
//! changes requested by the client (`set_state`) are validated here;
//! media-driven states (ringing, oncall, wrapup) follow the agent's
//! channels and cannot be entered by request.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use cpx_agent_core::channel::AgentNotice;
use cpx_agent_core::state_table::ChannelState;
use cpx_agent_core::types::{Agent, AgentSnapshot, ChannelId};

use crate::database::ReleaseOpt;
use crate::error::{EngineError, Result};

/// Availability states of an agent.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentState {
    /// Logged in but not taking calls; carries the chosen release option.
    Released(ReleaseOpt),
    Idle,
    Ringing,
    Precall,
    Oncall,
    /// Dialing out on behalf of a precall channel.
    Outgoing,
    Wrapup,
}

impl AgentState {
    pub fn name(&self) -> &'static str {
        match self {
            AgentState::Released(_) => "released",
            AgentState::Idle => "idle",
            AgentState::Ringing => "ringing",
            AgentState::Precall => "precall",
            AgentState::Oncall => "oncall",
            AgentState::Outgoing => "outgoing",
            AgentState::Wrapup => "wrapup",
        }
    }

    pub fn statedata(&self) -> Option<String> {
        match self {
            AgentState::Released(release) => Some(release.id.clone()),
            _ => None,
        }
    }
}

pub fn default_release() -> ReleaseOpt {
    ReleaseOpt {
        id: "default".to_string(),
        label: "Default".to_string(),
        bias: 0,
    }
}

/// The agent FSM proper. Hosted by the connection worker task; never
/// touched concurrently.
pub struct AgentFsm {
    pub agent: Agent,
    state: AgentState,
    /// Availability the agent returns to when the last channel ends.
    base_state: AgentState,
    state_since: DateTime<Utc>,
    channels: HashMap<ChannelId, ChannelState>,
    ack_count: u64,
    err_count: u64,
}

impl AgentFsm {
    /// A freshly authenticated agent starts out released.
    pub fn new(agent: Agent) -> Self {
        let released = AgentState::Released(default_release());
        Self {
            agent,
            state: released.clone(),
            base_state: released,
            state_since: Utc::now(),
            channels: HashMap::new(),
            ack_count: 0,
            err_count: 0,
        }
    }

    pub fn state(&self) -> &AgentState {
        &self.state
    }

    pub fn has_channels(&self) -> bool {
        !self.channels.is_empty()
    }

    pub fn channel_state(&self, id: &ChannelId) -> Option<ChannelState> {
        self.channels.get(id).copied()
    }

    /// Find a channel currently in the given state.
    pub fn channel_in(&self, state: ChannelState) -> Option<ChannelId> {
        self.channels
            .iter()
            .find(|(_, s)| **s == state)
            .map(|(id, _)| id.clone())
    }

    /// Client-requested availability change. Only `idle` and `released`
    /// may be requested; everything else follows the channels.
    pub fn set_state(
        &mut self,
        name: &str,
        data: Option<&str>,
        releases: &[ReleaseOpt],
    ) -> Result<()> {
        let requestable = matches!(
            self.state,
            AgentState::Released(_) | AgentState::Idle | AgentState::Wrapup
        );

        let next = match name {
            "idle" => {
                if self.has_channels() {
                    return Err(EngineError::Queue("agent still owns channels".into()));
                }
                AgentState::Idle
            }
            "released" => {
                let release = match data {
                    Some(id) => releases
                        .iter()
                        .find(|r| r.id == id)
                        .cloned()
                        .unwrap_or_else(default_release),
                    None => default_release(),
                };
                AgentState::Released(release)
            }
            other => {
                return Err(EngineError::Queue(format!(
                    "state {other} cannot be requested"
                )));
            }
        };

        if !requestable {
            return Err(EngineError::Queue(format!(
                "cannot change state while {}",
                self.state.name()
            )));
        }

        debug!("agent {}: {} -> {}", self.agent.login, self.state.name(), next.name());
        self.base_state = next.clone();
        self.enter(next);
        Ok(())
    }

    /// Mark the agent as dialing out.
    pub fn set_outgoing(&mut self) {
        self.enter(AgentState::Outgoing);
    }

    /// Apply a notice from one of the agent's channels.
    pub fn on_notice(&mut self, notice: &AgentNotice) {
        match notice {
            AgentNotice::ChannelAssigned { channel, state, .. } => {
                self.channels.insert(channel.clone(), *state);
            }
            AgentNotice::ChannelStateChanged { channel, state } => {
                self.channels.insert(channel.clone(), *state);
            }
            AgentNotice::ChannelTerminated { channel, .. } => {
                self.channels.remove(channel);
            }
        }
        self.recompute();
    }

    /// Derive the agent state from the channel set.
    fn recompute(&mut self) {
        let next = if self
            .channels
            .values()
            .any(|s| matches!(s, ChannelState::Oncall
                | ChannelState::WarmtransferHold
                | ChannelState::Warmtransfer3rdParty))
        {
            AgentState::Oncall
        } else if self.channels.values().any(|s| *s == ChannelState::Wrapup) {
            AgentState::Wrapup
        } else if self.channels.values().any(|s| *s == ChannelState::Precall) {
            AgentState::Precall
        } else if self
            .channels
            .values()
            .any(|s| matches!(s, ChannelState::Prering | ChannelState::Ringing))
        {
            AgentState::Ringing
        } else {
            self.base_state.clone()
        };

        if next != self.state {
            self.enter(next);
        }
    }

    fn enter(&mut self, next: AgentState) {
        self.state = next;
        self.state_since = Utc::now();
    }

    pub fn ack(&mut self, counter: u64) {
        self.ack_count = self.ack_count.max(counter);
    }

    pub fn err(&mut self, counter: u64, message: Option<&str>) {
        self.err_count += 1;
        warn!(
            "agent {} reported client error #{}: {}",
            self.agent.login,
            counter,
            message.unwrap_or("(no message)")
        );
    }

    pub fn snapshot(&self) -> AgentSnapshot {
        AgentSnapshot {
            login: self.agent.login.clone(),
            profile: self.agent.profile.clone(),
            state: self.state.name().to_string(),
            statedata: self.state.statedata(),
            statetime: self.state_since.timestamp(),
            timestamp: Utc::now().timestamp(),
            mediaload: None,
        }
    }
}
