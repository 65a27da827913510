//! Core types shared by the agent and channel state machines

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::media::MediaHandle;
use crate::state_table::ChannelState;

/// Agent identifier
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct AgentId(pub String);

impl AgentId {
    pub fn new() -> Self {
        Self(format!("agent-{}", Uuid::new_v4()))
    }
}

impl std::fmt::Display for AgentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Call identifier
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct CallId(pub String);

impl CallId {
    pub fn new() -> Self {
        Self(format!("call-{}", Uuid::new_v4()))
    }
}

impl std::fmt::Display for CallId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Channel identifier
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct ChannelId(pub String);

impl ChannelId {
    pub fn new() -> Self {
        Self(format!("channel-{}", Uuid::new_v4()))
    }
}

impl std::fmt::Display for ChannelId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Media type of a call
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaType {
    Voice,
    Chat,
    Email,
    Voicemail,
}

impl MediaType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaType::Voice => "voice",
            MediaType::Chat => "chat",
            MediaType::Email => "email",
            MediaType::Voicemail => "voicemail",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "voice" => Some(MediaType::Voice),
            "chat" => Some(MediaType::Chat),
            "email" => Some(MediaType::Email),
            "voicemail" => Some(MediaType::Voicemail),
            _ => None,
        }
    }
}

/// Whether a signal or stream flows through the application or directly
/// to the phone.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RingPath {
    Inband,
    Outband,
}

/// Security level of an agent account
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecurityLevel {
    Agent,
    Supervisor,
    Admin,
}

impl SecurityLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            SecurityLevel::Agent => "agent",
            SecurityLevel::Supervisor => "supervisor",
            SecurityLevel::Admin => "admin",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "agent" => Some(SecurityLevel::Agent),
            "supervisor" => Some(SecurityLevel::Supervisor),
            "admin" => Some(SecurityLevel::Admin),
            _ => None,
        }
    }
}

/// Caller identity presented to the agent
#[derive(Debug, Clone, Default, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct CallerId {
    pub name: String,
    pub number: String,
}

/// Tenant the call belongs to, with the options the channel layer consumes
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Client {
    pub id: String,
    pub label: String,
    /// Seconds before wrapup ends automatically; `None` disables the timer.
    pub autoend_wrapup: Option<u64>,
}

/// One entry in a call's state-change history
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateChange {
    pub state: ChannelState,
    pub at: DateTime<Utc>,
}

/// A media interaction routed through the system
#[derive(Debug, Clone)]
pub struct Call {
    pub id: CallId,
    pub media_type: MediaType,
    pub client: Client,
    pub caller_id: CallerId,
    pub ring_path: RingPath,
    pub media_path: RingPath,
    /// Handle to the media gateway driving this call.
    pub source: MediaHandle,
    pub state_changes: Vec<StateChange>,
}

impl Call {
    pub fn new(media_type: MediaType, client: Client, caller_id: CallerId, source: MediaHandle) -> Self {
        Self {
            id: CallId::new(),
            media_type,
            client,
            caller_id,
            ring_path: RingPath::Outband,
            media_path: RingPath::Outband,
            source,
            state_changes: Vec::new(),
        }
    }

    pub fn with_paths(mut self, ring_path: RingPath, media_path: RingPath) -> Self {
        self.ring_path = ring_path;
        self.media_path = media_path;
        self
    }
}

/// An agent account as held by the authentication store
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub id: AgentId,
    pub login: String,
    pub profile: String,
    pub skills: Vec<String>,
    pub security: SecurityLevel,
    pub ring_path: RingPath,
    #[serde(skip_serializing)]
    pub password_hash: String,
}

/// Lightweight agent identity carried on channel events
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRef {
    pub id: AgentId,
    pub login: String,
    pub profile: String,
}

impl From<&Agent> for AgentRef {
    fn from(agent: &Agent) -> Self {
        Self {
            id: agent.id.clone(),
            login: agent.login.clone(),
            profile: agent.profile.clone(),
        }
    }
}

/// Immutable view of an agent's availability, as returned to clients
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSnapshot {
    pub login: String,
    pub profile: String,
    pub state: String,
    pub statedata: Option<String>,
    /// Epoch seconds of the last state change.
    pub statetime: i64,
    /// Epoch seconds at snapshot time.
    pub timestamp: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mediaload: Option<serde_json::Value>,
}
