use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::types::Call;

/// States a channel can occupy.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelState {
    Prering,
    Ringing,
    Precall,
    Oncall,
    /// Deprecated: superseded by per-media warm transfer. Kept as a
    /// pass-through state.
    WarmtransferHold,
    /// Deprecated: superseded by per-media warm transfer. Kept as a
    /// pass-through state.
    Warmtransfer3rdParty,
    Wrapup,
}

impl ChannelState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelState::Prering => "prering",
            ChannelState::Ringing => "ringing",
            ChannelState::Precall => "precall",
            ChannelState::Oncall => "oncall",
            ChannelState::WarmtransferHold => "warmtransfer_hold",
            ChannelState::Warmtransfer3rdParty => "warmtransfer_3rd_party",
            ChannelState::Wrapup => "wrapup",
        }
    }

    pub const ALL: [ChannelState; 7] = [
        ChannelState::Prering,
        ChannelState::Ringing,
        ChannelState::Precall,
        ChannelState::Oncall,
        ChannelState::WarmtransferHold,
        ChannelState::Warmtransfer3rdParty,
        ChannelState::Wrapup,
    ];
}

impl std::fmt::Display for ChannelState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Inputs a channel reacts to.
#[derive(Debug, Clone)]
pub enum ChannelInput {
    /// The call started ringing the agent.
    Ringing(Call),
    /// Answer. `None` when the request comes from the agent connection,
    /// `Some` when the media side reports the answered call.
    Oncall(Option<Call>),
    /// Move to after-call work. `from_connection` distinguishes the agent
    /// pressing the button from the far side hanging up.
    Wrapup { from_connection: bool },
    /// Begin a legacy warm transfer towards a number.
    WarmTransfer { number: String },
    WarmTransferComplete,
    WarmTransferCancel,
    /// Tear the channel down.
    Stop,
    /// The auto-wrapup timer fired.
    EndWrapup,
    /// The endpoint driver exited with the given reason.
    EndpointExit(String),
}

impl ChannelInput {
    pub fn kind(&self) -> InputKind {
        match self {
            ChannelInput::Ringing(_) => InputKind::Ringing,
            ChannelInput::Oncall(_) => InputKind::Oncall,
            ChannelInput::Wrapup { .. } => InputKind::Wrapup,
            ChannelInput::WarmTransfer { .. } => InputKind::WarmTransfer,
            ChannelInput::WarmTransferComplete => InputKind::WarmTransferComplete,
            ChannelInput::WarmTransferCancel => InputKind::WarmTransferCancel,
            ChannelInput::Stop => InputKind::Stop,
            ChannelInput::EndWrapup => InputKind::EndWrapup,
            ChannelInput::EndpointExit(_) => InputKind::EndpointExit,
        }
    }

    pub fn name(&self) -> &'static str {
        self.kind().as_str()
    }
}

/// Discriminant used to key the transition table.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq)]
pub enum InputKind {
    Ringing,
    Oncall,
    Wrapup,
    WarmTransfer,
    WarmTransferComplete,
    WarmTransferCancel,
    Stop,
    EndWrapup,
    EndpointExit,
}

impl InputKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            InputKind::Ringing => "ringing",
            InputKind::Oncall => "oncall",
            InputKind::Wrapup => "wrapup",
            InputKind::WarmTransfer => "warm_transfer",
            InputKind::WarmTransferComplete => "warm_transfer_complete",
            InputKind::WarmTransferCancel => "warm_transfer_cancel",
            InputKind::Stop => "stop",
            InputKind::EndWrapup => "end_wrapup",
            InputKind::EndpointExit => "endpoint_exit",
        }
    }
}

/// Key for looking up candidate transitions.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq)]
pub struct StateKey {
    pub state: ChannelState,
    pub input: InputKind,
}

/// Conditions evaluated against the live channel before a candidate
/// transition is taken.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Guard {
    Always,
    /// The answer request came from the agent connection (no call payload).
    FromConnection,
    /// The payload call id matches the channel's call.
    CallMatches,
    /// The payload matches the channel's call by id or by client.
    ClientOrCallMatches,
    /// The channel is configured with the in-band sentinel endpoint.
    EndpointInband,
    /// Ringing flows in-band while media flows out-of-band.
    InbandRingOutbandMedia,
    /// The wrapup request came from the agent connection.
    SelfInitiated,
}

/// Side effects executed when a transition is taken, in declaration order.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Effect {
    /// Tell the owning agent connection about the new channel state.
    NotifyConnection,
    /// Invoke `oncall` on the media gateway.
    MediaOncall,
    /// Invoke `wrapup` on the media gateway.
    MediaWrapup,
    /// Invoke `try_wrapup` on the media gateway.
    TryWrapup,
    /// Release the spawned endpoint driver without killing the channel.
    FreeEndpoint,
    /// Hang the endpoint driver up.
    EndpointHangup,
    /// Terminate the channel after the other effects ran.
    Terminate,
}

/// One candidate transition for a `(state, input)` pair.
#[derive(Debug, Clone)]
pub struct Transition {
    pub guards: Vec<Guard>,
    pub effects: Vec<Effect>,
    /// `None` keeps the current state (or terminates, when the effects say
    /// so).
    pub next_state: Option<ChannelState>,
}

impl Transition {
    pub fn terminates(&self) -> bool {
        self.effects.contains(&Effect::Terminate)
    }
}

/// The channel transition table. A key maps to an ordered list of
/// candidates; the first candidate whose guards all hold is taken, and a
/// missing key (or no passing candidate) is an invalid input.
pub struct ChannelStateTable {
    transitions: HashMap<StateKey, Vec<Transition>>,
}

impl ChannelStateTable {
    pub fn new() -> Self {
        Self {
            transitions: HashMap::new(),
        }
    }

    pub fn insert(&mut self, key: StateKey, transition: Transition) {
        self.transitions.entry(key).or_default().push(transition);
    }

    pub fn candidates(&self, key: &StateKey) -> &[Transition] {
        self.transitions.get(key).map(|v| v.as_slice()).unwrap_or(&[])
    }

    pub fn has_transition(&self, key: &StateKey) -> bool {
        self.transitions.contains_key(key)
    }

    /// Consistency check: every non-terminal state must have at least one
    /// exit transition.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        for state in ChannelState::ALL {
            let has_exit = self.transitions.keys().any(|k| k.state == state);
            if !has_exit {
                errors.push(format!("state {state} has no exit transitions"));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}
