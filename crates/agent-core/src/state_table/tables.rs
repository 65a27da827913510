//! The master channel transition table
//!
//! Encodes the permitted channel transitions as data. Any `(state, input)`
//! pair not present here, and any pair whose guards all fail, is rejected
//! as invalid without side effects.

use super::builder::StateTableBuilder;
use super::types::*;

pub fn build_master_table() -> ChannelStateTable {
    let mut b = StateTableBuilder::new();

    // prering: the only way forward is the call starting to ring.
    b.add_state_change(
        ChannelState::Prering,
        InputKind::Ringing,
        ChannelState::Ringing,
        vec![Effect::NotifyConnection],
    );

    // ringing → oncall. Candidates are tried in order:
    //   1. answer from the connection with the in-band sentinel endpoint
    //   2. answer from the connection with in-band ring but out-of-band
    //      media, which frees the driver once media is up
    //   3. the media side reporting the answered call
    b.add_transition(
        ChannelState::Ringing,
        InputKind::Oncall,
        Transition {
            guards: vec![Guard::FromConnection, Guard::EndpointInband],
            effects: vec![Effect::MediaOncall, Effect::NotifyConnection],
            next_state: Some(ChannelState::Oncall),
        },
    );
    b.add_transition(
        ChannelState::Ringing,
        InputKind::Oncall,
        Transition {
            guards: vec![Guard::FromConnection, Guard::InbandRingOutbandMedia],
            effects: vec![Effect::MediaOncall, Effect::FreeEndpoint, Effect::NotifyConnection],
            next_state: Some(ChannelState::Oncall),
        },
    );
    b.add_transition(
        ChannelState::Ringing,
        InputKind::Oncall,
        Transition {
            guards: vec![Guard::CallMatches],
            effects: vec![Effect::NotifyConnection],
            next_state: Some(ChannelState::Oncall),
        },
    );

    b.add_terminal(
        ChannelState::Ringing,
        InputKind::Stop,
        vec![Effect::EndpointHangup],
    );

    // precall accepts the answered call by call id or client.
    b.add_transition(
        ChannelState::Precall,
        InputKind::Oncall,
        Transition {
            guards: vec![Guard::ClientOrCallMatches],
            effects: vec![Effect::NotifyConnection],
            next_state: Some(ChannelState::Oncall),
        },
    );

    // oncall → wrapup. Self-initiated wrapup releases media; otherwise the
    // gateway is asked whether it can wrap up.
    b.add_transition(
        ChannelState::Oncall,
        InputKind::Wrapup,
        Transition {
            guards: vec![Guard::SelfInitiated],
            effects: vec![Effect::MediaWrapup, Effect::NotifyConnection],
            next_state: Some(ChannelState::Wrapup),
        },
    );
    b.add_transition(
        ChannelState::Oncall,
        InputKind::Wrapup,
        Transition {
            guards: vec![Guard::Always],
            effects: vec![Effect::TryWrapup, Effect::NotifyConnection],
            next_state: Some(ChannelState::Wrapup),
        },
    );

    // Endpoint death while talking moves the channel into wrapup.
    b.add_state_change(
        ChannelState::Oncall,
        InputKind::EndpointExit,
        ChannelState::Wrapup,
        vec![Effect::TryWrapup, Effect::NotifyConnection],
    );

    // wrapup ends on an explicit stop or the auto-wrapup timer; a late
    // endpoint exit is ignored.
    b.add_terminal(ChannelState::Wrapup, InputKind::Stop, vec![]);
    b.add_terminal(ChannelState::Wrapup, InputKind::EndWrapup, vec![]);
    b.add_transition(
        ChannelState::Wrapup,
        InputKind::EndpointExit,
        Transition {
            guards: vec![Guard::Always],
            effects: vec![],
            next_state: None,
        },
    );

    // Legacy warm-transfer states, retained as pass-throughs.
    b.add_state_change(
        ChannelState::Oncall,
        InputKind::WarmTransfer,
        ChannelState::WarmtransferHold,
        vec![Effect::NotifyConnection],
    );
    b.add_state_change(
        ChannelState::WarmtransferHold,
        InputKind::WarmTransfer,
        ChannelState::Warmtransfer3rdParty,
        vec![Effect::NotifyConnection],
    );
    for state in [ChannelState::WarmtransferHold, ChannelState::Warmtransfer3rdParty] {
        b.add_state_change(
            state,
            InputKind::WarmTransferCancel,
            ChannelState::Oncall,
            vec![Effect::NotifyConnection],
        );
        b.add_state_change(
            state,
            InputKind::WarmTransferComplete,
            ChannelState::Wrapup,
            vec![Effect::TryWrapup, Effect::NotifyConnection],
        );
        b.add_terminal(state, InputKind::Stop, vec![Effect::EndpointHangup]);
    }

    // Endpoint death anywhere outside oncall/wrapup kills the channel with
    // the driver's exit reason.
    for state in [
        ChannelState::Prering,
        ChannelState::Ringing,
        ChannelState::Precall,
        ChannelState::WarmtransferHold,
        ChannelState::Warmtransfer3rdParty,
    ] {
        b.add_terminal(state, InputKind::EndpointExit, vec![]);
    }

    b.build()
}
