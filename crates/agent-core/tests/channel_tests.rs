//! Integration tests for the channel state machine
//!
//! These drive a real channel task through the transition table and verify
//! state movement, media gateway side effects, event emission and property
//! registry upkeep.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use cpx_agent_core::channel::{AgentChannel, AgentLink, TransitionOutcome};
use cpx_agent_core::endpoint::{Endpoint, EndpointDescriptor, EndpointKind};
use cpx_agent_core::error::Result;
use cpx_agent_core::events::{ChannelEvent, EventManager};
use cpx_agent_core::media::{MediaGateway, MediaHandle};
use cpx_agent_core::property::PropertyRegistry;
use cpx_agent_core::state_table::{ChannelInput, ChannelState};
use cpx_agent_core::types::{AgentId, AgentRef, Call, CallId, CallerId, Client, MediaType, RingPath};

/// Media gateway that records every invocation.
#[derive(Default)]
struct RecordingGateway {
    ops: Mutex<Vec<String>>,
}

impl RecordingGateway {
    fn ops(&self) -> Vec<String> {
        self.ops.lock().unwrap().clone()
    }

    fn record(&self, op: &str) {
        self.ops.lock().unwrap().push(op.to_string());
    }
}

#[async_trait]
impl MediaGateway for RecordingGateway {
    async fn oncall(&self, _call: &CallId) -> Result<()> {
        self.record("oncall");
        Ok(())
    }

    async fn wrapup(&self, _call: &CallId) -> Result<()> {
        self.record("wrapup");
        Ok(())
    }

    async fn try_wrapup(&self, _call: &CallId) -> Result<()> {
        self.record("try_wrapup");
        Ok(())
    }

    async fn hangup(&self, _call: &CallId) -> Result<()> {
        self.record("hangup");
        Ok(())
    }

    async fn dial(&self, _call: &CallId, _number: &str) -> Result<()> {
        self.record("dial");
        Ok(())
    }

    async fn transfer_to_agent(&self, _call: &CallId, _login: &str) -> Result<()> {
        self.record("transfer");
        Ok(())
    }
}

fn test_agent() -> AgentRef {
    AgentRef {
        id: AgentId("agent-test".to_string()),
        login: "alice".to_string(),
        profile: "default".to_string(),
    }
}

fn test_call(gateway: Arc<RecordingGateway>) -> Call {
    Call::new(
        MediaType::Voice,
        Client {
            id: "acme".to_string(),
            label: "Acme Corp".to_string(),
            autoend_wrapup: None,
        },
        CallerId {
            name: "Customer".to_string(),
            number: "5550100".to_string(),
        },
        MediaHandle::new(gateway),
    )
}

#[tokio::test]
async fn channel_happy_path() {
    let gateway = Arc::new(RecordingGateway::default());
    let events = EventManager::new(64);
    let mut bus = events.subscribe();
    let registry = Arc::new(PropertyRegistry::new());
    let (link, _notices) = AgentLink::new(test_agent());

    let call = test_call(gateway.clone());
    let handle = AgentChannel::spawn(
        link,
        call.clone(),
        Endpoint::Inband,
        ChannelState::Prering,
        events.clone(),
        registry.clone(),
    )
    .expect("channel should start");

    assert_eq!(handle.state(), ChannelState::Prering);
    assert_eq!(registry.len(), 1);

    // prering → ringing
    let outcome = handle.input(ChannelInput::Ringing(call.clone())).await.unwrap();
    assert_eq!(outcome, TransitionOutcome::Moved(ChannelState::Ringing));

    // ringing → oncall, answer from the connection, inband endpoint
    let outcome = handle.input(ChannelInput::Oncall(None)).await.unwrap();
    assert_eq!(outcome, TransitionOutcome::Moved(ChannelState::Oncall));
    assert_eq!(gateway.ops(), vec!["oncall"]);

    // oncall → wrapup (agent pressed the button)
    let outcome = handle
        .input(ChannelInput::Wrapup { from_connection: true })
        .await
        .unwrap();
    assert_eq!(outcome, TransitionOutcome::Moved(ChannelState::Wrapup));
    assert_eq!(gateway.ops(), vec!["oncall", "wrapup"]);

    // wrapup → gone
    let outcome = handle.input(ChannelInput::Stop).await.unwrap();
    assert_eq!(outcome, TransitionOutcome::Terminated(ChannelState::Wrapup));

    handle.closed().await;
    assert_eq!(registry.len(), 0);

    // media.oncall must have been invoked exactly once
    assert_eq!(gateway.ops().iter().filter(|op| *op == "oncall").count(), 1);

    // the bus saw the full life cycle, ending in a wrapup termination
    let mut initiated = 0;
    let mut updates = Vec::new();
    let mut terminated_from = None;
    while let Ok(event) = bus.try_recv() {
        match event {
            ChannelEvent::InitiatedChannel { .. } => initiated += 1,
            ChannelEvent::ChannelStateUpdate { new_state, .. } => updates.push(new_state),
            ChannelEvent::TerminatedChannel { final_state, call, .. } => {
                terminated_from = Some((final_state, call));
            }
        }
    }
    assert_eq!(initiated, 1);
    assert_eq!(
        updates,
        vec![ChannelState::Ringing, ChannelState::Oncall, ChannelState::Wrapup]
    );
    let (final_state, final_call) = terminated_from.expect("termination event");
    assert_eq!(final_state, ChannelState::Wrapup);
    // the call record carries the whole state history
    let history: Vec<ChannelState> = final_call.state_changes.iter().map(|c| c.state).collect();
    assert_eq!(
        history,
        vec![
            ChannelState::Prering,
            ChannelState::Ringing,
            ChannelState::Oncall,
            ChannelState::Wrapup
        ]
    );
}

#[tokio::test]
async fn unknown_inputs_are_invalid_without_side_effects() {
    let gateway = Arc::new(RecordingGateway::default());
    let events = EventManager::new(64);
    let registry = Arc::new(PropertyRegistry::new());
    let (link, _notices) = AgentLink::new(test_agent());

    let call = test_call(gateway.clone());
    let handle = AgentChannel::spawn(
        link,
        call.clone(),
        Endpoint::Inband,
        ChannelState::Prering,
        events,
        registry.clone(),
    )
    .unwrap();

    // wrapup makes no sense in prering
    let outcome = handle
        .input(ChannelInput::Wrapup { from_connection: true })
        .await
        .unwrap();
    assert_eq!(outcome, TransitionOutcome::Invalid);
    assert_eq!(handle.state(), ChannelState::Prering);
    assert!(gateway.ops().is_empty());

    // oncall with a non-matching call is rejected in ringing
    handle.input(ChannelInput::Ringing(call.clone())).await.unwrap();
    let mut other = test_call(gateway.clone());
    other.client.id = "other".to_string();
    let outcome = handle.input(ChannelInput::Oncall(Some(other))).await.unwrap();
    assert_eq!(outcome, TransitionOutcome::Invalid);
    assert_eq!(handle.state(), ChannelState::Ringing);
}

#[tokio::test]
async fn precall_accepts_call_matching_client() {
    let gateway = Arc::new(RecordingGateway::default());
    let events = EventManager::new(64);
    let registry = Arc::new(PropertyRegistry::new());
    let (link, _notices) = AgentLink::new(test_agent());

    let call = test_call(gateway.clone());
    let handle = AgentChannel::spawn(
        link,
        call.clone(),
        Endpoint::Inband,
        ChannelState::Precall,
        events,
        registry,
    )
    .unwrap();

    // a different call for the same client is acceptable in precall
    let mut same_client = test_call(gateway);
    same_client.client.id = call.client.id.clone();
    let outcome = handle.input(ChannelInput::Oncall(Some(same_client))).await.unwrap();
    assert_eq!(outcome, TransitionOutcome::Moved(ChannelState::Oncall));
}

#[tokio::test]
async fn endpoint_exit_during_oncall_moves_to_wrapup() {
    let gateway = Arc::new(RecordingGateway::default());
    let events = EventManager::new(64);
    let registry = Arc::new(PropertyRegistry::new());
    let (link, _notices) = AgentLink::new(test_agent());

    let call = test_call(gateway.clone());
    let handle = AgentChannel::spawn(
        link,
        call.clone(),
        Endpoint::Inband,
        ChannelState::Prering,
        events,
        registry,
    )
    .unwrap();

    handle.input(ChannelInput::Ringing(call.clone())).await.unwrap();
    handle.input(ChannelInput::Oncall(None)).await.unwrap();

    let outcome = handle
        .input(ChannelInput::EndpointExit("line dropped".to_string()))
        .await
        .unwrap();
    assert_eq!(outcome, TransitionOutcome::Moved(ChannelState::Wrapup));
    assert!(gateway.ops().contains(&"try_wrapup".to_string()));

    // a second exit while already in wrapup is ignored
    let outcome = handle
        .input(ChannelInput::EndpointExit("again".to_string()))
        .await
        .unwrap();
    assert_eq!(outcome, TransitionOutcome::Moved(ChannelState::Wrapup));
}

#[tokio::test]
async fn endpoint_exit_while_ringing_terminates() {
    let gateway = Arc::new(RecordingGateway::default());
    let events = EventManager::new(64);
    let registry = Arc::new(PropertyRegistry::new());
    let (link, _notices) = AgentLink::new(test_agent());

    let call = test_call(gateway);
    let handle = AgentChannel::spawn(
        link,
        call.clone(),
        Endpoint::Inband,
        ChannelState::Prering,
        events,
        registry.clone(),
    )
    .unwrap();

    handle.input(ChannelInput::Ringing(call)).await.unwrap();
    let outcome = handle
        .input(ChannelInput::EndpointExit("phone unplugged".to_string()))
        .await
        .unwrap();
    assert_eq!(outcome, TransitionOutcome::Terminated(ChannelState::Ringing));
    handle.closed().await;
    assert_eq!(registry.len(), 0);
}

#[tokio::test]
async fn endpoint_start_failure_fails_the_channel() {
    let gateway = Arc::new(RecordingGateway::default());
    let events = EventManager::new(64);
    let registry = Arc::new(PropertyRegistry::new());
    let (link, _notices) = AgentLink::new(test_agent());

    let call = test_call(gateway);
    let result = AgentChannel::spawn(
        link,
        call,
        Endpoint::Driver(EndpointDescriptor {
            kind: EndpointKind::Pstn,
            data: String::new(),
        }),
        ChannelState::Prering,
        events,
        registry.clone(),
    );

    assert!(result.is_err());
    assert_eq!(registry.len(), 0);
}

#[tokio::test]
async fn answer_frees_endpoint_on_inband_ring_outband_media() {
    let gateway = Arc::new(RecordingGateway::default());
    let events = EventManager::new(64);
    let registry = Arc::new(PropertyRegistry::new());
    let (link, _notices) = AgentLink::new(test_agent());

    let call = test_call(gateway.clone()).with_paths(RingPath::Inband, RingPath::Outband);
    let handle = AgentChannel::spawn(
        link,
        call.clone(),
        Endpoint::Driver(EndpointDescriptor {
            kind: EndpointKind::Sip,
            data: "sip:alice@phones.example".to_string(),
        }),
        ChannelState::Prering,
        events,
        registry,
    )
    .unwrap();

    handle.input(ChannelInput::Ringing(call)).await.unwrap();
    let outcome = handle.input(ChannelInput::Oncall(None)).await.unwrap();
    assert_eq!(outcome, TransitionOutcome::Moved(ChannelState::Oncall));
    assert_eq!(gateway.ops(), vec!["oncall"]);

    // the endpoint was released: its later death must not disturb the call
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(handle.state(), ChannelState::Oncall);
}

#[tokio::test]
async fn auto_wrapup_timer_ends_the_channel() {
    let gateway = Arc::new(RecordingGateway::default());
    let events = EventManager::new(64);
    let mut bus = events.subscribe();
    let registry = Arc::new(PropertyRegistry::new());
    let (link, _notices) = AgentLink::new(test_agent());

    let mut call = test_call(gateway);
    call.client.autoend_wrapup = Some(1);

    let handle = AgentChannel::spawn(
        link,
        call.clone(),
        Endpoint::Inband,
        ChannelState::Prering,
        events,
        registry.clone(),
    )
    .unwrap();

    handle.input(ChannelInput::Ringing(call)).await.unwrap();
    handle.input(ChannelInput::Oncall(None)).await.unwrap();
    handle.input(ChannelInput::Wrapup { from_connection: true }).await.unwrap();
    assert_eq!(handle.state(), ChannelState::Wrapup);

    handle.closed().await;
    assert_eq!(registry.len(), 0);

    let mut terminated = false;
    while let Ok(event) = bus.recv().await {
        if let ChannelEvent::TerminatedChannel { final_state, .. } = event {
            assert_eq!(final_state, ChannelState::Wrapup);
            terminated = true;
            break;
        }
    }
    assert!(terminated);
}

#[tokio::test]
async fn agent_death_terminates_channel() {
    let gateway = Arc::new(RecordingGateway::default());
    let events = EventManager::new(64);
    let registry = Arc::new(PropertyRegistry::new());
    let (link, notices) = AgentLink::new(test_agent());

    let call = test_call(gateway);
    let handle = AgentChannel::spawn(
        link,
        call,
        Endpoint::Inband,
        ChannelState::Prering,
        events,
        registry.clone(),
    )
    .unwrap();

    drop(notices);
    handle.closed().await;
    assert_eq!(registry.len(), 0);
}

#[tokio::test]
async fn warm_transfer_states_pass_through() {
    let gateway = Arc::new(RecordingGateway::default());
    let events = EventManager::new(64);
    let registry = Arc::new(PropertyRegistry::new());
    let (link, _notices) = AgentLink::new(test_agent());

    let call = test_call(gateway);
    let handle = AgentChannel::spawn(
        link,
        call.clone(),
        Endpoint::Inband,
        ChannelState::Prering,
        events,
        registry,
    )
    .unwrap();

    handle.input(ChannelInput::Ringing(call)).await.unwrap();
    handle.input(ChannelInput::Oncall(None)).await.unwrap();

    let outcome = handle
        .input(ChannelInput::WarmTransfer { number: "5550199".to_string() })
        .await
        .unwrap();
    assert_eq!(outcome, TransitionOutcome::Moved(ChannelState::WarmtransferHold));

    let outcome = handle.input(ChannelInput::WarmTransferCancel).await.unwrap();
    assert_eq!(outcome, TransitionOutcome::Moved(ChannelState::Oncall));

    handle
        .input(ChannelInput::WarmTransfer { number: "5550199".to_string() })
        .await
        .unwrap();
    let outcome = handle.input(ChannelInput::WarmTransferComplete).await.unwrap();
    assert_eq!(outcome, TransitionOutcome::Moved(ChannelState::Wrapup));
}
