//! Agent channel state machine runtime
//!
//! One [`AgentChannel`] task per media interaction. The task owns the
//! channel state, the spawned endpoint driver (when one exists) and the
//! call record; it interprets the master transition table and is the only
//! writer for its property-registry entry. It is linked to its owning
//! agent connection and to its endpoint: either dying takes the channel
//! with it, subject to the table's endpoint-exit rows.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info};

use crate::endpoint::{Endpoint, EndpointHandle};
use crate::error::{ChannelError, Result};
use crate::events::{ChannelEvent, EventManager};
use crate::property::{ChannelProp, PropertyRegistry};
use crate::state_table::{
    ChannelInput, ChannelState, ChannelStateTable, Effect, Guard, StateKey, Transition,
    MASTER_TABLE,
};
use crate::types::{AgentRef, Call, ChannelId, RingPath, StateChange};

/// Notices a channel sends to its owning agent connection.
#[derive(Debug, Clone)]
pub enum AgentNotice {
    ChannelAssigned {
        channel: ChannelId,
        state: ChannelState,
        call: Call,
    },
    ChannelStateChanged {
        channel: ChannelId,
        state: ChannelState,
    },
    ChannelTerminated {
        channel: ChannelId,
        state: ChannelState,
    },
}

/// Link to the agent connection owning a channel. When the receiving side
/// goes away the channel terminates.
#[derive(Debug, Clone)]
pub struct AgentLink {
    pub agent: AgentRef,
    tx: mpsc::UnboundedSender<AgentNotice>,
}

impl AgentLink {
    pub fn new(agent: AgentRef) -> (Self, mpsc::UnboundedReceiver<AgentNotice>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { agent, tx }, rx)
    }

    pub fn notify(&self, notice: AgentNotice) {
        let _ = self.tx.send(notice);
    }

    pub async fn closed(&self) {
        self.tx.closed().await
    }
}

/// Result of feeding an input to a channel.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TransitionOutcome {
    /// The input was accepted; the channel is now in the given state.
    Moved(ChannelState),
    /// The input is not permitted in the current state. Nothing happened.
    Invalid,
    /// The input ended the channel; the given state is the one it died in.
    Terminated(ChannelState),
}

enum ChannelCommand {
    Input {
        input: ChannelInput,
        reply: oneshot::Sender<TransitionOutcome>,
    },
}

/// Handle to a running channel task.
#[derive(Clone)]
pub struct ChannelHandle {
    pub id: ChannelId,
    pub call_id: crate::types::CallId,
    cmd_tx: mpsc::Sender<ChannelCommand>,
    state_rx: watch::Receiver<ChannelState>,
}

impl ChannelHandle {
    /// Feed an input through the transition table.
    pub async fn input(&self, input: ChannelInput) -> Result<TransitionOutcome> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(ChannelCommand::Input { input, reply: reply_tx })
            .await
            .map_err(|_| ChannelError::Terminated)?;
        reply_rx.await.map_err(|_| ChannelError::Terminated)
    }

    pub async fn stop(&self) -> Result<TransitionOutcome> {
        self.input(ChannelInput::Stop).await
    }

    pub fn state(&self) -> ChannelState {
        *self.state_rx.borrow()
    }

    /// Resolve when the channel task has gone away.
    pub async fn closed(&self) {
        self.cmd_tx.closed().await
    }
}

/// The channel task state.
pub struct AgentChannel {
    id: ChannelId,
    agent: AgentLink,
    call: Call,
    state: ChannelState,
    /// Configured endpoint; `Inband` is the sentinel.
    endpoint_cfg: Endpoint,
    /// Live driver, present only while the channel owns one.
    endpoint: Option<EndpointHandle>,
    table: Arc<ChannelStateTable>,
    registry: Arc<PropertyRegistry>,
    events: EventManager,
    cmd_rx: mpsc::Receiver<ChannelCommand>,
    state_tx: watch::Sender<ChannelState>,
    wrapup_deadline: Option<Instant>,
}

impl AgentChannel {
    /// Create a channel and spawn its task.
    ///
    /// Registers the channel property, emits `InitiatedChannel`, starts the
    /// endpoint when the channel begins in `prering`, and notifies the
    /// owning connection of the assignment. Endpoint start failure tears
    /// everything back down and surfaces as an error.
    pub fn spawn(
        agent: AgentLink,
        mut call: Call,
        endpoint: Endpoint,
        initial: ChannelState,
        events: EventManager,
        registry: Arc<PropertyRegistry>,
    ) -> Result<ChannelHandle> {
        let id = ChannelId::new();

        registry.register(
            id.clone(),
            ChannelProp {
                login: agent.agent.login.clone(),
                profile: agent.agent.profile.clone(),
                media_type: call.media_type,
                client: call.client.id.clone(),
                caller_id: call.caller_id.clone(),
                state: initial,
            },
        );

        call.state_changes.push(StateChange { state: initial, at: Utc::now() });
        events.emit(ChannelEvent::InitiatedChannel {
            at: Utc::now(),
            channel: id.clone(),
            call: call.clone(),
        });

        let live_endpoint = match (&endpoint, initial) {
            (Endpoint::Driver(desc), ChannelState::Prering) => {
                match EndpointHandle::spawn(desc, &call) {
                    Ok(handle) => Some(handle),
                    Err(e) => {
                        registry.remove(&id);
                        return Err(e);
                    }
                }
            }
            _ => None,
        };

        agent.notify(AgentNotice::ChannelAssigned {
            channel: id.clone(),
            state: initial,
            call: call.clone(),
        });

        let (cmd_tx, cmd_rx) = mpsc::channel(32);
        let (state_tx, state_rx) = watch::channel(initial);

        let handle = ChannelHandle {
            id: id.clone(),
            call_id: call.id.clone(),
            cmd_tx,
            state_rx,
        };

        let channel = AgentChannel {
            id,
            agent,
            call,
            state: initial,
            endpoint_cfg: endpoint,
            endpoint: live_endpoint,
            table: MASTER_TABLE.clone(),
            registry,
            events,
            cmd_rx,
            state_tx,
            wrapup_deadline: None,
        };

        tokio::spawn(channel.run());

        Ok(handle)
    }

    async fn run(mut self) {
        debug!("channel {} started in {}", self.id, self.state);

        loop {
            let wrapup_deadline = self.wrapup_deadline;

            tokio::select! {
                maybe_cmd = self.cmd_rx.recv() => {
                    match maybe_cmd {
                        Some(ChannelCommand::Input { input, reply }) => {
                            let outcome = self.handle_input(input).await;
                            let done = matches!(outcome, TransitionOutcome::Terminated(_));
                            let _ = reply.send(outcome);
                            if done {
                                return;
                            }
                        }
                        None => {
                            self.terminate("handle dropped").await;
                            return;
                        }
                    }
                }

                // Pends forever while no endpoint is owned.
                reason = Self::endpoint_exit(&mut self.endpoint) => {
                    self.endpoint = None;
                    let outcome = self.handle_input(ChannelInput::EndpointExit(reason)).await;
                    if matches!(outcome, TransitionOutcome::Terminated(_)) {
                        return;
                    }
                }

                _ = async { sleep_until(wrapup_deadline.unwrap()).await }, if wrapup_deadline.is_some() => {
                    self.wrapup_deadline = None;
                    let outcome = self.handle_input(ChannelInput::EndWrapup).await;
                    if matches!(outcome, TransitionOutcome::Terminated(_)) {
                        return;
                    }
                }

                _ = self.agent.closed() => {
                    self.terminate("agent connection lost").await;
                    return;
                }
            }
        }
    }

    async fn endpoint_exit(endpoint: &mut Option<EndpointHandle>) -> String {
        match endpoint.as_mut() {
            Some(handle) => handle.exited().await,
            None => std::future::pending().await,
        }
    }

    /// Look up the transition for an input and apply it. Inputs with no
    /// passing candidate leave the channel untouched.
    async fn handle_input(&mut self, input: ChannelInput) -> TransitionOutcome {
        let key = StateKey {
            state: self.state,
            input: input.kind(),
        };

        let transition: Option<Transition> = self
            .table
            .candidates(&key)
            .iter()
            .find(|t| t.guards.iter().all(|g| self.guard_holds(g, &input)))
            .cloned();

        let Some(transition) = transition else {
            debug!("channel {}: {} is invalid in {}", self.id, input.name(), self.state);
            return TransitionOutcome::Invalid;
        };

        if let Some(next) = transition.next_state {
            if next != self.state {
                self.enter_state(next);
            }
        }

        for effect in &transition.effects {
            self.apply_effect(*effect).await;
        }

        if transition.terminates() {
            let final_state = self.state;
            self.terminate(input.name()).await;
            return TransitionOutcome::Terminated(final_state);
        }

        TransitionOutcome::Moved(self.state)
    }

    fn guard_holds(&self, guard: &Guard, input: &ChannelInput) -> bool {
        match guard {
            Guard::Always => true,
            Guard::FromConnection => matches!(input, ChannelInput::Oncall(None)),
            Guard::CallMatches => {
                matches!(input, ChannelInput::Oncall(Some(c)) if c.id == self.call.id)
            }
            Guard::ClientOrCallMatches => matches!(
                input,
                ChannelInput::Oncall(Some(c))
                    if c.id == self.call.id || c.client.id == self.call.client.id
            ),
            Guard::EndpointInband => self.endpoint_cfg.is_inband(),
            Guard::InbandRingOutbandMedia => {
                self.call.ring_path == RingPath::Inband
                    && self.call.media_path == RingPath::Outband
            }
            Guard::SelfInitiated => {
                matches!(input, ChannelInput::Wrapup { from_connection: true })
            }
        }
    }

    fn enter_state(&mut self, next: ChannelState) {
        let old_state = self.state;
        self.state = next;

        let now = Utc::now();
        self.call.state_changes.push(StateChange { state: next, at: now });

        let prop = self
            .registry
            .update_state(&self.id, next)
            .unwrap_or_else(|| ChannelProp {
                login: self.agent.agent.login.clone(),
                profile: self.agent.agent.profile.clone(),
                media_type: self.call.media_type,
                client: self.call.client.id.clone(),
                caller_id: self.call.caller_id.clone(),
                state: next,
            });

        self.events.emit(ChannelEvent::ChannelStateUpdate {
            channel: self.id.clone(),
            agent: self.agent.agent.id.clone(),
            at: now,
            new_state: next,
            old_state,
            prop,
        });

        let _ = self.state_tx.send(next);

        if next == ChannelState::Wrapup {
            if let Some(secs) = self.call.client.autoend_wrapup {
                if secs > 0 {
                    self.wrapup_deadline = Some(Instant::now() + Duration::from_secs(secs));
                }
            }
        }
    }

    async fn apply_effect(&mut self, effect: Effect) {
        match effect {
            Effect::NotifyConnection => {
                self.agent.notify(AgentNotice::ChannelStateChanged {
                    channel: self.id.clone(),
                    state: self.state,
                });
            }
            Effect::MediaOncall => {
                if let Err(e) = self.call.source.oncall(&self.call.id).await {
                    error!("media oncall failed for {}: {}", self.call.id, e);
                }
            }
            Effect::MediaWrapup => {
                if let Err(e) = self.call.source.wrapup(&self.call.id).await {
                    error!("media wrapup failed for {}: {}", self.call.id, e);
                }
            }
            Effect::TryWrapup => {
                if let Err(e) = self.call.source.try_wrapup(&self.call.id).await {
                    error!("media try_wrapup failed for {}: {}", self.call.id, e);
                }
            }
            Effect::FreeEndpoint | Effect::EndpointHangup => {
                if let Some(endpoint) = self.endpoint.take() {
                    endpoint.hangup();
                }
            }
            // Handled by the caller once the other effects ran.
            Effect::Terminate => {}
        }
    }

    async fn terminate(&mut self, reason: &str) {
        info!("channel {} terminating from {}: {}", self.id, self.state, reason);

        if let Some(endpoint) = self.endpoint.take() {
            endpoint.hangup();
        }

        self.registry.remove(&self.id);

        self.events.emit(ChannelEvent::TerminatedChannel {
            at: Utc::now(),
            agent: self.agent.agent.clone(),
            call: self.call.clone(),
            final_state: self.state,
        });

        self.agent.notify(AgentNotice::ChannelTerminated {
            channel: self.id.clone(),
            state: self.state,
        });
    }
}
