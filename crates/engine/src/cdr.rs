//! CDR sink
//!
//! Subscribes to the channel event bus and folds channel lifecycles into
//! per-call records. This is the boundary to reporting: a real deployment
//! ships these records out, tests read them back.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, warn};

use cpx_agent_core::events::{ChannelEvent, EventManager};
use cpx_agent_core::state_table::ChannelState;
use cpx_agent_core::types::{CallId, StateChange};

/// Accumulated record for one call.
#[derive(Debug, Clone)]
pub struct CdrRecord {
    pub call_id: CallId,
    pub client: String,
    pub initiated_at: DateTime<Utc>,
    pub state_changes: Vec<StateChange>,
    pub agent: Option<String>,
    pub ended_at: Option<DateTime<Utc>>,
    /// True when the channel closed out of wrapup (a completed call).
    pub ended_in_wrapup: bool,
}

/// Collector task handle.
#[derive(Clone)]
pub struct CdrSink {
    records: Arc<DashMap<CallId, CdrRecord>>,
}

impl CdrSink {
    /// Subscribe to the bus and start collecting.
    pub fn spawn(events: &EventManager) -> Self {
        let records: Arc<DashMap<CallId, CdrRecord>> = Arc::new(DashMap::new());
        let mut rx = events.subscribe();
        let sink_records = records.clone();

        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => apply_event(&sink_records, event),
                    Err(RecvError::Lagged(missed)) => {
                        warn!("CDR sink lagged, {} events dropped", missed);
                    }
                    Err(RecvError::Closed) => break,
                }
            }
            debug!("CDR sink stopped");
        });

        Self { records }
    }

    pub fn get(&self, call_id: &CallId) -> Option<CdrRecord> {
        self.records.get(call_id).map(|r| r.clone())
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

fn apply_event(records: &DashMap<CallId, CdrRecord>, event: ChannelEvent) {
    match event {
        ChannelEvent::InitiatedChannel { at, call, .. } => {
            records
                .entry(call.id.clone())
                .or_insert_with(|| CdrRecord {
                    call_id: call.id.clone(),
                    client: call.client.id.clone(),
                    initiated_at: at,
                    state_changes: call.state_changes.clone(),
                    agent: None,
                    ended_at: None,
                    ended_in_wrapup: false,
                });
        }
        // Intermediate updates carry no call record; the full state-change
        // history arrives with the termination event.
        ChannelEvent::ChannelStateUpdate { .. } => {}
        ChannelEvent::TerminatedChannel { at, agent, call, final_state } => {
            let mut record = records.entry(call.id.clone()).or_insert_with(|| CdrRecord {
                call_id: call.id.clone(),
                client: call.client.id.clone(),
                initiated_at: at,
                state_changes: Vec::new(),
                agent: None,
                ended_at: None,
                ended_in_wrapup: false,
            });
            record.state_changes = call.state_changes.clone();
            record.agent = Some(agent.login.clone());
            record.ended_at = Some(at);
            record.ended_in_wrapup = final_state == ChannelState::Wrapup;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cpx_agent_core::media::MediaHandle;
    use cpx_agent_core::types::{AgentId, AgentRef, Call, CallerId, Client, MediaType};

    fn call() -> Call {
        Call::new(
            MediaType::Voice,
            Client::default(),
            CallerId::default(),
            MediaHandle::null(),
        )
    }

    #[tokio::test]
    async fn termination_from_wrapup_closes_record() {
        let events = EventManager::new(16);
        let sink = CdrSink::spawn(&events);

        let call = call();
        let agent = AgentRef {
            id: AgentId("a".into()),
            login: "alice".into(),
            profile: "default".into(),
        };

        events.emit(ChannelEvent::InitiatedChannel {
            at: Utc::now(),
            channel: cpx_agent_core::types::ChannelId::new(),
            call: call.clone(),
        });
        events.emit(ChannelEvent::TerminatedChannel {
            at: Utc::now(),
            agent,
            call: call.clone(),
            final_state: ChannelState::Wrapup,
        });

        // Broadcast delivery is asynchronous.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let record = sink.get(&call.id).expect("record exists");
        assert!(record.ended_in_wrapup);
        assert_eq!(record.agent.as_deref(), Some("alice"));
        assert!(record.ended_at.is_some());
    }
}
