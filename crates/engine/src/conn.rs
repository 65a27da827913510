//! Connection worker
//!
//! One task per logged-in agent session. It hosts the agent FSM, owns the
//! long-poll queue, spawns channels on behalf of routing, and carries the
//! whitelisted verb surface the dispatcher forwards into. Everything the
//! browser does after login funnels through here, serialised by the
//! worker's inbox.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval, Instant};
use tracing::{debug, info};
use uuid::Uuid;

use cpx_agent_core::channel::{AgentChannel, AgentLink, AgentNotice, ChannelHandle};
use cpx_agent_core::endpoint::Endpoint;
use cpx_agent_core::events::EventManager;
use cpx_agent_core::media::MediaHandle;
use cpx_agent_core::property::PropertyRegistry;
use cpx_agent_core::state_table::{ChannelInput, ChannelState};
use cpx_agent_core::types::{
    Agent, AgentSnapshot, Call, CallerId, ChannelId, MediaType, RingPath, SecurityLevel,
};

use crate::agent::AgentFsm;
use crate::config::EngineConfig;
use crate::database::Store;
use crate::error::{EngineError, ErrCode, Result};
use crate::queue::manager::QueueManagerHandle;
use crate::queue::worker::QueuedCall;
use crate::web::reply::ApiReply;

/// Verbs the worker accepts through the generic `api` fallthrough.
/// Anything else is `FUNCTION_NOEXISTS` — no reflection-based dispatch.
const API_VERBS: &[&str] = &[
    "set_state",
    "ack",
    "err",
    "dial",
    "get_avail_agents",
    "agent_transfer",
    "queue_transfer",
    "init_outbound",
    "warm_transfer",
    "warm_transfer_complete",
    "warm_transfer_cancel",
    "end_wrapup",
    "mediapush",
    "supervisor",
];

/// What a suspended poll resolves to.
#[derive(Debug)]
pub enum PollOutcome {
    /// Pending events, delivered with HTTP 200.
    Events(Vec<Value>),
    /// The worker died; the handler replies 408.
    Killed,
}

enum ConnCommand {
    Poll {
        reply: oneshot::Sender<PollOutcome>,
    },
    KeepAlive,
    SetEndpoint {
        endpoint: Endpoint,
        ring_path: RingPath,
    },
    DumpAgent {
        reply: oneshot::Sender<AgentSnapshot>,
    },
    Api {
        verb: String,
        args: Vec<Value>,
        reply: oneshot::Sender<ApiReply>,
    },
    SpawnChannel {
        call: Call,
        initial: ChannelState,
        reply: oneshot::Sender<Result<ChannelId>>,
    },
    Stop,
}

/// Cloneable handle to a connection worker.
#[derive(Clone)]
pub struct ConnectionHandle {
    pub id: Uuid,
    pub login: String,
    tx: mpsc::Sender<ConnCommand>,
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.id)
            .field("login", &self.login)
            .finish()
    }
}

impl ConnectionHandle {
    /// Register as the session's poller. The returned receiver resolves
    /// when events arrive or the worker dies; the HTTP layer bounds the
    /// wait.
    pub async fn poll(&self) -> Result<oneshot::Receiver<PollOutcome>> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(ConnCommand::Poll { reply: reply_tx })
            .await
            .map_err(|_| EngineError::BadCookie)?;
        Ok(reply_rx)
    }

    pub async fn keep_alive(&self) {
        let _ = self.tx.send(ConnCommand::KeepAlive).await;
    }

    pub async fn set_endpoint(&self, endpoint: Endpoint, ring_path: RingPath) -> Result<()> {
        self.tx
            .send(ConnCommand::SetEndpoint { endpoint, ring_path })
            .await
            .map_err(|_| EngineError::BadCookie)
    }

    pub async fn dump_agent(&self) -> Result<AgentSnapshot> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(ConnCommand::DumpAgent { reply: reply_tx })
            .await
            .map_err(|_| EngineError::BadCookie)?;
        reply_rx.await.map_err(|_| EngineError::BadCookie)
    }

    /// Generic verb fallthrough.
    pub async fn api(&self, verb: &str, args: Vec<Value>) -> Result<ApiReply> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(ConnCommand::Api {
                verb: verb.to_string(),
                args,
                reply: reply_tx,
            })
            .await
            .map_err(|_| EngineError::BadCookie)?;
        reply_rx.await.map_err(|_| EngineError::BadCookie)
    }

    /// Create a channel owned by this agent (routing and tests).
    pub async fn spawn_channel(&self, call: Call, initial: ChannelState) -> Result<ChannelId> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(ConnCommand::SpawnChannel {
                call,
                initial,
                reply: reply_tx,
            })
            .await
            .map_err(|_| EngineError::BadCookie)?;
        reply_rx.await.map_err(|_| EngineError::BadCookie)?
    }

    pub async fn stop(&self) {
        let _ = self.tx.send(ConnCommand::Stop).await;
    }

    /// Resolve when the worker has terminated.
    pub async fn closed(&self) {
        self.tx.closed().await
    }
}

/// Shared services the worker needs.
#[derive(Clone)]
pub struct ConnectionDeps {
    pub config: Arc<EngineConfig>,
    pub store: Store,
    pub queues: QueueManagerHandle,
    pub events: EventManager,
    pub registry: Arc<PropertyRegistry>,
    pub media: MediaHandle,
    pub directory: Arc<DashMap<String, ConnectionHandle>>,
}

/// The connection worker task state.
pub struct ConnectionWorker {
    id: Uuid,
    fsm: AgentFsm,
    endpoint: Endpoint,
    ring_path: RingPath,
    link: AgentLink,
    notice_rx: mpsc::UnboundedReceiver<AgentNotice>,
    channels: HashMap<ChannelId, (ChannelHandle, Call)>,
    pending: Vec<Value>,
    poller: Option<oneshot::Sender<PollOutcome>>,
    last_keepalive: Instant,
    deps: ConnectionDeps,
    cmd_rx: mpsc::Receiver<ConnCommand>,
}

impl ConnectionWorker {
    /// Start a worker for an authenticated agent and return its handle.
    pub fn spawn(
        agent: Agent,
        endpoint: Endpoint,
        ring_path: RingPath,
        deps: ConnectionDeps,
    ) -> ConnectionHandle {
        let id = Uuid::new_v4();
        let login = agent.login.clone();
        let (cmd_tx, cmd_rx) = mpsc::channel(64);
        let (link, notice_rx) = AgentLink::new((&agent).into());

        let handle = ConnectionHandle {
            id,
            login: login.clone(),
            tx: cmd_tx,
        };

        let worker = ConnectionWorker {
            id,
            fsm: AgentFsm::new(agent),
            endpoint,
            ring_path,
            link,
            notice_rx,
            channels: HashMap::new(),
            pending: Vec::new(),
            poller: None,
            last_keepalive: Instant::now(),
            deps,
            cmd_rx,
        };

        tokio::spawn(worker.run());

        info!("connection worker started for {}", login);
        handle
    }

    async fn run(mut self) {
        let idle_timeout = Duration::from_secs(self.deps.config.session.idle_timeout_secs);
        let mut idle_check = interval(idle_timeout.div_f32(4.0).max(Duration::from_millis(250)));

        loop {
            tokio::select! {
                maybe_cmd = self.cmd_rx.recv() => {
                    match maybe_cmd {
                        Some(ConnCommand::Stop) | None => break,
                        Some(cmd) => self.handle_command(cmd).await,
                    }
                }

                maybe_notice = self.notice_rx.recv() => {
                    if let Some(notice) = maybe_notice {
                        self.handle_notice(notice);
                    }
                }

                _ = idle_check.tick() => {
                    if self.last_keepalive.elapsed() >= idle_timeout {
                        info!(
                            "connection worker for {} idle for {:?}, terminating",
                            self.fsm.agent.login, idle_timeout
                        );
                        break;
                    }
                }
            }
        }

        self.shutdown();
    }

    fn shutdown(mut self) {
        if let Some(poller) = self.poller.take() {
            let _ = poller.send(PollOutcome::Killed);
        }
        self.deps
            .directory
            .remove_if(&self.fsm.agent.login, |_, handle| handle.id == self.id);
        debug!("connection worker for {} stopped", self.fsm.agent.login);
        // Dropping the worker drops its AgentLink sender; linked channels
        // observe that and terminate themselves.
    }

    async fn handle_command(&mut self, cmd: ConnCommand) {
        match cmd {
            ConnCommand::Poll { reply } => {
                self.last_keepalive = Instant::now();
                if !self.pending.is_empty() {
                    let events = std::mem::take(&mut self.pending);
                    let _ = reply.send(PollOutcome::Events(events));
                    return;
                }
                // One outstanding poll at a time; the superseded one gets
                // a synthetic empty reply.
                if let Some(old) = self.poller.replace(reply) {
                    let _ = old.send(PollOutcome::Events(Vec::new()));
                }
            }

            ConnCommand::KeepAlive => {
                self.last_keepalive = Instant::now();
            }

            ConnCommand::SetEndpoint { endpoint, ring_path } => {
                self.endpoint = endpoint;
                self.ring_path = ring_path;
            }

            ConnCommand::DumpAgent { reply } => {
                let _ = reply.send(self.fsm.snapshot());
            }

            ConnCommand::SpawnChannel { call, initial, reply } => {
                let _ = reply.send(self.spawn_channel(call, initial));
            }

            ConnCommand::Api { verb, args, reply } => {
                if !API_VERBS.contains(&verb.as_str()) {
                    let _ = reply.send(ApiReply::error(
                        ErrCode::FunctionNoexists,
                        format!("unknown function: {verb}"),
                    ));
                    return;
                }
                self.handle_api(&verb, args, reply).await;
            }

            ConnCommand::Stop => unreachable!("handled in run()"),
        }
    }

    fn handle_notice(&mut self, notice: AgentNotice) {
        self.fsm.on_notice(&notice);
        if let AgentNotice::ChannelTerminated { channel, .. } = &notice {
            self.channels.remove(channel);
        }
        let event = notice_event(&notice);
        self.push_event(event);
    }

    fn push_event(&mut self, event: Value) {
        if let Some(poller) = self.poller.take() {
            let mut events = std::mem::take(&mut self.pending);
            events.push(event);
            match poller.send(PollOutcome::Events(events)) {
                Ok(()) => {}
                // Poller went away (HTTP timeout); keep the backlog.
                Err(PollOutcome::Events(events)) => self.pending = events,
                Err(PollOutcome::Killed) => unreachable!("we only send Events here"),
            }
        } else {
            self.pending.push(event);
        }
    }

    fn spawn_channel(&mut self, mut call: Call, initial: ChannelState) -> Result<ChannelId> {
        call.ring_path = self.ring_path;
        let handle = AgentChannel::spawn(
            self.link.clone(),
            call.clone(),
            self.endpoint.clone(),
            initial,
            self.deps.events.clone(),
            self.deps.registry.clone(),
        )?;
        let id = handle.id.clone();
        self.channels.insert(id.clone(), (handle, call));
        Ok(id)
    }

    fn channel_in(&self, state: ChannelState) -> Option<&(ChannelHandle, Call)> {
        let id = self.fsm.channel_in(state)?;
        self.channels.get(&id)
    }

    async fn handle_api(&mut self, verb: &str, args: Vec<Value>, reply: oneshot::Sender<ApiReply>) {
        let outcome = match verb {
            "set_state" => self.api_set_state(&args).await,
            "ack" => {
                self.fsm.ack(arg_u64(&args, 0).unwrap_or(0));
                Ok(ApiReply::success())
            }
            "err" => {
                self.fsm.err(arg_u64(&args, 0).unwrap_or(0), arg_str(&args, 1).as_deref());
                Ok(ApiReply::success())
            }
            "dial" => self.api_dial(&args).await,
            "get_avail_agents" => {
                // Fan-out to other workers must not block this inbox.
                self.api_get_avail_agents(reply);
                return;
            }
            "agent_transfer" => self.api_agent_transfer(&args).await,
            "queue_transfer" => self.api_queue_transfer(&args).await,
            "init_outbound" => self.api_init_outbound(&args).await,
            "warm_transfer" => self.api_warm_transfer(&args).await,
            "warm_transfer_complete" => self.api_warm_input(ChannelInput::WarmTransferComplete).await,
            "warm_transfer_cancel" => self.api_warm_input(ChannelInput::WarmTransferCancel).await,
            "end_wrapup" => self.api_end_wrapup().await,
            "mediapush" => self.api_mediapush(&args).await,
            "supervisor" => {
                self.api_supervisor(&args, reply).await;
                return;
            }
            _ => Err(EngineError::UnknownFunction(verb.to_string())),
        };

        let _ = reply.send(match outcome {
            Ok(api_reply) => api_reply,
            Err(err) => ApiReply::from(err),
        });
    }

    async fn api_set_state(&mut self, args: &[Value]) -> Result<ApiReply> {
        let state = arg_str(args, 0).ok_or(EngineError::NoFunction)?;
        let data = arg_str(args, 1);
        let releases = self
            .deps
            .store
            .list_release_opts()
            .await
            .map_err(EngineError::Internal)?;
        self.fsm.set_state(&state, data.as_deref(), &releases)?;
        Ok(ApiReply::success())
    }

    async fn api_dial(&mut self, args: &[Value]) -> Result<ApiReply> {
        let number = arg_str(args, 0).ok_or(EngineError::NoFunction)?;
        let (handle, call) = self
            .channel_in(ChannelState::Precall)
            .cloned()
            .ok_or_else(|| EngineError::Queue("no outbound call to dial on".into()))?;

        call.source.dial(&call.id, &number).await?;
        self.fsm.set_outgoing();
        handle.input(ChannelInput::Oncall(Some(call))).await?;
        Ok(ApiReply::success())
    }

    fn api_get_avail_agents(&self, reply: oneshot::Sender<ApiReply>) {
        let directory = self.deps.directory.clone();
        let own_login = self.fsm.agent.login.clone();
        let own_snapshot = self.fsm.snapshot();

        tokio::spawn(async move {
            let mut agents = vec![own_snapshot];
            let others: Vec<ConnectionHandle> = directory
                .iter()
                .filter(|entry| entry.key() != &own_login)
                .map(|entry| entry.value().clone())
                .collect();
            for handle in others {
                let dump = tokio::time::timeout(Duration::from_secs(1), handle.dump_agent()).await;
                if let Ok(Ok(snapshot)) = dump {
                    agents.push(snapshot);
                }
            }
            agents.retain(|a| a.state == "idle" || a.state == "released");
            let reply_value = serde_json::to_value(&agents).unwrap_or_else(|_| json!([]));
            let _ = reply.send(ApiReply::success_with(reply_value));
        });
    }

    async fn api_agent_transfer(&mut self, args: &[Value]) -> Result<ApiReply> {
        let target = arg_str(args, 0).ok_or(EngineError::NoFunction)?;
        if !self.deps.directory.contains_key(&target) {
            return Err(EngineError::Queue(format!("agent {target} is not logged in")));
        }
        let (_, call) = self
            .channel_in(ChannelState::Oncall)
            .ok_or_else(|| EngineError::Queue("not on a call".into()))?;
        call.source.transfer_to_agent(&call.id, &target).await?;
        Ok(ApiReply::success())
    }

    async fn api_queue_transfer(&mut self, args: &[Value]) -> Result<ApiReply> {
        let queue_name = arg_str(args, 0).ok_or(EngineError::NoFunction)?;
        let (handle, call) = self
            .channel_in(ChannelState::Oncall)
            .cloned()
            .ok_or_else(|| EngineError::Queue("not on a call".into()))?;

        let queue = self
            .deps
            .queues
            .get_queue(&queue_name)
            .await?
            .ok_or_else(|| EngineError::Queue(format!("no such queue: {queue_name}")))?;

        queue.enqueue(QueuedCall {
            priority: self.deps.config.queue.default_priority,
            enqueued_at: chrono::Utc::now(),
            call_id: call.id.clone(),
            handle: Some(call.source.clone()),
        });

        handle.input(ChannelInput::Wrapup { from_connection: true }).await?;
        Ok(ApiReply::success())
    }

    async fn api_init_outbound(&mut self, args: &[Value]) -> Result<ApiReply> {
        let client_id = arg_str(args, 0).ok_or(EngineError::NoFunction)?;
        let media_type = arg_str(args, 1)
            .and_then(|s| MediaType::parse(&s))
            .unwrap_or(MediaType::Voice);

        let client = self
            .deps
            .store
            .get_client(&client_id)
            .await
            .map_err(EngineError::Internal)?
            .ok_or_else(|| EngineError::Queue(format!("no such client: {client_id}")))?;

        let call = Call::new(
            media_type,
            client,
            CallerId {
                name: self.fsm.agent.login.clone(),
                number: String::new(),
            },
            self.deps.media.clone(),
        );

        let id = self.spawn_channel(call, ChannelState::Precall)?;
        Ok(ApiReply::success_with(json!({ "channel": id.to_string() })))
    }

    async fn api_warm_transfer(&mut self, args: &[Value]) -> Result<ApiReply> {
        let number = arg_str(args, 0).ok_or(EngineError::NoFunction)?;
        self.api_warm_input(ChannelInput::WarmTransfer { number }).await
    }

    async fn api_warm_input(&mut self, input: ChannelInput) -> Result<ApiReply> {
        let (handle, _) = self
            .channel_in(ChannelState::Oncall)
            .or_else(|| self.channel_in(ChannelState::WarmtransferHold))
            .or_else(|| self.channel_in(ChannelState::Warmtransfer3rdParty))
            .cloned()
            .ok_or_else(|| EngineError::Queue("not on a call".into()))?;
        handle.input(input).await?;
        Ok(ApiReply::success())
    }

    async fn api_end_wrapup(&mut self) -> Result<ApiReply> {
        let (handle, _) = self
            .channel_in(ChannelState::Wrapup)
            .cloned()
            .ok_or_else(|| EngineError::Queue("no channel in wrapup".into()))?;
        handle.input(ChannelInput::Stop).await?;
        Ok(ApiReply::success())
    }

    async fn api_mediapush(&mut self, args: &[Value]) -> Result<ApiReply> {
        let (_, call) = self
            .channel_in(ChannelState::Oncall)
            .ok_or_else(|| EngineError::Queue("not on a call".into()))?;
        debug!(
            "media push for {}: {}",
            call.id,
            args.first().cloned().unwrap_or(serde_json::Value::Null)
        );
        Ok(ApiReply::success())
    }

    /// Supervisor surface. Gated on the agent's security level; the
    /// subcommand is the first argument, anything after it belongs to the
    /// subcommand.
    async fn api_supervisor(&mut self, args: &[Value], reply: oneshot::Sender<ApiReply>) {
        if !matches!(
            self.fsm.agent.security,
            SecurityLevel::Supervisor | SecurityLevel::Admin
        ) {
            let _ = reply.send(ApiReply::from(EngineError::InvalidCredentials));
            return;
        }

        let sub = arg_str(args, 0).unwrap_or_default();
        match sub.as_str() {
            "status" => self.supervisor_status(reply),
            "channels" => {
                let _ = reply.send(self.supervisor_channels());
            }
            "agent_state" => self.supervisor_agent_state(args, reply).await,
            other => {
                let _ = reply.send(ApiReply::error(
                    ErrCode::FunctionNoexists,
                    format!("unknown supervisor command: {other}"),
                ));
            }
        }
    }

    /// Snapshot of every logged-in agent plus per-queue waiting counts.
    fn supervisor_status(&self, reply: oneshot::Sender<ApiReply>) {
        let directory = self.deps.directory.clone();
        let own_login = self.fsm.agent.login.clone();
        let own_snapshot = self.fsm.snapshot();
        let queues = self.deps.queues.clone();

        // Same rule as get_avail_agents: dumping other workers must not
        // block this inbox.
        tokio::spawn(async move {
            let mut agents = vec![own_snapshot];
            let others: Vec<ConnectionHandle> = directory
                .iter()
                .filter(|entry| entry.key() != &own_login)
                .map(|entry| entry.value().clone())
                .collect();
            for handle in others {
                let dump = tokio::time::timeout(Duration::from_secs(1), handle.dump_agent()).await;
                if let Ok(Ok(snapshot)) = dump {
                    agents.push(snapshot);
                }
            }

            let mut queue_stats = Vec::new();
            if let Ok(list) = queues.queues().await {
                for (name, handle) in list {
                    let waiting = handle.count().await.unwrap_or(0);
                    queue_stats.push(json!({ "name": name, "calls": waiting }));
                }
            }

            let _ = reply.send(ApiReply::success_with(json!({
                "agents": agents,
                "queues": queue_stats,
            })));
        });
    }

    /// Every live channel as advertised in the property registry.
    fn supervisor_channels(&self) -> ApiReply {
        let channels: Vec<Value> = self
            .deps
            .registry
            .list()
            .into_iter()
            .map(|(id, prop)| {
                json!({
                    "channel": id.to_string(),
                    "login": prop.login,
                    "profile": prop.profile,
                    "type": prop.media_type.as_str(),
                    "client": prop.client,
                    "caller_id": [prop.caller_id.name, prop.caller_id.number],
                    "state": prop.state.as_str(),
                })
            })
            .collect();
        ApiReply::success_with(json!(channels))
    }

    /// Force another agent's availability through their own worker, so
    /// the change is serialised with everything else that agent does.
    async fn supervisor_agent_state(&mut self, args: &[Value], reply: oneshot::Sender<ApiReply>) {
        let Some(target) = arg_str(args, 1) else {
            let _ = reply.send(ApiReply::from(EngineError::NoFunction));
            return;
        };
        let Some(state) = arg_str(args, 2) else {
            let _ = reply.send(ApiReply::from(EngineError::NoFunction));
            return;
        };
        let mut forwarded = vec![json!(state)];
        if let Some(data) = arg_str(args, 3) {
            forwarded.push(json!(data));
        }

        if target == self.fsm.agent.login {
            let outcome = self.api_set_state(&forwarded).await;
            let _ = reply.send(outcome.unwrap_or_else(ApiReply::from));
            return;
        }

        let Some(handle) = self.deps.directory.get(&target).map(|e| e.value().clone()) else {
            let _ = reply.send(ApiReply::error(
                ErrCode::UnknownError,
                format!("agent {target} is not logged in"),
            ));
            return;
        };

        tokio::spawn(async move {
            let outcome =
                tokio::time::timeout(Duration::from_secs(2), handle.api("set_state", forwarded))
                    .await;
            let api_reply = match outcome {
                Ok(Ok(api_reply)) => api_reply,
                Ok(Err(e)) => ApiReply::from(e),
                Err(_) => ApiReply::from(EngineError::Timeout),
            };
            let _ = reply.send(api_reply);
        });
    }
}

/// Render a channel notice as a poll event for the browser.
fn notice_event(notice: &AgentNotice) -> Value {
    match notice {
        AgentNotice::ChannelAssigned { channel, state, call } => json!({
            "command": "setchannel",
            "channel": channel.to_string(),
            "state": state.as_str(),
            "call": {
                "id": call.id.to_string(),
                "type": call.media_type.as_str(),
                "client": call.client.id.clone(),
                "caller_id": [call.caller_id.name.clone(), call.caller_id.number.clone()],
            },
        }),
        AgentNotice::ChannelStateChanged { channel, state } => json!({
            "command": "setchannel",
            "channel": channel.to_string(),
            "state": state.as_str(),
        }),
        AgentNotice::ChannelTerminated { channel, state } => json!({
            "command": "endchannel",
            "channel": channel.to_string(),
            "state": state.as_str(),
        }),
    }
}

fn arg_str(args: &[Value], idx: usize) -> Option<String> {
    match args.get(idx)? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn arg_u64(args: &[Value], idx: usize) -> Option<u64> {
    match args.get(idx)? {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}
