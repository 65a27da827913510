//! Replicated queue manager
//!
//! A leader-elected directory of `queue name → worker handle`. All
//! mutations route through the leader; followers answer local hits and
//! forward misses. On surrender a node keeps only its node-local workers
//! and republishes them to the new leader, whose mapping wins conflicts.
//! Dead queue workers are restarted from the persisted configuration; a
//! dead node's queues are restarted by the leader the same way.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{timeout, Duration};
use tracing::{debug, info, warn};

use crate::cluster::{ClusterEvent, ClusterNode, NodeId};
use crate::config::QueueConfig;
use crate::database::{QueueDef, Store};
use crate::error::{EngineError, Result};

use super::worker::{QueueHandle, QueueWorker, QueuedCall};
use super::Recipe;

/// Messages exchanged between queue managers across the cluster.
pub enum PeerMsg {
    GetQueue {
        name: String,
        reply: oneshot::Sender<Option<QueueHandle>>,
    },
    QueryQueue {
        name: String,
        reply: oneshot::Sender<bool>,
    },
    ListQueues {
        reply: oneshot::Sender<Vec<(String, QueueHandle, i64)>>,
    },
    /// A follower started a queue and tells the leader.
    Announce {
        name: String,
        handle: QueueHandle,
        weight: i64,
        recipe: Recipe,
        reply: oneshot::Sender<AnnounceOutcome>,
    },
    /// A node that just surrendered pushes its local entries. The reply
    /// lists the names the leader rejected (its mapping wins).
    Republish {
        entries: Vec<RepublishEntry>,
        reply: oneshot::Sender<Vec<String>>,
    },
    RemoveEntry {
        name: String,
        node: NodeId,
    },
}

pub struct RepublishEntry {
    pub name: String,
    pub handle: QueueHandle,
    pub weight: i64,
    pub recipe: Recipe,
}

#[derive(Debug)]
pub enum AnnounceOutcome {
    Accepted,
    /// The leader already maps this name elsewhere; the announcer must
    /// stop its worker and adopt the winner.
    Duplicate(QueueHandle),
}

/// Result of `add_queue`.
#[derive(Debug, Clone)]
pub enum AddQueueResult {
    Ok(QueueHandle),
    Exists(QueueHandle),
}

impl AddQueueResult {
    pub fn handle(&self) -> &QueueHandle {
        match self {
            AddQueueResult::Ok(handle) | AddQueueResult::Exists(handle) => handle,
        }
    }

    pub fn already_existed(&self) -> bool {
        matches!(self, AddQueueResult::Exists(_))
    }
}

/// One ranked bindable queue.
#[derive(Debug, Clone)]
pub struct BindableQueue {
    pub name: String,
    pub handle: QueueHandle,
    /// Priority of the bindable call.
    pub priority: i64,
    /// Enqueue time of the bindable call.
    pub enqueued_at: DateTime<Utc>,
    pub call: QueuedCall,
    /// Effective weight after the ranking collapse.
    pub weight: i64,
}

enum ManagerCommand {
    AddQueue {
        name: String,
        recipe: Option<Recipe>,
        weight: Option<i64>,
        reply: oneshot::Sender<Result<AddQueueResult>>,
    },
    GetQueue {
        name: String,
        reply: oneshot::Sender<Result<Option<QueueHandle>>>,
    },
    QueryQueue {
        name: String,
        reply: oneshot::Sender<Result<bool>>,
    },
    Queues {
        reply: oneshot::Sender<Result<Vec<(String, QueueHandle)>>>,
    },
    BestBindable {
        reply: oneshot::Sender<Result<Vec<BindableQueue>>>,
    },
}

/// Cloneable handle to a queue manager task.
#[derive(Clone)]
pub struct QueueManagerHandle {
    tx: mpsc::Sender<ManagerCommand>,
}

impl QueueManagerHandle {
    async fn call<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<Result<T>>) -> ManagerCommand,
    ) -> Result<T> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(build(reply_tx))
            .await
            .map_err(|_| EngineError::Queue("queue manager unavailable".into()))?;
        reply_rx
            .await
            .map_err(|_| EngineError::Queue("queue manager unavailable".into()))?
    }

    pub async fn add_queue(
        &self,
        name: &str,
        recipe: Option<Recipe>,
        weight: Option<i64>,
    ) -> Result<AddQueueResult> {
        let name = name.to_string();
        self.call(|reply| ManagerCommand::AddQueue { name, recipe, weight, reply })
            .await
    }

    pub async fn get_queue(&self, name: &str) -> Result<Option<QueueHandle>> {
        let name = name.to_string();
        self.call(|reply| ManagerCommand::GetQueue { name, reply }).await
    }

    pub async fn query_queue(&self, name: &str) -> Result<bool> {
        let name = name.to_string();
        self.call(|reply| ManagerCommand::QueryQueue { name, reply }).await
    }

    pub async fn queues(&self) -> Result<Vec<(String, QueueHandle)>> {
        self.call(|reply| ManagerCommand::Queues { reply }).await
    }

    pub async fn get_best_bindable_queues(&self) -> Result<Vec<BindableQueue>> {
        self.call(|reply| ManagerCommand::BestBindable { reply }).await
    }
}

struct QueueEntry {
    handle: QueueHandle,
    weight: i64,
    recipe: Recipe,
}

/// The queue manager task.
pub struct QueueManager {
    node_id: NodeId,
    cluster: ClusterNode<PeerMsg>,
    store: Store,
    config: QueueConfig,
    entries: HashMap<String, QueueEntry>,
    cmd_rx: mpsc::Receiver<ManagerCommand>,
    death_tx: mpsc::UnboundedSender<String>,
    death_rx: mpsc::UnboundedReceiver<String>,
}

impl QueueManager {
    /// Start the manager for one cluster node.
    pub fn spawn(cluster: ClusterNode<PeerMsg>, store: Store, config: QueueConfig) -> QueueManagerHandle {
        let (cmd_tx, cmd_rx) = mpsc::channel(64);
        let (death_tx, death_rx) = mpsc::unbounded_channel();

        let manager = QueueManager {
            node_id: cluster.id.clone(),
            cluster,
            store,
            config,
            entries: HashMap::new(),
            cmd_rx,
            death_tx,
            death_rx,
        };

        info!("queue manager started on {}", manager.node_id);
        tokio::spawn(manager.run());

        QueueManagerHandle { tx: cmd_tx }
    }

    async fn run(mut self) {
        loop {
            tokio::select! {
                maybe_cmd = self.cmd_rx.recv() => {
                    match maybe_cmd {
                        Some(cmd) => self.handle_command(cmd).await,
                        None => break,
                    }
                }

                maybe_event = self.cluster.events.recv() => {
                    match maybe_event {
                        Some(event) => self.handle_cluster_event(event).await,
                        None => break,
                    }
                }

                maybe_peer = self.cluster.peers.recv() => {
                    if let Some(msg) = maybe_peer {
                        self.handle_peer(msg);
                    }
                }

                maybe_death = self.death_rx.recv() => {
                    if let Some(name) = maybe_death {
                        self.handle_worker_death(&name).await;
                    }
                }
            }
        }
        debug!("queue manager on {} stopped", self.node_id);
    }

    fn is_leader(&self) -> bool {
        self.cluster.is_leader()
    }

    fn leader(&self) -> Result<NodeId> {
        self.cluster
            .leader()
            .ok_or_else(|| EngineError::Cluster("no leader elected".into()))
    }

    async fn handle_command(&mut self, cmd: ManagerCommand) {
        match cmd {
            ManagerCommand::AddQueue { name, recipe, weight, reply } => {
                let result = self.add_queue(&name, recipe, weight).await;
                let _ = reply.send(result);
            }
            ManagerCommand::GetQueue { name, reply } => {
                let result = self.get_queue(&name).await;
                let _ = reply.send(result);
            }
            ManagerCommand::QueryQueue { name, reply } => {
                let result = self.query_queue(&name).await;
                let _ = reply.send(result);
            }
            ManagerCommand::Queues { reply } => {
                let result = self
                    .list_queues()
                    .await
                    .map(|list| list.into_iter().map(|(name, handle, _)| (name, handle)).collect());
                let _ = reply.send(result);
            }
            ManagerCommand::BestBindable { reply } => {
                let result = match self.list_queues().await {
                    Ok(list) => Ok(rank_bindable_queues(list).await),
                    Err(e) => Err(e),
                };
                let _ = reply.send(result);
            }
        }
    }

    /// Local check, leader check, then start-and-register.
    async fn add_queue(
        &mut self,
        name: &str,
        recipe: Option<Recipe>,
        weight: Option<i64>,
    ) -> Result<AddQueueResult> {
        if let Some(entry) = self.entries.get(name) {
            return Ok(AddQueueResult::Exists(entry.handle.clone()));
        }

        if !self.is_leader() {
            match self.rpc_get_queue(name).await {
                Ok(Some(handle)) => return Ok(AddQueueResult::Exists(handle)),
                Ok(None) => {}
                Err(e) => warn!("leader lookup for queue {} failed: {}", name, e),
            }
        }

        let recipe = recipe.unwrap_or_default();
        let weight = weight.unwrap_or(self.config.default_weight).max(1);
        let handle = self.start_worker(name, recipe.clone(), weight).await;
        self.entries.insert(
            name.to_string(),
            QueueEntry {
                handle: handle.clone(),
                weight,
                recipe: recipe.clone(),
            },
        );

        if !self.is_leader() {
            if let Ok(AnnounceOutcome::Duplicate(winner)) =
                self.rpc_announce(name, handle.clone(), weight, recipe).await
            {
                info!("queue {} already registered with the leader, dropping local worker", name);
                handle.stop();
                self.entries.remove(name);
                return Ok(AddQueueResult::Exists(winner));
            }
        }

        Ok(AddQueueResult::Ok(handle))
    }

    /// Local hit, else leader-authoritative lookup.
    async fn get_queue(&mut self, name: &str) -> Result<Option<QueueHandle>> {
        if let Some(entry) = self.entries.get(name) {
            return Ok(Some(entry.handle.clone()));
        }
        if self.is_leader() {
            return Ok(None);
        }
        self.rpc_get_queue(name).await
    }

    /// Local-first existence check.
    async fn query_queue(&mut self, name: &str) -> Result<bool> {
        if self.entries.contains_key(name) {
            return Ok(true);
        }
        if self.is_leader() {
            return Ok(false);
        }
        let leader = self.leader()?;
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cluster
            .send(&leader, PeerMsg::QueryQueue { name: name.to_string(), reply: reply_tx })
            .map_err(|e| EngineError::Cluster(e.to_string()))?;
        self.await_rpc(reply_rx).await
    }

    /// Leader-authoritative list with weights.
    async fn list_queues(&mut self) -> Result<Vec<(String, QueueHandle, i64)>> {
        if self.is_leader() {
            return Ok(self
                .entries
                .iter()
                .map(|(name, entry)| (name.clone(), entry.handle.clone(), entry.weight))
                .collect());
        }
        let leader = self.leader()?;
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cluster
            .send(&leader, PeerMsg::ListQueues { reply: reply_tx })
            .map_err(|e| EngineError::Cluster(e.to_string()))?;
        self.await_rpc(reply_rx).await
    }

    async fn start_worker(&mut self, name: &str, recipe: Recipe, weight: i64) -> QueueHandle {
        let handle = QueueWorker::spawn(name, self.node_id.clone(), recipe.clone());

        // Persist so a restart (worker death, node death) can rebuild.
        let def = QueueDef {
            name: name.to_string(),
            weight,
            recipe,
            group: "default".to_string(),
        };
        if let Err(e) = self.store.upsert_queue_def(&def).await {
            warn!("failed to persist queue {}: {}", name, e);
        }

        // Death monitor.
        let death_tx = self.death_tx.clone();
        let monitored = handle.clone();
        let queue_name = name.to_string();
        tokio::spawn(async move {
            monitored.closed().await;
            let _ = death_tx.send(queue_name);
        });

        handle
    }

    /// Restart a dead local worker from persisted config, or drop it when
    /// the configuration is gone.
    async fn handle_worker_death(&mut self, name: &str) {
        let Some(entry) = self.entries.get(name) else {
            return;
        };
        if entry.handle.node != self.node_id || !entry.handle.is_closed() {
            return;
        }

        match self.store.get_queue_def(name).await {
            Ok(Some(def)) => {
                warn!("queue worker {} died, restarting from config", name);
                let handle = self.start_worker(name, def.recipe.clone(), def.weight).await;
                self.entries.insert(
                    name.to_string(),
                    QueueEntry {
                        handle: handle.clone(),
                        weight: def.weight,
                        recipe: def.recipe.clone(),
                    },
                );
                if !self.is_leader() {
                    let _ = self.rpc_announce(name, handle, def.weight, def.recipe).await;
                }
            }
            Ok(None) => {
                warn!("queue worker {} died and its config is gone, dropping", name);
                self.entries.remove(name);
                if !self.is_leader() {
                    if let Ok(leader) = self.leader() {
                        let _ = self.cluster.send(
                            &leader,
                            PeerMsg::RemoveEntry {
                                name: name.to_string(),
                                node: self.node_id.clone(),
                            },
                        );
                    }
                }
            }
            Err(e) => warn!("config lookup for dead queue {} failed: {}", name, e),
        }
    }

    async fn handle_cluster_event(&mut self, event: ClusterEvent) {
        match event {
            ClusterEvent::Elected => {
                info!("queue manager on {} elected leader", self.node_id);
            }
            ClusterEvent::Surrendered { leader } => {
                info!("queue manager on {} now follows {}", self.node_id, leader);
                self.entries.retain(|_, entry| entry.handle.node == self.node_id);
                self.republish_to(&leader).await;
            }
            ClusterEvent::NodeUp(node) => {
                debug!("queue manager on {} sees {} up", self.node_id, node);
            }
            ClusterEvent::NodeDown(node) => {
                self.store.assert_master();
                let dead: Vec<String> = self
                    .entries
                    .iter()
                    .filter(|(_, entry)| entry.handle.node == node)
                    .map(|(name, _)| name.clone())
                    .collect();
                for name in &dead {
                    self.entries.remove(name);
                }

                // The leader restarts everything the persisted config says
                // should exist but no live worker backs any more. This
                // covers entries that pointed at the dead node as well as
                // queues this node never saw (the dead node was leader).
                if self.is_leader() {
                    let defs = match self.store.list_queue_defs().await {
                        Ok(defs) => defs,
                        Err(e) => {
                            warn!("config scan after {} went down failed: {}", node, e);
                            return;
                        }
                    };
                    for def in defs {
                        if self.entries.contains_key(&def.name) {
                            continue;
                        }
                        info!("restarting queue {} lost with {}", def.name, node);
                        let handle =
                            self.start_worker(&def.name, def.recipe.clone(), def.weight).await;
                        self.entries.insert(
                            def.name.clone(),
                            QueueEntry {
                                handle,
                                weight: def.weight,
                                recipe: def.recipe,
                            },
                        );
                    }
                }
            }
            ClusterEvent::InconsistentDatabase => {
                self.store.assert_master();
            }
        }
    }

    fn handle_peer(&mut self, msg: PeerMsg) {
        match msg {
            PeerMsg::GetQueue { name, reply } => {
                let _ = reply.send(self.entries.get(&name).map(|e| e.handle.clone()));
            }
            PeerMsg::QueryQueue { name, reply } => {
                let _ = reply.send(self.entries.contains_key(&name));
            }
            PeerMsg::ListQueues { reply } => {
                let list = self
                    .entries
                    .iter()
                    .map(|(name, entry)| (name.clone(), entry.handle.clone(), entry.weight))
                    .collect();
                let _ = reply.send(list);
            }
            PeerMsg::Announce { name, handle, weight, recipe, reply } => {
                match self.entries.get(&name) {
                    Some(existing) if existing.handle.node != handle.node => {
                        let _ = reply.send(AnnounceOutcome::Duplicate(existing.handle.clone()));
                    }
                    _ => {
                        self.entries.insert(name, QueueEntry { handle, weight, recipe });
                        let _ = reply.send(AnnounceOutcome::Accepted);
                    }
                }
            }
            PeerMsg::Republish { entries, reply } => {
                let mut rejected = Vec::new();
                for entry in entries {
                    match self.entries.get(&entry.name) {
                        Some(existing) if existing.handle.node != entry.handle.node => {
                            rejected.push(entry.name);
                        }
                        _ => {
                            self.entries.insert(
                                entry.name,
                                QueueEntry {
                                    handle: entry.handle,
                                    weight: entry.weight,
                                    recipe: entry.recipe,
                                },
                            );
                        }
                    }
                }
                let _ = reply.send(rejected);
            }
            PeerMsg::RemoveEntry { name, node } => {
                let owned_by_node = self
                    .entries
                    .get(&name)
                    .map(|entry| entry.handle.node == node)
                    .unwrap_or(false);
                if owned_by_node {
                    self.entries.remove(&name);
                }
            }
        }
    }

    async fn republish_to(&mut self, leader: &NodeId) {
        if leader == &self.node_id || self.entries.is_empty() {
            return;
        }
        let entries: Vec<RepublishEntry> = self
            .entries
            .iter()
            .map(|(name, entry)| RepublishEntry {
                name: name.clone(),
                handle: entry.handle.clone(),
                weight: entry.weight,
                recipe: entry.recipe.clone(),
            })
            .collect();

        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .cluster
            .send(leader, PeerMsg::Republish { entries, reply: reply_tx })
            .is_err()
        {
            warn!("republish to {} failed: unreachable", leader);
            return;
        }

        match self.await_rpc(reply_rx).await {
            Ok(rejected) => {
                for name in rejected {
                    if let Some(entry) = self.entries.remove(&name) {
                        info!("queue {} lost the heal, stopping local worker", name);
                        entry.handle.stop();
                    }
                }
            }
            Err(e) => warn!("republish to {} failed: {}", leader, e),
        }
    }

    async fn rpc_get_queue(&mut self, name: &str) -> Result<Option<QueueHandle>> {
        let leader = self.leader()?;
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cluster
            .send(&leader, PeerMsg::GetQueue { name: name.to_string(), reply: reply_tx })
            .map_err(|e| EngineError::Cluster(e.to_string()))?;
        self.await_rpc(reply_rx).await
    }

    async fn rpc_announce(
        &mut self,
        name: &str,
        handle: QueueHandle,
        weight: i64,
        recipe: Recipe,
    ) -> Result<AnnounceOutcome> {
        let leader = self.leader()?;
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cluster
            .send(
                &leader,
                PeerMsg::Announce {
                    name: name.to_string(),
                    handle,
                    weight,
                    recipe,
                    reply: reply_tx,
                },
            )
            .map_err(|e| EngineError::Cluster(e.to_string()))?;
        self.await_rpc(reply_rx).await
    }

    async fn await_rpc<T>(&self, rx: oneshot::Receiver<T>) -> Result<T> {
        timeout(Duration::from_millis(self.config.rpc_timeout_ms), rx)
            .await
            .map_err(|_| EngineError::Timeout)?
            .map_err(|_| EngineError::Timeout)
    }
}

/// Rank the bindable queues.
///
/// The multi-key ordering — enqueue time ascending, then priority
/// ascending, then `weight × call_count` descending, every pass stable —
/// is collapsed into a single monotonic score: the item at 1-based
/// position `c` of `L` gets `w + L − c`.
pub async fn rank_bindable_queues(queues: Vec<(String, QueueHandle, i64)>) -> Vec<BindableQueue> {
    let mut items = Vec::new();

    for (name, handle, weight) in queues {
        let Ok(Some(call)) = handle.ask().await else {
            continue;
        };
        let count = handle.count().await.unwrap_or(0) as i64;
        items.push(BindableQueue {
            name,
            priority: call.priority,
            enqueued_at: call.enqueued_at,
            weight: weight * count,
            call,
            handle,
        });
    }

    items.sort_by_key(|q| q.enqueued_at);
    items.sort_by_key(|q| q.priority);
    items.sort_by_key(|q| std::cmp::Reverse(q.weight));

    let len = items.len() as i64;
    for (idx, item) in items.iter_mut().enumerate() {
        item.weight += len - (idx as i64 + 1);
    }

    items
}
