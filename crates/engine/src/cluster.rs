//! In-process cluster fabric with deterministic leader election
//!
//! The queue manager needs three things from its cluster layer: a
//! membership view, "at most one leader per connected component", and a
//! way to send peer messages to reachable nodes. This module provides all
//! three for nodes hosted in one process — which covers single-node
//! deployments and lets tests drive node death and network partitions
//! deterministically.
//!
//! Election is bully-style: the lowest node id visible in a component
//! leads it. Every membership change (join, kill, partition, heal)
//! recomputes leadership and delivers `Elected` / `Surrendered` events to
//! the nodes whose role changed.

use std::collections::HashMap;

use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Cluster node identifier. Ordering decides elections.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Ord, PartialOrd, serde::Serialize, serde::Deserialize)]
pub struct NodeId(pub String);

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Membership events delivered to each node.
#[derive(Debug)]
pub enum ClusterEvent {
    /// This node now leads its component.
    Elected,
    /// This node stopped leading; the new leader is attached.
    Surrendered { leader: NodeId },
    NodeUp(NodeId),
    NodeDown(NodeId),
    /// The replicated store reported divergent copies (emitted on heal).
    InconsistentDatabase,
}

#[derive(Debug, thiserror::Error)]
#[error("node {0} is unreachable")]
pub struct Unreachable(pub NodeId);

struct NodeLinks<M> {
    event_tx: mpsc::UnboundedSender<ClusterEvent>,
    peer_tx: mpsc::UnboundedSender<M>,
    alive: bool,
    /// Leader as last told to this node; used to diff on recompute.
    leader: Option<NodeId>,
    /// Partition group; nodes only see peers in the same group.
    group: usize,
}

struct Shared<M> {
    nodes: HashMap<NodeId, NodeLinks<M>>,
    partitioned: bool,
}

/// The fabric. Cheap to clone; all handles share the same state.
pub struct Cluster<M> {
    shared: Arc<Mutex<Shared<M>>>,
}

impl<M> Clone for Cluster<M> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

/// One node's view of the fabric.
pub struct ClusterNode<M> {
    pub id: NodeId,
    pub events: mpsc::UnboundedReceiver<ClusterEvent>,
    pub peers: mpsc::UnboundedReceiver<M>,
    cluster: Cluster<M>,
}

impl<M: Send + 'static> Cluster<M> {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Mutex::new(Shared {
                nodes: HashMap::new(),
                partitioned: false,
            })),
        }
    }

    /// Add a node to the fabric and run an election.
    pub fn join(&self, id: NodeId) -> ClusterNode<M> {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (peer_tx, peer_rx) = mpsc::unbounded_channel();

        {
            let mut shared = self.shared.lock();
            for (peer, links) in shared.nodes.iter() {
                if links.alive {
                    let _ = links.event_tx.send(ClusterEvent::NodeUp(id.clone()));
                    debug!("{} sees {} up", peer, id);
                }
            }
            shared.nodes.insert(
                id.clone(),
                NodeLinks {
                    event_tx,
                    peer_tx,
                    alive: true,
                    leader: None,
                    group: 0,
                },
            );
            Self::recompute(&mut shared);
        }

        info!("node {} joined the cluster", id);
        ClusterNode {
            id,
            events: event_rx,
            peers: peer_rx,
            cluster: self.clone(),
        }
    }

    /// Kill a node: survivors that could see it get `NodeDown`, then a new
    /// election runs.
    pub fn kill(&self, id: &NodeId) {
        let mut shared = self.shared.lock();
        let Some(group) = shared.nodes.get(id).filter(|n| n.alive).map(|n| n.group) else {
            return;
        };
        if let Some(links) = shared.nodes.get_mut(id) {
            links.alive = false;
        }
        for (peer, links) in shared.nodes.iter() {
            if peer != id && links.alive && links.group == group {
                let _ = links.event_tx.send(ClusterEvent::NodeDown(id.clone()));
            }
        }
        Self::recompute(&mut shared);
        info!("node {} killed", id);
    }

    /// Split the fabric into groups. Nodes outside a listed group land in
    /// their own singleton component. Peers that become invisible are
    /// reported down.
    pub fn partition(&self, groups: &[&[NodeId]]) {
        let mut shared = self.shared.lock();

        let mut assignment: HashMap<NodeId, usize> = HashMap::new();
        for (idx, group) in groups.iter().enumerate() {
            for id in group.iter() {
                assignment.insert(id.clone(), idx + 1);
            }
        }
        let mut next_singleton = groups.len() + 1;
        let ids: Vec<NodeId> = shared.nodes.keys().cloned().collect();
        for id in &ids {
            if !assignment.contains_key(id) {
                assignment.insert(id.clone(), next_singleton);
                next_singleton += 1;
            }
        }

        // Tell every live node about peers it just lost sight of.
        for id in &ids {
            let Some(me) = shared.nodes.get(id) else { continue };
            if !me.alive {
                continue;
            }
            let my_old = me.group;
            let my_new = assignment[id];
            let lost: Vec<NodeId> = shared
                .nodes
                .iter()
                .filter(|(peer, links)| {
                    *peer != id && links.alive && links.group == my_old && assignment[*peer] != my_new
                })
                .map(|(peer, _)| peer.clone())
                .collect();
            if let Some(me) = shared.nodes.get(id) {
                for peer in lost {
                    let _ = me.event_tx.send(ClusterEvent::NodeDown(peer));
                }
            }
        }

        for (id, group) in assignment {
            if let Some(links) = shared.nodes.get_mut(&id) {
                links.group = group;
            }
        }
        shared.partitioned = true;
        Self::recompute(&mut shared);
        info!("cluster partitioned into {} groups", groups.len());
    }

    /// Merge all groups back together. Reconnected peers are reported up
    /// and every node hears the inconsistent-database alarm from the
    /// replicated store.
    pub fn heal(&self) {
        let mut shared = self.shared.lock();
        if !shared.partitioned {
            return;
        }

        let ids: Vec<NodeId> = shared.nodes.keys().cloned().collect();
        for id in &ids {
            let Some(me) = shared.nodes.get(id) else { continue };
            if !me.alive {
                continue;
            }
            let my_group = me.group;
            let regained: Vec<NodeId> = shared
                .nodes
                .iter()
                .filter(|(peer, links)| *peer != id && links.alive && links.group != my_group)
                .map(|(peer, _)| peer.clone())
                .collect();
            if let Some(me) = shared.nodes.get(id) {
                for peer in regained {
                    let _ = me.event_tx.send(ClusterEvent::NodeUp(peer));
                }
                let _ = me.event_tx.send(ClusterEvent::InconsistentDatabase);
            }
        }

        for links in shared.nodes.values_mut() {
            links.group = 0;
        }
        shared.partitioned = false;
        Self::recompute(&mut shared);
        info!("cluster healed");
    }

    /// Current leader of the component `id` sits in.
    pub fn leader_of(&self, id: &NodeId) -> Option<NodeId> {
        let shared = self.shared.lock();
        let node = shared.nodes.get(id)?;
        if !node.alive {
            return None;
        }
        node.leader.clone()
    }

    fn send_to(&self, from: &NodeId, to: &NodeId, msg: M) -> Result<(), Unreachable> {
        let shared = self.shared.lock();
        let sender = shared
            .nodes
            .get(from)
            .filter(|n| n.alive)
            .ok_or_else(|| Unreachable(from.clone()))?;
        let target = shared
            .nodes
            .get(to)
            .filter(|n| n.alive && n.group == sender.group)
            .ok_or_else(|| Unreachable(to.clone()))?;
        target.peer_tx.send(msg).map_err(|_| Unreachable(to.clone()))
    }

    /// Re-run the election in every component and notify role changes.
    fn recompute(shared: &mut Shared<M>) {
        let mut leaders: HashMap<usize, NodeId> = HashMap::new();
        for (id, links) in shared.nodes.iter() {
            if !links.alive {
                continue;
            }
            leaders
                .entry(links.group)
                .and_modify(|leader| {
                    if *id < *leader {
                        *leader = id.clone();
                    }
                })
                .or_insert_with(|| id.clone());
        }

        for (id, links) in shared.nodes.iter_mut() {
            if !links.alive {
                continue;
            }
            let new_leader = leaders.get(&links.group).cloned();
            if links.leader == new_leader {
                continue;
            }
            let old = links.leader.clone();
            links.leader = new_leader.clone();

            let was_leader = old.as_ref() == Some(id);
            let is_now_leader = new_leader.as_ref() == Some(id);

            if is_now_leader && !was_leader {
                let _ = links.event_tx.send(ClusterEvent::Elected);
            } else if !is_now_leader {
                // Delivered both to ex-leaders and to followers whose
                // leader changed: either way the node must republish its
                // local entries to whoever leads now.
                if let Some(leader) = new_leader {
                    let _ = links
                        .event_tx
                        .send(ClusterEvent::Surrendered { leader });
                }
            }
        }
    }
}

impl<M: Send + 'static> ClusterNode<M> {
    /// Current leader of this node's component.
    pub fn leader(&self) -> Option<NodeId> {
        self.cluster.leader_of(&self.id)
    }

    pub fn is_leader(&self) -> bool {
        self.leader().as_ref() == Some(&self.id)
    }

    /// Send a peer message; fails when the target is dead or across a
    /// partition.
    pub fn send(&self, to: &NodeId, msg: M) -> Result<(), Unreachable> {
        self.cluster.send_to(&self.id, to, msg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain_events(node: &mut ClusterNode<()>) -> Vec<String> {
        let mut out = Vec::new();
        while let Ok(event) = node.events.try_recv() {
            out.push(format!("{event:?}"));
        }
        out
    }

    #[tokio::test]
    async fn lowest_id_leads() {
        let cluster: Cluster<()> = Cluster::new();
        let mut a = cluster.join(NodeId("a".into()));
        let b = cluster.join(NodeId("b".into()));

        assert!(a.is_leader());
        assert!(!b.is_leader());
        assert_eq!(b.leader(), Some(NodeId("a".into())));

        let events = drain_events(&mut a);
        assert!(events.iter().any(|e| e.contains("Elected")));
    }

    #[tokio::test]
    async fn kill_promotes_survivor() {
        let cluster: Cluster<()> = Cluster::new();
        let a = cluster.join(NodeId("a".into()));
        let mut b = cluster.join(NodeId("b".into()));

        cluster.kill(&a.id);
        assert!(b.is_leader());
        let events = drain_events(&mut b);
        assert!(events.iter().any(|e| e.contains("NodeDown")));
        assert!(events.iter().any(|e| e.contains("Elected")));
    }

    #[tokio::test]
    async fn partition_elects_per_component_and_heal_demotes() {
        let cluster: Cluster<()> = Cluster::new();
        let a = cluster.join(NodeId("a".into()));
        let mut b = cluster.join(NodeId("b".into()));

        cluster.partition(&[&[a.id.clone()], &[b.id.clone()]]);
        assert!(a.is_leader());
        assert!(b.is_leader());
        assert!(a.send(&b.id, ()).is_err());

        cluster.heal();
        assert!(a.is_leader());
        assert!(!b.is_leader());
        let events = drain_events(&mut b);
        assert!(events.iter().any(|e| e.contains("Surrendered")));
        assert!(events.iter().any(|e| e.contains("InconsistentDatabase")));
        assert!(a.send(&b.id, ()).is_ok());
    }
}
