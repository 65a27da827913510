//! Queue worker
//!
//! One task per queue. Holds the ordered set of waiting calls, answers
//! bindable-call queries for the ranking pass, and applies its recipe
//! steps as their timers come due.

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep_until, Duration, Instant};
use tracing::{debug, info};

use cpx_agent_core::media::MediaHandle;
use cpx_agent_core::types::CallId;

use crate::cluster::NodeId;
use crate::error::{EngineError, Result};

use super::{Recipe, RecipeAction};

/// A call waiting in a queue.
#[derive(Debug, Clone)]
pub struct QueuedCall {
    /// Numerically lower sorts first.
    pub priority: i64,
    pub enqueued_at: DateTime<Utc>,
    pub call_id: CallId,
    /// Media handle used to steer the call once an agent binds it.
    pub handle: Option<MediaHandle>,
}

enum QueueCommand {
    Enqueue(QueuedCall),
    /// Current bindable call, if any. Does not remove it.
    Ask {
        reply: oneshot::Sender<Option<QueuedCall>>,
    },
    Count {
        reply: oneshot::Sender<usize>,
    },
    /// Remove a call (answered elsewhere or abandoned).
    Remove {
        call_id: CallId,
        reply: oneshot::Sender<bool>,
    },
    Stop,
}

/// Handle to a queue worker. Carries the node the worker lives on so the
/// manager can react to node death.
#[derive(Clone)]
pub struct QueueHandle {
    pub name: String,
    pub node: NodeId,
    tx: mpsc::UnboundedSender<QueueCommand>,
}

impl std::fmt::Debug for QueueHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueHandle")
            .field("name", &self.name)
            .field("node", &self.node)
            .finish()
    }
}

impl QueueHandle {
    pub fn enqueue(&self, call: QueuedCall) {
        let _ = self.tx.send(QueueCommand::Enqueue(call));
    }

    /// The call currently eligible to be offered to an agent.
    pub async fn ask(&self) -> Result<Option<QueuedCall>> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(QueueCommand::Ask { reply: reply_tx })
            .map_err(|_| EngineError::Queue(format!("queue {} is gone", self.name)))?;
        reply_rx
            .await
            .map_err(|_| EngineError::Queue(format!("queue {} is gone", self.name)))
    }

    pub async fn count(&self) -> Result<usize> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(QueueCommand::Count { reply: reply_tx })
            .map_err(|_| EngineError::Queue(format!("queue {} is gone", self.name)))?;
        reply_rx
            .await
            .map_err(|_| EngineError::Queue(format!("queue {} is gone", self.name)))
    }

    pub async fn remove(&self, call_id: CallId) -> Result<bool> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(QueueCommand::Remove { call_id, reply: reply_tx })
            .map_err(|_| EngineError::Queue(format!("queue {} is gone", self.name)))?;
        reply_rx
            .await
            .map_err(|_| EngineError::Queue(format!("queue {} is gone", self.name)))
    }

    pub fn stop(&self) {
        let _ = self.tx.send(QueueCommand::Stop);
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Resolve when the worker task has gone away.
    pub async fn closed(&self) {
        self.tx.closed().await
    }
}

/// Queue worker task state.
pub struct QueueWorker {
    name: String,
    recipe: Recipe,
    calls: Vec<QueuedCall>,
    started_at: Instant,
    next_step: usize,
    rx: mpsc::UnboundedReceiver<QueueCommand>,
}

impl QueueWorker {
    /// Start a worker and return its handle.
    pub fn spawn(name: &str, node: NodeId, recipe: Recipe) -> QueueHandle {
        let (tx, rx) = mpsc::unbounded_channel();

        let mut recipe = recipe;
        recipe.steps.sort_by_key(|step| step.after_secs);

        let worker = QueueWorker {
            name: name.to_string(),
            recipe,
            calls: Vec::new(),
            started_at: Instant::now(),
            next_step: 0,
            rx,
        };
        tokio::spawn(worker.run());

        info!("queue worker {} started on {}", name, node);
        QueueHandle {
            name: name.to_string(),
            node,
            tx,
        }
    }

    async fn run(mut self) {
        loop {
            let step_due = self
                .recipe
                .steps
                .get(self.next_step)
                .map(|step| self.started_at + Duration::from_secs(step.after_secs));

            tokio::select! {
                maybe_cmd = self.rx.recv() => {
                    match maybe_cmd {
                        Some(QueueCommand::Enqueue(call)) => {
                            debug!("queue {}: enqueued {} (priority {})", self.name, call.call_id, call.priority);
                            self.calls.push(call);
                        }
                        Some(QueueCommand::Ask { reply }) => {
                            let _ = reply.send(self.bindable());
                        }
                        Some(QueueCommand::Count { reply }) => {
                            let _ = reply.send(self.calls.len());
                        }
                        Some(QueueCommand::Remove { call_id, reply }) => {
                            let before = self.calls.len();
                            self.calls.retain(|c| c.call_id != call_id);
                            let _ = reply.send(self.calls.len() != before);
                        }
                        Some(QueueCommand::Stop) | None => {
                            debug!("queue worker {} stopping", self.name);
                            return;
                        }
                    }
                }

                _ = async { sleep_until(step_due.unwrap()).await }, if step_due.is_some() => {
                    self.apply_step();
                }
            }
        }
    }

    /// The oldest, highest-priority waiting call.
    fn bindable(&self) -> Option<QueuedCall> {
        self.calls
            .iter()
            .min_by_key(|c| (c.priority, c.enqueued_at))
            .cloned()
    }

    fn apply_step(&mut self) {
        let Some(step) = self.recipe.steps.get(self.next_step).cloned() else {
            return;
        };
        self.next_step += 1;

        match step.action {
            RecipeAction::Prioritize { delta } => {
                info!("queue {}: recipe shifts priorities by {}", self.name, delta);
                for call in &mut self.calls {
                    call.priority += delta;
                }
            }
            RecipeAction::Announce { message } => {
                info!("queue {}: announcement: {}", self.name, message);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::RecipeStep;

    fn call(priority: i64, secs: i64) -> QueuedCall {
        QueuedCall {
            priority,
            enqueued_at: DateTime::from_timestamp(secs, 0).unwrap(),
            call_id: CallId::new(),
            handle: None,
        }
    }

    #[tokio::test]
    async fn ask_returns_oldest_highest_priority() {
        let handle = QueueWorker::spawn("test", NodeId("n1".into()), Recipe::default());
        assert!(handle.ask().await.unwrap().is_none());

        let late_but_urgent = call(0, 200);
        let early = call(10, 100);
        handle.enqueue(early.clone());
        handle.enqueue(late_but_urgent.clone());

        let bindable = handle.ask().await.unwrap().unwrap();
        assert_eq!(bindable.call_id, late_but_urgent.call_id);
        assert_eq!(handle.count().await.unwrap(), 2);

        assert!(handle.remove(late_but_urgent.call_id).await.unwrap());
        let bindable = handle.ask().await.unwrap().unwrap();
        assert_eq!(bindable.call_id, early.call_id);
    }

    #[tokio::test(start_paused = true)]
    async fn recipe_prioritize_escalates_waiting_calls() {
        let recipe = Recipe {
            steps: vec![RecipeStep {
                after_secs: 30,
                action: RecipeAction::Prioritize { delta: -5 },
            }],
        };
        let handle = QueueWorker::spawn("escalating", NodeId("n1".into()), recipe);
        handle.enqueue(call(10, 100));

        // The ask round-trip guarantees the enqueue is processed before
        // the clock moves past the recipe step.
        assert_eq!(handle.ask().await.unwrap().unwrap().priority, 10);

        tokio::time::sleep(Duration::from_secs(31)).await;
        let bindable = handle.ask().await.unwrap().unwrap();
        assert_eq!(bindable.priority, 5);
    }

    #[tokio::test]
    async fn stop_makes_handle_fail() {
        let handle = QueueWorker::spawn("stopping", NodeId("n1".into()), Recipe::default());
        handle.stop();
        handle.closed().await;
        assert!(handle.ask().await.is_err());
    }
}
