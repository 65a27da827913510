//! Call queues and the replicated queue manager
//!
//! - [`worker`]: one task per queue holding the ordered set of waiting
//!   calls and applying its recipe over time.
//! - [`manager`]: the leader-elected, cluster-replicated directory of
//!   queue name → worker handle, plus bindable-queue ranking.

pub mod manager;
pub mod worker;

use serde::{Deserialize, Serialize};

pub use manager::{
    rank_bindable_queues, AddQueueResult, BindableQueue, QueueManager, QueueManagerHandle,
};
pub use worker::{QueueHandle, QueueWorker, QueuedCall};

/// Declarative rules a queue applies to itself over time.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Recipe {
    #[serde(default)]
    pub steps: Vec<RecipeStep>,
}

/// One timed rule.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RecipeStep {
    /// Seconds after queue start before the step fires.
    pub after_secs: u64,
    pub action: RecipeAction,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum RecipeAction {
    /// Shift the priority of every waiting call. Negative deltas escalate
    /// (numerically lower sorts first).
    Prioritize { delta: i64 },
    /// Play or log an announcement.
    Announce { message: String },
}
