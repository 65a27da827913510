//! Channel property registry
//!
//! A cluster-local directory of live channels. Each channel registers a
//! property record on construction, rewrites it on every transition and
//! removes it at termination. Readers (routing, supervisors) never write.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::state_table::ChannelState;
use crate::types::{CallerId, ChannelId, MediaType};

/// The advertised shape of one live channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelProp {
    pub login: String,
    pub profile: String,
    pub media_type: MediaType,
    pub client: String,
    pub caller_id: CallerId,
    pub state: ChannelState,
}

/// Concurrent map of channel id → property. The owning channel is the only
/// writer for its entry.
#[derive(Default)]
pub struct PropertyRegistry {
    inner: DashMap<ChannelId, ChannelProp>,
}

impl PropertyRegistry {
    pub fn new() -> Self {
        Self {
            inner: DashMap::new(),
        }
    }

    pub fn register(&self, id: ChannelId, prop: ChannelProp) {
        self.inner.insert(id, prop);
    }

    pub fn update_state(&self, id: &ChannelId, state: ChannelState) -> Option<ChannelProp> {
        let mut entry = self.inner.get_mut(id)?;
        entry.state = state;
        Some(entry.clone())
    }

    pub fn remove(&self, id: &ChannelId) -> Option<ChannelProp> {
        self.inner.remove(id).map(|(_, prop)| prop)
    }

    pub fn get(&self, id: &ChannelId) -> Option<ChannelProp> {
        self.inner.get(id).map(|entry| entry.clone())
    }

    pub fn list(&self) -> Vec<(ChannelId, ChannelProp)> {
        self.inner
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    /// All channels currently owned by an agent login.
    pub fn by_login(&self, login: &str) -> Vec<(ChannelId, ChannelProp)> {
        self.inner
            .iter()
            .filter(|entry| entry.value().login == login)
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}
