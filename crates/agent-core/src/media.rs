//! Media gateway boundary
//!
//! The channel state machine never touches media transport directly; it
//! drives the gateway through this trait. Production deployments plug in a
//! real gateway integration, tests plug in a recording stub.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::{ChannelError, Result};
use crate::types::CallId;

/// Operations the channel layer invokes on the media gateway.
#[async_trait]
pub trait MediaGateway: Send + Sync {
    /// Answer: begin bridging media for the call.
    async fn oncall(&self, call: &CallId) -> Result<()>;

    /// Wrapup initiated by the agent; the gateway must release media.
    async fn wrapup(&self, call: &CallId) -> Result<()>;

    /// Wrapup initiated by the far side; the gateway may decline if media
    /// is still live.
    async fn try_wrapup(&self, call: &CallId) -> Result<()>;

    async fn hangup(&self, call: &CallId) -> Result<()>;

    /// Dial out for a precall (outbound) interaction.
    async fn dial(&self, call: &CallId, number: &str) -> Result<()>;

    /// Hand the call to another agent.
    async fn transfer_to_agent(&self, call: &CallId, login: &str) -> Result<()>;
}

/// Cloneable handle wrapping a gateway implementation.
#[derive(Clone)]
pub struct MediaHandle(pub Arc<dyn MediaGateway>);

impl MediaHandle {
    pub fn new(gateway: Arc<dyn MediaGateway>) -> Self {
        Self(gateway)
    }

    pub fn null() -> Self {
        Self(Arc::new(NullMediaGateway))
    }
}

impl std::ops::Deref for MediaHandle {
    type Target = dyn MediaGateway;

    fn deref(&self) -> &Self::Target {
        self.0.as_ref()
    }
}

impl std::fmt::Debug for MediaHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("MediaHandle")
    }
}

/// Gateway that accepts every operation without doing anything. Used for
/// media types that carry no out-of-band media (chat, email).
pub struct NullMediaGateway;

#[async_trait]
impl MediaGateway for NullMediaGateway {
    async fn oncall(&self, _call: &CallId) -> Result<()> {
        Ok(())
    }

    async fn wrapup(&self, _call: &CallId) -> Result<()> {
        Ok(())
    }

    async fn try_wrapup(&self, _call: &CallId) -> Result<()> {
        Ok(())
    }

    async fn hangup(&self, _call: &CallId) -> Result<()> {
        Ok(())
    }

    async fn dial(&self, _call: &CallId, _number: &str) -> Result<()> {
        Ok(())
    }

    async fn transfer_to_agent(&self, _call: &CallId, login: &str) -> Result<()> {
        if login.is_empty() {
            return Err(ChannelError::Media("empty transfer target".into()));
        }
        Ok(())
    }
}
