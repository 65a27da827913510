//! Endpoint (phone driver) lifecycle
//!
//! A channel either rings the agent in-band (through the application) or
//! owns a spawned phone driver. The driver runs as its own task; the
//! channel is linked to it through an exit watch and reacts to the
//! driver's death according to the transition table.

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tracing::debug;

use crate::error::{ChannelError, Result};
use crate::types::{Call, RingPath};

/// Driver technology bound to a channel.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndpointKind {
    SipRegistration,
    Sip,
    Iax2,
    H323,
    Pstn,
}

impl EndpointKind {
    /// Parse the `voipendpoint` login option. The historical misspelling
    /// `sip_registation` is accepted and normalised.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "sip_registration" | "sip_registation" => Some(EndpointKind::SipRegistration),
            "sip" => Some(EndpointKind::Sip),
            "iax2" => Some(EndpointKind::Iax2),
            "h323" => Some(EndpointKind::H323),
            "pstn" => Some(EndpointKind::Pstn),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EndpointKind::SipRegistration => "sip_registration",
            EndpointKind::Sip => "sip",
            EndpointKind::Iax2 => "iax2",
            EndpointKind::H323 => "h323",
            EndpointKind::Pstn => "pstn",
        }
    }
}

/// How to reach the agent's phone when a driver is needed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointDescriptor {
    pub kind: EndpointKind,
    /// Registration id, URI or number, depending on `kind`.
    pub data: String,
}

/// Endpoint configuration of a channel: either the in-band sentinel or a
/// descriptor used to spawn a driver.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Endpoint {
    Inband,
    Driver(EndpointDescriptor),
}

impl Endpoint {
    pub fn is_inband(&self) -> bool {
        matches!(self, Endpoint::Inband)
    }
}

/// Endpoint options supplied at login.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EndpointOptions {
    pub voipendpoint: Option<String>,
    pub voipendpointdata: Option<String>,
    #[serde(default)]
    pub useoutbandring: bool,
}

impl EndpointOptions {
    /// Resolve login options into an endpoint descriptor and default ring
    /// path. `voipendpoint` defaults to `sip_registration`, whose data
    /// defaults to the username.
    pub fn resolve(&self, username: &str) -> Result<(Endpoint, RingPath)> {
        let kind = match &self.voipendpoint {
            Some(s) => EndpointKind::parse(s)
                .ok_or_else(|| ChannelError::EndpointStart(format!("unknown endpoint type: {s}")))?,
            None => EndpointKind::SipRegistration,
        };

        let data = match (&self.voipendpointdata, kind) {
            (Some(data), _) => data.clone(),
            (None, EndpointKind::SipRegistration) => username.to_string(),
            (None, _) => String::new(),
        };

        let ring_path = if self.useoutbandring {
            RingPath::Outband
        } else {
            RingPath::Inband
        };

        Ok((Endpoint::Driver(EndpointDescriptor { kind, data }), ring_path))
    }
}

/// Commands a channel sends to its driver task.
#[derive(Debug)]
pub enum EndpointCommand {
    Oncall,
    Hangup,
}

/// Handle to a running driver task. Dropping the handle hangs the driver
/// up; the channel observes driver death through [`EndpointHandle::exit`].
#[derive(Debug)]
pub struct EndpointHandle {
    pub kind: EndpointKind,
    tx: mpsc::UnboundedSender<EndpointCommand>,
    exit: watch::Receiver<Option<String>>,
}

impl EndpointHandle {
    /// Spawn a driver for the descriptor. Fails when the descriptor cannot
    /// identify a destination.
    pub fn spawn(desc: &EndpointDescriptor, call: &Call) -> Result<Self> {
        if desc.data.is_empty() {
            return Err(ChannelError::EndpointStart(format!(
                "{} endpoint has no destination",
                desc.kind.as_str()
            )));
        }

        let (tx, mut rx) = mpsc::unbounded_channel();
        let (exit_tx, exit_rx) = watch::channel(None);
        let kind = desc.kind;
        let data = desc.data.clone();
        let call_id = call.id.clone();

        tokio::spawn(async move {
            debug!("endpoint {} ({}) ringing for {}", kind.as_str(), data, call_id);
            loop {
                match rx.recv().await {
                    Some(EndpointCommand::Oncall) => {
                        debug!("endpoint {} answered for {}", data, call_id);
                    }
                    Some(EndpointCommand::Hangup) => {
                        let _ = exit_tx.send(Some("hangup".to_string()));
                        break;
                    }
                    None => {
                        // Channel dropped us; release the line.
                        let _ = exit_tx.send(Some("released".to_string()));
                        break;
                    }
                }
            }
        });

        Ok(Self { kind, tx, exit: exit_rx })
    }

    pub fn oncall(&self) {
        let _ = self.tx.send(EndpointCommand::Oncall);
    }

    pub fn hangup(&self) {
        let _ = self.tx.send(EndpointCommand::Hangup);
    }

    /// Wait for the driver to exit and return the reason.
    pub async fn exited(&mut self) -> String {
        loop {
            if let Some(reason) = self.exit.borrow().clone() {
                return reason;
            }
            if self.exit.changed().await.is_err() {
                return "endpoint task lost".to_string();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_kind_normalises_typo() {
        assert_eq!(EndpointKind::parse("sip_registation"), Some(EndpointKind::SipRegistration));
        assert_eq!(EndpointKind::parse("sip_registration"), Some(EndpointKind::SipRegistration));
        assert_eq!(EndpointKind::parse("carrier_pigeon"), None);
    }

    #[test]
    fn resolve_defaults_to_registration_under_username() {
        let opts = EndpointOptions::default();
        let (endpoint, ring_path) = opts.resolve("alice").unwrap();
        match endpoint {
            Endpoint::Driver(desc) => {
                assert_eq!(desc.kind, EndpointKind::SipRegistration);
                assert_eq!(desc.data, "alice");
            }
            Endpoint::Inband => panic!("expected a driver endpoint"),
        }
        assert_eq!(ring_path, RingPath::Inband);
    }

    #[test]
    fn resolve_honours_outband_ring() {
        let opts = EndpointOptions {
            voipendpoint: Some("pstn".to_string()),
            voipendpointdata: Some("5551234".to_string()),
            useoutbandring: true,
        };
        let (endpoint, ring_path) = opts.resolve("bob").unwrap();
        match endpoint {
            Endpoint::Driver(desc) => {
                assert_eq!(desc.kind, EndpointKind::Pstn);
                assert_eq!(desc.data, "5551234");
            }
            Endpoint::Inband => panic!("expected a driver endpoint"),
        }
        assert_eq!(ring_path, RingPath::Outband);
    }
}
