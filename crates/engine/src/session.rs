//! Session table
//!
//! The authoritative mapping from session cookies to authentication state
//! and live connection workers. The table is the only component touched
//! concurrently by request handlers, so it is a `DashMap` with atomic
//! entry updates; everything else in the engine talks through task
//! inboxes.

use std::sync::Arc;

use dashmap::DashMap;
use rand::RngCore;
use tracing::{debug, info};

use crate::conn::ConnectionHandle;
use crate::error::{EngineError, Result};

/// What the table knows about one session id.
#[derive(Debug, Clone, Default)]
pub struct SessionEntry {
    /// Salt handed out by the last `get_salt`; consumed by login.
    pub salt: Option<String>,
    /// Live connection worker, present only while logged in.
    pub connection: Option<ConnectionHandle>,
}

/// Process-wide concurrent session map.
#[derive(Default)]
pub struct SessionTable {
    inner: DashMap<String, SessionEntry>,
}

impl SessionTable {
    pub fn new() -> Self {
        Self {
            inner: DashMap::new(),
        }
    }

    /// Mint a fresh session id and insert an empty entry for it.
    pub fn issue_session(&self) -> String {
        let mut bytes = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut bytes);
        let id = hex::encode(bytes);
        self.inner.insert(id.clone(), SessionEntry::default());
        debug!("issued session {}", id);
        id
    }

    /// Generate a random 32-bit salt and store it on the session,
    /// replacing any prior salt. Returns `None` for unknown sessions.
    pub fn bind_salt(&self, session_id: &str) -> Option<String> {
        let mut entry = self.inner.get_mut(session_id)?;
        let salt = format!("{}", rand::thread_rng().next_u32());
        entry.salt = Some(salt.clone());
        Some(salt)
    }

    /// Bind a live connection worker into the session. The stored salt
    /// must still match the one the login consumed; the table then watches
    /// worker liveness and drops the whole entry when the worker dies.
    pub fn bind_connection(
        self: &Arc<Self>,
        session_id: &str,
        salt: &str,
        handle: ConnectionHandle,
    ) -> Result<()> {
        {
            let mut entry = self
                .inner
                .get_mut(session_id)
                .ok_or(EngineError::BadCookie)?;
            if entry.salt.as_deref() != Some(salt) {
                return Err(EngineError::NoSalt);
            }
            entry.connection = Some(handle.clone());
        }

        // Liveness watcher: a dead worker removes the triple atomically.
        let table = Arc::clone(self);
        let session_id = session_id.to_string();
        tokio::spawn(async move {
            handle.closed().await;
            let removed = table
                .inner
                .remove_if(&session_id, |_, entry| {
                    entry
                        .connection
                        .as_ref()
                        .map(|conn| conn.id == handle.id)
                        .unwrap_or(false)
                })
                .is_some();
            if removed {
                info!("session {} removed after connection worker exit", session_id);
            }
        });

        Ok(())
    }

    /// Resolve a session cookie. `None` means bad cookie.
    pub fn lookup(&self, session_id: &str) -> Option<SessionEntry> {
        self.inner.get(session_id).map(|entry| entry.clone())
    }

    /// Clear authentication state but keep the id usable (logout).
    pub fn revoke(&self, session_id: &str) -> Option<ConnectionHandle> {
        let mut entry = self.inner.get_mut(session_id)?;
        entry.salt = None;
        entry.connection.take()
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn issue_creates_unique_printable_ids() {
        let table = SessionTable::new();
        let a = table.issue_session();
        let b = table.issue_session();
        assert_ne!(a, b);
        assert_eq!(a.len(), 32);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert!(table.lookup(&a).is_some());
    }

    #[test]
    fn bind_salt_overwrites_prior_salt() {
        let table = SessionTable::new();
        let id = table.issue_session();
        let first = table.bind_salt(&id).unwrap();
        let second = table.bind_salt(&id).unwrap();
        assert_eq!(table.lookup(&id).unwrap().salt, Some(second.clone()));
        // the handshake is one-shot per salt
        if first != second {
            assert_ne!(table.lookup(&id).unwrap().salt, Some(first));
        }
    }

    #[test]
    fn bind_salt_on_unknown_session_fails() {
        let table = SessionTable::new();
        assert!(table.bind_salt("deadbeef").is_none());
    }

    #[test]
    fn revoke_keeps_id_usable() {
        let table = SessionTable::new();
        let id = table.issue_session();
        table.bind_salt(&id).unwrap();
        table.revoke(&id);
        let entry = table.lookup(&id).expect("id survives logout");
        assert!(entry.salt.is_none());
        assert!(entry.connection.is_none());
    }
}
