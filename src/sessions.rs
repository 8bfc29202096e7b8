//! In-memory session store for the web layer.
//!
//! The node hands out random hex session ids after a credential check; the
//! excluded web layer is responsible for transporting them (cookies or
//! otherwise) and calls back with the id to resolve the handle. Sessions
//! are not persisted; a restart signs everyone out.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use dashmap::DashMap;

use crate::crypto::Token;
use crate::vault::crypto::random_bytes;

/// Default session lifetime: one week, matching the cookie age the web
/// layer advertises.
pub const DEFAULT_TTL_SECS: u64 = 60 * 60 * 24 * 7;

#[derive(Debug, Clone)]
pub struct Session {
    pub session_id: String,
    pub handle: String,
    pub token: Token,
    pub created_at: u64,
    pub expires_at: u64,
}

impl Session {
    pub fn is_expired(&self) -> bool {
        now_secs() >= self.expires_at
    }
}

pub struct SessionStore {
    sessions: DashMap<String, Session>,
    ttl: Duration,
}

impl SessionStore {
    pub fn new(ttl_seconds: u64) -> SessionStore {
        SessionStore {
            sessions: DashMap::new(),
            ttl: Duration::from_secs(ttl_seconds),
        }
    }

    /// Mint a new session for an authenticated handle. The id is 32 random
    /// bytes, hex encoded.
    pub fn create(&self, handle: &str, token: Token) -> String {
        let seed: [u8; 32] = random_bytes();
        let session_id = hex::encode(seed);
        let now = now_secs();
        self.sessions.insert(
            session_id.clone(),
            Session {
                session_id: session_id.clone(),
                handle: handle.to_string(),
                token,
                created_at: now,
                expires_at: now + self.ttl.as_secs(),
            },
        );
        session_id
    }

    /// Resolve a session id, dropping it when expired.
    pub fn validate(&self, session_id: &str) -> Option<Session> {
        let session = self.sessions.get(session_id)?;
        if session.is_expired() {
            drop(session);
            self.sessions.remove(session_id);
            return None;
        }
        Some(session.clone())
    }

    pub fn remove(&self, session_id: &str) {
        self.sessions.remove(session_id);
    }

    /// Drop every session for a token, e.g. after a password change.
    pub fn remove_token(&self, token: &Token) {
        self.sessions.retain(|_, session| session.token != *token);
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

impl Default for SessionStore {
    fn default() -> Self {
        SessionStore::new(DEFAULT_TTL_SECS)
    }
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
