//! In-memory authorization state: who currently holds power of attorney
//! for whom, and which users the network has confirmed.
//!
//! The three `apply_*` operations are the only writers of user state and
//! are driven exclusively by confirmed network events, in confirmation
//! order. Local requests never mutate this state directly; a user shows up
//! here unconfirmed when their join is submitted and flips to confirmed
//! when the network echoes it back.

use std::collections::HashMap;

use crate::crypto::Token;

/// One custodied user's authorization state.
#[derive(Debug, Clone)]
pub struct User {
    pub handle: String,
    pub token: Token,
    /// Tokens currently holding power of attorney, in grant order.
    pub attorneys: Vec<Token>,
    /// True once the network has confirmed this user's join.
    pub confirmed: bool,
}

/// Registry of users keyed by handle, with a token→handle index so events
/// (which carry author tokens) resolve without a scan.
#[derive(Default)]
pub struct CapabilityRegistry {
    users: HashMap<String, User>,
    by_token: HashMap<Token, String>,
}

impl CapabilityRegistry {
    pub fn new() -> CapabilityRegistry {
        CapabilityRegistry::default()
    }

    /// Create an unconfirmed user. Called when a join is submitted locally
    /// and at startup for every vault record. Re-inserting an existing
    /// handle is a no-op.
    pub fn insert(&mut self, handle: &str, token: Token) {
        if self.users.contains_key(handle) {
            return;
        }
        self.users.insert(
            handle.to_string(),
            User {
                handle: handle.to_string(),
                token,
                attorneys: Vec::new(),
                confirmed: false,
            },
        );
        self.by_token.insert(token, handle.to_string());
    }

    /// Confirm the user behind a join event. Idempotent; unknown authors
    /// are ignored (the join belongs to someone we do not custody).
    pub fn apply_join(&mut self, author: &Token) {
        if let Some(user) = self.user_by_token_mut(author) {
            user.confirmed = true;
        }
    }

    /// Add an attorney to the author's set. Duplicate grants are silently
    /// absorbed.
    pub fn apply_grant(&mut self, author: &Token, attorney: &Token) {
        if let Some(user) = self.user_by_token_mut(author) {
            if !user.attorneys.contains(attorney) {
                user.attorneys.push(*attorney);
            }
        }
    }

    /// Remove an attorney from the author's set. Revoking an absent
    /// attorney is a no-op.
    pub fn apply_revoke(&mut self, author: &Token, attorney: &Token) {
        if let Some(user) = self.user_by_token_mut(author) {
            user.attorneys.retain(|t| t != attorney);
        }
    }

    pub fn get(&self, handle: &str) -> Option<&User> {
        self.users.get(handle)
    }

    pub fn handle_of_token(&self, token: &Token) -> Option<&str> {
        self.by_token.get(token).map(String::as_str)
    }

    /// The attorneys currently granted by `handle`, empty for unknown
    /// handles.
    pub fn attorneys_of(&self, handle: &str) -> Vec<Token> {
        self.users
            .get(handle)
            .map(|user| user.attorneys.clone())
            .unwrap_or_default()
    }

    /// Does `token` currently hold power of attorney for `handle`?
    pub fn is_attorney(&self, handle: &str, token: &Token) -> bool {
        self.users
            .get(handle)
            .is_some_and(|user| user.attorneys.contains(token))
    }

    fn user_by_token_mut(&mut self, token: &Token) -> Option<&mut User> {
        let handle = self.by_token.get(token)?;
        self.users.get_mut(handle)
    }
}
