//! The secret vault: encrypted, append-only custody of user credentials and
//! signing keys.
//!
//! Updates are log-structured; every mutation appends a whole record and
//! the in-memory index is rebuilt by replay on open, with later records for
//! a handle shadowing earlier ones.

pub mod crypto;
pub mod records;
pub mod store;

use std::collections::HashMap;
use std::path::Path;

use ed25519_dalek::SigningKey;
use tracing::{info, warn};

use crate::crypto::{generate_keypair, hash_password, token_of, Token};
use crate::types::{Result, SafeError};

use records::{parse_node_key, serialize_node_key, SecretRecord, NODE_KEY_KIND, SECRET_RECORD_KIND};
use store::VaultFile;

/// Durable store of user credentials and custodial signing keys, plus the
/// node's own gateway credential.
pub struct Vault {
    store: VaultFile,
    node_key: SigningKey,
    users: HashMap<String, SecretRecord>,
}

impl Vault {
    /// Open (or create) the vault and replay it into the in-memory index.
    pub fn open(passphrase: &str, path: &Path) -> Result<Vault> {
        let mut store = VaultFile::open(passphrase, path)?;

        let mut node_key = None;
        let mut users: HashMap<String, SecretRecord> = HashMap::new();
        for entry in store.entries.drain(..) {
            match entry.first() {
                Some(&SECRET_RECORD_KIND) => match SecretRecord::parse(&entry) {
                    // Last record for a handle wins.
                    Some(record) => {
                        users.insert(record.handle.clone(), record);
                    }
                    None => warn!("skipping unparseable secret record"),
                },
                Some(&NODE_KEY_KIND) => match parse_node_key(&entry) {
                    Some(key) => node_key = Some(key),
                    None => warn!("skipping unparseable node key entry"),
                },
                _ => warn!("skipping vault entry of unknown kind"),
            }
        }

        let node_key = match node_key {
            Some(key) => key,
            None => {
                let (key, token) = generate_keypair();
                store.append(&serialize_node_key(&key))?;
                info!(node_token = %token, "generated node gateway credential");
                key
            }
        };

        info!(users = users.len(), "vault open");
        Ok(Vault {
            store,
            node_key,
            users,
        })
    }

    /// Register a new user: fresh custodial keypair, hashed password,
    /// appended record. Returns the user's public token.
    pub fn new_user(&mut self, handle: &str, password: &str, email: &str) -> Result<Token> {
        if self.users.contains_key(handle) {
            return Err(SafeError::DuplicateHandle(handle.to_string()));
        }
        let (secret, token) = generate_keypair();
        let record = SecretRecord {
            handle: handle.to_string(),
            password: hash_password(password),
            email: email.to_string(),
            secret,
        };
        self.store.append(&record.serialize())?;
        self.users.insert(handle.to_string(), record);
        Ok(token)
    }

    /// Update a user's password and/or email by appending a merged record.
    /// Empty fields keep the existing values.
    pub fn update_user(&mut self, handle: &str, password: &str, email: &str) -> Result<()> {
        let current = self
            .users
            .get(handle)
            .ok_or_else(|| SafeError::NotFound(handle.to_string()))?;

        let updated = SecretRecord {
            handle: current.handle.clone(),
            password: if password.is_empty() {
                current.password
            } else {
                hash_password(password)
            },
            email: if email.is_empty() {
                current.email.clone()
            } else {
                email.to_string()
            },
            secret: current.secret.clone(),
        };
        self.store.append(&updated.serialize())?;
        self.users.insert(handle.to_string(), updated);
        Ok(())
    }

    /// Credential check. False for unknown handles as well as wrong
    /// passwords; callers must not be able to enumerate handles.
    pub fn check(&self, handle: &str, password: &str) -> bool {
        match self.users.get(handle) {
            Some(record) => record.password == hash_password(password),
            None => false,
        }
    }

    pub fn email_and_token(&self, handle: &str) -> Option<(String, Token)> {
        self.users
            .get(handle)
            .map(|record| (record.email.clone(), record.token()))
    }

    /// The custodial signing key for a handle.
    pub fn signing_key(&self, handle: &str) -> Option<SigningKey> {
        self.users.get(handle).map(|record| record.secret.clone())
    }

    pub fn token(&self, handle: &str) -> Option<Token> {
        self.users.get(handle).map(|record| record.token())
    }

    pub fn contains(&self, handle: &str) -> bool {
        self.users.contains_key(handle)
    }

    /// All stored `(handle, token)` pairs, for registry bootstrap.
    pub fn handles(&self) -> Vec<(String, Token)> {
        self.users
            .iter()
            .map(|(handle, record)| (handle.clone(), record.token()))
            .collect()
    }

    /// The node's own gateway signing key.
    pub fn node_key(&self) -> &SigningKey {
        &self.node_key
    }

    pub fn node_token(&self) -> Token {
        token_of(&self.node_key)
    }

    /// Flush and release the backing store.
    pub fn close(self) -> Result<()> {
        self.store.close()
    }
}
