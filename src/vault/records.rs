//! Plaintext record codec for decrypted vault entries.
//!
//! Every entry starts with a one-byte kind tag. Kind 0 is a user secret
//! record; kind 1 is the node's own gateway signing key, written once when
//! the vault is created.

use ed25519_dalek::SigningKey;

use crate::crypto::{token_of, Hash, Token};
use crate::wire::{put_hash, put_str, Reader};

/// Entry kind tag for a user secret record.
pub const SECRET_RECORD_KIND: u8 = 0;

/// Entry kind tag for the node signing key.
pub const NODE_KEY_KIND: u8 = 1;

/// A user's credentials and custodial signing key.
///
/// Later records for the same handle shadow earlier ones on replay; the
/// vault never rewrites in place.
#[derive(Debug, Clone)]
pub struct SecretRecord {
    pub handle: String,
    pub password: Hash,
    pub email: String,
    pub secret: SigningKey,
}

impl SecretRecord {
    /// The public token of the custodial key.
    pub fn token(&self) -> Token {
        token_of(&self.secret)
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut bytes = vec![SECRET_RECORD_KIND];
        put_str(&self.handle, &mut bytes);
        put_hash(&self.password, &mut bytes);
        put_str(&self.email, &mut bytes);
        bytes.extend_from_slice(&self.secret.to_bytes());
        bytes
    }

    /// Parse a kind-0 entry. `None` on wrong kind, underrun or trailing
    /// bytes.
    pub fn parse(data: &[u8]) -> Option<SecretRecord> {
        let mut reader = Reader::new(data);
        if reader.u8()? != SECRET_RECORD_KIND {
            return None;
        }
        let handle = reader.str()?;
        let password = reader.hash()?;
        let email = reader.str()?;
        let secret: [u8; 32] = reader.take(32)?.try_into().ok()?;
        if !reader.is_done() {
            return None;
        }
        Some(SecretRecord {
            handle,
            password,
            email,
            secret: SigningKey::from_bytes(&secret),
        })
    }
}

/// Serialize the node key entry (kind 1).
pub fn serialize_node_key(key: &SigningKey) -> Vec<u8> {
    let mut bytes = vec![NODE_KEY_KIND];
    bytes.extend_from_slice(&key.to_bytes());
    bytes
}

/// Parse a kind-1 entry.
pub fn parse_node_key(data: &[u8]) -> Option<SigningKey> {
    let mut reader = Reader::new(data);
    if reader.u8()? != NODE_KEY_KIND {
        return None;
    }
    let secret: [u8; 32] = reader.take(32)?.try_into().ok()?;
    if !reader.is_done() {
        return None;
    }
    Some(SigningKey::from_bytes(&secret))
}
