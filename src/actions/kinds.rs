//! The closed set of authorization actions: join, grant, revoke.
//!
//! Every action carries the epoch watermark it was built at, its author's
//! token, and a detached Ed25519 signature over the unsigned prefix.
//! [`Action::parse`] is the single dispatch point, the one-byte kind tag
//! selects the variant and anything malformed comes back as `None`.

use ed25519_dalek::SigningKey;

use crate::crypto::{hash_token, sign, token_of, verify, Hash, Token, SIGNATURE_LEN};
use crate::wire::{put_bytes, put_str, put_token, put_u64, Reader};

pub const JOIN_KIND: u8 = 0;
pub const GRANT_KIND: u8 = 1;
pub const REVOKE_KIND: u8 = 2;

/// Kind tag for the epoch marker the log records when a block advances
/// the watermark. Not an action; never appears in blocks.
pub const EPOCH_MARK_KIND: u8 = 3;

/// Largest fingerprint whose grant still fits a single u16-framed log
/// entry (frame limit minus the grant's fixed-size fields).
pub const MAX_FINGERPRINT: usize = u16::MAX as usize - 139;

/// Attestation that `author` joins the network under `handle`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinNetwork {
    pub epoch: u64,
    pub author: Token,
    pub handle: String,
    pub signature: [u8; SIGNATURE_LEN],
}

/// Delegation of signing authority from `author` to `attorney`, scoped by
/// an opaque fingerprint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GrantPower {
    pub epoch: u64,
    pub author: Token,
    pub attorney: Token,
    pub fingerprint: Vec<u8>,
    pub signature: [u8; SIGNATURE_LEN],
}

/// Withdrawal of a previously granted delegation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RevokePower {
    pub epoch: u64,
    pub author: Token,
    pub attorney: Token,
    pub signature: [u8; SIGNATURE_LEN],
}

impl JoinNetwork {
    pub fn signed(epoch: u64, key: &SigningKey, handle: &str) -> JoinNetwork {
        let mut action = JoinNetwork {
            epoch,
            author: token_of(key),
            handle: handle.to_string(),
            signature: [0u8; SIGNATURE_LEN],
        };
        action.signature = sign(key, &action.unsigned_bytes());
        action
    }

    fn unsigned_bytes(&self) -> Vec<u8> {
        let mut bytes = vec![JOIN_KIND];
        put_u64(self.epoch, &mut bytes);
        put_token(&self.author, &mut bytes);
        put_str(&self.handle, &mut bytes);
        bytes
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut bytes = self.unsigned_bytes();
        bytes.extend_from_slice(&self.signature);
        bytes
    }

    pub fn verify(&self) -> bool {
        verify(&self.author, &self.unsigned_bytes(), &self.signature)
    }
}

impl GrantPower {
    pub fn signed(epoch: u64, key: &SigningKey, attorney: Token, fingerprint: &[u8]) -> GrantPower {
        let mut action = GrantPower {
            epoch,
            author: token_of(key),
            attorney,
            fingerprint: fingerprint.to_vec(),
            signature: [0u8; SIGNATURE_LEN],
        };
        action.signature = sign(key, &action.unsigned_bytes());
        action
    }

    fn unsigned_bytes(&self) -> Vec<u8> {
        let mut bytes = vec![GRANT_KIND];
        put_u64(self.epoch, &mut bytes);
        put_token(&self.author, &mut bytes);
        put_token(&self.attorney, &mut bytes);
        put_bytes(&self.fingerprint, &mut bytes);
        bytes
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut bytes = self.unsigned_bytes();
        bytes.extend_from_slice(&self.signature);
        bytes
    }

    pub fn verify(&self) -> bool {
        verify(&self.author, &self.unsigned_bytes(), &self.signature)
    }
}

impl RevokePower {
    pub fn signed(epoch: u64, key: &SigningKey, attorney: Token) -> RevokePower {
        let mut action = RevokePower {
            epoch,
            author: token_of(key),
            attorney,
            signature: [0u8; SIGNATURE_LEN],
        };
        action.signature = sign(key, &action.unsigned_bytes());
        action
    }

    fn unsigned_bytes(&self) -> Vec<u8> {
        let mut bytes = vec![REVOKE_KIND];
        put_u64(self.epoch, &mut bytes);
        put_token(&self.author, &mut bytes);
        put_token(&self.attorney, &mut bytes);
        bytes
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut bytes = self.unsigned_bytes();
        bytes.extend_from_slice(&self.signature);
        bytes
    }

    pub fn verify(&self) -> bool {
        verify(&self.author, &self.unsigned_bytes(), &self.signature)
    }
}

/// A parsed confirmed action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Join(JoinNetwork),
    Grant(GrantPower),
    Revoke(RevokePower),
}

impl Action {
    /// Peek the kind tag without a full parse. Used to split raw block
    /// payloads into per-kind lists.
    pub fn kind_of(data: &[u8]) -> Option<u8> {
        match data.first() {
            Some(&kind) if kind <= REVOKE_KIND => Some(kind),
            _ => None,
        }
    }

    /// Parse a serialized action. `None` on unknown kind, underrun or
    /// trailing bytes.
    pub fn parse(data: &[u8]) -> Option<Action> {
        let mut reader = Reader::new(data);
        let kind = reader.u8()?;
        let action = match kind {
            JOIN_KIND => {
                let epoch = reader.u64()?;
                let author = reader.token()?;
                let handle = reader.str()?;
                let signature = reader.signature()?;
                Action::Join(JoinNetwork {
                    epoch,
                    author,
                    handle,
                    signature,
                })
            }
            GRANT_KIND => {
                let epoch = reader.u64()?;
                let author = reader.token()?;
                let attorney = reader.token()?;
                let fingerprint = reader.bytes()?.to_vec();
                let signature = reader.signature()?;
                Action::Grant(GrantPower {
                    epoch,
                    author,
                    attorney,
                    fingerprint,
                    signature,
                })
            }
            REVOKE_KIND => {
                let epoch = reader.u64()?;
                let author = reader.token()?;
                let attorney = reader.token()?;
                let signature = reader.signature()?;
                Action::Revoke(RevokePower {
                    epoch,
                    author,
                    attorney,
                    signature,
                })
            }
            _ => return None,
        };
        if !reader.is_done() {
            return None;
        }
        Some(action)
    }

    pub fn author(&self) -> Token {
        match self {
            Action::Join(a) => a.author,
            Action::Grant(a) => a.author,
            Action::Revoke(a) => a.author,
        }
    }

    pub fn epoch(&self) -> u64 {
        match self {
            Action::Join(a) => a.epoch,
            Action::Grant(a) => a.epoch,
            Action::Revoke(a) => a.epoch,
        }
    }

    pub fn serialize(&self) -> Vec<u8> {
        match self {
            Action::Join(a) => a.serialize(),
            Action::Grant(a) => a.serialize(),
            Action::Revoke(a) => a.serialize(),
        }
    }

    pub fn verify(&self) -> bool {
        match self {
            Action::Join(a) => a.verify(),
            Action::Grant(a) => a.verify(),
            Action::Revoke(a) => a.verify(),
        }
    }
}

/// Serialize an epoch marker: `[kind=3][u64 epoch]`.
pub fn epoch_mark(epoch: u64) -> Vec<u8> {
    let mut bytes = vec![EPOCH_MARK_KIND];
    put_u64(epoch, &mut bytes);
    bytes
}

/// Parse an epoch marker. `None` on wrong kind, underrun or trailing
/// bytes.
pub fn parse_epoch_mark(data: &[u8]) -> Option<u64> {
    let mut reader = Reader::new(data);
    if reader.u8()? != EPOCH_MARK_KIND {
        return None;
    }
    let epoch = reader.u64()?;
    if !reader.is_done() {
        return None;
    }
    Some(epoch)
}

/// Index an action payload under the hash of every token it mentions, so
/// the log answers "everything mentioning X" for authors and attorneys
/// alike. Malformed payloads index nothing.
pub fn token_indexer(payload: &[u8]) -> Vec<Hash> {
    match Action::parse(payload) {
        Some(Action::Join(join)) => vec![hash_token(&join.author)],
        Some(Action::Grant(grant)) => {
            vec![hash_token(&grant.author), hash_token(&grant.attorney)]
        }
        Some(Action::Revoke(revoke)) => {
            vec![hash_token(&revoke.author), hash_token(&revoke.attorney)]
        }
        None => Vec::new(),
    }
}
