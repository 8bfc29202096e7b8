//! Transport envelope for outbound submissions to the gateway.
//!
//! Wire form: `[kind byte][sender token][u64 epoch][payload][signature]`.
//! The signature is the node credential's Ed25519 signature over everything
//! from the kind byte through the payload, so the gateway can authenticate
//! the submitting node before relaying.

use ed25519_dalek::SigningKey;

use crate::crypto::{sign, token_of, verify, Token, SIGNATURE_LEN, TOKEN_LEN};
use crate::wire::{put_token, put_u64, Reader};

/// Message kind for an action submission.
pub const ACTION_MESSAGE: u8 = 1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub kind: u8,
    pub sender: Token,
    pub epoch: u64,
    pub payload: Vec<u8>,
    pub signature: [u8; SIGNATURE_LEN],
}

impl Envelope {
    /// Wrap and sign a payload with the node credential.
    pub fn seal(kind: u8, key: &SigningKey, epoch: u64, payload: Vec<u8>) -> Envelope {
        let sender = token_of(key);
        let unsigned = unsigned_bytes(kind, &sender, epoch, &payload);
        let signature = sign(key, &unsigned);
        Envelope {
            kind,
            sender,
            epoch,
            payload,
            signature,
        }
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut bytes = unsigned_bytes(self.kind, &self.sender, self.epoch, &self.payload);
        bytes.extend_from_slice(&self.signature);
        bytes
    }

    /// Parse an envelope. The payload is everything between the epoch and
    /// the fixed-size trailing signature.
    pub fn parse(data: &[u8]) -> Option<Envelope> {
        if data.len() < 1 + TOKEN_LEN + 8 + SIGNATURE_LEN {
            return None;
        }
        let payload_end = data.len() - SIGNATURE_LEN;
        let mut reader = Reader::new(&data[..payload_end]);
        let kind = reader.u8()?;
        let sender = reader.token()?;
        let epoch = reader.u64()?;
        let payload = reader.take(reader.remaining())?.to_vec();
        let signature = data[payload_end..].try_into().ok()?;
        Some(Envelope {
            kind,
            sender,
            epoch,
            payload,
            signature,
        })
    }

    pub fn verify(&self) -> bool {
        let unsigned = unsigned_bytes(self.kind, &self.sender, self.epoch, &self.payload);
        verify(&self.sender, &unsigned, &self.signature)
    }
}

fn unsigned_bytes(kind: u8, sender: &Token, epoch: u64, payload: &[u8]) -> Vec<u8> {
    let mut bytes = vec![kind];
    put_token(sender, &mut bytes);
    put_u64(epoch, &mut bytes);
    bytes.extend_from_slice(payload);
    bytes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::generate_keypair;

    #[test]
    fn test_seal_parse_verify() {
        let (key, sender) = generate_keypair();
        let envelope = Envelope::seal(ACTION_MESSAGE, &key, 42, b"action bytes".to_vec());
        assert!(envelope.verify());

        let parsed = Envelope::parse(&envelope.serialize()).unwrap();
        assert_eq!(parsed, envelope);
        assert_eq!(parsed.sender, sender);
        assert_eq!(parsed.epoch, 42);
        assert_eq!(parsed.payload, b"action bytes");
        assert!(parsed.verify());
    }

    #[test]
    fn test_tampered_payload_fails_verify() {
        let (key, _) = generate_keypair();
        let envelope = Envelope::seal(ACTION_MESSAGE, &key, 1, b"payload".to_vec());
        let mut bytes = envelope.serialize();
        let tamper_at = 1 + TOKEN_LEN + 8;
        bytes[tamper_at] ^= 0x01;
        let parsed = Envelope::parse(&bytes).unwrap();
        assert!(!parsed.verify());
    }

    #[test]
    fn test_parse_rejects_short_input() {
        assert!(Envelope::parse(&[1, 2, 3]).is_none());
    }

    #[test]
    fn test_empty_payload_allowed() {
        let (key, _) = generate_keypair();
        let envelope = Envelope::seal(ACTION_MESSAGE, &key, 0, Vec::new());
        let parsed = Envelope::parse(&envelope.serialize()).unwrap();
        assert!(parsed.payload.is_empty());
        assert!(parsed.verify());
    }
}
