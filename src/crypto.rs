//! Cryptographic primitives for identity and action signing.
//!
//! # Algorithms
//!
//! - **Identity**: Ed25519; a user's public key is their network token
//! - **Hashing**: SHA-256 for password hashes and the action index
//!
//! Everything here wraps `ed25519-dalek` / `sha2` behind fixed-size types so
//! the rest of the node never touches raw key material directly.

use ed25519_dalek::{Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};

use crate::types::{Result, SafeError};

/// Ed25519 public key length (32 bytes)
pub const TOKEN_LEN: usize = 32;

/// SHA-256 digest length (32 bytes)
pub const HASH_LEN: usize = 32;

/// Ed25519 signature length (64 bytes)
pub const SIGNATURE_LEN: usize = 64;

/// A user's public key, serving as their stable network identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Token(pub [u8; TOKEN_LEN]);

impl Token {
    pub const ZERO: Token = Token([0u8; TOKEN_LEN]);

    /// Parse a token from its 64-character hex encoding.
    pub fn from_hex(s: &str) -> Result<Token> {
        let bytes = hex::decode(s).map_err(|_| SafeError::InvalidToken(s.to_string()))?;
        let bytes: [u8; TOKEN_LEN] = bytes
            .try_into()
            .map_err(|_| SafeError::InvalidToken(s.to_string()))?;
        Ok(Token(bytes))
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn as_bytes(&self) -> &[u8; TOKEN_LEN] {
        &self.0
    }
}

impl std::fmt::Display for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// A SHA-256 digest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Hash(pub [u8; HASH_LEN]);

impl Hash {
    pub const ZERO: Hash = Hash([0u8; HASH_LEN]);

    pub fn as_bytes(&self) -> &[u8; HASH_LEN] {
        &self.0
    }
}

/// Hash arbitrary bytes with SHA-256.
pub fn hash_of(data: &[u8]) -> Hash {
    Hash(Sha256::digest(data).into())
}

/// Hash a token, the key under which actions mentioning it are indexed.
pub fn hash_token(token: &Token) -> Hash {
    hash_of(&token.0)
}

/// Hash a password into the fixed-size field stored in vault records.
pub fn hash_password(password: &str) -> Hash {
    hash_of(password.as_bytes())
}

/// Generate a new Ed25519 signing keypair.
///
/// Uses the OS cryptographically secure random number generator. The token
/// is the public half.
pub fn generate_keypair() -> (SigningKey, Token) {
    let signing_key = SigningKey::generate(&mut OsRng);
    let token = token_of(&signing_key);
    (signing_key, token)
}

/// The public token of a signing key.
pub fn token_of(key: &SigningKey) -> Token {
    Token(key.verifying_key().to_bytes())
}

/// Sign a payload, returning the detached 64-byte signature.
pub fn sign(key: &SigningKey, payload: &[u8]) -> [u8; SIGNATURE_LEN] {
    key.sign(payload).to_bytes()
}

/// Verify a detached signature against a token.
///
/// Returns false for malformed tokens as well as invalid signatures.
pub fn verify(token: &Token, payload: &[u8], signature: &[u8; SIGNATURE_LEN]) -> bool {
    let Ok(verifying_key) = VerifyingKey::from_bytes(&token.0) else {
        return false;
    };
    let signature = ed25519_dalek::Signature::from_bytes(signature);
    verifying_key.verify(payload, &signature).is_ok()
}
