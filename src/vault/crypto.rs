//! At-rest encryption for the secret vault.
//!
//! # Algorithms
//!
//! - **Key Derivation**: Argon2id (memory-hard, brute-force resistant)
//! - **Encryption**: ChaCha20-Poly1305 (authenticated encryption)
//!
//! The passphrase is stretched into a 256-bit vault key once per open; each
//! appended entry is sealed under that key with a fresh random nonce. The
//! Poly1305 tag is what turns a wrong passphrase into a clean integrity
//! failure instead of garbage plaintext.

use argon2::{Algorithm, Argon2, Params, Version};
use chacha20poly1305::{aead::Aead, ChaCha20Poly1305, Key, KeyInit, Nonce};
use rand::rngs::OsRng;
use rand::RngCore;
use zeroize::Zeroizing;

use crate::types::{Result, SafeError};

/// Argon2id memory cost in KiB (64 MB)
pub const ARGON2_MEMORY_KB: u32 = 65536;

/// Argon2id iteration count
pub const ARGON2_ITERATIONS: u32 = 3;

/// Argon2id parallelism (threads)
pub const ARGON2_PARALLELISM: u32 = 4;

/// Salt length for key derivation (16 bytes)
pub const SALT_LEN: usize = 16;

/// Nonce length for ChaCha20-Poly1305 (12 bytes)
pub const NONCE_LEN: usize = 12;

/// ChaCha20-Poly1305 auth tag length (16 bytes)
pub const TAG_LEN: usize = 16;

/// Generate cryptographically secure random bytes.
pub fn random_bytes<const N: usize>() -> [u8; N] {
    let mut bytes = [0u8; N];
    OsRng.fill_bytes(&mut bytes);
    bytes
}

/// The derived vault key. Zeroized on drop.
pub type VaultKey = Zeroizing<[u8; 32]>;

/// Derive the 256-bit vault key from a passphrase using Argon2id.
///
/// The salt lives in the vault file header, so the same passphrase opens
/// the same vault across restarts.
pub fn derive_vault_key(passphrase: &[u8], salt: &[u8]) -> Result<VaultKey> {
    let params = Params::new(
        ARGON2_MEMORY_KB,
        ARGON2_ITERATIONS,
        ARGON2_PARALLELISM,
        Some(32),
    )
    .map_err(|e| SafeError::Crypto(format!("invalid Argon2 params: {e}")))?;

    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);

    let mut key = Zeroizing::new([0u8; 32]);
    argon2
        .hash_password_into(passphrase, salt, key.as_mut())
        .map_err(|e| SafeError::Crypto(format!("key derivation failed: {e}")))?;

    Ok(key)
}

/// Seal one vault entry under the vault key with a fresh nonce.
///
/// Returns `(nonce, ciphertext)`; the ciphertext is `plaintext.len() +
/// TAG_LEN` bytes.
pub fn seal_entry(key: &VaultKey, plaintext: &[u8]) -> Result<([u8; NONCE_LEN], Vec<u8>)> {
    let nonce: [u8; NONCE_LEN] = random_bytes();
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key.as_ref()));
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .map_err(|e| SafeError::Crypto(format!("entry encryption failed: {e}")))?;
    Ok((nonce, ciphertext))
}

/// Open one sealed vault entry.
///
/// Fails with `Integrity` when the tag does not verify, either a wrong
/// passphrase or a tampered file.
pub fn open_entry(key: &VaultKey, nonce: &[u8; NONCE_LEN], ciphertext: &[u8]) -> Result<Vec<u8>> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key.as_ref()));
    cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| SafeError::Integrity("entry authentication failed".into()))
}
