//! Common error and result types for safehold.

use thiserror::Error;

/// Errors surfaced by the safehold node.
///
/// `Config`, `Integrity`, `CorruptLog` and `Io` during store open are fatal
/// at startup. Everything else is recovered locally and reported to the
/// caller as a typed failure.
#[derive(Debug, Error)]
pub enum SafeError {
    /// Bad passphrase material, unreadable paths, invalid startup settings.
    #[error("configuration error: {0}")]
    Config(String),

    /// The vault failed authenticated decryption.
    #[error("vault integrity failure: {0}")]
    Integrity(String),

    /// The action log cannot be scanned into a consistent frame table.
    #[error("corrupt action log: {0}")]
    CorruptLog(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("handle already in use: {0}")]
    DuplicateHandle(String),

    #[error("unknown handle: {0}")]
    NotFound(String),

    /// Malformed token encoding (wrong length or non-hex characters).
    #[error("invalid token: {0}")]
    InvalidToken(String),

    #[error("payload too large: {0} bytes exceeds frame limit")]
    PayloadTooLarge(usize),

    #[error("short write: wrote {wrote} of {expected} bytes")]
    ShortWrite { wrote: usize, expected: usize },

    /// The outbound gateway refused or dropped a submission.
    #[error("gateway send failure: {0}")]
    SendFailure(String),

    #[error("crypto failure: {0}")]
    Crypto(String),
}

pub type Result<T> = std::result::Result<T, SafeError>;
