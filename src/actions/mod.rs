//! Signed authorization actions and their durable, hash-indexed log.

pub mod envelope;
pub mod kinds;
pub mod log;

pub use envelope::{Envelope, ACTION_MESSAGE};
pub use kinds::{
    epoch_mark, parse_epoch_mark, token_indexer, Action, GrantPower, JoinNetwork, RevokePower,
    EPOCH_MARK_KIND, GRANT_KIND, JOIN_KIND, MAX_FINGERPRINT, REVOKE_KIND,
};
pub use log::{ActionLog, Indexer, MAX_PAYLOAD};
