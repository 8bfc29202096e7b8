//! Safehold - custodial identity and power-of-attorney node
//!
//! Safehold keeps user signing keys in an encrypted vault and signs
//! authorization actions on their behalf. Actions are submitted to a
//! network gateway; only actions the network confirms, delivered back in
//! ordered blocks, change authorization state or reach the durable log.
//!
//! ## Services
//!
//! - **Vault**: Argon2id/ChaCha20-Poly1305 encrypted store of custodial keys
//! - **Actions**: signed join/grant/revoke wire formats and the node envelope
//! - **Log**: append-only, hash-indexed record of confirmed actions
//! - **Registry**: in-memory who-may-act-for-whom state, rebuilt by replay
//! - **Node**: the single-writer loop serializing requests and block ingest
//! - **Gateway**: framed TCP link carrying submissions out and blocks in

pub mod actions;
pub mod config;
pub mod crypto;
pub mod gateway;
pub mod node;
pub mod registry;
pub mod sessions;
pub mod types;
pub mod vault;
pub mod wire;

pub use config::Args;
pub use node::{Node, NodeHandle, UserView};
pub use types::{Result, SafeError};
