//! Configuration for the safehold node.
//!
//! CLI arguments and environment variable handling using clap.

use clap::Parser;
use std::path::PathBuf;

/// Safehold - custodial identity and power-of-attorney node
#[derive(Parser, Debug, Clone)]
#[command(name = "safehold")]
#[command(about = "Custodial key vault and power-of-attorney service")]
pub struct Args {
    /// Path to the encrypted user vault
    #[arg(long, env = "VAULT_PATH", default_value = "safehold.vault")]
    pub vault_path: PathBuf,

    /// Path to the confirmed action log
    #[arg(long, env = "ACTIONS_PATH", default_value = "safehold.actions")]
    pub actions_path: PathBuf,

    /// Address of the network gateway providing the ordered block stream
    #[arg(long, env = "GATEWAY_ADDR", default_value = "localhost:7100")]
    pub gateway_addr: String,

    /// Passphrase protecting the vault at rest
    #[arg(long, env = "VAULT_PASSPHRASE")]
    pub passphrase: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

impl Args {
    pub fn validate(&self) -> Result<(), String> {
        if self.passphrase.is_empty() {
            return Err("VAULT_PASSPHRASE must not be empty".to_string());
        }

        if self.gateway_addr.is_empty() {
            return Err("GATEWAY_ADDR must not be empty".to_string());
        }

        Ok(())
    }
}
