use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct NodeConfig {
    /// Mediator address, `host:port`.
    #[serde(default = "default_mediator")]
    pub mediator: String,
    /// Largest accepted frame in bytes, excluding the length prefix.
    #[serde(default = "default_max_frame_length")]
    pub max_frame_length: usize,
    /// Outbound messages buffered before tasks have to wait.
    #[serde(default = "default_outbound_capacity")]
    pub outbound_capacity: usize,
    /// Events remembered by the distribution ledger.
    #[serde(default = "default_ledger_capacity")]
    pub distribution_ledger_capacity: usize,
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,
    /// Send read receipts to contacts.
    #[serde(default = "default_true")]
    pub read_receipts: bool,
    /// Send typing indicators to contacts.
    #[serde(default = "default_true")]
    pub typing_indicators: bool,
}

impl NodeConfig {
    /// Load the config at `path`, falling back to defaults if there is none.
    pub fn load(path: &Path) -> Result<Self> {
        if path.exists() {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            toml::from_str(&contents).with_context(|| format!("failed to parse {}", path.display()))
        } else {
            Ok(Self::default())
        }
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            mediator: default_mediator(),
            max_frame_length: default_max_frame_length(),
            outbound_capacity: default_outbound_capacity(),
            distribution_ledger_capacity: default_ledger_capacity(),
            reconnect_delay_ms: default_reconnect_delay_ms(),
            read_receipts: true,
            typing_indicators: true,
        }
    }
}

fn default_mediator() -> String {
    "127.0.0.1:4430".to_string()
}

fn default_max_frame_length() -> usize {
    64 * 1024
}

fn default_outbound_capacity() -> usize {
    256
}

fn default_ledger_capacity() -> usize {
    crate::dispatch::DEFAULT_LEDGER_CAPACITY
}

fn default_reconnect_delay_ms() -> u64 {
    5_000
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state_dir::StateDir;

    #[test]
    fn missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let state = StateDir::open(dir.path()).unwrap();
        assert_eq!(NodeConfig::load(&state.config_file()).unwrap(), NodeConfig::default());
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let state = StateDir::open(dir.path()).unwrap();
        std::fs::write(
            state.config_file(),
            "mediator = \"mediator.example:443\"\nread_receipts = false\n",
        )
        .unwrap();
        let config = NodeConfig::load(&state.config_file()).unwrap();
        assert_eq!(config.mediator, "mediator.example:443");
        assert!(!config.read_receipts);
        assert_eq!(config.max_frame_length, 64 * 1024);
        assert!(config.typing_indicators);
    }

    #[test]
    fn invalid_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let state = StateDir::open(dir.path()).unwrap();
        std::fs::write(state.config_file(), "max_frame_length = \"big\"").unwrap();
        let err = NodeConfig::load(&state.config_file()).unwrap_err();
        assert!(format!("{err:#}").contains("config.toml"));
    }
}
