//! Layout of a node's state directory.
//!
//! ```text
//! <state dir>/
//!   config.toml          node configuration, optional
//!   device.json          identity, device id and device group key
//!   protocol-state.json  last mediator connection, profile distribution
//!   nonces.json          hashes of every nonce used or received
//! ```

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;

const DEFAULT_STATE_DIR: &str = ".local/state/mdlink";

pub const CONFIG_FILE: &str = "config.toml";
pub const DEVICE_FILE: &str = "device.json";
pub const PROTOCOL_STATE_FILE: &str = "protocol-state.json";
pub const NONCE_FILE: &str = "nonces.json";

#[derive(Debug, Clone)]
pub struct StateDir {
    root: PathBuf,
}

impl StateDir {
    /// `$MDLINK_STATE_DIR`, else `~/.local/state/mdlink`.
    pub fn default_path() -> Result<PathBuf> {
        if let Ok(dir) = std::env::var("MDLINK_STATE_DIR") {
            return Ok(PathBuf::from(dir));
        }
        let home = std::env::var("HOME").context("HOME env var not set")?;
        Ok(PathBuf::from(home).join(DEFAULT_STATE_DIR))
    }

    /// Open `root`, creating it if needed. On unix the directory is
    /// restricted to `0700` since it holds the device group key.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)
            .with_context(|| format!("failed to create state dir {}", root.display()))?;
        #[cfg(unix)]
        std::fs::set_permissions(&root, std::fs::Permissions::from_mode(0o700))
            .with_context(|| format!("failed to set state dir permissions {}", root.display()))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config_file(&self) -> PathBuf {
        self.root.join(CONFIG_FILE)
    }

    pub fn device_file(&self) -> PathBuf {
        self.root.join(DEVICE_FILE)
    }

    pub fn protocol_state_file(&self) -> PathBuf {
        self.root.join(PROTOCOL_STATE_FILE)
    }

    pub fn nonce_file(&self) -> PathBuf {
        self.root.join(NONCE_FILE)
    }
}

/// Replace `path` with `data` through a temporary file and a rename, so a
/// crash leaves either the old or the new content.
pub(crate) fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    std::fs::write(&tmp, data).with_context(|| format!("failed to write {}", tmp.display()))?;
    std::fs::rename(&tmp, path).with_context(|| format!("failed to replace {}", path.display()))
}
