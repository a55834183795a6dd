use std::path::Path;

use anyhow::{Context, Result};
use mdlink_crypto::RawKey;
use mdlink_crypto::device_group::{DeviceGroupKeys, derive_device_group_keys};
use mdlink_protocol::{DeviceId, IdentityString};
use serde::Deserialize;
use zeroize::Zeroizing;

/// Credentials of this device, provisioned when it was linked.
#[derive(Deserialize)]
pub struct DeviceCredentials {
    pub identity: String,
    pub device_id: u64,
    /// Device group key, hex.
    device_group_key: String,
}

impl DeviceCredentials {
    pub fn load(path: &Path) -> Result<Self> {
        let data = Zeroizing::new(
            std::fs::read_to_string(path)
                .with_context(|| format!("failed to read {}", path.display()))?,
        );
        serde_json::from_str(&data).with_context(|| format!("failed to parse {}", path.display()))
    }

    pub fn identity(&self) -> Result<IdentityString> {
        self.identity
            .parse()
            .with_context(|| format!("invalid identity {:?}", self.identity))
    }

    pub fn device_id(&self) -> DeviceId {
        DeviceId(self.device_id)
    }

    /// Derive the device group keys. The device group key itself is purged
    /// once the sub-keys exist.
    pub fn keys(&self) -> Result<DeviceGroupKeys> {
        let bytes = Zeroizing::new(
            hex::decode(&self.device_group_key).context("device group key is not hex")?,
        );
        let dgk = RawKey::from_slice(&bytes).context("device group key must be 32 bytes")?;
        derive_device_group_keys(dgk).context("failed to derive device group keys")
    }
}

impl Drop for DeviceCredentials {
    fn drop(&mut self) {
        zeroize::Zeroize::zeroize(&mut self.device_group_key);
    }
}

#[cfg(test)]
mod tests {
    use mdlink_tasks::state_dir::{DEVICE_FILE, StateDir};

    use super::*;

    fn write(state: &StateDir, json: &str) {
        std::fs::write(state.device_file(), json).unwrap();
    }

    #[test]
    fn loads_credentials() {
        let dir = tempfile::tempdir().unwrap();
        let state = StateDir::open(dir.path()).unwrap();
        write(
            &state,
            &format!(
                r#"{{"identity":"ABCD1234","device_id":257,"device_group_key":"{}"}}"#,
                "42".repeat(32)
            ),
        );
        let credentials = DeviceCredentials::load(&state.device_file()).unwrap();
        assert_eq!(credentials.identity().unwrap().as_str(), "ABCD1234");
        assert_eq!(credentials.device_id(), DeviceId(257));
        assert!(credentials.keys().is_ok());
    }

    #[test]
    fn rejects_short_key() {
        let dir = tempfile::tempdir().unwrap();
        let state = StateDir::open(dir.path()).unwrap();
        write(
            &state,
            r#"{"identity":"ABCD1234","device_id":1,"device_group_key":"0011"}"#,
        );
        let credentials = DeviceCredentials::load(&state.device_file()).unwrap();
        assert!(credentials.keys().is_err());
    }

    #[test]
    fn missing_file_names_path() {
        let dir = tempfile::tempdir().unwrap();
        let err = DeviceCredentials::load(&dir.path().join(DEVICE_FILE))
            .err()
            .unwrap();
        assert!(format!("{err:#}").contains(DEVICE_FILE));
    }
}
