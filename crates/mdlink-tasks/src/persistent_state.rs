//! Protocol state that must survive a restart.
//!
//! Stored as JSON in the state directory. Entries of the profile picture
//! distribution cache expire after seven days and are dropped whenever the
//! state is loaded or touched.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use anyhow::{Context, Result};
use mdlink_protocol::IdentityString;
use serde::{Deserialize, Serialize};

use crate::state_dir::write_atomic;

/// Lifetime of a profile picture distribution entry.
pub const PROFILE_DISTRIBUTION_EXPIRY_MS: u64 = 7 * 24 * 60 * 60 * 1000;

/// What was last sent to a contact about the user's profile picture.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProfileDistribution {
    ProfilePicture {
        #[serde(with = "hex_bytes")]
        blob_id: Vec<u8>,
    },
    Removed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ProfileDistributionEntry {
    receiver: IdentityString,
    value: ProfileDistribution,
    created_at_ms: u64,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StateFile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    last_mediator_connection_ms: Option<u64>,
    #[serde(default)]
    profile_distribution: Vec<ProfileDistributionEntry>,
}

impl StateFile {
    /// Drop expired entries and duplicate receivers, keeping the newest.
    fn clean(&mut self, now_ms: u64) -> bool {
        let before = self.profile_distribution.len();
        let mut newest: BTreeMap<IdentityString, ProfileDistributionEntry> = BTreeMap::new();
        for entry in self.profile_distribution.drain(..) {
            if now_ms.saturating_sub(entry.created_at_ms) >= PROFILE_DISTRIBUTION_EXPIRY_MS {
                continue;
            }
            match newest.get(&entry.receiver) {
                Some(existing) if existing.created_at_ms >= entry.created_at_ms => {
                    tracing::warn!(receiver = %entry.receiver, "duplicate profile distribution entry");
                }
                Some(_) => {
                    tracing::warn!(receiver = %entry.receiver, "duplicate profile distribution entry");
                    newest.insert(entry.receiver.clone(), entry);
                }
                None => {
                    newest.insert(entry.receiver.clone(), entry);
                }
            }
        }
        self.profile_distribution = newest.into_values().collect();
        self.profile_distribution.len() != before
    }
}

pub struct PersistentProtocolState {
    path: Option<PathBuf>,
    file: Mutex<StateFile>,
}

impl PersistentProtocolState {
    /// State that is never written to disk.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            file: Mutex::new(StateFile::default()),
        }
    }

    /// Load the state from `path`, starting empty if there is none yet.
    pub fn load(path: &Path, now_ms: u64) -> Result<Self> {
        let mut file = if path.exists() {
            let data = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            serde_json::from_str(&data)
                .with_context(|| format!("failed to parse {}", path.display()))?
        } else {
            StateFile::default()
        };
        let cleaned = file.clean(now_ms);
        let state = Self {
            path: Some(path.to_path_buf()),
            file: Mutex::new(file),
        };
        if cleaned {
            state.save(&state.file())?;
        }
        Ok(state)
    }

    fn file(&self) -> MutexGuard<'_, StateFile> {
        self.file.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn save(&self, file: &StateFile) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let data = serde_json::to_vec_pretty(file)?;
        write_atomic(path, &data)
    }

    pub fn last_mediator_connection(&self) -> Option<u64> {
        self.file().last_mediator_connection_ms
    }

    pub fn set_last_mediator_connection(&self, at_ms: u64) -> Result<()> {
        let mut file = self.file();
        file.last_mediator_connection_ms = Some(at_ms);
        self.save(&file)
    }

    /// Last distribution towards `receiver`, unless it expired.
    pub fn last_profile_distribution(
        &self,
        receiver: &IdentityString,
        now_ms: u64,
    ) -> Option<ProfileDistribution> {
        let mut file = self.file();
        if file.clean(now_ms) {
            if let Err(err) = self.save(&file) {
                tracing::warn!(error = %err, "failed to save cleaned protocol state");
            }
        }
        file.profile_distribution
            .iter()
            .find(|entry| &entry.receiver == receiver)
            .map(|entry| entry.value.clone())
    }

    pub fn set_last_profile_distribution(
        &self,
        receiver: &IdentityString,
        value: ProfileDistribution,
        now_ms: u64,
    ) -> Result<()> {
        let mut file = self.file();
        file.profile_distribution
            .retain(|entry| &entry.receiver != receiver);
        file.profile_distribution.push(ProfileDistributionEntry {
            receiver: receiver.clone(),
            value,
            created_at_ms: now_ms,
        });
        file.clean(now_ms);
        self.save(&file)
    }
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        hex::decode(s).map_err(serde::de::Error::custom)
    }
}
