//! Nonce hashes kept in the state directory, so that replay protection
//! survives a restart.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use anyhow::{Context, Result};
use mdlink_crypto::{CryptoError, NonceHash, NonceScope, NonceStore};
use serde::{Deserialize, Serialize};

use crate::state_dir::write_atomic;

/// Hex encoded hashes per scope.
#[derive(Debug, Default, Serialize, Deserialize)]
struct NonceFile {
    #[serde(default)]
    csp: BTreeSet<String>,
    #[serde(default)]
    d2d: BTreeSet<String>,
}

impl NonceFile {
    fn scope(&self, scope: NonceScope) -> &BTreeSet<String> {
        match scope {
            NonceScope::Csp => &self.csp,
            NonceScope::D2d => &self.d2d,
        }
    }

    fn scope_mut(&mut self, scope: NonceScope) -> &mut BTreeSet<String> {
        match scope {
            NonceScope::Csp => &mut self.csp,
            NonceScope::D2d => &mut self.d2d,
        }
    }
}

fn decode_hash(value: &str) -> Option<NonceHash> {
    let bytes = hex::decode(value).ok()?;
    Some(NonceHash(bytes.try_into().ok()?))
}

/// [`NonceStore`] backed by a JSON file. Every insert rewrites the file
/// before it returns.
pub struct FileNonceStore {
    path: PathBuf,
    file: Mutex<NonceFile>,
}

impl FileNonceStore {
    /// Load the hashes at `path`, starting empty if there is no file yet.
    pub fn load(path: &Path) -> Result<Self> {
        let file: NonceFile = if path.exists() {
            let data = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            serde_json::from_str(&data)
                .with_context(|| format!("failed to parse {}", path.display()))?
        } else {
            NonceFile::default()
        };
        if let Some(bad) = file.csp.iter().chain(&file.d2d).find(|h| decode_hash(h).is_none()) {
            anyhow::bail!("invalid nonce hash {bad:?} in {}", path.display());
        }
        tracing::debug!(csp = file.csp.len(), d2d = file.d2d.len(), "loaded nonce hashes");
        Ok(Self {
            path: path.to_path_buf(),
            file: Mutex::new(file),
        })
    }

    fn file(&self) -> MutexGuard<'_, NonceFile> {
        self.file.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn save(&self, file: &NonceFile) -> Result<()> {
        let data = serde_json::to_vec(file)?;
        write_atomic(&self.path, &data)
    }
}

impl NonceStore for FileNonceStore {
    fn contains(&self, scope: NonceScope, hash: &NonceHash) -> mdlink_crypto::Result<bool> {
        Ok(self.file().scope(scope).contains(&hash.to_hex()))
    }

    fn insert(&self, scope: NonceScope, hash: NonceHash) -> mdlink_crypto::Result<()> {
        let key = hash.to_hex();
        let mut file = self.file();
        if !file.scope_mut(scope).insert(key.clone()) {
            return Ok(());
        }
        if let Err(err) = self.save(&file) {
            file.scope_mut(scope).remove(&key);
            return Err(CryptoError::Store(format!("{err:#}")));
        }
        Ok(())
    }

    fn all(&self, scope: NonceScope) -> mdlink_crypto::Result<Vec<NonceHash>> {
        self.file()
            .scope(scope)
            .iter()
            .map(|value| {
                decode_hash(value)
                    .ok_or_else(|| CryptoError::Store(format!("invalid nonce hash {value:?}")))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use mdlink_crypto::NonceService;

    use super::*;
    use crate::state_dir::NONCE_FILE;

    const NONCE: [u8; 24] = [7; 24];

    #[test]
    fn committed_nonce_is_rejected_after_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(NONCE_FILE);

        let store = Arc::new(FileNonceStore::load(&path).unwrap());
        let nonces = NonceService::new("ECHOECHO", store);
        nonces
            .check_and_register(NonceScope::Csp, NONCE)
            .unwrap()
            .commit()
            .unwrap();
        nonces
            .check_and_register(NonceScope::D2d, [8; 24])
            .unwrap()
            .discard();
        drop(nonces);

        let nonces = NonceService::new("ECHOECHO", Arc::new(FileNonceStore::load(&path).unwrap()));
        assert!(matches!(
            nonces.check_and_register(NonceScope::Csp, NONCE),
            Err(CryptoError::NonceReused(NonceScope::Csp))
        ));
        assert_eq!(nonces.all_persisted(NonceScope::Csp).unwrap().len(), 1);
        // Discarded and other-scope nonces stay usable.
        nonces
            .check_and_register(NonceScope::D2d, [8; 24])
            .unwrap()
            .discard();
        nonces
            .check_and_register(NonceScope::D2d, NONCE)
            .unwrap()
            .discard();
    }

    #[test]
    fn duplicate_insert_keeps_one_entry() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(NONCE_FILE);
        let store = FileNonceStore::load(&path).unwrap();
        let hash = NonceHash([1; 32]);
        store.insert(NonceScope::D2d, hash).unwrap();
        store.insert(NonceScope::D2d, hash).unwrap();
        assert_eq!(store.all(NonceScope::D2d).unwrap(), vec![hash]);
        assert!(store.all(NonceScope::Csp).unwrap().is_empty());

        let saved: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(saved["d2d"][0], hash.to_hex());
    }

    #[test]
    fn corrupt_hash_fails_to_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(NONCE_FILE);
        std::fs::write(&path, r#"{"csp":["zz"]}"#).unwrap();
        let err = FileNonceStore::load(&path).err().unwrap();
        assert!(format!("{err:#}").contains("invalid nonce hash"));
    }

    #[test]
    fn failed_write_is_not_remembered() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing").join(NONCE_FILE);
        let store = FileNonceStore::load(&path).unwrap();
        let hash = NonceHash([2; 32]);
        assert!(matches!(
            store.insert(NonceScope::Csp, hash),
            Err(CryptoError::Store(_))
        ));
        assert!(!store.contains(NonceScope::Csp, &hash).unwrap());
    }
}
