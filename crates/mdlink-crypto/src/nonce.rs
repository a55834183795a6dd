//! Replay protection for nonces.
//!
//! Nonces are never recorded in the clear. The service stores
//! `HMAC-SHA256(key = own identity, nonce)` per [`NonceScope`], so a leaked
//! record store reveals neither key material nor raw nonces.

use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use hmac::{Hmac, Mac};
use rand::RngCore;
use rand::rngs::OsRng;
use sha2::Sha256;

use crate::error::{CryptoError, Result};

type HmacSha256 = Hmac<Sha256>;

pub const NONCE_LENGTH: usize = 24;

pub type Nonce = [u8; NONCE_LENGTH];

/// Namespace a nonce is unique in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NonceScope {
    Csp,
    D2d,
}

impl fmt::Display for NonceScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NonceScope::Csp => f.write_str("csp"),
            NonceScope::D2d => f.write_str("d2d"),
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct NonceHash(pub [u8; 32]);

impl NonceHash {
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for NonceHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NonceHash({})", self.to_hex())
    }
}

/// Hash a nonce for storage.
pub fn hash_nonce(identity: &str, nonce: &Nonce) -> Result<NonceHash> {
    let mut mac =
        HmacSha256::new_from_slice(identity.as_bytes()).map_err(|_| CryptoError::InvalidKeyLength {
            expected: 64,
            actual: identity.len(),
        })?;
    mac.update(nonce);
    Ok(NonceHash(mac.finalize().into_bytes().into()))
}

/// Persistent record of used nonce hashes.
pub trait NonceStore: Send + Sync {
    fn contains(&self, scope: NonceScope, hash: &NonceHash) -> Result<bool>;
    fn insert(&self, scope: NonceScope, hash: NonceHash) -> Result<()>;
    fn all(&self, scope: NonceScope) -> Result<Vec<NonceHash>>;
}

/// In-memory [`NonceStore`].
#[derive(Default)]
pub struct MemoryNonceStore {
    hashes: Mutex<HashSet<(NonceScope, NonceHash)>>,
}

impl MemoryNonceStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl NonceStore for MemoryNonceStore {
    fn contains(&self, scope: NonceScope, hash: &NonceHash) -> Result<bool> {
        Ok(lock(&self.hashes).contains(&(scope, *hash)))
    }

    fn insert(&self, scope: NonceScope, hash: NonceHash) -> Result<()> {
        lock(&self.hashes).insert((scope, hash));
        Ok(())
    }

    fn all(&self, scope: NonceScope) -> Result<Vec<NonceHash>> {
        Ok(lock(&self.hashes)
            .iter()
            .filter(|(s, _)| *s == scope)
            .map(|(_, h)| *h)
            .collect())
    }
}

struct Registry {
    identity: String,
    store: Arc<dyn NonceStore>,
    in_flight: Mutex<HashSet<(NonceScope, NonceHash)>>,
}

impl Registry {
    fn release(&self, scope: NonceScope, hash: &NonceHash) {
        lock(&self.in_flight).remove(&(scope, *hash));
    }
}

/// Nonce bookkeeping for one identity.
///
/// A nonce is reserved by a [`NonceGuard`] while the message using it is
/// processed. The hash only becomes permanent once the guard is committed.
#[derive(Clone)]
pub struct NonceService {
    registry: Arc<Registry>,
}

impl NonceService {
    pub fn new(identity: impl Into<String>, store: Arc<dyn NonceStore>) -> Self {
        Self {
            registry: Arc::new(Registry {
                identity: identity.into(),
                store,
                in_flight: Mutex::new(HashSet::new()),
            }),
        }
    }

    /// Reserve `nonce`, failing if it was used or is in use.
    pub fn check_and_register(&self, scope: NonceScope, nonce: Nonce) -> Result<NonceGuard> {
        let hash = hash_nonce(&self.registry.identity, &nonce)?;
        if self.registry.store.contains(scope, &hash)? {
            tracing::warn!(%scope, hash = %hash.to_hex(), "nonce reuse detected");
            return Err(CryptoError::NonceReused(scope));
        }
        if !lock(&self.registry.in_flight).insert((scope, hash)) {
            tracing::warn!(%scope, hash = %hash.to_hex(), "nonce already in use");
            return Err(CryptoError::NonceReused(scope));
        }
        Ok(NonceGuard {
            scope,
            nonce,
            hash,
            processed: false,
            registry: Arc::clone(&self.registry),
        })
    }

    /// Generate and reserve a fresh random nonce.
    pub fn random_nonce(&self, scope: NonceScope) -> Result<NonceGuard> {
        let mut nonce = [0u8; NONCE_LENGTH];
        OsRng.fill_bytes(&mut nonce);
        self.check_and_register(scope, nonce)
    }

    pub fn all_persisted(&self, scope: NonceScope) -> Result<Vec<NonceHash>> {
        self.registry.store.all(scope)
    }

    /// Import hashes from another device. Returns how many were new.
    pub fn import(
        &self,
        scope: NonceScope,
        hashes: impl IntoIterator<Item = NonceHash>,
    ) -> Result<usize> {
        let mut imported = 0;
        for hash in hashes {
            if !self.registry.store.contains(scope, &hash)? {
                self.registry.store.insert(scope, hash)?;
                imported += 1;
            }
        }
        tracing::debug!(%scope, imported, "imported nonce hashes");
        Ok(imported)
    }
}

/// Reservation of a nonce. Must be either committed or discarded.
pub struct NonceGuard {
    scope: NonceScope,
    nonce: Nonce,
    hash: NonceHash,
    processed: bool,
    registry: Arc<Registry>,
}

impl NonceGuard {
    pub fn nonce(&self) -> &Nonce {
        &self.nonce
    }

    pub fn scope(&self) -> NonceScope {
        self.scope
    }

    pub fn hash(&self) -> &NonceHash {
        &self.hash
    }

    /// Persist the nonce hash. The nonce can never be used again.
    pub fn commit(mut self) -> Result<()> {
        self.processed = true;
        let result = self.registry.store.insert(self.scope, self.hash);
        self.registry.release(self.scope, &self.hash);
        result
    }

    /// Release the reservation without recording the nonce.
    pub fn discard(mut self) {
        self.processed = true;
        self.registry.release(self.scope, &self.hash);
    }
}

impl Drop for NonceGuard {
    fn drop(&mut self) {
        if !self.processed {
            tracing::error!(
                scope = %self.scope,
                hash = %self.hash.to_hex(),
                "nonce guard dropped without commit or discard"
            );
            self.registry.release(self.scope, &self.hash);
        }
    }
}

impl fmt::Debug for NonceGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NonceGuard")
            .field("scope", &self.scope)
            .field("hash", &self.hash)
            .field("processed", &self.processed)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service() -> NonceService {
        NonceService::new("ECHOECHO", Arc::new(MemoryNonceStore::new()))
    }

    fn sequential_nonce() -> Nonce {
        let mut nonce = [0u8; NONCE_LENGTH];
        for (i, b) in nonce.iter_mut().enumerate() {
            *b = i as u8;
        }
        nonce
    }

    #[test]
    fn hash_is_deterministic() {
        let nonce = sequential_nonce();
        let a = hash_nonce("ECHOECHO", &nonce).unwrap();
        let b = hash_nonce("ECHOECHO", &nonce).unwrap();
        assert_eq!(a, b);
        assert_eq!(
            a.to_hex(),
            "b6e30b6b79d591a6d1e0df00010dd9abc43591c8d701fc125b51f8648f0c98f0"
        );
        assert_ne!(a, hash_nonce("ECHOECHQ", &nonce).unwrap());
    }

    #[test]
    fn committed_nonce_is_rejected() {
        let nonces = service();
        let guard = nonces
            .check_and_register(NonceScope::Csp, sequential_nonce())
            .unwrap();
        guard.commit().unwrap();
        let err = nonces
            .check_and_register(NonceScope::Csp, sequential_nonce())
            .unwrap_err();
        assert!(matches!(err, CryptoError::NonceReused(NonceScope::Csp)));
        assert_eq!(nonces.all_persisted(NonceScope::Csp).unwrap().len(), 1);
    }

    #[test]
    fn scopes_are_independent() {
        let nonces = service();
        nonces
            .check_and_register(NonceScope::Csp, sequential_nonce())
            .unwrap()
            .commit()
            .unwrap();
        nonces
            .check_and_register(NonceScope::D2d, sequential_nonce())
            .unwrap()
            .commit()
            .unwrap();
    }

    #[test]
    fn in_flight_nonce_is_rejected_until_discarded() {
        let nonces = service();
        let guard = nonces
            .check_and_register(NonceScope::D2d, sequential_nonce())
            .unwrap();
        assert!(
            nonces
                .check_and_register(NonceScope::D2d, sequential_nonce())
                .is_err()
        );
        guard.discard();
        let again = nonces
            .check_and_register(NonceScope::D2d, sequential_nonce())
            .unwrap();
        again.discard();
        assert!(nonces.all_persisted(NonceScope::D2d).unwrap().is_empty());
    }

    #[test]
    fn dropped_guard_releases_reservation() {
        let nonces = service();
        drop(
            nonces
                .check_and_register(NonceScope::Csp, sequential_nonce())
                .unwrap(),
        );
        nonces
            .check_and_register(NonceScope::Csp, sequential_nonce())
            .unwrap()
            .discard();
    }

    #[test]
    fn import_skips_known_hashes() {
        let source = service();
        source.random_nonce(NonceScope::Csp).unwrap().commit().unwrap();
        source.random_nonce(NonceScope::Csp).unwrap().commit().unwrap();
        let hashes = source.all_persisted(NonceScope::Csp).unwrap();

        let target = service();
        assert_eq!(target.import(NonceScope::Csp, hashes.clone()).unwrap(), 2);
        assert_eq!(target.import(NonceScope::Csp, hashes).unwrap(), 0);
        assert_eq!(target.all_persisted(NonceScope::Csp).unwrap().len(), 2);
    }
}
