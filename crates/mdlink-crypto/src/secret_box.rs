use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{Key, XChaCha20Poly1305, XNonce};
use rand::RngCore;
use rand::rngs::OsRng;
use x25519_dalek::{PublicKey, StaticSecret};

use crate::error::{CryptoError, Result};
use crate::kdf::{KdfPurpose, derive_key_with_input};
use crate::key::{KEY_LENGTH, RawKey};
use crate::nonce::{NONCE_LENGTH, Nonce, NonceGuard, NonceScope, NonceService};

pub const MAC_LENGTH: usize = 16;

fn cipher(key: &RawKey<KEY_LENGTH>) -> Result<XChaCha20Poly1305> {
    Ok(XChaCha20Poly1305::new(Key::from_slice(key.expose()?)))
}

/// Symmetric authenticated encryption with 24 byte nonces.
pub struct SecretBox {
    cipher: XChaCha20Poly1305,
}

impl SecretBox {
    pub fn new(key: &RawKey<KEY_LENGTH>) -> Result<Self> {
        Ok(Self {
            cipher: cipher(key)?,
        })
    }

    pub fn encrypt(&self, nonce: &Nonce, plaintext: &[u8]) -> Result<Vec<u8>> {
        self.cipher
            .encrypt(XNonce::from_slice(nonce), plaintext)
            .map_err(|_| CryptoError::Encryption)
    }

    pub fn decrypt(&self, nonce: &Nonce, ciphertext: &[u8]) -> Result<Vec<u8>> {
        self.cipher
            .decrypt(XNonce::from_slice(nonce), ciphertext)
            .map_err(|_| CryptoError::Decryption)
    }

    /// Encrypt with the guarded nonce and prepend it to the ciphertext.
    ///
    /// The guard is left untouched; commit it once the data was sent.
    pub fn encrypt_nonce_ahead(&self, guard: &NonceGuard, plaintext: &[u8]) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(NONCE_LENGTH + plaintext.len() + MAC_LENGTH);
        out.extend_from_slice(guard.nonce());
        out.extend_from_slice(&self.encrypt(guard.nonce(), plaintext)?);
        Ok(out)
    }

    /// Decrypt `nonce || ciphertext`, reserving the nonce in `scope`.
    ///
    /// A reused nonce fails with [`CryptoError::NonceReused`]. On success the
    /// caller owns the guard and commits it once the plaintext was processed.
    pub fn decrypt_nonce_ahead(
        &self,
        nonces: &NonceService,
        scope: NonceScope,
        data: &[u8],
    ) -> Result<(Vec<u8>, NonceGuard)> {
        let (nonce, ciphertext) = split_nonce_ahead(data)?;
        let guard = nonces.check_and_register(scope, nonce)?;
        match self.decrypt(&nonce, ciphertext) {
            Ok(plaintext) => Ok((plaintext, guard)),
            Err(err) => {
                guard.discard();
                Err(err)
            }
        }
    }

    /// Encrypt with a random nonce that is not tracked for reuse.
    pub fn encrypt_random_nonce_ahead(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let mut nonce = [0u8; NONCE_LENGTH];
        OsRng.fill_bytes(&mut nonce);
        let mut out = nonce.to_vec();
        out.extend_from_slice(&self.encrypt(&nonce, plaintext)?);
        Ok(out)
    }

    pub fn decrypt_unguarded_nonce_ahead(&self, data: &[u8]) -> Result<Vec<u8>> {
        let (nonce, ciphertext) = split_nonce_ahead(data)?;
        self.decrypt(&nonce, ciphertext)
    }
}

fn split_nonce_ahead(data: &[u8]) -> Result<(Nonce, &[u8])> {
    if data.len() < NONCE_LENGTH + MAC_LENGTH {
        return Err(CryptoError::CiphertextTooShort(data.len()));
    }
    let (nonce, ciphertext) = data.split_at(NONCE_LENGTH);
    let mut out = [0u8; NONCE_LENGTH];
    out.copy_from_slice(nonce);
    Ok((out, ciphertext))
}

/// Holder of an X25519 secret key.
///
/// The secret is kept encrypted under a random in-memory key and only
/// decrypted for the duration of a single Diffie-Hellman computation.
pub struct SharedBoxFactory {
    public_key: [u8; KEY_LENGTH],
    wrapper: XChaCha20Poly1305,
    wrap_nonce: Nonce,
    wrapped_secret: Vec<u8>,
}

impl SharedBoxFactory {
    /// Take ownership of `secret`. The passed key is purged.
    pub fn consume(mut secret: RawKey<KEY_LENGTH>) -> Result<Self> {
        let bytes = secret.expose()?;
        let public_key = PublicKey::from(&StaticSecret::from(*bytes)).to_bytes();

        let wrapping_key = RawKey::<KEY_LENGTH>::random();
        let wrapper = cipher(&wrapping_key)?;
        let mut wrap_nonce = [0u8; NONCE_LENGTH];
        OsRng.fill_bytes(&mut wrap_nonce);
        let wrapped_secret = wrapper
            .encrypt(XNonce::from_slice(&wrap_nonce), bytes.as_slice())
            .map_err(|_| CryptoError::Encryption)?;
        secret.purge();

        Ok(Self {
            public_key,
            wrapper,
            wrap_nonce,
            wrapped_secret,
        })
    }

    pub fn public_key(&self) -> &[u8; KEY_LENGTH] {
        &self.public_key
    }

    fn unwrap_secret(&self) -> Result<StaticSecret> {
        let mut bytes = self
            .wrapper
            .decrypt(XNonce::from_slice(&self.wrap_nonce), self.wrapped_secret.as_slice())
            .map_err(|_| CryptoError::Decryption)?;
        let key = RawKey::<KEY_LENGTH>::take_from(&mut bytes)?;
        Ok(StaticSecret::from(*key.expose()?))
    }

    /// Raw X25519 shared secret with `peer`. Purge it after use.
    pub fn shared_secret(&self, peer: &[u8; KEY_LENGTH]) -> Result<RawKey<KEY_LENGTH>> {
        let secret = self.unwrap_secret()?;
        let shared = secret.diffie_hellman(&PublicKey::from(*peer));
        Ok(RawKey::new(*shared.as_bytes()))
    }

    /// Derive a key from the shared secret with `peer`, purging the secret.
    pub fn derive_shared_key(
        &self,
        peer: &[u8; KEY_LENGTH],
        purpose: &KdfPurpose,
        inputs: &[&[u8]],
    ) -> Result<RawKey<KEY_LENGTH>> {
        let mut shared = self.shared_secret(peer)?;
        let key = derive_key_with_input(&shared, purpose, inputs);
        shared.purge();
        key
    }

    pub fn shared_box(&self, peer: &[u8; KEY_LENGTH], purpose: &KdfPurpose) -> Result<SecretBox> {
        SecretBox::new(&self.derive_shared_key(peer, purpose, &[])?)
    }
}
