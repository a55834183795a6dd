use std::fmt;

use rand::RngCore;
use rand::rngs::OsRng;
use zeroize::Zeroize;

use crate::error::{CryptoError, Result};

/// Length of a symmetric key or an X25519 secret key.
pub const KEY_LENGTH: usize = 32;

/// Secret key material that can be purged.
///
/// Once purged, the bytes are zeroed and every access fails with
/// [`CryptoError::KeyPurged`] instead of handing out zeroes.
/// The bytes are also zeroed when the key is dropped.
pub struct RawKey<const N: usize = KEY_LENGTH> {
    bytes: [u8; N],
    purged: bool,
}

impl<const N: usize> RawKey<N> {
    pub fn new(bytes: [u8; N]) -> Self {
        Self {
            bytes,
            purged: false,
        }
    }

    /// Copy key material from a slice.
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let bytes: [u8; N] = bytes
            .try_into()
            .map_err(|_| CryptoError::InvalidKeyLength {
                expected: N,
                actual: bytes.len(),
            })?;
        Ok(Self::new(bytes))
    }

    /// Take key material out of a buffer and zero the buffer.
    pub fn take_from(buffer: &mut [u8]) -> Result<Self> {
        let key = Self::from_slice(buffer);
        buffer.zeroize();
        key
    }

    pub fn random() -> Self {
        let mut bytes = [0u8; N];
        OsRng.fill_bytes(&mut bytes);
        Self::new(bytes)
    }

    /// Access the key bytes.
    pub fn expose(&self) -> Result<&[u8; N]> {
        if self.purged {
            return Err(CryptoError::KeyPurged);
        }
        Ok(&self.bytes)
    }

    /// Overwrite the key bytes. Any later access fails.
    pub fn purge(&mut self) {
        self.bytes.zeroize();
        self.purged = true;
    }

    pub fn is_purged(&self) -> bool {
        self.purged
    }
}

impl<const N: usize> Drop for RawKey<N> {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

impl<const N: usize> fmt::Debug for RawKey<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.purged {
            write!(f, "RawKey<{N}>(purged)")
        } else {
            write!(f, "RawKey<{N}>(redacted)")
        }
    }
}
