pub mod csp;
pub mod device_group;
pub mod error;
pub mod file_nonce;
pub mod group_call;
pub mod kdf;
pub mod key;
pub mod nonce;
pub mod secret_box;

pub use error::{CryptoError, Result};
pub use kdf::{KdfPurpose, derive_key, hash};
pub use key::{KEY_LENGTH, RawKey};
pub use nonce::{MemoryNonceStore, NONCE_LENGTH, NonceGuard, NonceHash, NonceScope, NonceService, NonceStore};
pub use secret_box::{SecretBox, SharedBoxFactory};
