use thiserror::Error;

use crate::nonce::NonceScope;

#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("invalid key length: expected {expected} bytes, got {actual}")]
    InvalidKeyLength { expected: usize, actual: usize },

    #[error("cannot use key, it has been purged")]
    KeyPurged,

    #[error("blake2b '{field}' too long: {actual} bytes (max {max})")]
    ParameterTooLong {
        field: &'static str,
        max: usize,
        actual: usize,
    },

    #[error("invalid blake2b output length: {0}")]
    InvalidOutputLength(usize),

    #[error("encryption failed")]
    Encryption,

    #[error("decryption failed")]
    Decryption,

    #[error("ciphertext too short: {0} bytes")]
    CiphertextTooShort(usize),

    #[error("nonce reused in scope {0}")]
    NonceReused(NonceScope),

    #[error("{0} counter exhausted")]
    CounterExhausted(&'static str),

    #[error("nonce requested after the last chunk")]
    LastChunkReached,

    #[error("nonce store: {0}")]
    Store(String),
}

pub type Result<T> = std::result::Result<T, CryptoError>;
