//! BLAKE2b based key derivation.
//!
//! Every derived key is bound to a [`KdfPurpose`], a `(personal, salt)` pair.
//! Both parameters are UTF-8 strings of at most 8 bytes which are zero-padded
//! to the 16 bytes BLAKE2b expects.

use blake2b_simd::Params;

use crate::error::{CryptoError, Result};
use crate::key::RawKey;

/// Meaningful bytes of the BLAKE2b `personal` and `salt` parameters.
pub const PARAMETER_MAX_LENGTH: usize = 8;

/// Maximum BLAKE2b output and key length.
pub const BLAKE2B_MAX_LENGTH: usize = 64;

/// Domain separation parameters of a derivation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct KdfPurpose {
    pub personal: &'static str,
    pub salt: &'static str,
}

impl KdfPurpose {
    pub const fn new(personal: &'static str, salt: &'static str) -> Self {
        Self { personal, salt }
    }
}

pub mod purpose {
    use super::KdfPurpose;

    pub const CSP_PERSONAL: &str = "3ma-csp";
    pub const DEVICE_GROUP_PERSONAL: &str = "3ma-mdev";
    pub const CALL_PERSONAL: &str = "3ma-call";

    /// Vouch key proving possession of the client key to the chat server.
    pub const CSP_VOUCH: KdfPurpose = KdfPurpose::new(CSP_PERSONAL, "v2");
    /// Directory challenge-response key.
    pub const CSP_DIRECTORY: KdfPurpose = KdfPurpose::new(CSP_PERSONAL, "dir");
    /// Message metadata box key.
    pub const CSP_MESSAGE_METADATA: KdfPurpose = KdfPurpose::new(CSP_PERSONAL, "mm");

    pub const DEVICE_GROUP_PATH: KdfPurpose = KdfPurpose::new(DEVICE_GROUP_PERSONAL, "p");
    pub const DEVICE_GROUP_REFLECT: KdfPurpose = KdfPurpose::new(DEVICE_GROUP_PERSONAL, "r");
    pub const DEVICE_GROUP_DEVICE_INFO: KdfPurpose = KdfPurpose::new(DEVICE_GROUP_PERSONAL, "di");
    pub const DEVICE_GROUP_SHARED_DEVICE_DATA: KdfPurpose =
        KdfPurpose::new(DEVICE_GROUP_PERSONAL, "sdd");
    pub const DEVICE_GROUP_TRANSACTION_SCOPE: KdfPurpose =
        KdfPurpose::new(DEVICE_GROUP_PERSONAL, "ts");

    pub const CALL_ID: KdfPurpose = KdfPurpose::new(CALL_PERSONAL, "i");
    pub const CALL_KEY_HASH: KdfPurpose = KdfPurpose::new(CALL_PERSONAL, "#");
    pub const CALL_HANDSHAKE: KdfPurpose = KdfPurpose::new(CALL_PERSONAL, "h");
    pub const CALL_SFU: KdfPurpose = KdfPurpose::new(CALL_PERSONAL, "s");
    pub const CALL_NORMAL_HANDSHAKE_AUTH: KdfPurpose = KdfPurpose::new(CALL_PERSONAL, "nha");

    /// Every purpose in use. Purposes must never collide.
    pub const ALL: &[KdfPurpose] = &[
        CSP_VOUCH,
        CSP_DIRECTORY,
        CSP_MESSAGE_METADATA,
        DEVICE_GROUP_PATH,
        DEVICE_GROUP_REFLECT,
        DEVICE_GROUP_DEVICE_INFO,
        DEVICE_GROUP_SHARED_DEVICE_DATA,
        DEVICE_GROUP_TRANSACTION_SCOPE,
        CALL_ID,
        CALL_KEY_HASH,
        CALL_HANDSHAKE,
        CALL_SFU,
        CALL_NORMAL_HANDSHAKE_AUTH,
    ];
}

fn check_parameter(field: &'static str, value: &str) -> Result<()> {
    if value.len() > PARAMETER_MAX_LENGTH {
        return Err(CryptoError::ParameterTooLong {
            field,
            max: PARAMETER_MAX_LENGTH,
            actual: value.len(),
        });
    }
    Ok(())
}

/// Hash `inputs` with BLAKE2b into `N` bytes, optionally keyed.
pub fn hash<const N: usize>(
    key: Option<&[u8]>,
    purpose: &KdfPurpose,
    inputs: &[&[u8]],
) -> Result<[u8; N]> {
    if N == 0 || N > BLAKE2B_MAX_LENGTH {
        return Err(CryptoError::InvalidOutputLength(N));
    }
    check_parameter("personal", purpose.personal)?;
    check_parameter("salt", purpose.salt)?;

    let mut params = Params::new();
    params
        .hash_length(N)
        .personal(purpose.personal.as_bytes())
        .salt(purpose.salt.as_bytes());
    if let Some(key) = key {
        if key.len() > BLAKE2B_MAX_LENGTH {
            return Err(CryptoError::InvalidKeyLength {
                expected: BLAKE2B_MAX_LENGTH,
                actual: key.len(),
            });
        }
        params.key(key);
    }

    let mut state = params.to_state();
    for input in inputs {
        state.update(input);
    }
    let mut out = [0u8; N];
    out.copy_from_slice(state.finalize().as_bytes());
    Ok(out)
}

/// Derive an `N` byte key from `base` for a single purpose.
pub fn derive_key<const N: usize, const M: usize>(
    base: &RawKey<M>,
    purpose: &KdfPurpose,
) -> Result<RawKey<N>> {
    derive_key_with_input(base, purpose, &[])
}

/// Like [`derive_key`], binding additional public input into the derivation.
pub fn derive_key_with_input<const N: usize, const M: usize>(
    base: &RawKey<M>,
    purpose: &KdfPurpose,
    inputs: &[&[u8]],
) -> Result<RawKey<N>> {
    let mut out = hash::<N>(Some(base.expose()?), purpose, inputs)?;
    RawKey::take_from(&mut out)
}
