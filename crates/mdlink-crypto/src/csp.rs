//! Chat server protocol key derivations.

use zeroize::Zeroizing;

use crate::error::Result;
use crate::kdf::{derive_key, purpose};
use crate::key::{KEY_LENGTH, RawKey};
use crate::secret_box::{SecretBox, SharedBoxFactory};

/// Derive the vouch key from the client key and both server keys.
///
/// `VouchKey = BLAKE2b(key = SS1 || SS2, salt = "v2", personal = "3ma-csp")`
/// where SS1 is the shared secret with the server's permanent key and SS2 the
/// one with its temporary key. Both secrets and their concatenation are purged
/// before returning.
pub fn derive_vouch_key(
    client_key: &SharedBoxFactory,
    server_permanent_key: &[u8; KEY_LENGTH],
    server_temporary_key: &[u8; KEY_LENGTH],
) -> Result<RawKey<KEY_LENGTH>> {
    let mut ss1 = client_key.shared_secret(server_permanent_key)?;
    let mut ss2 = client_key.shared_secret(server_temporary_key)?;
    let concatenated = concat_secrets(&ss1, &ss2);
    ss1.purge();
    ss2.purge();

    let mut base = concatenated?;
    let vouch_key = derive_key(&base, &purpose::CSP_VOUCH);
    base.purge();
    vouch_key
}

fn concat_secrets(
    first: &RawKey<KEY_LENGTH>,
    second: &RawKey<KEY_LENGTH>,
) -> Result<RawKey<64>> {
    let mut buffer = Zeroizing::new([0u8; 64]);
    buffer[..KEY_LENGTH].copy_from_slice(first.expose()?);
    buffer[KEY_LENGTH..].copy_from_slice(second.expose()?);
    RawKey::take_from(buffer.as_mut_slice())
}

/// Key of the directory challenge-response box towards `peer`.
pub fn directory_challenge_box(
    client_key: &SharedBoxFactory,
    peer: &[u8; KEY_LENGTH],
) -> Result<SecretBox> {
    client_key.shared_box(peer, &purpose::CSP_DIRECTORY)
}

/// Key of the message metadata box towards `peer`.
pub fn message_metadata_box(
    client_key: &SharedBoxFactory,
    peer: &[u8; KEY_LENGTH],
) -> Result<SecretBox> {
    client_key.shared_box(peer, &purpose::CSP_MESSAGE_METADATA)
}

#[cfg(test)]
mod tests {
    use x25519_dalek::{PublicKey, StaticSecret};

    use super::*;

    fn public(secret: [u8; 32]) -> [u8; 32] {
        PublicKey::from(&StaticSecret::from(secret)).to_bytes()
    }

    #[test]
    fn vouch_key_is_derived_from_both_shared_secrets() {
        let client = SharedBoxFactory::consume(RawKey::new([1; 32])).unwrap();
        let permanent = public([2; 32]);
        let temporary = public([3; 32]);

        let vouch = derive_vouch_key(&client, &permanent, &temporary).unwrap();

        let ss1 = client.shared_secret(&permanent).unwrap();
        let ss2 = client.shared_secret(&temporary).unwrap();
        let mut base = [0u8; 64];
        base[..32].copy_from_slice(ss1.expose().unwrap());
        base[32..].copy_from_slice(ss2.expose().unwrap());
        let expected: RawKey<32> = derive_key(&RawKey::new(base), &purpose::CSP_VOUCH).unwrap();
        assert_eq!(vouch.expose().unwrap(), expected.expose().unwrap());

        let swapped = derive_vouch_key(&client, &temporary, &permanent).unwrap();
        assert_ne!(vouch.expose().unwrap(), swapped.expose().unwrap());
    }

    #[test]
    fn directory_and_metadata_keys_differ() {
        let client = SharedBoxFactory::consume(RawKey::new([1; 32])).unwrap();
        let server = SharedBoxFactory::consume(RawKey::new([2; 32])).unwrap();
        let directory = directory_challenge_box(&client, server.public_key()).unwrap();
        let metadata = message_metadata_box(&server, client.public_key()).unwrap();
        let sealed = directory.encrypt_random_nonce_ahead(b"challenge").unwrap();
        assert!(metadata.decrypt_unguarded_nonce_ahead(&sealed).is_err());
    }
}
