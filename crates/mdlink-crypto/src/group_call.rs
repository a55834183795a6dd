//! Group call key derivations based on the group call key (GCK).

use crate::error::Result;
use crate::kdf::{derive_key, hash, purpose};
use crate::key::{KEY_LENGTH, RawKey};
use crate::secret_box::{SecretBox, SharedBoxFactory};

pub const GROUP_CALL_PROTOCOL_VERSION: u8 = 1;

/// Public parameters of a group call.
#[derive(Debug, Clone)]
pub struct GroupCallParameters<'a> {
    pub creator_identity: &'a str,
    pub group_id: u64,
    pub protocol_version: u8,
    pub sfu_base_url: &'a str,
}

pub struct GroupCallKeys {
    pub call_id: [u8; 32],
    /// Group call key hash (GCKH).
    pub key_hash: [u8; 32],
    /// Group call handshake key (GCHK).
    pub handshake: SecretBox,
    /// Group call SFU token key (GCSK).
    pub sfu: SecretBox,
}

/// Derive the call id and keys of a group call.
pub fn derive_group_call_keys(
    gck: &RawKey<KEY_LENGTH>,
    params: &GroupCallParameters<'_>,
) -> Result<GroupCallKeys> {
    let gck_bytes = gck.expose()?;
    let call_id = hash::<32>(
        None,
        &purpose::CALL_ID,
        &[
            params.creator_identity.as_bytes(),
            &params.group_id.to_le_bytes(),
            &[params.protocol_version],
            gck_bytes,
            params.sfu_base_url.as_bytes(),
        ],
    )?;
    let key_hash = hash::<32>(Some(gck_bytes), &purpose::CALL_KEY_HASH, &[])?;
    let handshake = SecretBox::new(&derive_key(gck, &purpose::CALL_HANDSHAKE)?)?;
    let sfu = SecretBox::new(&derive_key(gck, &purpose::CALL_SFU)?)?;
    Ok(GroupCallKeys {
        call_id,
        key_hash,
        handshake,
        sfu,
    })
}

/// Normal handshake authentication box towards a participant (GCNHAK).
///
/// Keyed with the shared secret of the client key and the participant's
/// public key, bound to the group call key hash.
pub fn normal_handshake_auth_box(
    client_key: &SharedBoxFactory,
    participant_public_key: &[u8; KEY_LENGTH],
    key_hash: &[u8; 32],
) -> Result<SecretBox> {
    let key = client_key.derive_shared_key(
        participant_public_key,
        &purpose::CALL_NORMAL_HANDSHAKE_AUTH,
        &[key_hash],
    )?;
    SecretBox::new(&key)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> GroupCallParameters<'static> {
        GroupCallParameters {
            creator_identity: "ECHOECHO",
            group_id: 42,
            protocol_version: GROUP_CALL_PROTOCOL_VERSION,
            sfu_base_url: "https://sfu.example.org",
        }
    }

    #[test]
    fn key_hash_vector() {
        let keys = derive_group_call_keys(&RawKey::new([7; 32]), &params()).unwrap();
        assert_eq!(
            hex::encode(keys.key_hash),
            "99f3e29f94ef5047ef672c64cecc1a483f2743da4a89be24958576ff4664ec1b"
        );
    }

    #[test]
    fn call_id_depends_on_every_parameter() {
        let gck = RawKey::new([7; 32]);
        let base = derive_group_call_keys(&gck, &params()).unwrap().call_id;

        let mut other = params();
        other.group_id = 43;
        assert_ne!(derive_group_call_keys(&gck, &other).unwrap().call_id, base);

        let mut other = params();
        other.sfu_base_url = "https://sfu.example.net";
        assert_ne!(derive_group_call_keys(&gck, &other).unwrap().call_id, base);

        let other_gck = RawKey::new([8; 32]);
        assert_ne!(
            derive_group_call_keys(&other_gck, &params()).unwrap().call_id,
            base
        );
        assert_eq!(derive_group_call_keys(&gck, &params()).unwrap().call_id, base);
    }

    #[test]
    fn handshake_auth_is_symmetric() {
        let keys = derive_group_call_keys(&RawKey::new([7; 32]), &params()).unwrap();
        let alice = SharedBoxFactory::consume(RawKey::new([1; 32])).unwrap();
        let bob = SharedBoxFactory::consume(RawKey::new([2; 32])).unwrap();

        let sealed = normal_handshake_auth_box(&alice, bob.public_key(), &keys.key_hash)
            .unwrap()
            .encrypt_random_nonce_ahead(b"hello")
            .unwrap();
        let opened = normal_handshake_auth_box(&bob, alice.public_key(), &keys.key_hash)
            .unwrap()
            .decrypt_unguarded_nonce_ahead(&sealed)
            .unwrap();
        assert_eq!(opened, b"hello");
    }
}
