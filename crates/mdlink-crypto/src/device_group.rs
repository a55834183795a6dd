//! Keys of the device group, all derived from the device group key (DGK).

use crate::error::Result;
use crate::kdf::{derive_key, purpose};
use crate::key::{KEY_LENGTH, RawKey};
use crate::secret_box::{SecretBox, SharedBoxFactory};

pub struct DeviceGroupKeys {
    /// Path key, used towards the mediator during authentication.
    pub path: SharedBoxFactory,
    /// Reflect key for D2D envelopes.
    pub reflect: RawKey<KEY_LENGTH>,
    /// Device info key.
    pub device_info: RawKey<KEY_LENGTH>,
    /// Shared device data key.
    pub shared_device_data: RawKey<KEY_LENGTH>,
    /// Transaction scope key.
    pub transaction_scope: RawKey<KEY_LENGTH>,
}

impl DeviceGroupKeys {
    pub fn reflect_box(&self) -> Result<SecretBox> {
        SecretBox::new(&self.reflect)
    }

    pub fn device_info_box(&self) -> Result<SecretBox> {
        SecretBox::new(&self.device_info)
    }

    pub fn shared_device_data_box(&self) -> Result<SecretBox> {
        SecretBox::new(&self.shared_device_data)
    }

    pub fn transaction_scope_box(&self) -> Result<SecretBox> {
        SecretBox::new(&self.transaction_scope)
    }
}

/// Derive all device group keys. The device group key is purged.
pub fn derive_device_group_keys(mut dgk: RawKey<KEY_LENGTH>) -> Result<DeviceGroupKeys> {
    let keys = (|| -> Result<DeviceGroupKeys> {
        Ok(DeviceGroupKeys {
            path: SharedBoxFactory::consume(derive_key(&dgk, &purpose::DEVICE_GROUP_PATH)?)?,
            reflect: derive_key(&dgk, &purpose::DEVICE_GROUP_REFLECT)?,
            device_info: derive_key(&dgk, &purpose::DEVICE_GROUP_DEVICE_INFO)?,
            shared_device_data: derive_key(&dgk, &purpose::DEVICE_GROUP_SHARED_DEVICE_DATA)?,
            transaction_scope: derive_key(&dgk, &purpose::DEVICE_GROUP_TRANSACTION_SCOPE)?,
        })
    })();
    dgk.purge();
    keys
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kdf::KdfPurpose;

    fn dgk() -> RawKey<32> {
        let mut bytes = [0u8; 32];
        for (i, b) in bytes.iter_mut().enumerate() {
            *b = i as u8;
        }
        RawKey::new(bytes)
    }

    fn derived_hex(purpose: &KdfPurpose) -> String {
        let key: RawKey<32> = derive_key(&dgk(), purpose).unwrap();
        hex::encode(key.expose().unwrap())
    }

    #[test]
    fn known_vectors() {
        assert_eq!(
            derived_hex(&purpose::DEVICE_GROUP_PATH),
            "7778f521159908faf27e10ef0976184fef402d454adc60b19f7835b69ad7bdd7"
        );
        assert_eq!(
            derived_hex(&purpose::DEVICE_GROUP_REFLECT),
            "438be661c724c165f716d67e385bb895ae7096cc6c4ab32372cd6d3f0c27e3d1"
        );
        assert_eq!(
            derived_hex(&purpose::DEVICE_GROUP_DEVICE_INFO),
            "ad82c4c368b24a35fff9e8f74a2d5f6c1b84009d278fa70bc0d9274299709268"
        );
        assert_eq!(
            derived_hex(&purpose::DEVICE_GROUP_SHARED_DEVICE_DATA),
            "4fe6aad88db8010aa49ea4b9189f8fcbcedcdb715b95687783dea6ac1a5d4987"
        );
        assert_eq!(
            derived_hex(&purpose::DEVICE_GROUP_TRANSACTION_SCOPE),
            "385d1990ebe4670601abf5323cd52f84762caed3cbcfc711776db67bef72bb48"
        );
    }

    #[test]
    fn derive_all_matches_single_derivations() {
        let keys = derive_device_group_keys(dgk()).unwrap();
        assert_eq!(
            hex::encode(keys.reflect.expose().unwrap()),
            derived_hex(&purpose::DEVICE_GROUP_REFLECT)
        );
        assert_eq!(
            hex::encode(keys.transaction_scope.expose().unwrap()),
            derived_hex(&purpose::DEVICE_GROUP_TRANSACTION_SCOPE)
        );
    }

    #[test]
    fn purged_dgk_fails() {
        let mut key = dgk();
        key.purge();
        assert!(derive_device_group_keys(key).is_err());
    }
}
