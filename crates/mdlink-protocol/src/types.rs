use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;

/// Identifier of a device within the device group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceId(pub u64);

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0.to_le_bytes()))
    }
}

/// Identifier of a message, unique per sender and receiver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MessageId(pub u64);

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0.to_le_bytes()))
    }
}

pub const IDENTITY_LENGTH: usize = 8;

/// An 8 character user identity, e.g. `ECHOECHO`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct IdentityString(String);

impl IdentityString {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for IdentityString {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let valid = s.len() == IDENTITY_LENGTH
            && s
                .chars()
                .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '*');
        if !valid {
            return Err(ProtocolError::InvalidIdentity(s.to_string()));
        }
        Ok(Self(s.to_string()))
    }
}

impl TryFrom<String> for IdentityString {
    type Error = ProtocolError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<IdentityString> for String {
    fn from(value: IdentityString) -> Self {
        value.0
    }
}

impl fmt::Display for IdentityString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
