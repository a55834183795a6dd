//! Binary layouts of the reflection payloads. All integers are little-endian.

use crate::error::{ProtocolError, Result};

/// Message flags of `REFLECT` and `REFLECTED`.
pub mod flags {
    /// The mediator must not queue the reflection for offline devices.
    pub const EPHEMERAL: u16 = 0x0001;
}

const REFLECT_HEADER_LENGTH: u8 = 8;
const REFLECTED_HEADER_LENGTH: u8 = 16;
const REFLECT_ACK_LENGTH: usize = 16;
const REFLECTED_ACK_LENGTH: usize = 8;

fn ensure_length(what: &'static str, bytes: &[u8], expected: usize) -> Result<()> {
    if bytes.len() < expected {
        return Err(ProtocolError::Truncated {
            what,
            expected,
            actual: bytes.len(),
        });
    }
    Ok(())
}

fn read_u16(bytes: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([bytes[offset], bytes[offset + 1]])
}

fn read_u32(bytes: &[u8], offset: usize) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&bytes[offset..offset + 4]);
    u32::from_le_bytes(buf)
}

fn read_u64(bytes: &[u8], offset: usize) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&bytes[offset..offset + 8]);
    u64::from_le_bytes(buf)
}

/// Header length is checked to be at least the known size; longer headers
/// carry fields this version does not understand and are skipped.
fn read_header_length(what: &'static str, bytes: &[u8], minimum: u8) -> Result<usize> {
    ensure_length(what, bytes, 1)?;
    let header_length = bytes[0];
    if header_length < minimum {
        return Err(ProtocolError::InvalidHeaderLength {
            what,
            expected: minimum,
            actual: header_length,
        });
    }
    ensure_length(what, bytes, header_length as usize)?;
    Ok(header_length as usize)
}

/// `REFLECT`: an encrypted D2D envelope to be reflected to the other devices.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reflect {
    pub flags: u16,
    pub reflect_id: u32,
    pub envelope: Vec<u8>,
}

impl Reflect {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(REFLECT_HEADER_LENGTH as usize + self.envelope.len());
        out.push(REFLECT_HEADER_LENGTH);
        out.push(0);
        out.extend_from_slice(&self.flags.to_le_bytes());
        out.extend_from_slice(&self.reflect_id.to_le_bytes());
        out.extend_from_slice(&self.envelope);
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let header_length = read_header_length("REFLECT", bytes, REFLECT_HEADER_LENGTH)?;
        Ok(Self {
            flags: read_u16(bytes, 2),
            reflect_id: read_u32(bytes, 4),
            envelope: bytes[header_length..].to_vec(),
        })
    }
}

/// `REFLECTED`: an envelope reflected by another device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reflected {
    pub flags: u16,
    pub reflected_id: u32,
    /// Server receive time in milliseconds.
    pub timestamp: u64,
    pub envelope: Vec<u8>,
}

impl Reflected {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(REFLECTED_HEADER_LENGTH as usize + self.envelope.len());
        out.push(REFLECTED_HEADER_LENGTH);
        out.push(0);
        out.extend_from_slice(&self.flags.to_le_bytes());
        out.extend_from_slice(&self.reflected_id.to_le_bytes());
        out.extend_from_slice(&self.timestamp.to_le_bytes());
        out.extend_from_slice(&self.envelope);
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let header_length = read_header_length("REFLECTED", bytes, REFLECTED_HEADER_LENGTH)?;
        Ok(Self {
            flags: read_u16(bytes, 2),
            reflected_id: read_u32(bytes, 4),
            timestamp: read_u64(bytes, 8),
            envelope: bytes[header_length..].to_vec(),
        })
    }

    pub fn is_ephemeral(&self) -> bool {
        self.flags & flags::EPHEMERAL != 0
    }
}

/// `REFLECT_ACK`: the mediator stored a reflection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReflectAck {
    pub reflect_id: u32,
    pub timestamp: u64,
}

impl ReflectAck {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = vec![0u8; 4];
        out.extend_from_slice(&self.reflect_id.to_le_bytes());
        out.extend_from_slice(&self.timestamp.to_le_bytes());
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        ensure_length("REFLECT_ACK", bytes, REFLECT_ACK_LENGTH)?;
        Ok(Self {
            reflect_id: read_u32(bytes, 4),
            timestamp: read_u64(bytes, 8),
        })
    }
}

/// `REFLECTED_ACK`: this device processed a reflection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReflectedAck {
    pub reflected_id: u32,
}

impl ReflectedAck {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = vec![0u8; 4];
        out.extend_from_slice(&self.reflected_id.to_le_bytes());
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        ensure_length("REFLECTED_ACK", bytes, REFLECTED_ACK_LENGTH)?;
        Ok(Self {
            reflected_id: read_u32(bytes, 4),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reflected_layout() {
        let reflected = Reflected {
            flags: flags::EPHEMERAL,
            reflected_id: 0x0403_0201,
            timestamp: 0x0c0b_0a09_0807_0605,
            envelope: vec![0xaa, 0xbb],
        };
        let bytes = reflected.encode();
        assert_eq!(
            bytes,
            vec![
                16, 0, 1, 0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 0xaa, 0xbb
            ]
        );
        let decoded = Reflected::decode(&bytes).unwrap();
        assert_eq!(decoded, reflected);
        assert!(decoded.is_ephemeral());
    }

    #[test]
    fn reflected_skips_unknown_header_fields() {
        let mut bytes = vec![20, 0, 0, 0, 7, 0, 0, 0];
        bytes.extend_from_slice(&42u64.to_le_bytes());
        bytes.extend_from_slice(&[0xff; 4]);
        bytes.push(0x01);
        let decoded = Reflected::decode(&bytes).unwrap();
        assert_eq!(decoded.reflected_id, 7);
        assert_eq!(decoded.timestamp, 42);
        assert_eq!(decoded.envelope, vec![0x01]);
    }

    #[test]
    fn reflected_rejects_short_header() {
        let bytes = vec![8, 0, 0, 0, 7, 0, 0, 0];
        assert!(matches!(
            Reflected::decode(&bytes),
            Err(ProtocolError::InvalidHeaderLength { actual: 8, .. })
        ));
        assert!(matches!(
            Reflected::decode(&[16, 0, 0]),
            Err(ProtocolError::Truncated { .. })
        ));
    }

    #[test]
    fn reflect_layout() {
        let reflect = Reflect {
            flags: 0,
            reflect_id: 1,
            envelope: vec![9],
        };
        assert_eq!(reflect.encode(), vec![8, 0, 0, 0, 1, 0, 0, 0, 9]);
        assert_eq!(Reflect::decode(&reflect.encode()).unwrap(), reflect);
    }

    #[test]
    fn ack_layouts() {
        let ack = ReflectAck {
            reflect_id: 3,
            timestamp: 1000,
        };
        let bytes = ack.encode();
        assert_eq!(bytes.len(), 16);
        assert_eq!(&bytes[..4], &[0, 0, 0, 0]);
        assert_eq!(ReflectAck::decode(&bytes).unwrap(), ack);

        let ack = ReflectedAck { reflected_id: 5 };
        assert_eq!(ack.encode(), vec![0, 0, 0, 0, 5, 0, 0, 0]);
        assert!(ReflectedAck::decode(&[0; 7]).is_err());
    }
}
