use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("unknown {layer} payload type 0x{value:02x}")]
    UnknownPayloadType { layer: &'static str, value: u8 },

    #[error("{what} truncated: expected at least {expected} bytes, got {actual}")]
    Truncated {
        what: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("{what}: unexpected header length {actual} (expected {expected})")]
    InvalidHeaderLength {
        what: &'static str,
        expected: u8,
        actual: u8,
    },

    #[error("protobuf decode failed for {what}: {source}")]
    Decode {
        what: &'static str,
        #[source]
        source: prost::DecodeError,
    },

    #[error("{0} sequence number exhausted")]
    SequenceNumberExhausted(&'static str),

    #[error("{value} out of range for {kind}")]
    OutOfRange { kind: &'static str, value: u64 },

    #[error("invalid identity: {0:?}")]
    InvalidIdentity(String),

    #[error("unexpected {0} frame")]
    Unexpected(&'static str),
}

impl ProtocolError {
    pub fn decode(what: &'static str, source: prost::DecodeError) -> Self {
        ProtocolError::Decode { what, source }
    }
}

pub type Result<T> = std::result::Result<T, ProtocolError>;
