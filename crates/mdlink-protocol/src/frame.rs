use crate::error::{ProtocolError, Result};

/// Type byte followed by three reserved bytes.
pub const FRAME_HEADER_LENGTH: usize = 4;

macro_rules! payload_types {
    ($(#[$meta:meta])* $name:ident, $layer:literal { $($variant:ident = $value:literal => $label:literal,)* }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[repr(u8)]
        pub enum $name {
            $($variant = $value,)*
        }

        impl $name {
            pub fn label(self) -> &'static str {
                match self {
                    $($name::$variant => $label,)*
                }
            }
        }

        impl TryFrom<u8> for $name {
            type Error = ProtocolError;

            fn try_from(value: u8) -> Result<Self> {
                match value {
                    $($value => Ok($name::$variant),)*
                    _ => Err(ProtocolError::UnknownPayloadType { layer: $layer, value }),
                }
            }
        }
    };
}

payload_types! {
    /// Payload types of the device to mediator protocol.
    D2mPayloadType, "d2m" {
        Proxy = 0x00 => "PROXY",
        ServerHello = 0x10 => "SERVER_HELLO",
        ClientHello = 0x11 => "CLIENT_HELLO",
        ServerInfo = 0x12 => "SERVER_INFO",
        ReflectionQueueDry = 0x20 => "REFLECTION_QUEUE_DRY",
        RolePromotedToLeader = 0x21 => "ROLE_PROMOTED_TO_LEADER",
        GetDevicesInfo = 0x30 => "GET_DEVICES_INFO",
        DevicesInfo = 0x31 => "DEVICES_INFO",
        DropDevice = 0x32 => "DROP_DEVICE",
        DropDeviceAck = 0x33 => "DROP_DEVICE_ACK",
        SetSharedDeviceData = 0x34 => "SET_SHARED_DEVICE_DATA",
        BeginTransaction = 0x40 => "BEGIN_TRANSACTION",
        BeginTransactionAck = 0x41 => "BEGIN_TRANSACTION_ACK",
        CommitTransaction = 0x42 => "COMMIT_TRANSACTION",
        CommitTransactionAck = 0x43 => "COMMIT_TRANSACTION_ACK",
        TransactionRejected = 0x44 => "TRANSACTION_REJECTED",
        TransactionEnded = 0x45 => "TRANSACTION_ENDED",
        Reflect = 0x80 => "REFLECT",
        ReflectAck = 0x81 => "REFLECT_ACK",
        Reflected = 0x82 => "REFLECTED",
        ReflectedAck = 0x83 => "REFLECTED_ACK",
    }
}

payload_types! {
    /// Payload types of the chat server protocol, carried in `PROXY` frames.
    CspPayloadType, "csp" {
        EchoRequest = 0x00 => "ECHO_REQUEST",
        OutgoingMessage = 0x01 => "OUTGOING_MESSAGE",
        IncomingMessage = 0x02 => "INCOMING_MESSAGE",
        EchoResponse = 0x80 => "ECHO_RESPONSE",
        OutgoingMessageAck = 0x81 => "OUTGOING_MESSAGE_ACK",
        IncomingMessageAck = 0x82 => "INCOMING_MESSAGE_ACK",
        QueueSendComplete = 0xd0 => "QUEUE_SEND_COMPLETE",
        Alert = 0xe0 => "ALERT",
        CloseError = 0xe1 => "CLOSE_ERROR",
    }
}

fn encode_container(payload_type: u8, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(FRAME_HEADER_LENGTH + payload.len());
    out.push(payload_type);
    out.extend_from_slice(&[0u8; 3]);
    out.extend_from_slice(payload);
    out
}

fn decode_container<'a>(what: &'static str, bytes: &'a [u8]) -> Result<(u8, &'a [u8])> {
    if bytes.len() < FRAME_HEADER_LENGTH {
        return Err(ProtocolError::Truncated {
            what,
            expected: FRAME_HEADER_LENGTH,
            actual: bytes.len(),
        });
    }
    Ok((bytes[0], &bytes[FRAME_HEADER_LENGTH..]))
}

/// One frame on a mediator connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub payload_type: u8,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(payload_type: D2mPayloadType, payload: Vec<u8>) -> Self {
        Self {
            payload_type: payload_type as u8,
            payload,
        }
    }

    /// A `PROXY` frame wrapping a chat server payload.
    pub fn proxy(csp_type: CspPayloadType, payload: &[u8]) -> Self {
        Self::new(
            D2mPayloadType::Proxy,
            encode_container(csp_type as u8, payload),
        )
    }

    pub fn d2m_type(&self) -> Result<D2mPayloadType> {
        D2mPayloadType::try_from(self.payload_type)
    }

    /// Chat server type and payload of a `PROXY` frame.
    pub fn csp(&self) -> Result<(CspPayloadType, &[u8])> {
        let (csp_type, payload) = decode_container("csp container", &self.payload)?;
        Ok((CspPayloadType::try_from(csp_type)?, payload))
    }

    pub fn encode(&self) -> Vec<u8> {
        encode_container(self.payload_type, &self.payload)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let (payload_type, payload) = decode_container("d2m container", bytes)?;
        Ok(Self {
            payload_type,
            payload: payload.to_vec(),
        })
    }
}
