//! Typed messages on top of [`Frame`]s.

use mdlink_proto::{csp, d2m};
use prost::Message;

use crate::error::{ProtocolError, Result};
use crate::frame::{CspPayloadType, D2mPayloadType, Frame};
use crate::reflect::{Reflect, ReflectAck, Reflected, ReflectedAck};

/// Which server a message is exchanged with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Layer {
    Csp,
    D2m,
}

fn decode_proto<T: Message + Default>(what: &'static str, payload: &[u8]) -> Result<T> {
    T::decode(payload).map_err(|err| ProtocolError::decode(what, err))
}

/// Messages received from the mediator or, proxied, from the chat server.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    ReflectionQueueDry,
    RolePromotedToLeader,
    DevicesInfo(d2m::DevicesInfo),
    DropDeviceAck(d2m::DropDeviceAck),
    BeginTransactionAck,
    CommitTransactionAck,
    TransactionRejected(d2m::TransactionRejected),
    TransactionEnded(d2m::TransactionEnded),
    ReflectAck(ReflectAck),
    Reflected(Reflected),
    IncomingMessage(csp::IncomingMessage),
    OutgoingMessageAck(csp::OutgoingMessageAck),
    EchoResponse(Vec<u8>),
    QueueSendComplete,
    Alert(csp::Alert),
    CloseError(csp::CloseError),
}

impl InboundMessage {
    pub fn layer(&self) -> Layer {
        match self {
            InboundMessage::IncomingMessage(_)
            | InboundMessage::OutgoingMessageAck(_)
            | InboundMessage::EchoResponse(_)
            | InboundMessage::QueueSendComplete
            | InboundMessage::Alert(_)
            | InboundMessage::CloseError(_) => Layer::Csp,
            _ => Layer::D2m,
        }
    }

    /// Name of the payload type, for logging.
    pub fn label(&self) -> &'static str {
        match self {
            InboundMessage::ReflectionQueueDry => D2mPayloadType::ReflectionQueueDry.label(),
            InboundMessage::RolePromotedToLeader => D2mPayloadType::RolePromotedToLeader.label(),
            InboundMessage::DevicesInfo(_) => D2mPayloadType::DevicesInfo.label(),
            InboundMessage::DropDeviceAck(_) => D2mPayloadType::DropDeviceAck.label(),
            InboundMessage::BeginTransactionAck => D2mPayloadType::BeginTransactionAck.label(),
            InboundMessage::CommitTransactionAck => D2mPayloadType::CommitTransactionAck.label(),
            InboundMessage::TransactionRejected(_) => D2mPayloadType::TransactionRejected.label(),
            InboundMessage::TransactionEnded(_) => D2mPayloadType::TransactionEnded.label(),
            InboundMessage::ReflectAck(_) => D2mPayloadType::ReflectAck.label(),
            InboundMessage::Reflected(_) => D2mPayloadType::Reflected.label(),
            InboundMessage::IncomingMessage(_) => CspPayloadType::IncomingMessage.label(),
            InboundMessage::OutgoingMessageAck(_) => CspPayloadType::OutgoingMessageAck.label(),
            InboundMessage::EchoResponse(_) => CspPayloadType::EchoResponse.label(),
            InboundMessage::QueueSendComplete => CspPayloadType::QueueSendComplete.label(),
            InboundMessage::Alert(_) => CspPayloadType::Alert.label(),
            InboundMessage::CloseError(_) => CspPayloadType::CloseError.label(),
        }
    }

    pub fn decode(frame: &Frame) -> Result<Self> {
        let payload = frame.payload.as_slice();
        let message = match frame.d2m_type()? {
            D2mPayloadType::Proxy => return Self::decode_csp(frame),
            D2mPayloadType::ReflectionQueueDry => InboundMessage::ReflectionQueueDry,
            D2mPayloadType::RolePromotedToLeader => InboundMessage::RolePromotedToLeader,
            D2mPayloadType::DevicesInfo => {
                InboundMessage::DevicesInfo(decode_proto("DEVICES_INFO", payload)?)
            }
            D2mPayloadType::DropDeviceAck => {
                InboundMessage::DropDeviceAck(decode_proto("DROP_DEVICE_ACK", payload)?)
            }
            D2mPayloadType::BeginTransactionAck => InboundMessage::BeginTransactionAck,
            D2mPayloadType::CommitTransactionAck => InboundMessage::CommitTransactionAck,
            D2mPayloadType::TransactionRejected => InboundMessage::TransactionRejected(
                decode_proto("TRANSACTION_REJECTED", payload)?,
            ),
            D2mPayloadType::TransactionEnded => {
                InboundMessage::TransactionEnded(decode_proto("TRANSACTION_ENDED", payload)?)
            }
            D2mPayloadType::ReflectAck => InboundMessage::ReflectAck(ReflectAck::decode(payload)?),
            D2mPayloadType::Reflected => InboundMessage::Reflected(Reflected::decode(payload)?),
            other => return Err(ProtocolError::Unexpected(other.label())),
        };
        Ok(message)
    }

    fn decode_csp(frame: &Frame) -> Result<Self> {
        let (csp_type, payload) = frame.csp()?;
        let message = match csp_type {
            CspPayloadType::IncomingMessage => {
                InboundMessage::IncomingMessage(decode_proto("INCOMING_MESSAGE", payload)?)
            }
            CspPayloadType::OutgoingMessageAck => {
                InboundMessage::OutgoingMessageAck(decode_proto("OUTGOING_MESSAGE_ACK", payload)?)
            }
            CspPayloadType::EchoResponse => InboundMessage::EchoResponse(payload.to_vec()),
            CspPayloadType::QueueSendComplete => InboundMessage::QueueSendComplete,
            CspPayloadType::Alert => InboundMessage::Alert(decode_proto("ALERT", payload)?),
            CspPayloadType::CloseError => {
                InboundMessage::CloseError(decode_proto("CLOSE_ERROR", payload)?)
            }
            other => return Err(ProtocolError::Unexpected(other.label())),
        };
        Ok(message)
    }

    /// Encode as the server would send it.
    pub fn encode(&self) -> Frame {
        match self {
            InboundMessage::ReflectionQueueDry => {
                Frame::new(D2mPayloadType::ReflectionQueueDry, Vec::new())
            }
            InboundMessage::RolePromotedToLeader => {
                Frame::new(D2mPayloadType::RolePromotedToLeader, Vec::new())
            }
            InboundMessage::DevicesInfo(m) => {
                Frame::new(D2mPayloadType::DevicesInfo, m.encode_to_vec())
            }
            InboundMessage::DropDeviceAck(m) => {
                Frame::new(D2mPayloadType::DropDeviceAck, m.encode_to_vec())
            }
            InboundMessage::BeginTransactionAck => Frame::new(
                D2mPayloadType::BeginTransactionAck,
                d2m::BeginTransactionAck {}.encode_to_vec(),
            ),
            InboundMessage::CommitTransactionAck => Frame::new(
                D2mPayloadType::CommitTransactionAck,
                d2m::CommitTransactionAck {}.encode_to_vec(),
            ),
            InboundMessage::TransactionRejected(m) => {
                Frame::new(D2mPayloadType::TransactionRejected, m.encode_to_vec())
            }
            InboundMessage::TransactionEnded(m) => {
                Frame::new(D2mPayloadType::TransactionEnded, m.encode_to_vec())
            }
            InboundMessage::ReflectAck(m) => Frame::new(D2mPayloadType::ReflectAck, m.encode()),
            InboundMessage::Reflected(m) => Frame::new(D2mPayloadType::Reflected, m.encode()),
            InboundMessage::IncomingMessage(m) => {
                Frame::proxy(CspPayloadType::IncomingMessage, &m.encode_to_vec())
            }
            InboundMessage::OutgoingMessageAck(m) => {
                Frame::proxy(CspPayloadType::OutgoingMessageAck, &m.encode_to_vec())
            }
            InboundMessage::EchoResponse(data) => Frame::proxy(CspPayloadType::EchoResponse, data),
            InboundMessage::QueueSendComplete => {
                Frame::proxy(CspPayloadType::QueueSendComplete, &[])
            }
            InboundMessage::Alert(m) => Frame::proxy(CspPayloadType::Alert, &m.encode_to_vec()),
            InboundMessage::CloseError(m) => {
                Frame::proxy(CspPayloadType::CloseError, &m.encode_to_vec())
            }
        }
    }
}

/// Messages sent to the mediator or, proxied, to the chat server.
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundMessage {
    GetDevicesInfo,
    DropDevice(d2m::DropDevice),
    BeginTransaction(d2m::BeginTransaction),
    CommitTransaction,
    Reflect(Reflect),
    ReflectedAck(ReflectedAck),
    OutgoingMessage(csp::OutgoingMessage),
    IncomingMessageAck(csp::IncomingMessageAck),
    EchoRequest(Vec<u8>),
}

impl OutboundMessage {
    pub fn layer(&self) -> Layer {
        match self {
            OutboundMessage::OutgoingMessage(_)
            | OutboundMessage::IncomingMessageAck(_)
            | OutboundMessage::EchoRequest(_) => Layer::Csp,
            _ => Layer::D2m,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            OutboundMessage::GetDevicesInfo => D2mPayloadType::GetDevicesInfo.label(),
            OutboundMessage::DropDevice(_) => D2mPayloadType::DropDevice.label(),
            OutboundMessage::BeginTransaction(_) => D2mPayloadType::BeginTransaction.label(),
            OutboundMessage::CommitTransaction => D2mPayloadType::CommitTransaction.label(),
            OutboundMessage::Reflect(_) => D2mPayloadType::Reflect.label(),
            OutboundMessage::ReflectedAck(_) => D2mPayloadType::ReflectedAck.label(),
            OutboundMessage::OutgoingMessage(_) => CspPayloadType::OutgoingMessage.label(),
            OutboundMessage::IncomingMessageAck(_) => CspPayloadType::IncomingMessageAck.label(),
            OutboundMessage::EchoRequest(_) => CspPayloadType::EchoRequest.label(),
        }
    }

    pub fn encode(&self) -> Frame {
        match self {
            OutboundMessage::GetDevicesInfo => Frame::new(
                D2mPayloadType::GetDevicesInfo,
                d2m::GetDevicesInfo {}.encode_to_vec(),
            ),
            OutboundMessage::DropDevice(m) => {
                Frame::new(D2mPayloadType::DropDevice, m.encode_to_vec())
            }
            OutboundMessage::BeginTransaction(m) => {
                Frame::new(D2mPayloadType::BeginTransaction, m.encode_to_vec())
            }
            OutboundMessage::CommitTransaction => Frame::new(
                D2mPayloadType::CommitTransaction,
                d2m::CommitTransaction {}.encode_to_vec(),
            ),
            OutboundMessage::Reflect(m) => Frame::new(D2mPayloadType::Reflect, m.encode()),
            OutboundMessage::ReflectedAck(m) => {
                Frame::new(D2mPayloadType::ReflectedAck, m.encode())
            }
            OutboundMessage::OutgoingMessage(m) => {
                Frame::proxy(CspPayloadType::OutgoingMessage, &m.encode_to_vec())
            }
            OutboundMessage::IncomingMessageAck(m) => {
                Frame::proxy(CspPayloadType::IncomingMessageAck, &m.encode_to_vec())
            }
            OutboundMessage::EchoRequest(data) => Frame::proxy(CspPayloadType::EchoRequest, data),
        }
    }

    /// Decode as the server would receive it.
    pub fn decode(frame: &Frame) -> Result<Self> {
        let payload = frame.payload.as_slice();
        let message = match frame.d2m_type()? {
            D2mPayloadType::Proxy => {
                let (csp_type, payload) = frame.csp()?;
                match csp_type {
                    CspPayloadType::OutgoingMessage => OutboundMessage::OutgoingMessage(
                        decode_proto("OUTGOING_MESSAGE", payload)?,
                    ),
                    CspPayloadType::IncomingMessageAck => OutboundMessage::IncomingMessageAck(
                        decode_proto("INCOMING_MESSAGE_ACK", payload)?,
                    ),
                    CspPayloadType::EchoRequest => OutboundMessage::EchoRequest(payload.to_vec()),
                    other => return Err(ProtocolError::Unexpected(other.label())),
                }
            }
            D2mPayloadType::GetDevicesInfo => OutboundMessage::GetDevicesInfo,
            D2mPayloadType::DropDevice => {
                OutboundMessage::DropDevice(decode_proto("DROP_DEVICE", payload)?)
            }
            D2mPayloadType::BeginTransaction => {
                OutboundMessage::BeginTransaction(decode_proto("BEGIN_TRANSACTION", payload)?)
            }
            D2mPayloadType::CommitTransaction => OutboundMessage::CommitTransaction,
            D2mPayloadType::Reflect => OutboundMessage::Reflect(Reflect::decode(payload)?),
            D2mPayloadType::ReflectedAck => {
                OutboundMessage::ReflectedAck(ReflectedAck::decode(payload)?)
            }
            other => return Err(ProtocolError::Unexpected(other.label())),
        };
        Ok(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drop_device_ack_decodes() {
        let frame = InboundMessage::DropDeviceAck(d2m::DropDeviceAck { device_id: 7 }).encode();
        assert_eq!(frame.payload_type, 0x33);
        match InboundMessage::decode(&frame).unwrap() {
            InboundMessage::DropDeviceAck(ack) => assert_eq!(ack.device_id, 7),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn csp_messages_travel_in_proxy_frames() {
        let message = OutboundMessage::IncomingMessageAck(csp::IncomingMessageAck {
            sender_identity: "ECHOECHO".into(),
            message_id: 1,
        });
        let frame = message.encode();
        assert_eq!(frame.payload_type, D2mPayloadType::Proxy as u8);
        assert_eq!(message.layer(), Layer::Csp);
        assert_eq!(OutboundMessage::decode(&frame).unwrap(), message);
    }

    #[test]
    fn handshake_frames_are_unexpected() {
        let frame = Frame::new(D2mPayloadType::ServerHello, vec![]);
        assert!(matches!(
            InboundMessage::decode(&frame),
            Err(ProtocolError::Unexpected("SERVER_HELLO"))
        ));
    }

    #[test]
    fn malformed_payload_is_a_decode_error() {
        let frame = Frame::new(D2mPayloadType::DropDeviceAck, vec![0x09, 0x01]);
        assert!(matches!(
            InboundMessage::decode(&frame),
            Err(ProtocolError::Decode { .. })
        ));
    }
}
