pub mod error;
pub mod frame;
pub mod message;
pub mod reflect;
pub mod sequence;
pub mod types;

pub use error::{ProtocolError, Result};
pub use frame::{CspPayloadType, D2mPayloadType, Frame};
pub use message::{InboundMessage, Layer, OutboundMessage};
pub use reflect::{Reflect, ReflectAck, Reflected, ReflectedAck};
pub use sequence::{SequenceNumber, SequenceNumberU32, SequenceNumberU53, SequenceNumberU64, U53};
pub use types::{DeviceId, IdentityString, MessageId};
