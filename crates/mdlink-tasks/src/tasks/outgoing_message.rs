//! Messages this device sends to contacts, and their reflections.

use futures_util::FutureExt;
use mdlink_crypto::NonceScope;
use mdlink_proto::csp::delivery_receipt::Status as ReceiptStatus;
use mdlink_proto::csp::e2e_message::Body;
use mdlink_proto::{csp, d2d};
use mdlink_protocol::{IdentityString, InboundMessage, MessageId, OutboundMessage};
use prost::Message;
use rand::Rng;

use crate::codec::ActiveTaskCodecHandle;
use crate::demux::MessageFilterInstruction;
use crate::error::Result;
use crate::model::ReactionAction;
use crate::task::{ActiveTask, ComposableTask, Persistence, TaskFuture};
use crate::tasks::ProfilePictureDistributionStep;

/// Most message ids carried by a single delivery receipt.
pub const MAX_RECEIPT_IDS: usize = 512;

fn random_message_id() -> MessageId {
    MessageId(rand::thread_rng().r#gen())
}

pub(crate) fn envelope(content: d2d::envelope::Content) -> d2d::Envelope {
    d2d::Envelope {
        content: Some(content),
        ..Default::default()
    }
}

/// Write a CSP message with a fresh nonce.
///
/// The nonce is committed before writing: once it may have left the device
/// it must never be used again, even if the write fails.
pub(crate) async fn write_csp_message(
    handle: &ActiveTaskCodecHandle,
    receiver: &IdentityString,
    message_id: MessageId,
    created_at: u64,
    flags: u32,
    message: csp::E2eMessage,
) -> Result<()> {
    let guard = handle.services().nonces.random_nonce(NonceScope::Csp)?;
    let nonce = guard.nonce().to_vec();
    guard.commit()?;
    handle
        .write(OutboundMessage::OutgoingMessage(csp::OutgoingMessage {
            receiver_identity: receiver.to_string(),
            message_id: message_id.0,
            created_at,
            flags,
            nonce,
            message: Some(message),
        }))
        .await
}

/// Sends one end-to-end message to a contact.
///
/// Depending on the kind of message it first distributes the profile
/// picture, reflects the message to the other devices, and after the chat
/// server acknowledged it reflects that it was sent.
pub struct OutgoingCspMessageTask {
    receiver: IdentityString,
    message_id: MessageId,
    created_at: u64,
    body: Body,
    reflect: bool,
    distribute_profile: bool,
    reflect_sent: bool,
}

impl OutgoingCspMessageTask {
    pub fn text(
        receiver: IdentityString,
        message_id: MessageId,
        created_at: u64,
        text: String,
    ) -> Self {
        Self {
            receiver,
            message_id,
            created_at,
            body: Body::Text(csp::Text { text }),
            reflect: true,
            distribute_profile: true,
            reflect_sent: true,
        }
    }

    pub fn reaction(
        receiver: IdentityString,
        target: MessageId,
        action: ReactionAction,
        created_at: u64,
    ) -> Self {
        Self {
            receiver,
            message_id: random_message_id(),
            created_at,
            body: Body::Reaction(csp::Reaction {
                message_id: target.0,
                action: Some(action.to_proto()),
            }),
            reflect: true,
            distribute_profile: true,
            reflect_sent: false,
        }
    }

    pub fn delivery_receipt(
        receiver: IdentityString,
        status: ReceiptStatus,
        ids: &[MessageId],
        created_at: u64,
    ) -> Self {
        Self {
            receiver,
            message_id: random_message_id(),
            created_at,
            body: Body::DeliveryReceipt(csp::DeliveryReceipt {
                status: status as i32,
                message_ids: ids.iter().map(|id| id.0).collect(),
            }),
            reflect: true,
            distribute_profile: false,
            reflect_sent: false,
        }
    }

    /// New text for the sent message `target`. Sent under its own id
    /// `message_id`.
    pub fn edit(
        receiver: IdentityString,
        message_id: MessageId,
        target: MessageId,
        text: String,
        created_at: u64,
    ) -> Self {
        Self {
            receiver,
            message_id,
            created_at,
            body: Body::EditMessage(csp::EditMessage {
                message_id: target.0,
                text,
            }),
            reflect: true,
            distribute_profile: false,
            reflect_sent: false,
        }
    }

    pub fn delete(receiver: IdentityString, target: MessageId, created_at: u64) -> Self {
        Self {
            receiver,
            message_id: random_message_id(),
            created_at,
            body: Body::DeleteMessage(csp::DeleteMessage {
                message_id: target.0,
            }),
            reflect: true,
            distribute_profile: false,
            reflect_sent: false,
        }
    }

    /// Set or, with `None`, delete this user's profile picture at the
    /// receiver. Not reflected.
    pub(crate) fn profile_picture(
        receiver: IdentityString,
        blob_id: Option<Vec<u8>>,
        created_at: u64,
    ) -> Self {
        let body = match blob_id {
            Some(blob_id) => Body::SetProfilePicture(csp::SetProfilePicture { blob_id }),
            None => Body::DeleteProfilePicture(csp::DeleteProfilePicture {}),
        };
        Self {
            receiver,
            message_id: random_message_id(),
            created_at,
            body,
            reflect: false,
            distribute_profile: false,
            reflect_sent: false,
        }
    }

    pub fn receiver(&self) -> &IdentityString {
        &self.receiver
    }

    pub fn body(&self) -> &Body {
        &self.body
    }

    async fn send(&self, handle: &ActiveTaskCodecHandle) -> Result<()> {
        if self.distribute_profile {
            ProfilePictureDistributionStep::new(self.receiver.clone())
                .run(handle)
                .await?;
        }

        let message = csp::E2eMessage {
            body: Some(self.body.clone()),
        };
        if self.reflect {
            handle
                .reflect(vec![envelope(d2d::envelope::Content::OutgoingMessage(
                    d2d::OutgoingMessage {
                        receiver_identity: self.receiver.to_string(),
                        message_id: self.message_id.0,
                        created_at: self.created_at,
                        body: message.encode_to_vec(),
                    },
                ))])
                .await?;
        }

        write_csp_message(
            handle,
            &self.receiver,
            self.message_id,
            self.created_at,
            0,
            message,
        )
        .await?;
        let receiver = self.receiver.to_string();
        let message_id = self.message_id.0;
        handle
            .read(move |message| match message {
                InboundMessage::OutgoingMessageAck(ack)
                    if ack.receiver_identity == receiver && ack.message_id == message_id =>
                {
                    MessageFilterInstruction::Accept(())
                }
                _ => MessageFilterInstruction::BypassOrBacklog,
            })
            .await?;
        tracing::debug!(receiver = %self.receiver, message_id = %self.message_id, "message sent");

        if self.reflect_sent {
            let services = handle.services();
            let at = services.now_ms();
            handle
                .reflect(vec![envelope(d2d::envelope::Content::OutgoingMessageUpdate(
                    d2d::OutgoingMessageUpdate {
                        updates: vec![d2d::outgoing_message_update::Update {
                            receiver_identity: self.receiver.to_string(),
                            message_id: self.message_id.0,
                            update: Some(d2d::outgoing_message_update::update::Update::Sent(
                                d2d::outgoing_message_update::Sent { at },
                            )),
                        }],
                    },
                ))])
                .await?;
            services
                .model
                .messages
                .sent()
                .mark(&self.receiver, self.message_id, at);
        }
        Ok(())
    }
}

impl ActiveTask for OutgoingCspMessageTask {
    type Output = ();

    fn name(&self) -> &'static str {
        "outgoing-csp-message"
    }

    fn persistence(&self) -> Persistence {
        Persistence::Persistent
    }

    fn message_id(&self) -> Option<MessageId> {
        Some(self.message_id)
    }

    fn run<'a>(&'a self, handle: &'a ActiveTaskCodecHandle) -> TaskFuture<'a, ()> {
        self.send(handle).boxed()
    }
}

/// Sends a delivery receipt for any number of messages, split into
/// messages of at most [`MAX_RECEIPT_IDS`] ids.
pub struct OutgoingDeliveryReceiptTask {
    receiver: IdentityString,
    status: ReceiptStatus,
    ids: Vec<MessageId>,
    created_at: u64,
}

impl OutgoingDeliveryReceiptTask {
    pub fn new(
        receiver: IdentityString,
        status: ReceiptStatus,
        ids: Vec<MessageId>,
        created_at: u64,
    ) -> Self {
        Self {
            receiver,
            status,
            ids,
            created_at,
        }
    }
}

impl ActiveTask for OutgoingDeliveryReceiptTask {
    type Output = ();

    fn name(&self) -> &'static str {
        "outgoing-delivery-receipt"
    }

    fn persistence(&self) -> Persistence {
        Persistence::Persistent
    }

    fn run<'a>(&'a self, handle: &'a ActiveTaskCodecHandle) -> TaskFuture<'a, ()> {
        async move {
            for ids in self.ids.chunks(MAX_RECEIPT_IDS) {
                let receipt = OutgoingCspMessageTask::delivery_receipt(
                    self.receiver.clone(),
                    self.status,
                    ids,
                    self.created_at,
                );
                handle.run(&receipt).await?;
            }
            Ok(())
        }
        .boxed()
    }
}

/// Tells the other devices that inbound messages were read, without telling
/// the sender.
pub struct ReflectReadTask {
    sender: IdentityString,
    ids: Vec<MessageId>,
    read_at: u64,
}

impl ReflectReadTask {
    pub fn new(sender: IdentityString, ids: Vec<MessageId>, read_at: u64) -> Self {
        Self {
            sender,
            ids,
            read_at,
        }
    }
}

impl ActiveTask for ReflectReadTask {
    type Output = ();

    fn name(&self) -> &'static str {
        "reflect-read"
    }

    fn persistence(&self) -> Persistence {
        Persistence::Persistent
    }

    fn run<'a>(&'a self, handle: &'a ActiveTaskCodecHandle) -> TaskFuture<'a, ()> {
        async move {
            let updates = self
                .ids
                .iter()
                .map(|id| d2d::incoming_message_update::Update {
                    sender_identity: self.sender.to_string(),
                    message_id: id.0,
                    update: Some(d2d::incoming_message_update::update::Update::Read(
                        d2d::incoming_message_update::Read { at: self.read_at },
                    )),
                })
                .collect();
            handle
                .reflect(vec![envelope(d2d::envelope::Content::IncomingMessageUpdate(
                    d2d::IncomingMessageUpdate { updates },
                ))])
                .await?;
            Ok(())
        }
        .boxed()
    }
}
