use futures_util::FutureExt;
use mdlink_crypto::{CryptoError, NONCE_LENGTH, NonceScope};
use mdlink_proto::csp::delivery_receipt::Status as ReceiptStatus;
use mdlink_proto::csp::e2e_message::Body;
use mdlink_proto::{csp, d2d};
use mdlink_protocol::{MessageId, OutboundMessage};
use prost::Message;

use crate::codec::ActiveTaskCodecHandle;
use crate::dispatch::{DispatchError, RemoteContext};
use crate::error::{Result, TaskError};
use crate::model::{ReactionAction, parse_identity};
use crate::task::{ActiveTask, ComposableTask, Persistence, TaskFuture};
use crate::tasks::IncomingTypingIndicatorTask;
use crate::tasks::outgoing_message::envelope;

/// Processes a message a contact sent through the chat server.
///
/// The message is reflected to the other devices, applied to the model, its
/// nonce committed and finally acknowledged towards the chat server. Invalid
/// messages and replayed nonces are acknowledged and dropped so that the
/// server does not deliver them again.
pub struct IncomingMessageTask {
    message: csp::IncomingMessage,
}

impl IncomingMessageTask {
    pub fn new(message: csp::IncomingMessage) -> Self {
        Self { message }
    }

    async fn ack(&self, handle: &ActiveTaskCodecHandle) -> Result<()> {
        handle
            .write(OutboundMessage::IncomingMessageAck(csp::IncomingMessageAck {
                sender_identity: self.message.sender_identity.clone(),
                message_id: self.message.message_id,
            }))
            .await
    }

    async fn receive(&self, handle: &ActiveTaskCodecHandle) -> Result<()> {
        let nonce: [u8; NONCE_LENGTH] = match self.message.nonce.as_slice().try_into() {
            Ok(nonce) => nonce,
            Err(_) => {
                tracing::warn!(
                    sender = %self.message.sender_identity,
                    length = self.message.nonce.len(),
                    "message with invalid nonce, dropping"
                );
                return self.ack(handle).await;
            }
        };
        let guard = match handle
            .services()
            .nonces
            .check_and_register(NonceScope::Csp, nonce)
        {
            Ok(guard) => guard,
            Err(CryptoError::NonceReused(_)) => {
                tracing::warn!(sender = %self.message.sender_identity, "replayed message, dropping");
                return self.ack(handle).await;
            }
            Err(err) => return Err(err.into()),
        };

        match self.dispatch(handle).await {
            Ok(()) => guard.commit()?,
            Err(TaskError::Dispatch(err)) => {
                tracing::warn!(sender = %self.message.sender_identity, error = %err, "discarding message");
                guard.discard();
            }
            Err(err) => {
                guard.discard();
                return Err(err);
            }
        }
        self.ack(handle).await
    }

    async fn dispatch(&self, handle: &ActiveTaskCodecHandle) -> Result<()> {
        let message = &self.message;
        let sender = parse_identity("sender identity", &message.sender_identity)?;
        let id = MessageId(message.message_id);
        let created_at = message.created_at;
        let Some(body) = message.message.as_ref().and_then(|m| m.body.clone()) else {
            return Err(DispatchError::Invalid("message without body".into()).into());
        };

        if let Body::TypingIndicator(indicator) = &body {
            return IncomingTypingIndicatorTask::new(sender, id, indicator.is_typing)
                .run(handle)
                .await;
        }

        let reflection = envelope(d2d::envelope::Content::IncomingMessage(
            d2d::IncomingMessage {
                sender_identity: message.sender_identity.clone(),
                message_id: message.message_id,
                created_at,
                body: csp::E2eMessage {
                    body: Some(body.clone()),
                }
                .encode_to_vec(),
            },
        ));
        let context = RemoteContext::new(handle, Some(reflection));
        let model = &handle.services().model;
        match body {
            Body::Text(text) => {
                model
                    .messages
                    .incoming()
                    .from_remote(&context, sender, id, created_at, text.text)
                    .await
            }
            Body::DeliveryReceipt(receipt) => {
                let status = receipt_status(receipt.status)?;
                let ids: Vec<MessageId> = receipt.message_ids.into_iter().map(MessageId).collect();
                model
                    .messages
                    .delivery()
                    .from_remote(&context, &sender, status, &ids, created_at)
                    .await
            }
            Body::Reaction(reaction) => {
                let action = ReactionAction::from_proto(reaction.action)?;
                model
                    .messages
                    .reactions()
                    .from_remote(&context, &sender, MessageId(reaction.message_id), action, created_at)
                    .await
            }
            Body::SetProfilePicture(picture) => {
                model
                    .contacts
                    .profile_picture()
                    .from_remote(&context, &sender, id, Some(picture.blob_id))
                    .await
            }
            Body::DeleteProfilePicture(_) => {
                model
                    .contacts
                    .profile_picture()
                    .from_remote(&context, &sender, id, None)
                    .await
            }
            Body::EditMessage(edit) => {
                model
                    .messages
                    .edit()
                    .from_remote(
                        &context,
                        &sender,
                        MessageId(edit.message_id),
                        id,
                        edit.text,
                        created_at,
                    )
                    .await
            }
            Body::DeleteMessage(delete) => {
                model
                    .messages
                    .delete()
                    .from_remote(&context, &sender, MessageId(delete.message_id), created_at)
                    .await
            }
            Body::TypingIndicator(_) => Ok(()),
        }
    }
}

pub(crate) fn receipt_status(status: i32) -> std::result::Result<ReceiptStatus, DispatchError> {
    match ReceiptStatus::try_from(status) {
        Ok(ReceiptStatus::Unspecified) | Err(_) => {
            Err(DispatchError::Invalid(format!("delivery receipt status {status}")))
        }
        Ok(status) => Ok(status),
    }
}

impl ActiveTask for IncomingMessageTask {
    type Output = ();

    fn name(&self) -> &'static str {
        "incoming-message"
    }

    fn persistence(&self) -> Persistence {
        Persistence::Volatile
    }

    fn message_id(&self) -> Option<MessageId> {
        Some(MessageId(self.message.message_id))
    }

    fn run<'a>(&'a self, handle: &'a ActiveTaskCodecHandle) -> TaskFuture<'a, ()> {
        self.receive(handle).boxed()
    }
}
