use futures_util::FutureExt;
use mdlink_crypto::NonceScope;
use mdlink_proto::csp::delivery_receipt::Status as ReceiptStatus;
use mdlink_proto::csp::e2e_message::Body;
use mdlink_proto::{csp, d2d};
use mdlink_protocol::{IdentityString, MessageId, OutboundMessage, Reflected, ReflectedAck};
use prost::Message;

use crate::codec::PassiveTaskCodecHandle;
use crate::dispatch::{DispatchError, SyncContext};
use crate::model::{
    ContactChange, Direction, Model, ReactionAction, SettingsUpdate, parse_identity,
};
use crate::services::TaskServices;
use crate::task::{PassiveTask, TaskFuture};
use crate::tasks::incoming_message::receipt_status;

/// Applies an envelope another device of the group reflected.
///
/// The envelope nonce is committed before `REFLECTED_ACK` is sent. An
/// envelope that cannot be decrypted or applied is logged and dropped, but
/// still acknowledged so that the mediator does not deliver it again.
/// Ephemeral reflections are never acknowledged.
pub struct ReflectedTask {
    reflected: Reflected,
}

impl ReflectedTask {
    pub fn new(reflected: Reflected) -> Self {
        Self { reflected }
    }

    async fn process(&mut self, handle: &PassiveTaskCodecHandle) -> crate::Result<()> {
        let services = handle.services();
        let reflected_id = self.reflected.reflected_id;
        let reflect_box = services.keys.reflect_box()?;

        match reflect_box.decrypt_nonce_ahead(
            &services.nonces,
            NonceScope::D2d,
            &self.reflected.envelope,
        ) {
            Ok((plaintext, guard)) => {
                let context = SyncContext::new(&services.ledger, self.reflected.timestamp);
                match apply_envelope(services, &context, &plaintext) {
                    Ok(()) => guard.commit()?,
                    Err(err) => {
                        tracing::warn!(reflected_id, error = %err, "discarding reflected envelope");
                        guard.discard();
                    }
                }
            }
            Err(err) => {
                tracing::warn!(reflected_id, error = %err, "undecryptable reflected envelope");
            }
        }

        if self.reflected.is_ephemeral() {
            return Ok(());
        }
        handle
            .write(OutboundMessage::ReflectedAck(ReflectedAck { reflected_id }))
            .await
    }
}

impl PassiveTask for ReflectedTask {
    type Output = ();

    fn name(&self) -> &'static str {
        "reflected"
    }

    fn run<'a>(&'a mut self, handle: &'a PassiveTaskCodecHandle) -> TaskFuture<'a, ()> {
        self.process(handle).boxed()
    }
}

fn decode<T: Message + Default>(what: &str, bytes: &[u8]) -> Result<T, DispatchError> {
    T::decode(bytes).map_err(|err| DispatchError::Invalid(format!("{what}: {err}")))
}

fn e2e_body(bytes: &[u8]) -> Result<Body, DispatchError> {
    decode::<csp::E2eMessage>("message body", bytes)?
        .body
        .ok_or_else(|| DispatchError::Invalid("message without body".into()))
}

fn message_ids(ids: Vec<u64>) -> Vec<MessageId> {
    ids.into_iter().map(MessageId).collect()
}

fn apply_envelope(
    services: &TaskServices,
    context: &SyncContext<'_>,
    plaintext: &[u8],
) -> Result<(), DispatchError> {
    let envelope: d2d::Envelope = decode("envelope", plaintext)?;
    let model = &services.model;
    match envelope.content {
        Some(d2d::envelope::Content::IncomingMessage(message)) => {
            let sender = parse_identity("sender identity", &message.sender_identity)?;
            apply_incoming(model, context, sender, message)
        }
        Some(d2d::envelope::Content::OutgoingMessage(message)) => {
            let receiver = parse_identity("receiver identity", &message.receiver_identity)?;
            apply_outgoing(services, context, receiver, message)
        }
        Some(d2d::envelope::Content::IncomingMessageUpdate(update)) => {
            for update in update.updates {
                let sender = parse_identity("sender identity", &update.sender_identity)?;
                match update.update {
                    Some(d2d::incoming_message_update::update::Update::Read(read)) => {
                        model.messages.read().from_sync(
                            context,
                            &sender,
                            &[MessageId(update.message_id)],
                            read.at,
                        )?;
                    }
                    None => return Err(DispatchError::Invalid("empty incoming update".into())),
                }
            }
            Ok(())
        }
        Some(d2d::envelope::Content::OutgoingMessageUpdate(update)) => {
            for update in update.updates {
                let receiver = parse_identity("receiver identity", &update.receiver_identity)?;
                match update.update {
                    Some(d2d::outgoing_message_update::update::Update::Sent(sent)) => {
                        model.messages.sent().from_sync(
                            context,
                            &receiver,
                            MessageId(update.message_id),
                            sent.at,
                        )?;
                    }
                    None => return Err(DispatchError::Invalid("empty outgoing update".into())),
                }
            }
            Ok(())
        }
        Some(d2d::envelope::Content::UserProfileSync(sync)) => {
            use d2d::user_profile_sync::profile_picture::Image;
            match sync.profile_picture.and_then(|picture| picture.image) {
                Some(Image::UpdatedBlobId(blob_id)) => {
                    model.profile.picture().from_sync(context, Some(blob_id))
                }
                Some(Image::Removed(_)) => model.profile.picture().from_sync(context, None),
                None => Err(DispatchError::Invalid("user profile sync without picture".into())),
            }
        }
        Some(d2d::envelope::Content::ContactSync(sync)) => model
            .contacts
            .sync()
            .from_sync(context, ContactChange::from_proto(sync)?),
        Some(d2d::envelope::Content::SettingsSync(sync)) => model
            .settings
            .sync()
            .from_sync(context, SettingsUpdate::from_proto(sync)?),
        None => Err(DispatchError::Invalid("empty envelope".into())),
    }
}

/// A message a contact sent, received by another device.
fn apply_incoming(
    model: &Model,
    context: &SyncContext<'_>,
    sender: IdentityString,
    message: d2d::IncomingMessage,
) -> Result<(), DispatchError> {
    let id = MessageId(message.message_id);
    let at = message.created_at;
    match e2e_body(&message.body)? {
        Body::Text(text) => model
            .messages
            .incoming()
            .from_sync(context, sender, id, at, text.text),
        Body::DeliveryReceipt(receipt) => model.messages.delivery().from_sync(
            context,
            &sender,
            receipt_status(receipt.status)?,
            &message_ids(receipt.message_ids),
            at,
        ),
        Body::Reaction(reaction) => model.messages.reactions().from_sync(
            context,
            &sender,
            MessageId(reaction.message_id),
            sender.clone(),
            ReactionAction::from_proto(reaction.action)?,
            at,
        ),
        Body::SetProfilePicture(picture) => {
            model
                .contacts
                .profile_picture()
                .from_sync(context, &sender, id, Some(picture.blob_id))
        }
        Body::DeleteProfilePicture(_) => {
            model
                .contacts
                .profile_picture()
                .from_sync(context, &sender, id, None)
        }
        Body::EditMessage(edit) => model.messages.edit().from_sync(
            context,
            &sender,
            Direction::Inbound,
            MessageId(edit.message_id),
            id,
            edit.text,
            at,
        ),
        Body::DeleteMessage(delete) => model.messages.delete().from_sync(
            context,
            &sender,
            Direction::Inbound,
            MessageId(delete.message_id),
            at,
        ),
        Body::TypingIndicator(_) => Err(DispatchError::Invalid(
            "reflected typing indicator".into(),
        )),
    }
}

/// A message this user sent from another device.
fn apply_outgoing(
    services: &TaskServices,
    context: &SyncContext<'_>,
    receiver: IdentityString,
    message: d2d::OutgoingMessage,
) -> Result<(), DispatchError> {
    let model = &services.model;
    let id = MessageId(message.message_id);
    let at = message.created_at;
    match e2e_body(&message.body)? {
        Body::Text(text) => model
            .messages
            .outgoing()
            .from_sync(context, receiver, id, at, text.text),
        Body::DeliveryReceipt(receipt) => match receipt_status(receipt.status)? {
            ReceiptStatus::Read => model.messages.read().from_sync(
                context,
                &receiver,
                &message_ids(receipt.message_ids),
                at,
            ),
            status => {
                tracing::debug!(?status, "ignoring reflected outgoing receipt");
                Ok(())
            }
        },
        Body::Reaction(reaction) => model.messages.reactions().from_sync(
            context,
            &receiver,
            MessageId(reaction.message_id),
            services.identity.clone(),
            ReactionAction::from_proto(reaction.action)?,
            at,
        ),
        Body::EditMessage(edit) => model.messages.edit().from_sync(
            context,
            &receiver,
            Direction::Outbound,
            MessageId(edit.message_id),
            id,
            edit.text,
            at,
        ),
        Body::DeleteMessage(delete) => model.messages.delete().from_sync(
            context,
            &receiver,
            Direction::Outbound,
            MessageId(delete.message_id),
            at,
        ),
        Body::SetProfilePicture(_) | Body::DeleteProfilePicture(_) => {
            tracing::debug!(receiver = %receiver, "ignoring reflected profile picture distribution");
            Ok(())
        }
        Body::TypingIndicator(_) => Err(DispatchError::Invalid(
            "reflected typing indicator".into(),
        )),
    }
}
