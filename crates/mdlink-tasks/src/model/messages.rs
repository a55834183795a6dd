//! Conversation messages and their delivery state.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};

use mdlink_proto::csp::delivery_receipt::Status as ReceiptStatus;
use mdlink_protocol::{IdentityString, MessageId};
use rand::Rng;

use crate::dispatch::{DispatchError, DistributionEvent, Origin, RemoteContext, SyncContext};
use crate::model::ReactionAction;
use crate::services::TaskServices;
use crate::task::TaskResult;
use crate::tasks::{OutgoingCspMessageTask, OutgoingDeliveryReceiptTask, ReflectReadTask};

/// Reaction applied when a contact acknowledges one of our messages.
pub const ACKNOWLEDGE_EMOJI: &str = "\u{1f44d}";
/// Reaction applied when a contact declines one of our messages.
pub const DECLINE_EMOJI: &str = "\u{1f44e}";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Inbound,
    Outbound,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageView {
    pub contact: IdentityString,
    pub direction: Direction,
    pub id: MessageId,
    pub created_at: u64,
    pub text: String,
    /// Inbound: when this user read it. Outbound: when the contact read it.
    pub read_at: Option<u64>,
    pub delivered_at: Option<u64>,
    pub sent_at: Option<u64>,
    pub edited_at: Option<u64>,
    /// Set once the message was deleted for everyone. The text and the
    /// reactions are gone then.
    pub deleted_at: Option<u64>,
    /// Emoji per reacting identity.
    pub reactions: BTreeMap<IdentityString, BTreeSet<String>>,
}

impl MessageView {
    fn new(
        contact: IdentityString,
        direction: Direction,
        id: MessageId,
        created_at: u64,
        text: String,
    ) -> Self {
        Self {
            contact,
            direction,
            id,
            created_at,
            text,
            read_at: None,
            delivered_at: None,
            sent_at: None,
            edited_at: None,
            deleted_at: None,
            reactions: BTreeMap::new(),
        }
    }

    fn edit(&mut self, text: String, at: u64) {
        self.text = text;
        self.edited_at = Some(at);
    }

    fn delete(&mut self, at: u64) {
        self.text.clear();
        self.reactions.clear();
        self.deleted_at = Some(at);
    }

    fn react(&mut self, reactor: IdentityString, action: &ReactionAction) {
        match action {
            ReactionAction::Apply(emoji) => {
                self.reactions.entry(reactor).or_default().insert(emoji.clone());
            }
            ReactionAction::Withdraw(emoji) => {
                if let Some(emojis) = self.reactions.get_mut(&reactor) {
                    emojis.remove(emoji);
                    if emojis.is_empty() {
                        self.reactions.remove(&reactor);
                    }
                }
            }
        }
    }
}

type MessageKey = (IdentityString, Direction, MessageId);

#[derive(Default)]
pub struct Messages {
    records: Mutex<HashMap<MessageKey, MessageView>>,
}

impl Messages {
    fn records(&self) -> MutexGuard<'_, HashMap<MessageKey, MessageView>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn get(
        &self,
        contact: &IdentityString,
        direction: Direction,
        id: MessageId,
    ) -> Option<MessageView> {
        self.records()
            .get(&(contact.clone(), direction, id))
            .cloned()
    }

    /// All messages exchanged with `contact`, oldest first.
    pub fn conversation(&self, contact: &IdentityString) -> Vec<MessageView> {
        let mut messages: Vec<MessageView> = self
            .records()
            .values()
            .filter(|message| &message.contact == contact)
            .cloned()
            .collect();
        messages.sort_by_key(|message| (message.created_at, message.id));
        messages
    }

    fn insert(&self, message: MessageView) {
        let key = (message.contact.clone(), message.direction, message.id);
        self.records().entry(key).or_insert(message);
    }

    fn ensure_all(
        &self,
        contact: &IdentityString,
        direction: Direction,
        ids: &[MessageId],
    ) -> Result<(), DispatchError> {
        let records = self.records();
        for id in ids {
            if !records.contains_key(&(contact.clone(), direction, *id)) {
                return Err(DispatchError::UnknownMessage {
                    contact: contact.clone(),
                    message_id: *id,
                });
            }
        }
        Ok(())
    }

    fn update_all(
        &self,
        contact: &IdentityString,
        direction: Direction,
        ids: &[MessageId],
        mut update: impl FnMut(&mut MessageView),
    ) {
        let mut records = self.records();
        for id in ids {
            if let Some(message) = records.get_mut(&(contact.clone(), direction, *id)) {
                update(message);
            }
        }
    }

    /// The message an edit or a deletion refers to must exist and must not
    /// be deleted already. Changes of this user additionally need an
    /// outbound message the chat server accepted.
    fn ensure_changeable(
        &self,
        contact: &IdentityString,
        direction: Direction,
        id: MessageId,
        local: bool,
    ) -> Result<(), DispatchError> {
        let records = self.records();
        let message = records
            .get(&(contact.clone(), direction, id))
            .ok_or_else(|| DispatchError::UnknownMessage {
                contact: contact.clone(),
                message_id: id,
            })?;
        if message.deleted_at.is_some() {
            return Err(DispatchError::Invalid(format!("change of deleted message {id}")));
        }
        if local && message.sent_at.is_none() {
            return Err(DispatchError::Invalid(format!("change of unsent message {id}")));
        }
        Ok(())
    }

    fn update(
        &self,
        contact: &IdentityString,
        direction: Direction,
        id: MessageId,
        update: impl FnOnce(&mut MessageView),
    ) {
        if let Some(message) = self.records().get_mut(&(contact.clone(), direction, id)) {
            update(message);
        }
    }

    /// Direction of the message a reaction refers to. Inbound messages win
    /// if both directions share the id.
    fn reaction_target(
        &self,
        contact: &IdentityString,
        id: MessageId,
    ) -> Result<Direction, DispatchError> {
        let records = self.records();
        [Direction::Inbound, Direction::Outbound]
            .into_iter()
            .find(|direction| records.contains_key(&(contact.clone(), *direction, id)))
            .ok_or_else(|| DispatchError::UnknownMessage {
                contact: contact.clone(),
                message_id: id,
            })
    }

    pub fn incoming(&self) -> IncomingMessages<'_> {
        IncomingMessages { messages: self }
    }

    pub fn outgoing(&self) -> OutgoingMessages<'_> {
        OutgoingMessages { messages: self }
    }

    pub fn sent(&self) -> SentState<'_> {
        SentState { messages: self }
    }

    pub fn read(&self) -> ReadState<'_> {
        ReadState { messages: self }
    }

    pub fn delivery(&self) -> DeliveryState<'_> {
        DeliveryState { messages: self }
    }

    pub fn reactions(&self) -> Reactions<'_> {
        Reactions { messages: self }
    }

    pub fn edit(&self) -> MessageEdits<'_> {
        MessageEdits { messages: self }
    }

    pub fn delete(&self) -> MessageDeletions<'_> {
        MessageDeletions { messages: self }
    }
}

/// Text messages received from contacts.
pub struct IncomingMessages<'a> {
    messages: &'a Messages,
}

impl IncomingMessages<'_> {
    pub fn from_sync(
        &self,
        context: &SyncContext<'_>,
        sender: IdentityString,
        id: MessageId,
        created_at: u64,
        text: String,
    ) -> Result<(), DispatchError> {
        context.claim(DistributionEvent::IncomingMessage {
            sender: sender.clone(),
            message_id: id,
        })?;
        self.messages
            .insert(MessageView::new(sender, Direction::Inbound, id, created_at, text));
        Ok(())
    }

    pub async fn from_remote(
        &self,
        context: &RemoteContext<'_>,
        sender: IdentityString,
        id: MessageId,
        created_at: u64,
        text: String,
    ) -> crate::Result<()> {
        let event = DistributionEvent::IncomingMessage {
            sender: sender.clone(),
            message_id: id,
        };
        context
            .distribute(vec![event], || {
                self.messages
                    .insert(MessageView::new(sender, Direction::Inbound, id, created_at, text));
                Ok(())
            })
            .await
    }
}

/// Text messages this user sends.
pub struct OutgoingMessages<'a> {
    messages: &'a Messages,
}

impl OutgoingMessages<'_> {
    /// Store a new text message to `receiver` and schedule sending it.
    pub fn from_local(
        &self,
        services: &TaskServices,
        receiver: IdentityString,
        text: String,
    ) -> Result<(MessageId, TaskResult<()>), DispatchError> {
        let id = MessageId(rand::thread_rng().r#gen());
        let created_at = services.now_ms();
        services.ledger.claim(
            DistributionEvent::OutgoingMessage {
                receiver: receiver.clone(),
                message_id: id,
            },
            Origin::Local,
        )?;
        self.messages.insert(MessageView::new(
            receiver.clone(),
            Direction::Outbound,
            id,
            created_at,
            text.clone(),
        ));
        let result = services
            .scheduler
            .schedule(OutgoingCspMessageTask::text(receiver, id, created_at, text));
        Ok((id, result))
    }

    pub fn from_sync(
        &self,
        context: &SyncContext<'_>,
        receiver: IdentityString,
        id: MessageId,
        created_at: u64,
        text: String,
    ) -> Result<(), DispatchError> {
        context.claim(DistributionEvent::OutgoingMessage {
            receiver: receiver.clone(),
            message_id: id,
        })?;
        self.messages
            .insert(MessageView::new(receiver, Direction::Outbound, id, created_at, text));
        Ok(())
    }
}

/// Whether the chat server accepted an outbound message.
pub struct SentState<'a> {
    messages: &'a Messages,
}

impl SentState<'_> {
    pub fn from_sync(
        &self,
        context: &SyncContext<'_>,
        receiver: &IdentityString,
        id: MessageId,
        at: u64,
    ) -> Result<(), DispatchError> {
        self.messages
            .ensure_all(receiver, Direction::Outbound, &[id])?;
        context.claim(DistributionEvent::MessageSent {
            receiver: receiver.clone(),
            message_id: id,
        })?;
        self.mark(receiver, id, at);
        Ok(())
    }

    /// Record the chat server's ack of a message sent by this device.
    pub(crate) fn mark(&self, receiver: &IdentityString, id: MessageId, at: u64) {
        self.messages
            .update_all(receiver, Direction::Outbound, &[id], |message| {
                message.sent_at.get_or_insert(at);
            });
    }
}

/// Read state of inbound messages.
pub struct ReadState<'a> {
    messages: &'a Messages,
}

impl ReadState<'_> {
    /// The user read messages of `sender` on this device.
    ///
    /// With read receipts enabled the receipt is sent to the sender, which
    /// also reflects it. Otherwise only the other devices learn about it.
    pub fn from_local(
        &self,
        services: &TaskServices,
        sender: IdentityString,
        ids: Vec<MessageId>,
    ) -> Result<TaskResult<()>, DispatchError> {
        if ids.is_empty() {
            return Err(DispatchError::Invalid("read of no messages".into()));
        }
        self.messages
            .ensure_all(&sender, Direction::Inbound, &ids)?;
        let events = ids
            .iter()
            .map(|id| DistributionEvent::MessageRead {
                sender: sender.clone(),
                message_id: *id,
            })
            .collect();
        services.ledger.claim_all(events, Origin::Local)?;

        let read_at = services.now_ms();
        self.mark(&sender, &ids, read_at);
        let result = if services.model.sends_read_receipts(&sender) {
            services.scheduler.schedule(OutgoingDeliveryReceiptTask::new(
                sender,
                ReceiptStatus::Read,
                ids,
                read_at,
            ))
        } else {
            services
                .scheduler
                .schedule(ReflectReadTask::new(sender, ids, read_at))
        };
        Ok(result)
    }

    pub fn from_sync(
        &self,
        context: &SyncContext<'_>,
        sender: &IdentityString,
        ids: &[MessageId],
        read_at: u64,
    ) -> Result<(), DispatchError> {
        self.messages.ensure_all(sender, Direction::Inbound, ids)?;
        context.claim_all(
            ids.iter()
                .map(|id| DistributionEvent::MessageRead {
                    sender: sender.clone(),
                    message_id: *id,
                })
                .collect(),
        )?;
        self.mark(sender, ids, read_at);
        Ok(())
    }

    fn mark(&self, sender: &IdentityString, ids: &[MessageId], read_at: u64) {
        self.messages
            .update_all(sender, Direction::Inbound, ids, |message| {
                message.read_at.get_or_insert(read_at);
            });
    }
}

/// Delivery receipts a contact sent for outbound messages.
pub struct DeliveryState<'a> {
    messages: &'a Messages,
}

impl DeliveryState<'_> {
    pub fn from_sync(
        &self,
        context: &SyncContext<'_>,
        receiver: &IdentityString,
        status: ReceiptStatus,
        ids: &[MessageId],
        at: u64,
    ) -> Result<(), DispatchError> {
        self.messages.ensure_all(receiver, Direction::Outbound, ids)?;
        context.claim_all(receipt_events(receiver, status, ids))?;
        self.apply(receiver, status, ids, at);
        Ok(())
    }

    pub async fn from_remote(
        &self,
        context: &RemoteContext<'_>,
        receiver: &IdentityString,
        status: ReceiptStatus,
        ids: &[MessageId],
        at: u64,
    ) -> crate::Result<()> {
        self.messages.ensure_all(receiver, Direction::Outbound, ids)?;
        context
            .distribute(receipt_events(receiver, status, ids), || {
                self.apply(receiver, status, ids, at);
                Ok(())
            })
            .await
    }

    fn apply(&self, receiver: &IdentityString, status: ReceiptStatus, ids: &[MessageId], at: u64) {
        self.messages
            .update_all(receiver, Direction::Outbound, ids, |message| match status {
                ReceiptStatus::Received => {
                    message.delivered_at.get_or_insert(at);
                }
                ReceiptStatus::Read => {
                    message.read_at.get_or_insert(at);
                }
                ReceiptStatus::Acknowledged => message.react(
                    receiver.clone(),
                    &ReactionAction::Apply(ACKNOWLEDGE_EMOJI.into()),
                ),
                ReceiptStatus::Declined => message.react(
                    receiver.clone(),
                    &ReactionAction::Apply(DECLINE_EMOJI.into()),
                ),
                ReceiptStatus::Unspecified => {}
            });
    }
}

fn receipt_events(
    receiver: &IdentityString,
    status: ReceiptStatus,
    ids: &[MessageId],
) -> Vec<DistributionEvent> {
    ids.iter()
        .map(|id| DistributionEvent::DeliveryReceipt {
            receiver: receiver.clone(),
            message_id: *id,
            status: status as i32,
        })
        .collect()
}

/// Emoji reactions on messages of either direction.
pub struct Reactions<'a> {
    messages: &'a Messages,
}

impl Reactions<'_> {
    /// This user reacts to a message exchanged with `contact`.
    pub fn from_local(
        &self,
        services: &TaskServices,
        contact: IdentityString,
        id: MessageId,
        action: ReactionAction,
    ) -> Result<TaskResult<()>, DispatchError> {
        let direction = self.messages.reaction_target(&contact, id)?;
        let at = services.now_ms();
        services.ledger.claim(
            DistributionEvent::Reaction {
                contact: contact.clone(),
                message_id: id,
                reactor: services.identity.clone(),
                action: action.clone(),
                at,
            },
            Origin::Local,
        )?;
        self.messages
            .update_all(&contact, direction, &[id], |message| {
                message.react(services.identity.clone(), &action)
            });
        Ok(services
            .scheduler
            .schedule(OutgoingCspMessageTask::reaction(contact, id, action, at)))
    }

    pub fn from_sync(
        &self,
        context: &SyncContext<'_>,
        contact: &IdentityString,
        id: MessageId,
        reactor: IdentityString,
        action: ReactionAction,
        at: u64,
    ) -> Result<(), DispatchError> {
        let direction = self.messages.reaction_target(contact, id)?;
        context.claim(DistributionEvent::Reaction {
            contact: contact.clone(),
            message_id: id,
            reactor: reactor.clone(),
            action: action.clone(),
            at,
        })?;
        self.messages
            .update_all(contact, direction, &[id], |message| {
                message.react(reactor.clone(), &action)
            });
        Ok(())
    }

    /// `sender` reacted to a message of the conversation with them.
    pub async fn from_remote(
        &self,
        context: &RemoteContext<'_>,
        sender: &IdentityString,
        id: MessageId,
        action: ReactionAction,
        at: u64,
    ) -> crate::Result<()> {
        let event = DistributionEvent::Reaction {
            contact: sender.clone(),
            message_id: id,
            reactor: sender.clone(),
            action: action.clone(),
            at,
        };
        let direction = self.messages.reaction_target(sender, id)?;
        context
            .distribute(vec![event], || {
                self.messages
                    .update_all(sender, direction, &[id], |message| {
                        message.react(sender.clone(), &action)
                    });
                Ok(())
            })
            .await
    }
}

/// New text for a message. Only the author edits a message, so this user
/// edits outbound messages and contacts edit inbound ones.
pub struct MessageEdits<'a> {
    messages: &'a Messages,
}

impl MessageEdits<'_> {
    pub fn from_local(
        &self,
        services: &TaskServices,
        receiver: IdentityString,
        id: MessageId,
        text: String,
    ) -> Result<TaskResult<()>, DispatchError> {
        self.messages
            .ensure_changeable(&receiver, Direction::Outbound, id, true)?;
        let edit_id = MessageId(rand::thread_rng().r#gen());
        let at = services.now_ms();
        services.ledger.claim(
            DistributionEvent::MessageEdit {
                contact: receiver.clone(),
                message_id: id,
                edit_id,
            },
            Origin::Local,
        )?;
        self.messages
            .update(&receiver, Direction::Outbound, id, |message| {
                message.edit(text.clone(), at)
            });
        Ok(services
            .scheduler
            .schedule(OutgoingCspMessageTask::edit(receiver, edit_id, id, text, at)))
    }

    /// `edit_id` is the id of the message that carried the edit.
    #[allow(clippy::too_many_arguments)]
    pub fn from_sync(
        &self,
        context: &SyncContext<'_>,
        contact: &IdentityString,
        direction: Direction,
        id: MessageId,
        edit_id: MessageId,
        text: String,
        at: u64,
    ) -> Result<(), DispatchError> {
        self.messages.ensure_changeable(contact, direction, id, false)?;
        context.claim(DistributionEvent::MessageEdit {
            contact: contact.clone(),
            message_id: id,
            edit_id,
        })?;
        self.messages
            .update(contact, direction, id, |message| message.edit(text, at));
        Ok(())
    }

    pub async fn from_remote(
        &self,
        context: &RemoteContext<'_>,
        sender: &IdentityString,
        id: MessageId,
        edit_id: MessageId,
        text: String,
        at: u64,
    ) -> crate::Result<()> {
        self.messages
            .ensure_changeable(sender, Direction::Inbound, id, false)?;
        let event = DistributionEvent::MessageEdit {
            contact: sender.clone(),
            message_id: id,
            edit_id,
        };
        context
            .distribute(vec![event], || {
                self.messages
                    .update(sender, Direction::Inbound, id, |message| message.edit(text, at));
                Ok(())
            })
            .await
    }
}

/// Deletion of a message for everyone, by its author.
pub struct MessageDeletions<'a> {
    messages: &'a Messages,
}

impl MessageDeletions<'_> {
    pub fn from_local(
        &self,
        services: &TaskServices,
        receiver: IdentityString,
        id: MessageId,
    ) -> Result<TaskResult<()>, DispatchError> {
        self.messages
            .ensure_changeable(&receiver, Direction::Outbound, id, true)?;
        let at = services.now_ms();
        services.ledger.claim(
            DistributionEvent::MessageDelete {
                contact: receiver.clone(),
                message_id: id,
            },
            Origin::Local,
        )?;
        self.messages
            .update(&receiver, Direction::Outbound, id, |message| message.delete(at));
        Ok(services
            .scheduler
            .schedule(OutgoingCspMessageTask::delete(receiver, id, at)))
    }

    pub fn from_sync(
        &self,
        context: &SyncContext<'_>,
        contact: &IdentityString,
        direction: Direction,
        id: MessageId,
        at: u64,
    ) -> Result<(), DispatchError> {
        self.messages.ensure_changeable(contact, direction, id, false)?;
        context.claim(DistributionEvent::MessageDelete {
            contact: contact.clone(),
            message_id: id,
        })?;
        self.messages
            .update(contact, direction, id, |message| message.delete(at));
        Ok(())
    }

    pub async fn from_remote(
        &self,
        context: &RemoteContext<'_>,
        sender: &IdentityString,
        id: MessageId,
        at: u64,
    ) -> crate::Result<()> {
        self.messages
            .ensure_changeable(sender, Direction::Inbound, id, false)?;
        let event = DistributionEvent::MessageDelete {
            contact: sender.clone(),
            message_id: id,
        };
        context
            .distribute(vec![event], || {
                self.messages
                    .update(sender, Direction::Inbound, id, |message| message.delete(at));
                Ok(())
            })
            .await
    }
}
