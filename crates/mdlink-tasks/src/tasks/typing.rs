//! Typing indicators are sent to the contact only. They are neither
//! reflected nor acknowledged by the chat server.

use futures_util::FutureExt;
use mdlink_proto::csp;
use mdlink_protocol::{IdentityString, MessageId};

use crate::codec::ActiveTaskCodecHandle;
use crate::dispatch::RemoteContext;
use crate::task::{ActiveTask, ComposableTask, Persistence, TaskFuture};
use crate::tasks::outgoing_message::write_csp_message;

/// CSP message flags.
pub(crate) mod flags {
    pub const NO_SERVER_QUEUING: u32 = 0x02;
    pub const NO_SERVER_ACK: u32 = 0x04;
}

pub struct OutgoingTypingIndicatorTask {
    receiver: IdentityString,
    message_id: MessageId,
    is_typing: bool,
}

impl OutgoingTypingIndicatorTask {
    pub fn new(receiver: IdentityString, message_id: MessageId, is_typing: bool) -> Self {
        Self {
            receiver,
            message_id,
            is_typing,
        }
    }
}

impl ActiveTask for OutgoingTypingIndicatorTask {
    type Output = ();

    fn name(&self) -> &'static str {
        "outgoing-typing-indicator"
    }

    fn persistence(&self) -> Persistence {
        Persistence::Volatile
    }

    fn message_id(&self) -> Option<MessageId> {
        Some(self.message_id)
    }

    fn run<'a>(&'a self, handle: &'a ActiveTaskCodecHandle) -> TaskFuture<'a, ()> {
        async move {
            let message = csp::E2eMessage {
                body: Some(csp::e2e_message::Body::TypingIndicator(csp::TypingIndicator {
                    is_typing: self.is_typing,
                })),
            };
            let created_at = handle.services().now_ms();
            write_csp_message(
                handle,
                &self.receiver,
                self.message_id,
                created_at,
                flags::NO_SERVER_QUEUING | flags::NO_SERVER_ACK,
                message,
            )
            .await
        }
        .boxed()
    }
}

/// Applies a contact's typing indicator as part of the incoming message task.
pub struct IncomingTypingIndicatorTask {
    sender: IdentityString,
    message_id: MessageId,
    is_typing: bool,
}

impl IncomingTypingIndicatorTask {
    pub fn new(sender: IdentityString, message_id: MessageId, is_typing: bool) -> Self {
        Self {
            sender,
            message_id,
            is_typing,
        }
    }
}

impl ComposableTask<ActiveTaskCodecHandle> for IncomingTypingIndicatorTask {
    type Output = ();

    fn run<'a>(&'a mut self, handle: &'a ActiveTaskCodecHandle) -> TaskFuture<'a, ()> {
        async move {
            let context = RemoteContext::new(handle, None);
            handle
                .services()
                .model
                .contacts
                .typing()
                .from_remote(&context, &self.sender, self.message_id, self.is_typing)
                .await
        }
        .boxed()
    }
}
