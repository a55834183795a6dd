//! Entry points shared by all multi-device relevant mutations.
//!
//! Every mutation a model controller offers comes in up to three flavours:
//!
//! - `from_local`: the user did something on this device. The model is
//!   updated and a task is scheduled that reflects and/or sends the change.
//! - `from_sync`: another device of the group reflected the change. The model
//!   is updated, nothing is sent. [`SyncContext`] has no means to write.
//! - `from_remote`: a contact sent the change over the chat server. The model
//!   is updated and the incoming message is reflected exactly once through
//!   [`RemoteContext`], which cannot write chat server messages.
//!
//! Each call names the logical event it handles. The [`DistributionLedger`]
//! remembers which entry point handled an event and refuses a second one.

use std::fmt;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use lru::LruCache;
use mdlink_proto::d2d;
use mdlink_protocol::{DeviceId, IdentityString, MessageId};
use thiserror::Error;

use crate::codec::ActiveTaskCodecHandle;
use crate::model::{ContactChange, ReactionAction, SettingsUpdate};

pub const DEFAULT_LEDGER_CAPACITY: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    Local,
    Sync,
    Remote,
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Origin::Local => "from_local",
            Origin::Sync => "from_sync",
            Origin::Remote => "from_remote",
        })
    }
}

#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("{event} was already distributed {first}, refusing {second}")]
    AlreadyDistributed {
        event: String,
        first: Origin,
        second: Origin,
    },

    #[error("unknown message {message_id} with {contact}")]
    UnknownMessage {
        contact: IdentityString,
        message_id: MessageId,
    },

    #[error("invalid {0}")]
    Invalid(String),
}

/// A logical multi-device event, independent of the path it arrived on.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DistributionEvent {
    IncomingMessage {
        sender: IdentityString,
        message_id: MessageId,
    },
    OutgoingMessage {
        receiver: IdentityString,
        message_id: MessageId,
    },
    MessageSent {
        receiver: IdentityString,
        message_id: MessageId,
    },
    MessageRead {
        sender: IdentityString,
        message_id: MessageId,
    },
    DeliveryReceipt {
        receiver: IdentityString,
        message_id: MessageId,
        status: i32,
    },
    Reaction {
        contact: IdentityString,
        message_id: MessageId,
        reactor: IdentityString,
        action: ReactionAction,
        at: u64,
    },
    TypingIndicator {
        contact: IdentityString,
        message_id: MessageId,
    },
    ContactProfilePicture {
        contact: IdentityString,
        message_id: MessageId,
    },
    MessageEdit {
        contact: IdentityString,
        message_id: MessageId,
        edit_id: MessageId,
    },
    MessageDelete {
        contact: IdentityString,
        message_id: MessageId,
    },
    OwnProfilePicture {
        blob_id: Option<Vec<u8>>,
        at: u64,
    },
    ContactSync {
        change: ContactChange,
        at: u64,
    },
    SettingsSync {
        update: SettingsUpdate,
        at: u64,
    },
    DeviceDrop(DeviceId),
}

type Seen = LruCache<DistributionEvent, Origin>;

/// Remembers which entry point handled the most recent events.
pub struct DistributionLedger {
    seen: Arc<Mutex<Seen>>,
}

impl Default for DistributionLedger {
    fn default() -> Self {
        Self::new(NonZeroUsize::new(DEFAULT_LEDGER_CAPACITY).unwrap_or(NonZeroUsize::MIN))
    }
}

impl DistributionLedger {
    pub fn new(capacity: NonZeroUsize) -> Self {
        Self {
            seen: Arc::new(Mutex::new(LruCache::new(capacity))),
        }
    }

    fn seen(&self) -> MutexGuard<'_, Seen> {
        self.seen.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record that `origin` handles `event`.
    pub fn claim(&self, event: DistributionEvent, origin: Origin) -> Result<(), DispatchError> {
        self.claim_all(vec![event], origin)
    }

    /// Record that `origin` handles all of `events`, or none of them if one
    /// was already handled.
    pub fn claim_all(
        &self,
        events: Vec<DistributionEvent>,
        origin: Origin,
    ) -> Result<(), DispatchError> {
        let mut seen = self.seen();
        for event in &events {
            if let Some(first) = seen.peek(event) {
                tracing::warn!(?event, %first, second = %origin, "event distributed twice");
                return Err(DispatchError::AlreadyDistributed {
                    event: format!("{event:?}"),
                    first: *first,
                    second: origin,
                });
            }
        }
        for event in events {
            seen.put(event, origin);
        }
        Ok(())
    }

    /// Like [`claim`](Self::claim), but the event is forgotten again when
    /// the returned [`LedgerClaim`] is dropped. Used for events that may be
    /// attempted again once the current attempt has ended, whatever its
    /// outcome.
    pub fn claim_scoped(
        &self,
        event: DistributionEvent,
        origin: Origin,
    ) -> Result<LedgerClaim, DispatchError> {
        self.claim(event.clone(), origin)?;
        Ok(LedgerClaim {
            seen: Arc::clone(&self.seen),
            event,
            origin,
        })
    }

    /// Forget `events`, e.g. because distributing them failed midway.
    pub(crate) fn release(&self, events: &[DistributionEvent]) {
        let mut seen = self.seen();
        for event in events {
            seen.pop(event);
        }
    }

    pub fn origin(&self, event: &DistributionEvent) -> Option<Origin> {
        self.seen().peek(event).copied()
    }
}

/// An event claimed for as long as this value lives.
pub struct LedgerClaim {
    seen: Arc<Mutex<Seen>>,
    event: DistributionEvent,
    origin: Origin,
}

impl LedgerClaim {
    pub fn event(&self) -> &DistributionEvent {
        &self.event
    }
}

impl fmt::Debug for LedgerClaim {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LedgerClaim")
            .field("event", &self.event)
            .field("origin", &self.origin)
            .finish()
    }
}

impl Drop for LedgerClaim {
    fn drop(&mut self) {
        let mut seen = self.seen.lock().unwrap_or_else(PoisonError::into_inner);
        // The entry may have been evicted and claimed anew meanwhile.
        if seen.peek(&self.event) == Some(&self.origin) {
            seen.pop(&self.event);
        }
    }
}

/// Capabilities of a `from_sync` entry point: claiming the event, nothing else.
pub struct SyncContext<'a> {
    ledger: &'a DistributionLedger,
    /// Mediator timestamp of the reflection in milliseconds.
    reflected_at: u64,
}

impl<'a> SyncContext<'a> {
    pub fn new(ledger: &'a DistributionLedger, reflected_at: u64) -> Self {
        Self {
            ledger,
            reflected_at,
        }
    }

    pub fn reflected_at(&self) -> u64 {
        self.reflected_at
    }

    pub fn claim(&self, event: DistributionEvent) -> Result<(), DispatchError> {
        self.ledger.claim(event, Origin::Sync)
    }

    pub fn claim_all(&self, events: Vec<DistributionEvent>) -> Result<(), DispatchError> {
        self.ledger.claim_all(events, Origin::Sync)
    }
}

/// Capabilities of a `from_remote` entry point: claiming the event and
/// reflecting the incoming message that caused it, once.
pub struct RemoteContext<'a> {
    handle: &'a ActiveTaskCodecHandle,
    reflection: Mutex<Option<d2d::Envelope>>,
}

impl<'a> RemoteContext<'a> {
    pub fn new(handle: &'a ActiveTaskCodecHandle, reflection: Option<d2d::Envelope>) -> Self {
        Self {
            handle,
            reflection: Mutex::new(reflection),
        }
    }

    /// Claim `events`, reflect the incoming message if that is still
    /// pending, then apply the mutation.
    ///
    /// A reflection cannot be taken back, so callers validate the mutation
    /// against the model before calling this. If reflecting or `apply`
    /// fails the claims are released so that a redelivery of the message is
    /// processed again.
    pub async fn distribute<R>(
        &self,
        events: Vec<DistributionEvent>,
        apply: impl FnOnce() -> Result<R, DispatchError>,
    ) -> crate::Result<R> {
        let ledger = &self.handle.services().ledger;
        ledger.claim_all(events.clone(), Origin::Remote)?;
        if let Err(err) = self.reflect().await {
            ledger.release(&events);
            return Err(err);
        }
        apply().map_err(|err| {
            ledger.release(&events);
            crate::TaskError::from(err)
        })
    }

    /// Reflect the incoming message unless that already happened.
    pub async fn reflect(&self) -> crate::Result<()> {
        let envelope = self
            .reflection
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(envelope) = envelope {
            self.handle.reflect(vec![envelope]).await?;
        }
        Ok(())
    }
}
