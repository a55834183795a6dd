use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use mdlink_proto::d2d;
use mdlink_protocol::{IdentityString, MessageId};
use rand::Rng;

use crate::dispatch::{DispatchError, DistributionEvent, Origin, RemoteContext, SyncContext};
use crate::model::parse_identity;
use crate::services::TaskServices;
use crate::task::TaskResult;
use crate::tasks::{ContactSyncTask, OutgoingTypingIndicatorTask};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContactView {
    pub nickname: Option<String>,
    /// Overrides [`Settings::read_receipts`](crate::model::Settings::read_receipts).
    pub read_receipts: Option<bool>,
    /// Overrides [`Settings::typing_indicators`](crate::model::Settings::typing_indicators).
    pub typing_indicators: Option<bool>,
    /// Whether the contact is currently typing.
    pub typing: bool,
    /// Blob id of the profile picture the contact distributed to us.
    pub profile_picture: Option<Vec<u8>>,
}

/// Contact properties carried by a contact sync. `None` leaves a property
/// as it is.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ContactUpdate {
    pub identity: IdentityString,
    pub nickname: Option<String>,
    pub read_receipts: Option<bool>,
    pub typing_indicators: Option<bool>,
}

impl ContactUpdate {
    pub fn new(identity: IdentityString) -> Self {
        Self {
            identity,
            nickname: None,
            read_receipts: None,
            typing_indicators: None,
        }
    }

    fn from_proto(contact: d2d::Contact) -> Result<Self, DispatchError> {
        Ok(Self {
            identity: parse_identity("contact identity", &contact.identity)?,
            nickname: contact.nickname,
            read_receipts: contact.read_receipts,
            typing_indicators: contact.typing_indicators,
        })
    }

    fn to_proto(&self) -> d2d::Contact {
        d2d::Contact {
            identity: self.identity.to_string(),
            nickname: self.nickname.clone(),
            read_receipts: self.read_receipts,
            typing_indicators: self.typing_indicators,
        }
    }

    fn apply(&self, view: &mut ContactView) {
        if let Some(nickname) = &self.nickname {
            view.nickname = Some(nickname.clone());
        }
        if let Some(read_receipts) = self.read_receipts {
            view.read_receipts = Some(read_receipts);
        }
        if let Some(typing_indicators) = self.typing_indicators {
            view.typing_indicators = Some(typing_indicators);
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ContactChange {
    Create(ContactUpdate),
    Update(ContactUpdate),
    Delete(IdentityString),
}

impl ContactChange {
    pub fn identity(&self) -> &IdentityString {
        match self {
            ContactChange::Create(update) | ContactChange::Update(update) => &update.identity,
            ContactChange::Delete(identity) => identity,
        }
    }

    pub fn from_proto(sync: d2d::ContactSync) -> Result<Self, DispatchError> {
        use d2d::contact_sync::Action;
        Ok(match sync.action {
            Some(Action::Create(contact)) => {
                ContactChange::Create(ContactUpdate::from_proto(contact)?)
            }
            Some(Action::Update(contact)) => {
                ContactChange::Update(ContactUpdate::from_proto(contact)?)
            }
            Some(Action::DeleteIdentity(identity)) => {
                ContactChange::Delete(parse_identity("contact identity", &identity)?)
            }
            None => return Err(DispatchError::Invalid("contact sync without action".into())),
        })
    }

    pub fn to_proto(&self) -> d2d::ContactSync {
        use d2d::contact_sync::Action;
        let action = match self {
            ContactChange::Create(update) => Action::Create(update.to_proto()),
            ContactChange::Update(update) => Action::Update(update.to_proto()),
            ContactChange::Delete(identity) => Action::DeleteIdentity(identity.to_string()),
        };
        d2d::ContactSync {
            action: Some(action),
        }
    }

    /// Whether the change still fits the current contacts. Creating needs
    /// an unknown identity, updating and deleting a known one.
    pub(crate) fn applies_to(&self, contacts: &Contacts) -> bool {
        let exists = contacts.contacts().contains_key(self.identity());
        match self {
            ContactChange::Create(_) => !exists,
            ContactChange::Update(_) | ContactChange::Delete(_) => exists,
        }
    }

    /// Whether the contacts still show the change after it was applied.
    pub(crate) fn is_applied(&self, contacts: &Contacts) -> bool {
        let exists = contacts.contacts().contains_key(self.identity());
        exists != matches!(self, ContactChange::Delete(_))
    }
}

#[derive(Default)]
pub struct Contacts {
    contacts: Mutex<HashMap<IdentityString, ContactView>>,
}

impl Contacts {
    fn contacts(&self) -> MutexGuard<'_, HashMap<IdentityString, ContactView>> {
        self.contacts.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn get(&self, identity: &IdentityString) -> Option<ContactView> {
        self.contacts().get(identity).cloned()
    }

    fn update(&self, identity: &IdentityString, update: impl FnOnce(&mut ContactView)) {
        update(self.contacts().entry(identity.clone()).or_default());
    }

    pub fn typing(&self) -> Typing<'_> {
        Typing { contacts: self }
    }

    pub fn sync(&self) -> ContactSync<'_> {
        ContactSync { contacts: self }
    }

    pub fn profile_picture(&self) -> ContactProfilePicture<'_> {
        ContactProfilePicture { contacts: self }
    }
}

/// Typing indicators, which are never reflected.
pub struct Typing<'a> {
    contacts: &'a Contacts,
}

impl Typing<'_> {
    /// Tell `contact` whether this user is typing. Returns `None` if typing
    /// indicators are disabled.
    pub fn from_local(
        &self,
        services: &TaskServices,
        contact: IdentityString,
        is_typing: bool,
    ) -> Result<Option<TaskResult<()>>, DispatchError> {
        if !services.model.sends_typing_indicators(&contact) {
            return Ok(None);
        }
        let id = MessageId(rand::thread_rng().r#gen());
        services.ledger.claim(
            DistributionEvent::TypingIndicator {
                contact: contact.clone(),
                message_id: id,
            },
            Origin::Local,
        )?;
        Ok(Some(services.scheduler.schedule(
            OutgoingTypingIndicatorTask::new(contact, id, is_typing),
        )))
    }

    pub async fn from_remote(
        &self,
        context: &RemoteContext<'_>,
        contact: &IdentityString,
        id: MessageId,
        is_typing: bool,
    ) -> crate::Result<()> {
        let event = DistributionEvent::TypingIndicator {
            contact: contact.clone(),
            message_id: id,
        };
        context
            .distribute(vec![event], || {
                self.contacts
                    .update(contact, |view| view.typing = is_typing);
                Ok(())
            })
            .await
    }
}

/// Profile pictures contacts distribute to this user.
pub struct ContactProfilePicture<'a> {
    contacts: &'a Contacts,
}

impl ContactProfilePicture<'_> {
    /// `blob_id` is `None` when the contact removed their picture.
    pub fn from_sync(
        &self,
        context: &SyncContext<'_>,
        contact: &IdentityString,
        id: MessageId,
        blob_id: Option<Vec<u8>>,
    ) -> Result<(), DispatchError> {
        context.claim(DistributionEvent::ContactProfilePicture {
            contact: contact.clone(),
            message_id: id,
        })?;
        self.contacts
            .update(contact, |view| view.profile_picture = blob_id);
        Ok(())
    }

    pub async fn from_remote(
        &self,
        context: &RemoteContext<'_>,
        contact: &IdentityString,
        id: MessageId,
        blob_id: Option<Vec<u8>>,
    ) -> crate::Result<()> {
        let event = DistributionEvent::ContactProfilePicture {
            contact: contact.clone(),
            message_id: id,
        };
        context
            .distribute(vec![event], || {
                self.contacts
                    .update(contact, |view| view.profile_picture = blob_id);
                Ok(())
            })
            .await
    }
}

/// Contacts created, changed or removed by this user.
pub struct ContactSync<'a> {
    contacts: &'a Contacts,
}

impl ContactSync<'_> {
    /// Apply `change` and sync it to the other devices inside a contact sync
    /// transaction.
    pub fn from_local(
        &self,
        services: &TaskServices,
        change: ContactChange,
    ) -> Result<TaskResult<()>, DispatchError> {
        self.check(&change)?;
        services.ledger.claim(
            DistributionEvent::ContactSync {
                change: change.clone(),
                at: services.now_ms(),
            },
            Origin::Local,
        )?;
        self.apply(&change);
        Ok(services.scheduler.schedule(ContactSyncTask::new(change)))
    }

    pub fn from_sync(
        &self,
        context: &SyncContext<'_>,
        change: ContactChange,
    ) -> Result<(), DispatchError> {
        self.check(&change)?;
        context.claim(DistributionEvent::ContactSync {
            change: change.clone(),
            at: context.reflected_at(),
        })?;
        self.apply(&change);
        Ok(())
    }

    fn check(&self, change: &ContactChange) -> Result<(), DispatchError> {
        if change.applies_to(self.contacts) {
            return Ok(());
        }
        let reason = match change {
            ContactChange::Create(_) => "creation of existing contact",
            ContactChange::Update(_) => "update of unknown contact",
            ContactChange::Delete(_) => "deletion of unknown contact",
        };
        Err(DispatchError::Invalid(format!("{reason} {}", change.identity())))
    }

    fn apply(&self, change: &ContactChange) {
        tracing::debug!(identity = %change.identity(), ?change, "applying contact change");
        let mut contacts = self.contacts.contacts();
        match change {
            ContactChange::Create(update) => {
                let mut view = ContactView::default();
                update.apply(&mut view);
                contacts.insert(update.identity.clone(), view);
            }
            ContactChange::Update(update) => {
                if let Some(view) = contacts.get_mut(&update.identity) {
                    update.apply(view);
                }
            }
            ContactChange::Delete(identity) => {
                contacts.remove(identity);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::DistributionLedger;

    fn identity(value: &str) -> IdentityString {
        value.parse().unwrap()
    }

    #[test]
    fn contact_sync_follows_lifecycle() {
        let ledger = DistributionLedger::default();
        let contacts = Contacts::default();
        let alice = identity("ALICE123");
        let create = ContactChange::Create(ContactUpdate {
            nickname: Some("al".into()),
            ..ContactUpdate::new(alice.clone())
        });

        let err = contacts
            .sync()
            .from_sync(
                &SyncContext::new(&ledger, 1),
                ContactChange::Update(ContactUpdate::new(alice.clone())),
            )
            .unwrap_err();
        assert!(matches!(err, DispatchError::Invalid(_)));

        contacts
            .sync()
            .from_sync(&SyncContext::new(&ledger, 2), create.clone())
            .unwrap();
        assert!(matches!(
            contacts.sync().from_sync(&SyncContext::new(&ledger, 3), create),
            Err(DispatchError::Invalid(_))
        ));

        contacts
            .sync()
            .from_sync(
                &SyncContext::new(&ledger, 4),
                ContactChange::Update(ContactUpdate {
                    read_receipts: Some(false),
                    ..ContactUpdate::new(alice.clone())
                }),
            )
            .unwrap();
        let view = contacts.get(&alice).unwrap();
        assert_eq!(view.nickname.as_deref(), Some("al"));
        assert_eq!(view.read_receipts, Some(false));
        assert_eq!(view.typing_indicators, None);

        contacts
            .sync()
            .from_sync(&SyncContext::new(&ledger, 5), ContactChange::Delete(alice.clone()))
            .unwrap();
        assert!(contacts.get(&alice).is_none());
    }

    #[test]
    fn contact_change_survives_protobuf() {
        let change = ContactChange::Update(ContactUpdate {
            typing_indicators: Some(true),
            ..ContactUpdate::new(identity("ALICE123"))
        });
        assert_eq!(ContactChange::from_proto(change.to_proto()).unwrap(), change);
        assert!(matches!(
            ContactChange::from_proto(d2d::ContactSync { action: None }),
            Err(DispatchError::Invalid(_))
        ));
    }

    #[test]
    fn removed_picture_clears_blob() {
        let ledger = DistributionLedger::default();
        let contacts = Contacts::default();
        let contact: IdentityString = "ECHOECHO".parse().unwrap();
        let context = SyncContext::new(&ledger, 1);
        contacts
            .profile_picture()
            .from_sync(&context, &contact, MessageId(1), Some(vec![1; 16]))
            .unwrap();
        assert_eq!(contacts.get(&contact).unwrap().profile_picture, Some(vec![1; 16]));
        contacts
            .profile_picture()
            .from_sync(&context, &contact, MessageId(2), None)
            .unwrap();
        assert_eq!(contacts.get(&contact).unwrap().profile_picture, None);
    }
}
