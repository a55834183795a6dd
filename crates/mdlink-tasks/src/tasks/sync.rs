//! Changes this user made that are synced to the other devices inside a
//! device group transaction.
//!
//! Each sync is abandoned if its change no longer matches the model by the
//! time the transaction begins. Whatever superseded it schedules its own
//! sync.

use futures_util::FutureExt;
use mdlink_proto::d2d;
use mdlink_proto::d2d::user_profile_sync::profile_picture::Image;

use crate::codec::{ActiveTaskCodecHandle, TransactionResult, TransactionScope};
use crate::model::{ContactChange, SettingsUpdate};
use crate::task::{ActiveTask, Persistence, TaskFuture};
use crate::tasks::outgoing_message::envelope;

/// Reflect `content` inside a transaction of `scope`, skipping it once
/// `precondition` fails.
async fn sync_in_transaction(
    handle: &ActiveTaskCodecHandle,
    name: &'static str,
    scope: TransactionScope,
    precondition: impl FnMut() -> bool,
    content: d2d::envelope::Content,
) -> crate::Result<()> {
    let result = handle
        .transaction(scope, precondition, |_running| async move {
            handle
                .run(&ReflectInTransactionTask {
                    name,
                    scope,
                    content,
                })
                .await
        })
        .await?;
    match result {
        TransactionResult::Complete(complete, ()) => {
            tracing::debug!(task = name, transaction = %complete.id(), "synced");
        }
        TransactionResult::Aborted(aborted) => {
            tracing::debug!(task = name, transaction = %aborted.id(), "change superseded, sync skipped");
        }
    }
    Ok(())
}

/// Syncs this user's profile picture in a `USER_PROFILE_SYNC` transaction.
pub struct UserProfileSyncTask {
    picture: Option<Vec<u8>>,
}

impl UserProfileSyncTask {
    pub fn new(picture: Option<Vec<u8>>) -> Self {
        Self { picture }
    }
}

impl ActiveTask for UserProfileSyncTask {
    type Output = ();

    fn name(&self) -> &'static str {
        "user-profile-sync"
    }

    fn persistence(&self) -> Persistence {
        Persistence::Persistent
    }

    fn run<'a>(&'a self, handle: &'a ActiveTaskCodecHandle) -> TaskFuture<'a, ()> {
        let profile = &handle.services().model.profile;
        let image = match &self.picture {
            Some(blob_id) => Image::UpdatedBlobId(blob_id.clone()),
            None => Image::Removed(d2d::Unit {}),
        };
        sync_in_transaction(
            handle,
            self.name(),
            TransactionScope::UserProfileSync,
            || profile.get().picture == self.picture,
            d2d::envelope::Content::UserProfileSync(d2d::UserProfileSync {
                profile_picture: Some(d2d::user_profile_sync::ProfilePicture {
                    image: Some(image),
                }),
            }),
        )
        .boxed()
    }
}

/// Syncs a contact change in a `CONTACT_SYNC` transaction.
pub struct ContactSyncTask {
    change: ContactChange,
}

impl ContactSyncTask {
    pub fn new(change: ContactChange) -> Self {
        Self { change }
    }
}

impl ActiveTask for ContactSyncTask {
    type Output = ();

    fn name(&self) -> &'static str {
        "contact-sync"
    }

    fn persistence(&self) -> Persistence {
        Persistence::Persistent
    }

    fn run<'a>(&'a self, handle: &'a ActiveTaskCodecHandle) -> TaskFuture<'a, ()> {
        let contacts = &handle.services().model.contacts;
        sync_in_transaction(
            handle,
            self.name(),
            TransactionScope::ContactSync,
            || self.change.is_applied(contacts),
            d2d::envelope::Content::ContactSync(self.change.to_proto()),
        )
        .boxed()
    }
}

/// Syncs changed settings in a `SETTINGS_SYNC` transaction.
pub struct SettingsSyncTask {
    update: SettingsUpdate,
}

impl SettingsSyncTask {
    pub fn new(update: SettingsUpdate) -> Self {
        Self { update }
    }
}

impl ActiveTask for SettingsSyncTask {
    type Output = ();

    fn name(&self) -> &'static str {
        "settings-sync"
    }

    fn persistence(&self) -> Persistence {
        Persistence::Persistent
    }

    fn run<'a>(&'a self, handle: &'a ActiveTaskCodecHandle) -> TaskFuture<'a, ()> {
        let settings = &handle.services().model.settings;
        let update = self.update;
        sync_in_transaction(
            handle,
            self.name(),
            TransactionScope::SettingsSync,
            move || {
                update.read_receipts.is_none_or(|v| v == settings.read_receipts())
                    && update
                        .typing_indicators
                        .is_none_or(|v| v == settings.typing_indicators())
            },
            d2d::envelope::Content::SettingsSync(update.to_proto()),
        )
        .boxed()
    }
}

/// The reflection of a sync. Refused by the codec outside its transaction.
struct ReflectInTransactionTask {
    name: &'static str,
    scope: TransactionScope,
    content: d2d::envelope::Content,
}

impl ActiveTask for ReflectInTransactionTask {
    type Output = ();

    fn name(&self) -> &'static str {
        self.name
    }

    fn persistence(&self) -> Persistence {
        Persistence::Persistent
    }

    fn transaction(&self) -> Option<TransactionScope> {
        Some(self.scope)
    }

    fn run<'a>(&'a self, handle: &'a ActiveTaskCodecHandle) -> TaskFuture<'a, ()> {
        async move {
            handle
                .reflect(vec![envelope(self.content.clone())])
                .await?;
            Ok(())
        }
        .boxed()
    }
}
