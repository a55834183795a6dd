use std::collections::BTreeSet;
use std::sync::{Mutex, MutexGuard, PoisonError};

use mdlink_protocol::IdentityString;

use crate::dispatch::{DispatchError, DistributionEvent, Origin, SyncContext};
use crate::services::TaskServices;
use crate::task::TaskResult;
use crate::tasks::UserProfileSyncTask;

/// Who receives this user's profile picture along with outgoing messages.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ProfilePictureShareWith {
    #[default]
    Everyone,
    Nobody,
    AllowList(BTreeSet<IdentityString>),
}

impl ProfilePictureShareWith {
    pub fn includes(&self, identity: &IdentityString) -> bool {
        match self {
            ProfilePictureShareWith::Everyone => true,
            ProfilePictureShareWith::Nobody => false,
            ProfilePictureShareWith::AllowList(allowed) => allowed.contains(identity),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProfileView {
    /// Blob id of the uploaded profile picture.
    pub picture: Option<Vec<u8>>,
    pub share_with: ProfilePictureShareWith,
}

/// This user's own profile.
#[derive(Default)]
pub struct Profile {
    view: Mutex<ProfileView>,
}

impl Profile {
    fn view(&self) -> MutexGuard<'_, ProfileView> {
        self.view.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn get(&self) -> ProfileView {
        self.view().clone()
    }

    pub fn set_share_with(&self, share_with: ProfilePictureShareWith) {
        self.view().share_with = share_with;
    }

    pub fn picture(&self) -> ProfilePicture<'_> {
        ProfilePicture { profile: self }
    }
}

pub struct ProfilePicture<'a> {
    profile: &'a Profile,
}

impl ProfilePicture<'_> {
    /// Set or, with `None`, remove the profile picture and sync it to the
    /// other devices inside a user profile transaction.
    pub fn from_local(
        &self,
        services: &TaskServices,
        blob_id: Option<Vec<u8>>,
    ) -> Result<TaskResult<()>, DispatchError> {
        services.ledger.claim(
            DistributionEvent::OwnProfilePicture {
                blob_id: blob_id.clone(),
                at: services.now_ms(),
            },
            Origin::Local,
        )?;
        self.profile.view().picture = blob_id.clone();
        Ok(services
            .scheduler
            .schedule(UserProfileSyncTask::new(blob_id)))
    }

    pub fn from_sync(
        &self,
        context: &SyncContext<'_>,
        blob_id: Option<Vec<u8>>,
    ) -> Result<(), DispatchError> {
        context.claim(DistributionEvent::OwnProfilePicture {
            blob_id: blob_id.clone(),
            at: context.reflected_at(),
        })?;
        self.profile.view().picture = blob_id;
        Ok(())
    }
}
