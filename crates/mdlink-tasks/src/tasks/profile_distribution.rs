use futures_util::FutureExt;
use mdlink_protocol::IdentityString;

use crate::codec::ActiveTaskCodecHandle;
use crate::error::TaskError;
use crate::persistent_state::ProfileDistribution;
use crate::task::{ComposableTask, TaskFuture};
use crate::tasks::OutgoingCspMessageTask;

/// Identity of the echo test account, which never receives profile pictures.
const ECHO_IDENTITY: &str = "ECHOECHO";

/// Sends this user's profile picture, or its removal, to a contact before a
/// message, unless the contact already got the same within the last seven
/// days.
pub struct ProfilePictureDistributionStep {
    receiver: IdentityString,
}

impl ProfilePictureDistributionStep {
    pub fn new(receiver: IdentityString) -> Self {
        Self { receiver }
    }

    /// Gateway identities start with `*`.
    fn is_excluded(&self) -> bool {
        let identity = self.receiver.as_str();
        identity == ECHO_IDENTITY || identity.starts_with('*')
    }
}

impl ComposableTask<ActiveTaskCodecHandle> for ProfilePictureDistributionStep {
    type Output = ();

    fn run<'a>(&'a mut self, handle: &'a ActiveTaskCodecHandle) -> TaskFuture<'a, ()> {
        async move {
            if self.is_excluded() {
                return Ok(());
            }
            let services = handle.services();
            let profile = services.model.profile.get();
            let value = match profile.picture {
                Some(blob_id) if profile.share_with.includes(&self.receiver) => {
                    ProfileDistribution::ProfilePicture { blob_id }
                }
                _ => ProfileDistribution::Removed,
            };

            let now = services.now_ms();
            if services.state.last_profile_distribution(&self.receiver, now).as_ref() == Some(&value) {
                return Ok(());
            }

            let blob_id = match &value {
                ProfileDistribution::ProfilePicture { blob_id } => Some(blob_id.clone()),
                ProfileDistribution::Removed => None,
            };
            tracing::debug!(receiver = %self.receiver, removed = blob_id.is_none(), "distributing profile picture");
            handle
                .run(&OutgoingCspMessageTask::profile_picture(
                    self.receiver.clone(),
                    blob_id,
                    now,
                ))
                .await?;
            services
                .state
                .set_last_profile_distribution(&self.receiver, value, now)
                .map_err(TaskError::Storage)
        }
        .boxed()
    }
}
