use std::sync::atomic::{AtomicBool, Ordering};

use mdlink_proto::d2d;

use crate::dispatch::{DispatchError, DistributionEvent, Origin, SyncContext};
use crate::services::TaskServices;
use crate::task::TaskResult;
use crate::tasks::SettingsSyncTask;

/// Privacy settings that decide what is sent to contacts.
pub struct Settings {
    read_receipts: AtomicBool,
    typing_indicators: AtomicBool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            read_receipts: AtomicBool::new(true),
            typing_indicators: AtomicBool::new(true),
        }
    }
}

/// Settings carried by a settings sync. `None` leaves a setting as it is.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct SettingsUpdate {
    pub read_receipts: Option<bool>,
    pub typing_indicators: Option<bool>,
}

impl SettingsUpdate {
    pub fn is_empty(&self) -> bool {
        self.read_receipts.is_none() && self.typing_indicators.is_none()
    }

    pub fn from_proto(sync: d2d::SettingsSync) -> Result<Self, DispatchError> {
        let settings = sync
            .update
            .ok_or_else(|| DispatchError::Invalid("settings sync without update".into()))?;
        Ok(Self {
            read_receipts: settings.read_receipts,
            typing_indicators: settings.typing_indicators,
        })
    }

    pub fn to_proto(&self) -> d2d::SettingsSync {
        d2d::SettingsSync {
            update: Some(d2d::Settings {
                read_receipts: self.read_receipts,
                typing_indicators: self.typing_indicators,
            }),
        }
    }
}

impl Settings {
    pub fn read_receipts(&self) -> bool {
        self.read_receipts.load(Ordering::Acquire)
    }

    pub fn set_read_receipts(&self, enabled: bool) {
        self.read_receipts.store(enabled, Ordering::Release);
    }

    pub fn typing_indicators(&self) -> bool {
        self.typing_indicators.load(Ordering::Acquire)
    }

    pub fn set_typing_indicators(&self, enabled: bool) {
        self.typing_indicators.store(enabled, Ordering::Release);
    }

    pub fn sync(&self) -> SettingsSync<'_> {
        SettingsSync { settings: self }
    }

    fn apply(&self, update: &SettingsUpdate) {
        if let Some(enabled) = update.read_receipts {
            self.set_read_receipts(enabled);
        }
        if let Some(enabled) = update.typing_indicators {
            self.set_typing_indicators(enabled);
        }
    }
}

/// Settings changed by this user on any device of the group.
pub struct SettingsSync<'a> {
    settings: &'a Settings,
}

impl SettingsSync<'_> {
    /// Apply `update` and sync it to the other devices inside a settings
    /// sync transaction.
    pub fn from_local(
        &self,
        services: &TaskServices,
        update: SettingsUpdate,
    ) -> Result<TaskResult<()>, DispatchError> {
        if update.is_empty() {
            return Err(DispatchError::Invalid("empty settings update".into()));
        }
        services.ledger.claim(
            DistributionEvent::SettingsSync {
                update,
                at: services.now_ms(),
            },
            Origin::Local,
        )?;
        self.settings.apply(&update);
        Ok(services.scheduler.schedule(SettingsSyncTask::new(update)))
    }

    pub fn from_sync(
        &self,
        context: &SyncContext<'_>,
        update: SettingsUpdate,
    ) -> Result<(), DispatchError> {
        context.claim(DistributionEvent::SettingsSync {
            update,
            at: context.reflected_at(),
        })?;
        tracing::debug!(?update, "applying reflected settings");
        self.settings.apply(&update);
        Ok(())
    }
}
