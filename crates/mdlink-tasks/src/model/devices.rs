use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use mdlink_protocol::DeviceId;

use crate::dispatch::{DispatchError, DistributionEvent, Origin};
use crate::services::TaskServices;
use crate::task::TaskResult;
use crate::tasks::DropDeviceTask;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceView {
    pub label: String,
    pub connected_since: Option<u64>,
    pub last_disconnect_at: Option<u64>,
}

/// Other devices of the device group, as last reported by the mediator.
#[derive(Default)]
pub struct Devices {
    devices: Mutex<BTreeMap<DeviceId, DeviceView>>,
}

impl Devices {
    fn devices(&self) -> MutexGuard<'_, BTreeMap<DeviceId, DeviceView>> {
        self.devices.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn list(&self) -> BTreeMap<DeviceId, DeviceView> {
        self.devices().clone()
    }

    /// Replace the list with a `DEVICES_INFO` snapshot.
    pub fn replace(&self, devices: BTreeMap<DeviceId, DeviceView>) {
        *self.devices() = devices;
    }

    pub(crate) fn remove(&self, id: DeviceId) {
        self.devices().remove(&id);
    }

    pub fn drop_device(&self) -> DropDevice<'_> {
        DropDevice { devices: self }
    }
}

pub struct DropDevice<'a> {
    devices: &'a Devices,
}

impl DropDevice<'_> {
    /// Ask the mediator to remove `id` from the device group. The device
    /// leaves the list once the mediator acknowledged. A second drop of the
    /// same device is refused while the first one is pending.
    pub fn from_local(
        &self,
        services: &TaskServices,
        id: DeviceId,
    ) -> Result<TaskResult<()>, DispatchError> {
        if id == services.device_id {
            return Err(DispatchError::Invalid(format!("drop of own device {id}")));
        }
        let claim = services
            .ledger
            .claim_scoped(DistributionEvent::DeviceDrop(id), Origin::Local)?;
        tracing::info!(device = %id, known = self.devices.devices().contains_key(&id), "dropping device");
        Ok(services
            .scheduler
            .schedule(DropDeviceTask::new(id).holding(claim)))
    }
}
