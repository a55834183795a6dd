use std::collections::BTreeMap;

use futures_util::FutureExt;
use mdlink_proto::d2m;
use mdlink_proto::d2m::devices_info::augmented_device_info::ConnectionState;
use mdlink_protocol::DeviceId;

use crate::codec::PassiveTaskCodecHandle;
use crate::model::DeviceView;
use crate::task::{PassiveTask, TaskFuture};

/// Label shown for a device whose info cannot be decrypted.
const UNKNOWN_LABEL: &str = "unknown device";

/// Replaces the device list with the mediator's `DEVICES_INFO`.
pub struct DevicesInfoTask {
    info: d2m::DevicesInfo,
}

impl DevicesInfoTask {
    pub fn new(info: d2m::DevicesInfo) -> Self {
        Self { info }
    }
}

impl PassiveTask for DevicesInfoTask {
    type Output = ();

    fn name(&self) -> &'static str {
        "devices-info"
    }

    fn run<'a>(&'a mut self, handle: &'a PassiveTaskCodecHandle) -> TaskFuture<'a, ()> {
        async move {
            let services = handle.services();
            let info_box = services.keys.device_info_box()?;
            let mut devices = BTreeMap::new();
            for (id, info) in std::mem::take(&mut self.info.augmented_device_info) {
                let id = DeviceId(id);
                let label = match info_box.decrypt_unguarded_nonce_ahead(&info.encrypted_device_info) {
                    Ok(plaintext) => String::from_utf8_lossy(&plaintext).into_owned(),
                    Err(err) => {
                        tracing::warn!(device = %id, error = %err, "undecryptable device info");
                        UNKNOWN_LABEL.to_string()
                    }
                };
                let (connected_since, last_disconnect_at) = match info.connection_state {
                    Some(ConnectionState::ConnectedSince(at)) => (Some(at), None),
                    Some(ConnectionState::LastDisconnectAt(at)) => (None, Some(at)),
                    None => (None, None),
                };
                devices.insert(
                    id,
                    DeviceView {
                        label,
                        connected_since,
                        last_disconnect_at,
                    },
                );
            }
            tracing::info!(count = devices.len(), "device list updated");
            services.model.devices.replace(devices);
            Ok(())
        }
        .boxed()
    }
}
