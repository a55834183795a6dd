use std::sync::{Mutex, PoisonError};

use futures_util::FutureExt;
use mdlink_proto::d2m;
use mdlink_protocol::{DeviceId, InboundMessage, OutboundMessage};

use crate::codec::ActiveTaskCodecHandle;
use crate::demux::MessageFilterInstruction;
use crate::dispatch::LedgerClaim;
use crate::task::{ActiveTask, Persistence, TaskFuture};

/// Removes another device from the device group.
///
/// Only a `DROP_DEVICE_ACK` for the same device completes the task. Acks for
/// other devices belong to other drop requests and stay in the backlog.
///
/// A drop requested through the device model keeps its ledger claim until
/// the task is gone, so the same device can be dropped again after a
/// failed or completed attempt, but not while one is pending.
pub struct DropDeviceTask {
    device: DeviceId,
    claim: Mutex<Option<LedgerClaim>>,
}

impl DropDeviceTask {
    pub fn new(device: DeviceId) -> Self {
        Self {
            device,
            claim: Mutex::new(None),
        }
    }

    pub(crate) fn holding(mut self, claim: LedgerClaim) -> Self {
        self.claim = Mutex::new(Some(claim));
        self
    }
}

impl ActiveTask for DropDeviceTask {
    type Output = ();

    fn name(&self) -> &'static str {
        "drop-device"
    }

    fn persistence(&self) -> Persistence {
        Persistence::Persistent
    }

    fn run<'a>(&'a self, handle: &'a ActiveTaskCodecHandle) -> TaskFuture<'a, ()> {
        async move {
            let device = self.device;
            handle
                .write(OutboundMessage::DropDevice(d2m::DropDevice {
                    device_id: device.0,
                }))
                .await?;
            handle
                .read(move |message| match message {
                    InboundMessage::DropDeviceAck(ack) if ack.device_id == device.0 => {
                        MessageFilterInstruction::Accept(())
                    }
                    _ => MessageFilterInstruction::BypassOrBacklog,
                })
                .await?;
            handle.services().model.devices.remove(device);
            self.claim
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take();
            tracing::info!(device = %device, "device dropped");
            Ok(())
        }
        .boxed()
    }
}
