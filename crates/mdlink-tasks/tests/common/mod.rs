//! A fake mediator driving the task manager through a `TaskController`.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use mdlink_crypto::RawKey;
use mdlink_crypto::device_group::{DeviceGroupKeys, derive_device_group_keys};
use mdlink_proto::d2d;
use mdlink_protocol::{
    DeviceId, IdentityString, InboundMessage, Layer, OutboundMessage, ReflectAck, Reflected,
};
use mdlink_tasks::clock::ManualClock;
use mdlink_tasks::persistent_state::PersistentProtocolState;
use mdlink_tasks::{TaskController, TaskError, TaskManager, TaskScheduler, TaskServices};
use prost::Message;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};

pub const OWN_IDENTITY: &str = "MDLINK01";
pub const OWN_DEVICE: DeviceId = DeviceId(0x0101);
const DGK: [u8; 32] = [0x42; 32];

pub fn identity(value: &str) -> IdentityString {
    value.parse().unwrap()
}

pub fn keys() -> DeviceGroupKeys {
    derive_device_group_keys(RawKey::new(DGK)).unwrap()
}

fn services() -> (TaskServices, TaskManager) {
    let (scheduler, queue) = TaskScheduler::channel();
    let services = TaskServices::new(
        identity(OWN_IDENTITY),
        OWN_DEVICE,
        keys(),
        scheduler,
        PersistentProtocolState::in_memory(),
    );
    (services, TaskManager::new(queue))
}

pub fn setup() -> (Arc<TaskServices>, TaskManager) {
    let (services, manager) = services();
    (Arc::new(services), manager)
}

/// Like [`setup`], with time under the test's control.
pub fn setup_with_clock(clock: &Arc<ManualClock>) -> (Arc<TaskServices>, TaskManager) {
    let (services, manager) = services();
    (Arc::new(services.with_clock(clock.clone())), manager)
}

pub struct Mediator {
    pub controller: TaskController,
    outbound: mpsc::Receiver<OutboundMessage>,
    manager: JoinHandle<(TaskManager, TaskError)>,
    next_reflected_id: u32,
}

impl Mediator {
    /// Connect `manager` with both layers authenticated.
    pub fn connect(services: &Arc<TaskServices>, mut manager: TaskManager) -> Self {
        let (controller, outbound) = TaskController::new(Arc::clone(services), 16);
        controller.authenticated(Layer::D2m);
        controller.authenticated(Layer::Csp);
        let codec = controller.codec();
        let manager = tokio::spawn(async move {
            let error = manager.run(codec).await;
            (manager, error)
        });
        Self {
            controller,
            outbound,
            manager,
            next_reflected_id: 0,
        }
    }

    pub fn push(&self, message: InboundMessage) {
        self.controller.push(message);
    }

    /// Next message the device sent.
    pub async fn next(&mut self) -> OutboundMessage {
        timeout(Duration::from_secs(5), self.outbound.recv())
            .await
            .expect("timed out waiting for an outbound message")
            .expect("outbound channel closed")
    }

    /// Assert that the device sends nothing for a while.
    pub async fn assert_idle(&mut self) {
        sleep(Duration::from_millis(100)).await;
        match self.outbound.try_recv() {
            Err(TryRecvError::Empty) => {}
            Ok(message) => panic!("unexpected {}", message.label()),
            Err(TryRecvError::Disconnected) => panic!("outbound channel closed"),
        }
    }

    /// Expect a `REFLECT`, acknowledge it and return the decrypted envelope.
    pub async fn ack_reflect(&mut self, timestamp: u64) -> d2d::Envelope {
        let OutboundMessage::Reflect(reflect) = self.next().await else {
            panic!("expected a reflect");
        };
        self.push(InboundMessage::ReflectAck(ReflectAck {
            reflect_id: reflect.reflect_id,
            timestamp,
        }));
        let plaintext = keys()
            .reflect_box()
            .unwrap()
            .decrypt_unguarded_nonce_ahead(&reflect.envelope)
            .unwrap();
        d2d::Envelope::decode(plaintext.as_slice()).unwrap()
    }

    /// Encrypt `content` as another device of the group would.
    pub fn reflected(&mut self, content: d2d::envelope::Content, flags: u16) -> Reflected {
        self.next_reflected_id += 1;
        let envelope = d2d::Envelope {
            padding: Vec::new(),
            device_id: 0x0202,
            content: Some(content),
        };
        Reflected {
            flags,
            reflected_id: self.next_reflected_id,
            timestamp: 1_700_000_000_000,
            envelope: keys()
                .reflect_box()
                .unwrap()
                .encrypt_random_nonce_ahead(&envelope.encode_to_vec())
                .unwrap(),
        }
    }

    /// Close the connection and wait for the manager to notice.
    pub async fn disconnect(self) -> (TaskManager, TaskError) {
        self.controller.close();
        timeout(Duration::from_secs(5), self.manager)
            .await
            .expect("timed out waiting for the task manager")
            .unwrap()
    }
}
