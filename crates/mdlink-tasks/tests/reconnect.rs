mod common;

use std::time::Duration;

use common::{Mediator, identity, setup};
use mdlink_proto::d2m;
use mdlink_protocol::{DeviceId, InboundMessage, MessageId, OutboundMessage};
use mdlink_tasks::TaskError;
use mdlink_tasks::tasks::{DropDeviceTask, OutgoingTypingIndicatorTask};
use tokio::time::{sleep, timeout};

#[tokio::test]
async fn persistent_tasks_survive_reconnects() {
    let (services, mut manager) = setup();

    let dropped = services.scheduler.schedule(DropDeviceTask::new(DeviceId(7)));
    let typing = services.scheduler.schedule(OutgoingTypingIndicatorTask::new(
        identity("ABCD1234"),
        MessageId(1),
        true,
    ));
    manager.run_disconnected(sleep(Duration::from_millis(50))).await;
    assert_eq!(manager.pending(), 1);
    assert!(matches!(typing.await, Err(TaskError::Aborted)));

    let mut mediator = Mediator::connect(&services, manager);
    assert_eq!(
        mediator.next().await,
        OutboundMessage::DropDevice(d2m::DropDevice { device_id: 7 })
    );
    let (manager, error) = mediator.disconnect().await;
    assert!(error.is_connection_fatal());
    assert_eq!(manager.pending(), 1);

    // The interrupted task starts over on the next connection.
    let mut mediator = Mediator::connect(&services, manager);
    assert_eq!(
        mediator.next().await,
        OutboundMessage::DropDevice(d2m::DropDevice { device_id: 7 })
    );
    mediator.push(InboundMessage::DropDeviceAck(d2m::DropDeviceAck { device_id: 7 }));
    timeout(Duration::from_secs(5), dropped)
        .await
        .unwrap()
        .unwrap();
    mediator.assert_idle().await;
}

#[tokio::test]
async fn volatile_tasks_are_aborted_on_disconnect() {
    let (services, manager) = setup();
    let mediator = Mediator::connect(&services, manager);
    let (manager, _) = mediator.disconnect().await;

    let typing = services.scheduler.schedule(OutgoingTypingIndicatorTask::new(
        identity("ABCD1234"),
        MessageId(2),
        false,
    ));
    let mut manager = manager;
    manager.run_disconnected(sleep(Duration::from_millis(50))).await;
    assert!(matches!(typing.await, Err(TaskError::Aborted)));
    assert_eq!(manager.pending(), 0);
}
