mod common;

use std::time::Duration;

use common::{Mediator, setup};
use mdlink_proto::d2m;
use mdlink_protocol::{DeviceId, InboundMessage, OutboundMessage};
use mdlink_tasks::{DispatchError, TaskError};
use tokio::time::timeout;

#[tokio::test]
async fn completes_only_on_matching_ack() {
    let (services, manager) = setup();
    let mut mediator = Mediator::connect(&services, manager);

    let mut result = services
        .model
        .devices
        .drop_device()
        .from_local(&services, DeviceId(9))
        .unwrap();
    assert_eq!(
        mediator.next().await,
        OutboundMessage::DropDevice(d2m::DropDevice { device_id: 9 })
    );

    mediator.push(InboundMessage::DropDeviceAck(d2m::DropDeviceAck { device_id: 8 }));
    assert!(
        timeout(Duration::from_millis(100), &mut result).await.is_err(),
        "ack for another device must not complete the task"
    );

    mediator.push(InboundMessage::DropDeviceAck(d2m::DropDeviceAck { device_id: 9 }));
    timeout(Duration::from_secs(5), result)
        .await
        .unwrap()
        .unwrap();

    // The unrelated ack is still waiting for its reader.
    assert_eq!(mediator.controller.codec().backlog_len(), 1);
    mediator.assert_idle().await;
}

#[tokio::test]
async fn own_device_cannot_be_dropped() {
    let (services, _manager) = setup();
    let err = services
        .model
        .devices
        .drop_device()
        .from_local(&services, common::OWN_DEVICE)
        .err()
        .unwrap();
    assert!(matches!(err, DispatchError::Invalid(_)));
}

#[tokio::test]
async fn second_drop_of_same_device_is_refused() {
    let (services, _manager) = setup();
    let _first = services
        .model
        .devices
        .drop_device()
        .from_local(&services, DeviceId(3))
        .unwrap();
    let second = services
        .model
        .devices
        .drop_device()
        .from_local(&services, DeviceId(3));
    assert!(matches!(second, Err(DispatchError::AlreadyDistributed { .. })));
}

#[tokio::test]
async fn connection_loss_fails_pending_read() {
    let (services, manager) = setup();
    let mut mediator = Mediator::connect(&services, manager);
    let _result = services
        .model
        .devices
        .drop_device()
        .from_local(&services, DeviceId(4))
        .unwrap();
    mediator.next().await;

    let (manager, error) = mediator.disconnect().await;
    assert!(matches!(error, TaskError::ConnectionClosed));
    assert_eq!(manager.pending(), 1);
}

#[tokio::test]
async fn failed_drop_can_be_retried() {
    let (services, manager) = setup();
    drop(manager);

    let first = services
        .model
        .devices
        .drop_device()
        .from_local(&services, DeviceId(6))
        .unwrap();
    assert!(matches!(first.await, Err(TaskError::Aborted)));

    let second = services
        .model
        .devices
        .drop_device()
        .from_local(&services, DeviceId(6))
        .unwrap();
    assert!(matches!(second.await, Err(TaskError::Aborted)));
}

#[tokio::test]
async fn acknowledged_drop_can_be_repeated() {
    let (services, manager) = setup();
    let mut mediator = Mediator::connect(&services, manager);

    for _ in 0..2 {
        let result = services
            .model
            .devices
            .drop_device()
            .from_local(&services, DeviceId(9))
            .unwrap();
        assert_eq!(
            mediator.next().await,
            OutboundMessage::DropDevice(d2m::DropDevice { device_id: 9 })
        );
        mediator.push(InboundMessage::DropDeviceAck(d2m::DropDeviceAck { device_id: 9 }));
        timeout(Duration::from_secs(5), result)
            .await
            .unwrap()
            .unwrap();
    }
    mediator.assert_idle().await;
}
