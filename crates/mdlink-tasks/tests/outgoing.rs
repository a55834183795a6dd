mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{Mediator, identity, keys, setup, setup_with_clock};
use mdlink_proto::csp::e2e_message::Body;
use mdlink_proto::{csp, d2d, d2m};
use mdlink_protocol::{DeviceId, InboundMessage, MessageId, OutboundMessage};
use mdlink_tasks::{DispatchError, TaskServices};
use mdlink_tasks::clock::ManualClock;
use mdlink_tasks::model::Direction;
use mdlink_tasks::persistent_state::{PROFILE_DISTRIBUTION_EXPIRY_MS, ProfileDistribution};
use prost::Message;
use tokio::time::{sleep, timeout};

const RECEIVER: &str = "ABCD1234";

fn body(message: &csp::OutgoingMessage) -> Body {
    message
        .message
        .as_ref()
        .and_then(|message| message.body.clone())
        .unwrap()
}

async fn expect_csp(mediator: &mut Mediator) -> csp::OutgoingMessage {
    let OutboundMessage::OutgoingMessage(message) = mediator.next().await else {
        panic!("expected an outgoing CSP message");
    };
    message
}

fn ack(mediator: &Mediator, message: &csp::OutgoingMessage) {
    mediator.push(InboundMessage::OutgoingMessageAck(csp::OutgoingMessageAck {
        receiver_identity: message.receiver_identity.clone(),
        message_id: message.message_id,
    }));
}

#[tokio::test]
async fn typing_indicator_is_fire_and_forget() {
    let (services, manager) = setup();
    let mut mediator = Mediator::connect(&services, manager);

    let result = services
        .model
        .contacts
        .typing()
        .from_local(&services, identity(RECEIVER), true)
        .unwrap()
        .unwrap();
    let message = expect_csp(&mut mediator).await;
    assert_eq!(message.flags, 0x02 | 0x04);
    assert_eq!(
        body(&message),
        Body::TypingIndicator(csp::TypingIndicator { is_typing: true })
    );
    timeout(Duration::from_secs(5), result)
        .await
        .unwrap()
        .unwrap();
    mediator.assert_idle().await;
}

#[tokio::test]
async fn typing_indicator_respects_setting() {
    let (services, manager) = setup();
    let mut mediator = Mediator::connect(&services, manager);
    services.model.settings.set_typing_indicators(false);

    let scheduled = services
        .model
        .contacts
        .typing()
        .from_local(&services, identity(RECEIVER), true)
        .unwrap();
    assert!(scheduled.is_none());
    mediator.assert_idle().await;
}

#[tokio::test]
async fn profile_picture_is_distributed_once() {
    let (services, manager) = setup();
    let mut mediator = Mediator::connect(&services, manager);

    let (first, result) = services
        .model
        .messages
        .outgoing()
        .from_local(&services, identity(RECEIVER), "one".into())
        .unwrap();
    let removal = expect_csp(&mut mediator).await;
    assert_eq!(
        body(&removal),
        Body::DeleteProfilePicture(csp::DeleteProfilePicture {})
    );
    ack(&mediator, &removal);
    let reflected = mediator.ack_reflect(1).await;
    assert!(matches!(
        reflected.content,
        Some(d2d::envelope::Content::OutgoingMessage(_))
    ));
    let text = expect_csp(&mut mediator).await;
    assert_eq!(text.message_id, first.0);
    ack(&mediator, &text);
    let sent = mediator.ack_reflect(2).await;
    assert!(matches!(
        sent.content,
        Some(d2d::envelope::Content::OutgoingMessageUpdate(_))
    ));
    timeout(Duration::from_secs(5), result)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        services
            .state
            .last_profile_distribution(&identity(RECEIVER), services.now_ms()),
        Some(ProfileDistribution::Removed)
    );

    let (second, result) = services
        .model
        .messages
        .outgoing()
        .from_local(&services, identity(RECEIVER), "two".into())
        .unwrap();
    mediator.ack_reflect(3).await;
    let text = expect_csp(&mut mediator).await;
    assert_eq!(body(&text), Body::Text(csp::Text { text: "two".into() }));
    ack(&mediator, &text);
    mediator.ack_reflect(4).await;
    timeout(Duration::from_secs(5), result)
        .await
        .unwrap()
        .unwrap();
    mediator.assert_idle().await;

    for id in [first, second] {
        let message = services
            .model
            .messages
            .get(&identity(RECEIVER), Direction::Outbound, id)
            .unwrap();
        assert!(message.sent_at.is_some());
    }
}

/// Send `text` and expect the profile picture removal in front of it.
async fn send_with_removal(
    mediator: &mut Mediator,
    services: &Arc<TaskServices>,
    text: &str,
) -> MessageId {
    let (id, result) = services
        .model
        .messages
        .outgoing()
        .from_local(services, identity(RECEIVER), text.into())
        .unwrap();
    let removal = expect_csp(mediator).await;
    assert_eq!(
        body(&removal),
        Body::DeleteProfilePicture(csp::DeleteProfilePicture {})
    );
    ack(mediator, &removal);
    mediator.ack_reflect(1).await;
    let sent = expect_csp(mediator).await;
    assert_eq!(sent.message_id, id.0);
    ack(mediator, &sent);
    mediator.ack_reflect(2).await;
    timeout(Duration::from_secs(5), result)
        .await
        .unwrap()
        .unwrap();
    let message = services
        .model
        .messages
        .get(&identity(RECEIVER), Direction::Outbound, id)
        .unwrap();
    assert_eq!(message.created_at, services.now_ms());
    id
}

#[tokio::test]
async fn profile_picture_is_distributed_again_after_expiry() {
    let clock = Arc::new(ManualClock::new(1_700_000_000_000));
    let (services, manager) = setup_with_clock(&clock);
    let mut mediator = Mediator::connect(&services, manager);

    send_with_removal(&mut mediator, &services, "before").await;
    clock.advance(PROFILE_DISTRIBUTION_EXPIRY_MS + 1);
    assert_eq!(
        services
            .state
            .last_profile_distribution(&identity(RECEIVER), services.now_ms()),
        None
    );
    send_with_removal(&mut mediator, &services, "after").await;
    mediator.assert_idle().await;
}

/// Expect the reflection of a message carrying `expected`, then the message
/// itself, and acknowledge both.
async fn expect_reflected_csp(
    mediator: &mut Mediator,
    expected: &Body,
) -> csp::OutgoingMessage {
    let reflected = mediator.ack_reflect(3).await;
    let Some(d2d::envelope::Content::OutgoingMessage(outgoing)) = reflected.content else {
        panic!("expected a reflected outgoing message");
    };
    let e2e = csp::E2eMessage::decode(outgoing.body.as_slice()).unwrap();
    assert_eq!(e2e.body.as_ref(), Some(expected));
    let message = expect_csp(mediator).await;
    assert_eq!(message.message_id, outgoing.message_id);
    assert_eq!(&body(&message), expected);
    ack(mediator, &message);
    message
}

#[tokio::test]
async fn sent_message_is_edited_then_deleted() {
    let (services, manager) = setup();
    let mut mediator = Mediator::connect(&services, manager);
    let id = send_with_removal(&mut mediator, &services, "helo").await;
    let edits = services.model.messages.edit();

    let result = edits
        .from_local(&services, identity(RECEIVER), id, "hello".into())
        .unwrap();
    expect_reflected_csp(
        &mut mediator,
        &Body::EditMessage(csp::EditMessage {
            message_id: id.0,
            text: "hello".into(),
        }),
    )
    .await;
    timeout(Duration::from_secs(5), result)
        .await
        .unwrap()
        .unwrap();
    let message = services
        .model
        .messages
        .get(&identity(RECEIVER), Direction::Outbound, id)
        .unwrap();
    assert_eq!(message.text, "hello");
    assert!(message.edited_at.is_some());

    let result = services
        .model
        .messages
        .delete()
        .from_local(&services, identity(RECEIVER), id)
        .unwrap();
    expect_reflected_csp(
        &mut mediator,
        &Body::DeleteMessage(csp::DeleteMessage { message_id: id.0 }),
    )
    .await;
    timeout(Duration::from_secs(5), result)
        .await
        .unwrap()
        .unwrap();
    mediator.assert_idle().await;
    let message = services
        .model
        .messages
        .get(&identity(RECEIVER), Direction::Outbound, id)
        .unwrap();
    assert!(message.text.is_empty());
    assert!(message.deleted_at.is_some());

    let again = edits.from_local(&services, identity(RECEIVER), id, "back".into());
    assert!(matches!(again, Err(DispatchError::Invalid(_))));
}

#[tokio::test]
async fn unsent_message_cannot_be_edited() {
    let (services, _manager) = setup();
    let (id, _result) = services
        .model
        .messages
        .outgoing()
        .from_local(&services, identity(RECEIVER), "draft".into())
        .unwrap();
    let result = services
        .model
        .messages
        .edit()
        .from_local(&services, identity(RECEIVER), id, "final".into());
    assert!(matches!(result, Err(DispatchError::Invalid(_))));
    let result = services
        .model
        .messages
        .edit()
        .from_local(&services, identity(RECEIVER), MessageId(404), "lost".into());
    assert!(matches!(result, Err(DispatchError::UnknownMessage { .. })));
}

#[tokio::test]
async fn devices_info_replaces_device_list() {
    let (services, manager) = setup();
    let mediator = Mediator::connect(&services, manager);

    let info_box = keys().device_info_box().unwrap();
    let mut info = d2m::DevicesInfo::default();
    info.augmented_device_info.insert(
        0x0202,
        d2m::devices_info::AugmentedDeviceInfo {
            encrypted_device_info: info_box.encrypt_random_nonce_ahead(b"Laptop").unwrap(),
            connection_state: Some(
                d2m::devices_info::augmented_device_info::ConnectionState::ConnectedSince(10),
            ),
        },
    );
    info.augmented_device_info.insert(
        0x0303,
        d2m::devices_info::AugmentedDeviceInfo {
            encrypted_device_info: vec![0; 8],
            connection_state: Some(
                d2m::devices_info::augmented_device_info::ConnectionState::LastDisconnectAt(20),
            ),
        },
    );
    mediator.push(InboundMessage::DevicesInfo(info));

    let mut devices = services.model.devices.list();
    for _ in 0..50 {
        if !devices.is_empty() {
            break;
        }
        sleep(Duration::from_millis(10)).await;
        devices = services.model.devices.list();
    }
    assert_eq!(devices.len(), 2);
    assert_eq!(devices[&DeviceId(0x0202)].label, "Laptop");
    assert_eq!(devices[&DeviceId(0x0202)].connected_since, Some(10));
    assert_eq!(devices[&DeviceId(0x0303)].label, "unknown device");
    assert_eq!(devices[&DeviceId(0x0303)].last_disconnect_at, Some(20));
}
