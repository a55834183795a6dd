mod common;

use std::time::Duration;

use common::{Mediator, identity, keys, setup};
use mdlink_proto::{d2d, d2m};
use mdlink_protocol::{InboundMessage, OutboundMessage};
use mdlink_tasks::model::{ContactChange, ContactUpdate, SettingsUpdate};
use mdlink_tasks::{DispatchError, TransactionScope};
use prost::Message;
use tokio::time::timeout;

fn begin_scope(message: OutboundMessage) -> TransactionScope {
    let OutboundMessage::BeginTransaction(begin) = message else {
        panic!("expected a transaction begin");
    };
    let plaintext = keys()
        .transaction_scope_box()
        .unwrap()
        .decrypt_unguarded_nonce_ahead(&begin.encrypted_scope)
        .unwrap();
    let scope = d2d::TransactionScope::decode(plaintext.as_slice()).unwrap();
    TransactionScope::try_from(scope.scope).unwrap()
}

#[tokio::test]
async fn profile_sync_waits_out_a_rejected_transaction() {
    let (services, manager) = setup();
    let mut mediator = Mediator::connect(&services, manager);

    let result = services
        .model
        .profile
        .picture()
        .from_local(&services, Some(vec![0xb1; 16]))
        .unwrap();

    assert_eq!(
        begin_scope(mediator.next().await),
        TransactionScope::UserProfileSync
    );
    mediator.push(InboundMessage::TransactionRejected(d2m::TransactionRejected {
        device_id: 0x0202,
        encrypted_scope: Vec::new(),
    }));
    mediator.assert_idle().await;
    mediator.push(InboundMessage::TransactionEnded(d2m::TransactionEnded {
        device_id: 0x0202,
        encrypted_scope: Vec::new(),
    }));

    assert_eq!(
        begin_scope(mediator.next().await),
        TransactionScope::UserProfileSync
    );
    mediator.push(InboundMessage::BeginTransactionAck);

    let envelope = mediator.ack_reflect(5).await;
    let Some(d2d::envelope::Content::UserProfileSync(sync)) = envelope.content else {
        panic!("expected a user profile sync");
    };
    assert_eq!(
        sync.profile_picture.and_then(|picture| picture.image),
        Some(d2d::user_profile_sync::profile_picture::Image::UpdatedBlobId(vec![0xb1; 16]))
    );

    assert_eq!(mediator.next().await, OutboundMessage::CommitTransaction);
    mediator.push(InboundMessage::CommitTransactionAck);
    timeout(Duration::from_secs(5), result)
        .await
        .unwrap()
        .unwrap();
    mediator.assert_idle().await;
}

#[tokio::test]
async fn superseded_profile_sync_is_skipped() {
    let (services, manager) = setup();
    let mut mediator = Mediator::connect(&services, manager);

    let first = services
        .model
        .profile
        .picture()
        .from_local(&services, Some(vec![1; 16]))
        .unwrap();
    mediator.next().await;
    mediator.push(InboundMessage::TransactionRejected(d2m::TransactionRejected {
        device_id: 0x0202,
        encrypted_scope: Vec::new(),
    }));
    mediator.assert_idle().await;

    let second = services
        .model
        .profile
        .picture()
        .from_local(&services, None)
        .unwrap();
    mediator.push(InboundMessage::TransactionEnded(d2m::TransactionEnded {
        device_id: 0x0202,
        encrypted_scope: Vec::new(),
    }));
    timeout(Duration::from_secs(5), first)
        .await
        .unwrap()
        .unwrap();

    // Only the newer picture is synced.
    begin_scope(mediator.next().await);
    mediator.push(InboundMessage::BeginTransactionAck);
    let envelope = mediator.ack_reflect(6).await;
    let Some(d2d::envelope::Content::UserProfileSync(sync)) = envelope.content else {
        panic!("expected a user profile sync");
    };
    assert!(matches!(
        sync.profile_picture.and_then(|picture| picture.image),
        Some(d2d::user_profile_sync::profile_picture::Image::Removed(_))
    ));
    assert_eq!(mediator.next().await, OutboundMessage::CommitTransaction);
    mediator.push(InboundMessage::CommitTransactionAck);
    timeout(Duration::from_secs(5), second)
        .await
        .unwrap()
        .unwrap();
}

/// Begin and acknowledge a transaction of `scope`, returning the envelope
/// reflected inside it once committed.
async fn reflect_in_transaction(
    mediator: &mut Mediator,
    scope: TransactionScope,
) -> d2d::Envelope {
    assert_eq!(begin_scope(mediator.next().await), scope);
    mediator.push(InboundMessage::BeginTransactionAck);
    let envelope = mediator.ack_reflect(7).await;
    assert_eq!(mediator.next().await, OutboundMessage::CommitTransaction);
    mediator.push(InboundMessage::CommitTransactionAck);
    envelope
}

#[tokio::test]
async fn created_contact_is_synced() {
    let (services, manager) = setup();
    let mut mediator = Mediator::connect(&services, manager);

    let mut update = ContactUpdate::new(identity("ECHOECHO"));
    update.nickname = Some("Echo".into());
    update.read_receipts = Some(false);
    let result = services
        .model
        .contacts
        .sync()
        .from_local(&services, ContactChange::Create(update))
        .unwrap();
    let contact = services.model.contacts.get(&identity("ECHOECHO")).unwrap();
    assert_eq!(contact.nickname.as_deref(), Some("Echo"));
    assert!(!services.model.sends_read_receipts(&identity("ECHOECHO")));

    let envelope = reflect_in_transaction(&mut mediator, TransactionScope::ContactSync).await;
    let Some(d2d::envelope::Content::ContactSync(sync)) = envelope.content else {
        panic!("expected a contact sync");
    };
    let Some(d2d::contact_sync::Action::Create(synced)) = sync.action else {
        panic!("expected a created contact");
    };
    assert_eq!(synced.identity, "ECHOECHO");
    assert_eq!(synced.nickname.as_deref(), Some("Echo"));
    assert_eq!(synced.read_receipts, Some(false));
    assert_eq!(synced.typing_indicators, None);

    timeout(Duration::from_secs(5), result)
        .await
        .unwrap()
        .unwrap();
    mediator.assert_idle().await;
}

#[tokio::test]
async fn contact_deleted_before_its_sync_is_skipped() {
    let (services, manager) = setup();
    let mut mediator = Mediator::connect(&services, manager);
    let contacts = services.model.contacts.sync();

    let created = contacts
        .from_local(
            &services,
            ContactChange::Create(ContactUpdate::new(identity("ECHOECHO"))),
        )
        .unwrap();
    mediator.next().await;
    mediator.push(InboundMessage::TransactionRejected(d2m::TransactionRejected {
        device_id: 0x0202,
        encrypted_scope: Vec::new(),
    }));
    mediator.assert_idle().await;

    let deleted = contacts
        .from_local(&services, ContactChange::Delete(identity("ECHOECHO")))
        .unwrap();
    mediator.push(InboundMessage::TransactionEnded(d2m::TransactionEnded {
        device_id: 0x0202,
        encrypted_scope: Vec::new(),
    }));
    timeout(Duration::from_secs(5), created)
        .await
        .unwrap()
        .unwrap();

    let envelope = reflect_in_transaction(&mut mediator, TransactionScope::ContactSync).await;
    let Some(d2d::envelope::Content::ContactSync(sync)) = envelope.content else {
        panic!("expected a contact sync");
    };
    assert_eq!(
        sync.action,
        Some(d2d::contact_sync::Action::DeleteIdentity("ECHOECHO".into()))
    );
    timeout(Duration::from_secs(5), deleted)
        .await
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn settings_change_is_synced() {
    let (services, manager) = setup();
    let mut mediator = Mediator::connect(&services, manager);

    let result = services
        .model
        .settings
        .sync()
        .from_local(
            &services,
            SettingsUpdate {
                typing_indicators: Some(false),
                ..Default::default()
            },
        )
        .unwrap();
    assert!(!services.model.settings.typing_indicators());
    assert!(services.model.settings.read_receipts());

    let envelope = reflect_in_transaction(&mut mediator, TransactionScope::SettingsSync).await;
    let Some(d2d::envelope::Content::SettingsSync(sync)) = envelope.content else {
        panic!("expected a settings sync");
    };
    assert_eq!(
        sync.update,
        Some(d2d::Settings {
            read_receipts: None,
            typing_indicators: Some(false),
        })
    );
    timeout(Duration::from_secs(5), result)
        .await
        .unwrap()
        .unwrap();
    mediator.assert_idle().await;
}

#[tokio::test]
async fn empty_settings_change_is_refused() {
    let (services, _manager) = setup();
    let result = services
        .model
        .settings
        .sync()
        .from_local(&services, SettingsUpdate::default());
    assert!(matches!(result, Err(DispatchError::Invalid(_))));
}
