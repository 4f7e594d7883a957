mod common;

use amqp::connection::{Connection, ConnectionEvents, ConnectionOptions};
use amqp::link::{Link, LinkState};
use amqp::models::{
    AmqpMessage, AmqpProperties, AmqpValue, DeliveryState, ReceiverSettleMode, Role,
    SenderSettleMode,
};
use amqp::session::{Session, SessionEvents, SessionOptions};
use claims::{assert_err, assert_none, assert_ok};
use common::{MockServer, MockServerConfig, client_connection, test_context, wait_until};
use std::sync::{Arc, Mutex};

fn unopened_session() -> (Connection, Session) {
    let connection = Connection::new(
        "localhost",
        ConnectionOptions::default(),
        ConnectionEvents::new(),
    )
    .unwrap();
    let session = Session::new(&connection, SessionOptions::default(), SessionEvents::new()).unwrap();
    (connection, session)
}

#[tokio::test]
async fn test_link_property_defaults() {
    let (_connection, session) = unopened_session();
    let link = session.create_sender_link("MySession", "MySource", "MyTarget").unwrap();

    assert_eq!(link.name().unwrap(), "MySession");
    assert_eq!(link.role().unwrap(), Role::Sender);
    assert_eq!(link.source().unwrap(), "MySource");
    assert_eq!(link.target().unwrap(), "MyTarget");
    assert_eq!(link.state().unwrap(), LinkState::Detached);
    assert_eq!(link.sender_settle_mode().unwrap(), SenderSettleMode::Unsettled);
    assert_eq!(link.receiver_settle_mode().unwrap(), ReceiverSettleMode::First);
    assert_eq!(link.initial_delivery_count().unwrap(), 0);
    assert_eq!(link.max_message_size().unwrap(), 0);
    assert_eq!(link.max_link_credit().unwrap(), 0);
    assert!(link.attach_properties().unwrap().is_empty());
    assert_none!(link.handle().unwrap());
    assert_err!(link.peer_max_message_size());
    assert_eq!(link.session().unwrap(), session);
}

#[tokio::test]
async fn test_link_setters_before_attach() {
    let (_connection, session) = unopened_session();
    let link = session.create_receiver_link("receiver", "MySource", "MyTarget").unwrap();

    let mut properties = AmqpProperties::new();
    properties.insert("com.example.key".to_string(), AmqpValue::from("value"));

    assert_ok!(link.set_sender_settle_mode(SenderSettleMode::Settled));
    assert_ok!(link.set_receiver_settle_mode(ReceiverSettleMode::Second));
    assert_ok!(link.set_initial_delivery_count(32767));
    assert_ok!(link.set_max_message_size(65536));
    assert_ok!(link.set_max_link_credit(10));
    assert_ok!(link.set_attach_properties(properties.clone()));

    assert_eq!(link.sender_settle_mode().unwrap(), SenderSettleMode::Settled);
    assert_eq!(link.receiver_settle_mode().unwrap(), ReceiverSettleMode::Second);
    assert_eq!(link.initial_delivery_count().unwrap(), 32767);
    assert_eq!(link.max_message_size().unwrap(), 65536);
    assert_eq!(link.max_link_credit().unwrap(), 10);
    assert_eq!(link.attach_properties().unwrap(), properties);
}

#[tokio::test]
async fn test_attach_and_detach_without_peer() {
    let (_connection, session) = unopened_session();
    let link = session.create_sender_link("MySession", "MySource", "MyTarget").unwrap();

    assert_ok!(link.attach());
    assert_eq!(link.state().unwrap(), LinkState::Attaching);
    assert_err!(link.attach());
    assert_err!(link.set_initial_delivery_count(1));

    assert_ok!(link.detach(false, "", "", AmqpProperties::new()));
    assert_eq!(link.state().unwrap(), LinkState::Detached);
}

#[tokio::test]
async fn test_detach_unattached_link_fails() {
    let (_connection, session) = unopened_session();
    let link = session.create_sender_link("link", "source", "target").unwrap();
    assert_err!(link.detach(true, "", "", AmqpProperties::new()));
}

#[tokio::test]
async fn test_transfer_on_receiver_fails() {
    let (_connection, session) = unopened_session();
    let link = session.create_receiver_link("link", "source", "target").unwrap();
    link.attach().unwrap();
    assert_err!(link.transfer(AmqpMessage::with_value("hello")));
}

#[tokio::test]
async fn test_attach_against_peer() {
    let server = MockServer::start_with(MockServerConfig {
        max_message_size: 4096,
        ..Default::default()
    })
    .await;
    let connection = client_connection(&server);
    let session = Session::new(&connection, SessionOptions::default(), SessionEvents::new()).unwrap();
    let link = session.create_sender_link("sender", "client", "queue").unwrap();

    let transitions = Arc::new(Mutex::new(Vec::new()));
    let recorded = transitions.clone();
    link.on_state_changed(move |_, new, old| recorded.lock().unwrap().push((old, new)))
        .unwrap();

    link.attach().unwrap();
    assert!(wait_until(&connection, || link.state().ok() == Some(LinkState::Attached)).await);
    assert_eq!(link.peer_max_message_size().unwrap(), 4096);
    assert!(link.handle().unwrap().is_some());
    assert_eq!(server.attached_links(), 1);

    let transitions = transitions.lock().unwrap().clone();
    assert_eq!(
        transitions,
        vec![
            (LinkState::Detached, LinkState::Attaching),
            (LinkState::Attaching, LinkState::Attached)
        ]
    );

    let err = assert_err!(link.transfer(AmqpMessage::with_data(vec![0u8; 8192])));
    assert!(matches!(err, amqp::AmqpError::MessageTooLarge { .. }));

    let delivery = link.transfer(AmqpMessage::with_value("payload")).unwrap();
    let outcome = delivery
        .wait(&test_context(), &[&connection])
        .await
        .expect("disposition before timeout");
    assert_eq!(outcome.unwrap(), DeliveryState::Accepted);
    assert_eq!(server.received().len(), 1);

    link.detach(true, "", "", AmqpProperties::new()).unwrap();
    assert!(wait_until(&connection, || link.state().ok() == Some(LinkState::Detached)).await);
}

#[tokio::test]
async fn test_refused_attach_reports_detach_error() {
    let server = MockServer::start_with(MockServerConfig {
        refuse_links: true,
        ..Default::default()
    })
    .await;
    let connection = client_connection(&server);
    let session = Session::new(&connection, SessionOptions::default(), SessionEvents::new()).unwrap();
    let link = session.create_sender_link("sender", "client", "queue").unwrap();

    let detached = Arc::new(Mutex::new(None));
    let recorded = detached.clone();
    link.on_detached(move |_, error| {
        *recorded.lock().unwrap() = Some(error.map(|e| e.condition.clone()));
    })
    .unwrap();

    link.attach().unwrap();
    assert!(wait_until(&connection, || detached.lock().unwrap().is_some()).await);
    assert_eq!(
        detached.lock().unwrap().clone().flatten().as_deref(),
        Some("amqp:not-allowed")
    );
    assert_ne!(link.state().unwrap(), LinkState::Attached);
}
