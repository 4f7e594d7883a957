mod common;

use amqp::AmqpError;
use amqp::connection::{Connection, ConnectionEvents, ConnectionOptions, ConnectionState};
use amqp::models::{AmqpProperties, conditions};
use amqp::network::SaslMechanism;
use claims::{assert_err, assert_ok};
use common::{
    MockServer, MockServerConfig, client_connection, unused_address, wait_for_state, wait_until,
};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use zeroize::Zeroizing;

fn plain(username: &str, password: &str) -> SaslMechanism {
    SaslMechanism::Plain {
        username: username.to_string(),
        password: Zeroizing::new(password.to_string()),
    }
}

/// Server that accepts only `user`/`secret` over SASL PLAIN.
async fn sasl_server() -> MockServer {
    MockServer::start_with(MockServerConfig {
        connection_options: ConnectionOptions {
            sasl_validator: Some(Arc::new(|mechanism: &SaslMechanism| {
                matches!(
                    mechanism,
                    SaslMechanism::Plain { username, password }
                        if username == "user" && password.as_str() == "secret"
                )
            })),
            ..Default::default()
        },
        ..Default::default()
    })
    .await
}

fn recording_connection(
    address: &str,
    options: ConnectionOptions,
) -> (Connection, Arc<Mutex<Vec<AmqpError>>>) {
    let errors = Arc::new(Mutex::new(Vec::new()));
    let recorded = errors.clone();
    let connection = Connection::new(
        address,
        options,
        ConnectionEvents::new().on_io_error(move |_, error| {
            recorded.lock().unwrap().push(error.clone());
        }),
    )
    .unwrap();
    (connection, errors)
}

#[tokio::test]
async fn test_open_reaches_opened_and_reports_transitions() {
    let server = MockServer::start().await;
    let transitions = Arc::new(Mutex::new(Vec::new()));
    let recorded = transitions.clone();
    let connection = Connection::new(
        &server.address(),
        ConnectionOptions::default(),
        ConnectionEvents::new().on_state_changed(move |_, old, new| {
            recorded.lock().unwrap().push((old, new));
        }),
    )
    .unwrap();

    assert_eq!(connection.state(), ConnectionState::Start);
    assert_ok!(connection.open());
    assert!(wait_for_state(&connection, ConnectionState::Opened).await);

    let transitions = transitions.lock().unwrap().clone();
    assert_eq!(
        transitions.first(),
        Some(&(ConnectionState::Start, ConnectionState::HeaderSent))
    );
    assert_eq!(
        transitions.last().map(|(_, new)| *new),
        Some(ConnectionState::Opened)
    );
    assert!(connection.remote_max_frame_size().is_ok());
}

#[tokio::test]
async fn test_getters_before_open() {
    let connection = Connection::new(
        "amqp://localhost:5672",
        ConnectionOptions {
            max_frame_size: 65536,
            max_channel_count: 16,
            idle_timeout: Duration::from_secs(30),
            ..Default::default()
        },
        ConnectionEvents::new(),
    )
    .unwrap();

    assert_eq!(connection.host(), "localhost");
    assert_eq!(connection.port(), 5672);
    assert_eq!(connection.max_frame_size(), 65536);
    assert_eq!(connection.max_channel(), 16);
    assert_eq!(connection.idle_timeout(), Duration::from_secs(30));
    assert!(!connection.container_id().is_empty());
    assert!(connection.properties().is_empty());
    assert_err!(connection.remote_max_frame_size());
}

#[tokio::test]
async fn test_close_before_open_fails() {
    let connection = Connection::new(
        "localhost",
        ConnectionOptions::default(),
        ConnectionEvents::new(),
    )
    .unwrap();
    let err = assert_err!(connection.close("", "", AmqpProperties::new()));
    assert!(matches!(err, AmqpError::InvalidState(_)));
}

#[tokio::test]
async fn test_clean_close_reaches_end() {
    let server = MockServer::start().await;
    let connection = client_connection(&server);
    connection.open().unwrap();
    assert!(wait_for_state(&connection, ConnectionState::Opened).await);

    assert_ok!(connection.close("", "", AmqpProperties::new()));
    assert_eq!(connection.state(), ConnectionState::CloseSent);
    assert!(wait_for_state(&connection, ConnectionState::End).await);
}

#[tokio::test]
async fn test_nothing_listening_reports_io_error() {
    let errors = Arc::new(Mutex::new(Vec::new()));
    let recorded = errors.clone();
    let connection = Connection::new(
        &unused_address().await,
        ConnectionOptions::default(),
        ConnectionEvents::new().on_io_error(move |_, error| {
            recorded.lock().unwrap().push(error.clone());
        }),
    )
    .unwrap();

    assert_ok!(connection.open());
    assert!(wait_for_state(&connection, ConnectionState::Error).await);
    assert!(wait_until(&connection, || !errors.lock().unwrap().is_empty()).await);
    assert!(errors.lock().unwrap()[0].is_connection_error());
    assert_err!(connection.open());
}

#[tokio::test]
async fn test_invalid_options_are_rejected() {
    let result = Connection::new(
        "localhost",
        ConnectionOptions {
            max_frame_size: 16,
            ..Default::default()
        },
        ConnectionEvents::new(),
    );
    assert!(matches!(result, Err(AmqpError::Configuration(_))));
    assert!(matches!(
        Connection::new("amqp://", ConnectionOptions::default(), ConnectionEvents::new()),
        Err(AmqpError::Configuration(_))
    ));
}

#[tokio::test]
async fn test_idle_frame_ratio_validation() {
    let connection = Connection::new(
        "localhost",
        ConnectionOptions::default(),
        ConnectionEvents::new(),
    )
    .unwrap();
    assert_ok!(connection.set_idle_empty_frame_send_percentage(0.25));
    assert_err!(connection.set_idle_empty_frame_send_percentage(0.0));
    assert_err!(connection.set_idle_empty_frame_send_percentage(1.5));
}

#[tokio::test]
async fn test_sasl_plain_with_valid_credentials_opens() {
    let server = sasl_server().await;
    let (connection, errors) = recording_connection(
        &server.address(),
        ConnectionOptions {
            sasl: Some(plain("user", "secret")),
            ..Default::default()
        },
    );

    assert_ok!(connection.open());
    assert!(wait_for_state(&connection, ConnectionState::Opened).await);
    assert!(errors.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_sasl_plain_with_rejected_credentials_fails() {
    let server = sasl_server().await;
    let (connection, errors) = recording_connection(
        &server.address(),
        ConnectionOptions {
            sasl: Some(plain("user", "wrong")),
            ..Default::default()
        },
    );

    assert_ok!(connection.open());
    assert!(wait_for_state(&connection, ConnectionState::Error).await);
    assert!(wait_until(&connection, || !errors.lock().unwrap().is_empty()).await);
    let error = errors.lock().unwrap()[0].clone();
    assert!(error.is_connection_error(), "unexpected error {error:?}");
    assert!(
        wait_until(&connection, || {
            server.connection_states() == vec![ConnectionState::Error]
        })
        .await
    );
}

#[tokio::test]
async fn test_heartbeats_keep_an_idle_connection_open() {
    // The server drops peers that stay silent for 300ms; with nothing else to
    // send, only the client's empty frames keep it alive.
    let server = MockServer::start_with(MockServerConfig {
        connection_options: ConnectionOptions {
            idle_timeout: Duration::from_millis(300),
            ..Default::default()
        },
        ..Default::default()
    })
    .await;
    let connection = client_connection(&server);
    assert_ok!(connection.set_idle_empty_frame_send_percentage(0.25));
    connection.open().unwrap();
    assert!(wait_for_state(&connection, ConnectionState::Opened).await);

    let quiet_until = tokio::time::Instant::now() + Duration::from_millis(1200);
    while tokio::time::Instant::now() < quiet_until {
        connection.poll().unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(connection.state(), ConnectionState::Opened);
    assert_eq!(server.connection_states(), vec![ConnectionState::Opened]);
}

#[tokio::test]
async fn test_silent_peer_is_dropped_after_idle_timeout() {
    let silent = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = silent.local_addr().unwrap().port();
    let accept = tokio::spawn(async move {
        let (socket, _) = silent.accept().await.unwrap();
        tokio::time::sleep(Duration::from_secs(10)).await;
        drop(socket);
    });

    let (connection, errors) = recording_connection(
        &format!("amqp://127.0.0.1:{port}"),
        ConnectionOptions {
            idle_timeout: Duration::from_millis(200),
            ..Default::default()
        },
    );
    assert_ok!(connection.open());
    assert!(wait_for_state(&connection, ConnectionState::Error).await);
    assert!(wait_until(&connection, || !errors.lock().unwrap().is_empty()).await);
    assert!(matches!(
        errors.lock().unwrap()[0],
        AmqpError::OperationTimeout(_)
    ));
    accept.abort();
}

#[tokio::test]
async fn test_close_with_error_discards_until_peer_closes() {
    let server = MockServer::start().await;
    let transitions = Arc::new(Mutex::new(Vec::new()));
    let recorded = transitions.clone();
    let connection = Connection::new(
        &server.address(),
        ConnectionOptions::default(),
        ConnectionEvents::new().on_state_changed(move |_, _, new| {
            recorded.lock().unwrap().push(new);
        }),
    )
    .unwrap();
    connection.open().unwrap();
    assert!(wait_for_state(&connection, ConnectionState::Opened).await);

    assert_ok!(connection.close(
        conditions::INTERNAL_ERROR,
        "shutting down",
        AmqpProperties::new()
    ));
    assert_eq!(connection.state(), ConnectionState::Discarding);
    assert!(wait_for_state(&connection, ConnectionState::End).await);

    let transitions = transitions.lock().unwrap().clone();
    assert!(transitions.contains(&ConnectionState::Discarding));
    assert_eq!(transitions.last(), Some(&ConnectionState::End));
    assert!(
        wait_until(&connection, || {
            server.connection_states() == vec![ConnectionState::End]
        })
        .await
    );
}
