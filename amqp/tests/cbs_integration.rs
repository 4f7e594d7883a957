mod common;

use amqp::cbs::{Cbs, CbsOpenResult, CbsOperationResult, CbsOptions, CbsTokenType};
use amqp::connection::{Connection, ConnectionEvents, ConnectionOptions};
use amqp::management::{ManagementClientOptions, ManagementOperationStatus};
use amqp::models::AmqpMessage;
use amqp::session::{Session, SessionEvents, SessionOptions};
use claims::assert_ok;
use common::{MockServer, MockServerConfig, client_connection, test_context, unused_address};

fn session_on(connection: &Connection) -> Session {
    Session::new(connection, SessionOptions::default(), SessionEvents::new()).unwrap()
}

#[tokio::test]
async fn test_open_with_nothing_listening_is_an_error() {
    let connection = Connection::new(
        &unused_address().await,
        ConnectionOptions::default(),
        ConnectionEvents::new(),
    )
    .unwrap();
    let session = session_on(&connection);
    let cbs = Cbs::new(&session, CbsOptions::default()).unwrap();

    assert_eq!(cbs.open(&test_context()).await, CbsOpenResult::Error);
}

#[tokio::test]
async fn test_open_and_put_token() {
    let server = MockServer::start().await;
    let connection = client_connection(&server);
    let session = session_on(&connection);
    let cbs = Cbs::new(&session, CbsOptions { enable_trace: true }).unwrap();

    assert_eq!(cbs.open(&test_context()).await, CbsOpenResult::Ok);
    let (result, status_code, description) = cbs
        .put_token(CbsTokenType::Sas, "amqp://localhost/queue", "token", &test_context())
        .await
        .unwrap();
    assert_eq!(result, CbsOperationResult::Ok);
    assert_eq!(status_code, 200);
    assert_eq!(description, "OK");

    let requests = server.cbs_requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].body_str(), Some("token"));

    assert_ok!(cbs.close(&test_context()).await);
}

#[tokio::test]
async fn test_rejected_token_reports_failure() {
    let server = MockServer::start_with(MockServerConfig {
        cbs_status_code: 401,
        ..Default::default()
    })
    .await;
    let connection = client_connection(&server);
    let session = session_on(&connection);
    let cbs = Cbs::new(&session, CbsOptions::default()).unwrap();
    assert_eq!(cbs.open(&test_context()).await, CbsOpenResult::Ok);

    let (result, status_code, description) = cbs
        .put_token(CbsTokenType::Jwt, "audience", "token", &test_context())
        .await
        .unwrap();
    assert_eq!(result, CbsOperationResult::Failed);
    assert_eq!(status_code, 401);
    assert_eq!(description, "Unauthorized");
}

#[tokio::test]
async fn test_put_token_before_open_reports_closed_instance() {
    let server = MockServer::start().await;
    let connection = client_connection(&server);
    let session = session_on(&connection);
    let cbs = Cbs::new(&session, CbsOptions::default()).unwrap();

    let (result, _, _) = cbs
        .put_token(CbsTokenType::Sas, "audience", "token", &test_context())
        .await
        .unwrap();
    assert_eq!(result, CbsOperationResult::InstanceClosed);
    assert!(server.cbs_requests().is_empty());
}

#[tokio::test]
async fn test_two_instances_share_a_session() {
    let server = MockServer::start().await;
    let connection = client_connection(&server);
    let session = session_on(&connection);
    let first = Cbs::new(&session, CbsOptions::default()).unwrap();
    let second = Cbs::new(&session, CbsOptions::default()).unwrap();

    let ctx = test_context();
    let (first_open, second_open) = tokio::join!(first.open(&ctx), second.open(&ctx));
    assert_eq!(first_open, CbsOpenResult::Ok);
    assert_eq!(second_open, CbsOpenResult::Ok);

    let (first_put, second_put) = tokio::join!(
        first.put_token(CbsTokenType::Sas, "audience-1", "token-1", &ctx),
        second.put_token(CbsTokenType::Sas, "audience-2", "token-2", &ctx),
    );
    assert_eq!(first_put.unwrap().0, CbsOperationResult::Ok);
    assert_eq!(second_put.unwrap().0, CbsOperationResult::Ok);
    assert_eq!(server.cbs_requests().len(), 2);
}

#[tokio::test]
async fn test_management_client_against_cbs_node() {
    let server = MockServer::start().await;
    let connection = client_connection(&server);
    let session = session_on(&connection);
    let management = session
        .create_management_client(
            "$cbs",
            ManagementClientOptions {
                status_code_key: "status-code".to_string(),
                status_description_key: "status-description".to_string(),
                enable_trace: false,
            },
        )
        .unwrap();
    assert!(management.reply_to().starts_with("$cbs-reply-"));
    assert_eq!(management.node(), "$cbs");

    assert_eq!(
        management.open(&test_context()).await,
        amqp::management::ManagementOpenStatus::Ok
    );
    let result = management
        .execute_operation(
            "put-token",
            "jwt",
            "",
            AmqpMessage::with_value("token").set_application_property("name", "aud"),
            &test_context(),
        )
        .await
        .unwrap();
    assert_eq!(result.status, ManagementOperationStatus::Ok);
    assert_eq!(result.status_code, 200);

    let request = &server.cbs_requests()[0];
    assert_eq!(
        request.properties.reply_to.as_deref(),
        Some(management.reply_to())
    );
    assert!(request.properties.message_id.is_some());

    assert_ok!(management.close(&test_context()).await);
}
