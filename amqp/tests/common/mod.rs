//! In-process AMQP peer used by the integration tests.
//!
//! The peer listens on a free port, begins every offered session, attaches
//! every offered link and answers `$cbs` put-token requests on the sender
//! link whose target matches the request's `reply-to`.

#![allow(dead_code)]

use amqp::common::{Context, Pollable};
use amqp::connection::{Connection, ConnectionEvents, ConnectionOptions, ConnectionState};
use amqp::link::Link;
use amqp::models::{AmqpMessage, AmqpValue, DeliveryState, Role};
use amqp::network::SocketListener;
use amqp::session::{Endpoint, Session, SessionEvents, SessionOptions};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub const TEST_TIMEOUT: Duration = Duration::from_secs(10);

pub fn test_context() -> Context {
    Context::with_timeout(TEST_TIMEOUT)
}

#[derive(Debug, Clone)]
pub struct MockServerConfig {
    /// Status code returned for every put-token request.
    pub cbs_status_code: i64,
    /// Refuse every offered link instead of attaching it.
    pub refuse_links: bool,
    /// Max message size advertised on links the peer receives on.
    pub max_message_size: u64,
    /// Messages sent on every link the client attaches as a receiver.
    pub outgoing: Vec<AmqpMessage>,
    /// Options for the connections the server accepts.
    pub connection_options: ConnectionOptions,
}

impl Default for MockServerConfig {
    fn default() -> Self {
        Self {
            cbs_status_code: 200,
            refuse_links: false,
            max_message_size: 0,
            outgoing: Vec::new(),
            connection_options: ConnectionOptions::default(),
        }
    }
}

#[derive(Default)]
struct ServerState {
    config: MockServerConfig,
    received: Mutex<Vec<(String, AmqpMessage)>>,
    cbs_requests: Mutex<Vec<AmqpMessage>>,
    replies: Mutex<HashMap<String, Link>>,
    links: Mutex<Vec<Link>>,
    sessions: Mutex<Vec<Session>>,
}

pub struct MockServer {
    port: u16,
    state: Arc<ServerState>,
    connections: Arc<Mutex<Vec<Connection>>>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl MockServer {
    pub async fn start() -> Self {
        Self::start_with(MockServerConfig::default()).await
    }

    pub async fn start_with(config: MockServerConfig) -> Self {
        let state = Arc::new(ServerState {
            config,
            ..Default::default()
        });
        let connections: Arc<Mutex<Vec<Connection>>> = Arc::new(Mutex::new(Vec::new()));

        let listener = SocketListener::new(0);
        {
            let state = state.clone();
            let connections = connections.clone();
            listener.on_socket_accepted(move |transport| {
                let options = state.config.connection_options.clone();
                let state = state.clone();
                let events = ConnectionEvents::new()
                    .on_new_endpoint(move |_, endpoint| accept_session(&state, endpoint));
                let connection = Connection::from_transport(transport, options, events)
                    .expect("server connection");
                connection.listen().expect("listen");
                connections.lock().unwrap().push(connection);
            });
        }
        listener.start().await.expect("listener should bind");
        let port = listener.local_port().expect("listener port");

        let cancel = CancellationToken::new();
        let task = {
            let cancel = cancel.clone();
            let connections = connections.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(Duration::from_millis(2)) => {
                            let _ = listener.poll();
                            let current = connections.lock().unwrap().clone();
                            for connection in current {
                                let _ = connection.poll();
                            }
                        }
                    }
                }
                listener.stop();
            })
        };

        Self {
            port,
            state,
            connections,
            cancel,
            task,
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn address(&self) -> String {
        format!("amqp://localhost:{}", self.port)
    }

    /// Messages received on non-`$cbs` links, with the link target.
    pub fn received(&self) -> Vec<(String, AmqpMessage)> {
        self.state.received.lock().unwrap().clone()
    }

    pub fn cbs_requests(&self) -> Vec<AmqpMessage> {
        self.state.cbs_requests.lock().unwrap().clone()
    }

    pub fn attached_links(&self) -> usize {
        self.state.links.lock().unwrap().len()
    }

    /// States of the connections the server has accepted, oldest first.
    pub fn connection_states(&self) -> Vec<ConnectionState> {
        self.connections
            .lock()
            .unwrap()
            .iter()
            .map(Connection::state)
            .collect()
    }

    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        let _ = (&mut self.task).await;
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn accept_session(state: &Arc<ServerState>, endpoint: Endpoint) -> bool {
    let link_state = state.clone();
    let events = SessionEvents::new()
        .on_link_attached(move |_, endpoint| accept_link(&link_state, endpoint));
    let options = SessionOptions {
        initial_incoming_window_size: 1000,
        initial_outgoing_window_size: 1000,
        ..Default::default()
    };
    let Ok(session) = Session::from_endpoint(endpoint, options, events) else {
        return false;
    };
    if session.begin().is_err() {
        return false;
    }
    state.sessions.lock().unwrap().push(session);
    true
}

fn accept_link(state: &Arc<ServerState>, endpoint: amqp::link::LinkEndpoint) -> bool {
    if state.config.refuse_links {
        return false;
    }
    let role = endpoint.role();
    let source = endpoint.source().to_string();
    let target = endpoint.target().to_string();
    let Ok(link) = Link::from_endpoint(endpoint) else {
        return false;
    };

    match role {
        Role::Receiver => {
            let _ = link.set_max_link_credit(100);
            let _ = link.set_max_message_size(state.config.max_message_size);
            let handler_state = state.clone();
            let _ = link.on_transfer(move |_, message| {
                handle_message(&handler_state, &target, message)
            });
        }
        Role::Sender => {
            state
                .replies
                .lock()
                .unwrap()
                .insert(target.clone(), link.clone());
        }
    }
    if link.attach().is_err() {
        return false;
    }
    if role == Role::Sender && source != "$cbs" {
        for message in &state.config.outgoing {
            let _ = link.transfer(message.clone());
        }
    }
    state.links.lock().unwrap().push(link);
    true
}

fn handle_message(state: &ServerState, target: &str, message: &AmqpMessage) -> DeliveryState {
    if target != "$cbs" {
        state
            .received
            .lock()
            .unwrap()
            .push((target.to_string(), message.clone()));
        return DeliveryState::Accepted;
    }

    state.cbs_requests.lock().unwrap().push(message.clone());
    let reply_to = message.properties.reply_to.clone().unwrap_or_default();
    let reply = state.replies.lock().unwrap().get(&reply_to).cloned();
    if let Some(reply) = reply {
        let code = state.config.cbs_status_code;
        let mut response = AmqpMessage::new()
            .set_application_property("status-code", AmqpValue::Long(code))
            .set_application_property(
                "status-description",
                if code == 200 { "OK" } else { "Unauthorized" },
            );
        response.properties.correlation_id = message.properties.message_id.clone();
        let _ = reply.transfer(response);
    }
    DeliveryState::Accepted
}

/// Polls `connection` until it reaches `state` or the timeout passes.
pub async fn wait_for_state(connection: &Connection, state: ConnectionState) -> bool {
    wait_until(connection, || connection.state() == state).await
}

/// Polls `connection` until `condition` holds or the timeout passes.
pub async fn wait_until(connection: &Connection, condition: impl Fn() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + TEST_TIMEOUT;
    while tokio::time::Instant::now() < deadline {
        let _ = connection.poll();
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    false
}

/// A client connection to the mock server.
pub fn client_connection(server: &MockServer) -> Connection {
    Connection::new(
        &server.address(),
        ConnectionOptions::default(),
        ConnectionEvents::new(),
    )
    .expect("client connection")
}

/// Address of a local port with nothing listening on it.
pub async fn unused_address() -> String {
    let socket = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let port = socket.local_addr().expect("addr").port();
    drop(socket);
    format!("amqp://127.0.0.1:{port}")
}
