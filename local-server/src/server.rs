//! A small in-memory AMQP broker for local development.
//!
//! Messages sent to an address are queued under that address and delivered to
//! links that receive from it, one consumer per message. Put-token requests to
//! `$cbs` are answered with a configured status code without checking the
//! token.

use crate::config::ServerConfig;
use amqp::cbs::{CBS_NODE, CBS_STATUS_CODE_KEY, CBS_STATUS_DESCRIPTION_KEY, PUT_TOKEN_OPERATION};
use amqp::common::Pollable;
use amqp::connection::{Connection, ConnectionEvents, ConnectionOptions};
use amqp::link::{Link, LinkEndpoint, LinkState};
use amqp::models::{AmqpErrorCondition, AmqpMessage, AmqpValue, DeliveryState, Role, conditions};
use amqp::network::{SocketListener, Transport};
use amqp::session::{Endpoint, Session, SessionEvents, SessionOptions};
use amqp::AmqpResult;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const POLL_INTERVAL: Duration = Duration::from_millis(5);
const SESSION_WINDOW: u32 = 5000;
const RECEIVER_CREDIT: u32 = 100;

#[derive(Debug, Clone)]
pub struct ServerOptions {
    pub port: u16,
    pub max_frame_size: u32,
    pub idle_timeout: Duration,
    pub cbs_status_code: u32,
    pub enable_trace: bool,
}

impl From<&ServerConfig> for ServerOptions {
    fn from(config: &ServerConfig) -> Self {
        Self {
            port: config.port(),
            max_frame_size: config.max_frame_size(),
            idle_timeout: config.idle_timeout(),
            cbs_status_code: config.cbs_status_code(),
            enable_trace: config.enable_trace(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub connections: u64,
    pub received: u64,
    pub delivered: u64,
    pub tokens: u64,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// State shared by every connection the server accepts.
struct Broker {
    options: ServerOptions,
    queues: Mutex<HashMap<String, VecDeque<AmqpMessage>>>,
    /// Sender links keyed by their target, used to answer `$cbs` requests.
    replies: Mutex<HashMap<String, Link>>,
    /// Sender links delivering queued messages, with the address they drain.
    consumers: Mutex<Vec<(String, Link)>>,
    receivers: Mutex<Vec<Link>>,
    sessions: Mutex<Vec<Session>>,
    connections: AtomicU64,
    received: AtomicU64,
    delivered: AtomicU64,
    tokens: AtomicU64,
}

impl Broker {
    fn new(options: ServerOptions) -> Self {
        Self {
            options,
            queues: Mutex::new(HashMap::new()),
            replies: Mutex::new(HashMap::new()),
            consumers: Mutex::new(Vec::new()),
            receivers: Mutex::new(Vec::new()),
            sessions: Mutex::new(Vec::new()),
            connections: AtomicU64::new(0),
            received: AtomicU64::new(0),
            delivered: AtomicU64::new(0),
            tokens: AtomicU64::new(0),
        }
    }

    fn accept_session(self: &Arc<Self>, endpoint: Endpoint) -> bool {
        let broker = Arc::clone(self);
        let events = SessionEvents::new()
            .on_link_attached(move |_, endpoint| broker.accept_link(endpoint))
            .on_state_changed(|_, new, old| log::debug!("Session {old} -> {new}"));
        let options = SessionOptions {
            initial_incoming_window_size: SESSION_WINDOW,
            initial_outgoing_window_size: SESSION_WINDOW,
            enable_trace: self.options.enable_trace,
            ..Default::default()
        };
        let session = match Session::from_endpoint(endpoint, options, events) {
            Ok(session) => session,
            Err(e) => {
                log::error!("Failed to accept session: {e}");
                return false;
            }
        };
        if let Err(e) = session.begin() {
            log::error!("Failed to begin session: {e}");
            return false;
        }
        lock(&self.sessions).push(session);
        true
    }

    fn accept_link(self: &Arc<Self>, endpoint: LinkEndpoint) -> bool {
        let role = endpoint.role();
        let name = endpoint.name().to_string();
        let source = endpoint.source().to_string();
        let target = endpoint.target().to_string();
        let link = match Link::from_endpoint(endpoint) {
            Ok(link) => link,
            Err(e) => {
                log::error!("Failed to claim link '{name}': {e}");
                return false;
            }
        };

        let configured = match role {
            Role::Receiver => self.configure_receiver(&link, target.clone()),
            Role::Sender => Ok(()),
        };
        if let Err(e) = configured.and_then(|()| link.attach()) {
            log::error!("Failed to attach link '{name}': {e}");
            return false;
        }

        match role {
            Role::Receiver => {
                log::info!("Link '{name}' attached, receiving on '{target}'");
                lock(&self.receivers).push(link);
            }
            Role::Sender if source == CBS_NODE => {
                log::debug!("Link '{name}' attached, replying to '{target}'");
                lock(&self.replies).insert(target, link);
            }
            Role::Sender => {
                log::info!("Link '{name}' attached, delivering from '{source}'");
                lock(&self.replies).insert(target, link.clone());
                lock(&self.consumers).push((source, link));
            }
        }
        true
    }

    fn configure_receiver(self: &Arc<Self>, link: &Link, address: String) -> AmqpResult<()> {
        link.set_max_link_credit(RECEIVER_CREDIT)?;
        let broker = Arc::downgrade(self);
        link.on_transfer(move |_, message| match broker.upgrade() {
            Some(broker) => broker.on_message(&address, message),
            None => DeliveryState::Released,
        })
    }

    fn on_message(&self, address: &str, message: &AmqpMessage) -> DeliveryState {
        if address == CBS_NODE {
            return self.on_cbs_request(message);
        }
        self.received.fetch_add(1, Ordering::Relaxed);
        log::info!(
            "Received on '{address}': id={:?} body={:?}",
            message.properties.message_id,
            message.body
        );
        lock(&self.queues)
            .entry(address.to_string())
            .or_default()
            .push_back(message.clone());
        DeliveryState::Accepted
    }

    fn on_cbs_request(&self, request: &AmqpMessage) -> DeliveryState {
        let operation = request
            .application_properties
            .get("operation")
            .and_then(AmqpValue::as_str)
            .unwrap_or_default();
        let audience = request
            .application_properties
            .get("name")
            .and_then(AmqpValue::as_str)
            .unwrap_or_default();
        let token_type = request
            .application_properties
            .get("type")
            .and_then(AmqpValue::as_str)
            .unwrap_or_default();

        let (status, description) = if operation != PUT_TOKEN_OPERATION {
            (400, format!("Unsupported operation '{operation}'"))
        } else {
            self.tokens.fetch_add(1, Ordering::Relaxed);
            let status = self.options.cbs_status_code;
            let description = if (200..300).contains(&status) { "OK" } else { "Rejected" };
            (status, description.to_string())
        };
        log::info!("{CBS_NODE} {operation} ({token_type}) for '{audience}': {status}");

        let Some(reply_to) = request.properties.reply_to.clone() else {
            log::warn!("{CBS_NODE} request without reply-to");
            return DeliveryState::Rejected {
                error: Some(AmqpErrorCondition::new(
                    conditions::NOT_ALLOWED,
                    "reply-to is required",
                )),
            };
        };
        let Some(reply) = lock(&self.replies).get(&reply_to).cloned() else {
            log::warn!("No reply link attached for '{reply_to}'");
            return DeliveryState::Released;
        };

        let mut response = AmqpMessage::new()
            .set_application_property(CBS_STATUS_CODE_KEY, AmqpValue::from(i64::from(status)))
            .set_application_property(CBS_STATUS_DESCRIPTION_KEY, description.as_str());
        response.properties.correlation_id = request.properties.message_id.clone();
        if let Err(e) = reply.transfer(response) {
            log::warn!("Failed to answer {CBS_NODE} request on '{reply_to}': {e}");
        }
        DeliveryState::Accepted
    }

    /// Hands queued messages to consumers with credit.
    fn dispatch(&self) {
        let consumers = lock(&self.consumers).clone();
        let mut queues = lock(&self.queues);
        for (address, link) in consumers {
            let Some(queue) = queues.get_mut(&address) else {
                continue;
            };
            if link.state().ok() != Some(LinkState::Attached) {
                continue;
            }
            while link.link_credit().unwrap_or(0) > 0 {
                let Some(message) = queue.pop_front() else {
                    break;
                };
                match link.transfer(message.clone()) {
                    Ok(_) => {
                        self.delivered.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(e) => {
                        log::warn!("Failed to deliver from '{address}': {e}");
                        queue.push_front(message);
                        break;
                    }
                }
            }
        }
    }

    /// Drops handles to links and sessions that are gone.
    fn prune(&self) {
        let live = |link: &Link| {
            matches!(
                link.state(),
                Ok(LinkState::Attaching | LinkState::Attached | LinkState::Detaching)
            )
        };
        lock(&self.consumers).retain(|(_, link)| live(link));
        lock(&self.receivers).retain(live);
        lock(&self.replies).retain(|_, link| live(link));
        lock(&self.sessions).retain(|session| session.state().is_ok());
    }

    fn stats(&self) -> ServerStats {
        ServerStats {
            connections: self.connections.load(Ordering::Relaxed),
            received: self.received.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            tokens: self.tokens.load(Ordering::Relaxed),
        }
    }
}

pub struct LocalServer {
    listener: SocketListener,
    connections: Arc<Mutex<Vec<Connection>>>,
    broker: Arc<Broker>,
}

impl LocalServer {
    /// Binds the listener and starts accepting connections.
    pub async fn start(options: ServerOptions) -> AmqpResult<Self> {
        let listener = SocketListener::with_max_frame_size(options.port, options.max_frame_size);
        let broker = Arc::new(Broker::new(options));
        let connections = Arc::new(Mutex::new(Vec::new()));

        {
            let broker = Arc::clone(&broker);
            let connections = Arc::clone(&connections);
            listener.on_socket_accepted(move |transport| {
                accept_connection(&broker, &connections, transport);
            });
        }
        listener.start().await?;
        Ok(Self {
            listener,
            connections,
            broker,
        })
    }

    pub fn local_port(&self) -> Option<u16> {
        self.listener.local_port()
    }

    pub fn stats(&self) -> ServerStats {
        self.broker.stats()
    }

    /// Accepts pending sockets, processes every connection and delivers
    /// queued messages.
    pub fn poll(&self) {
        if let Err(e) = self.listener.poll() {
            log::error!("Listener failed: {e}");
        }
        let connections = lock(&self.connections).clone();
        for connection in &connections {
            if let Err(e) = connection.poll() {
                log::warn!("Connection to {} failed to poll: {e}", connection.host());
            }
        }
        self.broker.dispatch();
        self.broker.prune();
        lock(&self.connections).retain(|connection| !connection.state().is_terminal());
    }

    /// Polls until `shutdown` is cancelled, then closes every connection.
    pub async fn run(&self, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(POLL_INTERVAL) => self.poll(),
            }
        }
        self.stop();
    }

    pub fn stop(&self) {
        for connection in lock(&self.connections).drain(..) {
            if let Err(e) = connection.close("", "", Default::default()) {
                log::debug!("Closing connection to {}: {e}", connection.host());
            }
        }
        self.listener.stop();
        log::info!("Server stopped: {:?}", self.broker.stats());
    }
}

fn accept_connection(
    broker: &Arc<Broker>,
    connections: &Arc<Mutex<Vec<Connection>>>,
    transport: Transport,
) {
    let peer = transport
        .peer_addr()
        .map(|addr| addr.to_string())
        .unwrap_or_else(|| "unknown peer".to_string());
    let session_broker = Arc::clone(broker);
    let events = ConnectionEvents::new()
        .on_new_endpoint(move |_, endpoint| session_broker.accept_session(endpoint))
        .on_state_changed(|connection, old, new| {
            log::debug!("Connection {}: {old} -> {new}", connection.host());
        })
        .on_io_error(|connection, error| {
            log::warn!("Connection {} failed: {error}", connection.host());
        });
    let options = ConnectionOptions {
        max_frame_size: broker.options.max_frame_size,
        idle_timeout: broker.options.idle_timeout,
        enable_trace: broker.options.enable_trace,
        ..Default::default()
    };

    let connection = match Connection::from_transport(transport, options, events) {
        Ok(connection) => connection,
        Err(e) => {
            log::error!("Rejecting connection from {peer}: {e}");
            return;
        }
    };
    if let Err(e) = connection.listen() {
        log::error!("Failed to listen on connection from {peer}: {e}");
        return;
    }
    broker.connections.fetch_add(1, Ordering::Relaxed);
    log::info!("Accepted connection from {peer}");
    lock(connections).push(connection);
}

#[cfg(test)]
mod tests {
    use super::*;
    use amqp::common::Context;
    use amqp::message_receiver::{MessageReceiver, MessageReceiverEvents, MessageReceiverOptions};
    use amqp::message_sender::{
        MessageSendStatus, MessageSender, MessageSenderEvents, MessageSenderOptions,
    };

    fn test_options() -> ServerOptions {
        ServerOptions {
            port: 0,
            max_frame_size: u32::MAX,
            idle_timeout: Duration::from_secs(60),
            cbs_status_code: 200,
            enable_trace: false,
        }
    }

    #[tokio::test]
    async fn test_messages_are_queued_and_delivered() {
        let server = Arc::new(LocalServer::start(test_options()).await.unwrap());
        let port = server.local_port().unwrap();
        let shutdown = CancellationToken::new();
        let task = {
            let server = Arc::clone(&server);
            let shutdown = shutdown.clone();
            tokio::spawn(async move { server.run(shutdown).await })
        };

        let connection = Connection::new(
            &format!("localhost:{port}"),
            ConnectionOptions::default(),
            ConnectionEvents::new(),
        )
        .unwrap();
        let session = connection
            .create_session(SessionOptions::default(), SessionEvents::new())
            .unwrap();
        let ctx = Context::with_timeout(Duration::from_secs(10));

        let sender = MessageSender::new(
            &session,
            "orders",
            MessageSenderOptions::default(),
            MessageSenderEvents::new(),
        )
        .unwrap();
        sender.open(&ctx).await.unwrap();
        for body in ["first", "second"] {
            let (status, _) = sender
                .send(AmqpMessage::with_value(body), &ctx)
                .await
                .unwrap();
            assert_eq!(status, MessageSendStatus::Ok);
        }

        let receiver = MessageReceiver::new(
            &session,
            "orders",
            MessageReceiverOptions::default(),
            MessageReceiverEvents::new(),
        )
        .unwrap();
        receiver.open(&ctx).await.unwrap();
        for expected in ["first", "second"] {
            let message = receiver
                .wait_for_incoming_message(&ctx, &[])
                .await
                .unwrap()
                .unwrap();
            assert_eq!(message.body_str(), Some(expected));
        }

        let stats = server.stats();
        assert_eq!(stats.received, 2);
        assert_eq!(stats.delivered, 2);
        assert_eq!(stats.connections, 1);

        shutdown.cancel();
        task.await.unwrap();
    }
}
