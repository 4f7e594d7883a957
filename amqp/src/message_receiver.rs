//! Receiving messages over a receiver link.

use crate::auth::TokenProvider;
use crate::cbs;
use crate::common::{AsyncOperationQueue, Context, Pollable};
use crate::connection::Connection;
use crate::lifecycle::{DetachedFn, EndpointState, FailureHook, Lifecycle, StateChangedFn};
use crate::link::{Link, LinkEndpoint};
use crate::models::{
    AmqpErrorCondition, AmqpMessage, AmqpProperties, DeliveryState, ReceiverSettleMode, Role,
};
use crate::session::Session;
use crate::{AmqpError, AmqpResult};
use std::fmt;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageReceiverState {
    Invalid,
    Idle,
    Opening,
    Open,
    Closing,
    Error,
}

impl fmt::Display for MessageReceiverState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl EndpointState for MessageReceiverState {
    const IDLE: Self = Self::Idle;
    const OPENING: Self = Self::Opening;
    const OPEN: Self = Self::Open;
    const CLOSING: Self = Self::Closing;
    const ERROR: Self = Self::Error;
}

pub type MessageReceivedFn = Arc<dyn Fn(&AmqpMessage) -> DeliveryState + Send + Sync>;

#[derive(Clone)]
pub struct MessageReceiverOptions {
    /// Link name; a random one is generated when empty.
    pub name: String,
    pub target_address: String,
    pub settle_mode: ReceiverSettleMode,
    /// Credit kept available to the peer sender.
    pub max_link_credit: u32,
    pub attach_properties: AmqpProperties,
    /// Token source used to authenticate through `$cbs` before attaching.
    pub credential: Option<Arc<dyn TokenProvider>>,
    pub enable_trace: bool,
}

impl Default for MessageReceiverOptions {
    fn default() -> Self {
        Self {
            name: String::new(),
            target_address: String::new(),
            settle_mode: ReceiverSettleMode::default(),
            max_link_credit: 1,
            attach_properties: AmqpProperties::new(),
            credential: None,
            enable_trace: false,
        }
    }
}

impl fmt::Debug for MessageReceiverOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageReceiverOptions")
            .field("name", &self.name)
            .field("target_address", &self.target_address)
            .field("settle_mode", &self.settle_mode)
            .field("max_link_credit", &self.max_link_credit)
            .field("credential", &self.credential.is_some())
            .field("enable_trace", &self.enable_trace)
            .finish()
    }
}

/// Callbacks for a [`MessageReceiver`].
#[derive(Clone, Default)]
pub struct MessageReceiverEvents {
    on_state_changed: Option<StateChangedFn<MessageReceiverState>>,
    on_detached: Option<DetachedFn>,
    on_message_received: Option<MessageReceivedFn>,
}

impl MessageReceiverEvents {
    pub fn new() -> Self {
        Self::default()
    }

    /// Called with `(new_state, old_state)`.
    pub fn on_state_changed<F>(mut self, callback: F) -> Self
    where
        F: Fn(MessageReceiverState, MessageReceiverState) + Send + Sync + 'static,
    {
        self.on_state_changed = Some(Arc::new(callback));
        self
    }

    pub fn on_detached<F>(mut self, callback: F) -> Self
    where
        F: Fn(Option<&AmqpErrorCondition>) + Send + Sync + 'static,
    {
        self.on_detached = Some(Arc::new(callback));
        self
    }

    /// Handles each message instead of queueing it for
    /// [`MessageReceiver::wait_for_incoming_message`]. The returned state is
    /// sent to the peer as the delivery's disposition.
    pub fn on_message_received<F>(mut self, callback: F) -> Self
    where
        F: Fn(&AmqpMessage) -> DeliveryState + Send + Sync + 'static,
    {
        self.on_message_received = Some(Arc::new(callback));
        self
    }
}

type IncomingQueue = Arc<AsyncOperationQueue<AmqpResult<AmqpMessage>>>;

/// Receives messages from one source over a dedicated receiver link.
///
/// Without an `on_message_received` handler, every message is accepted and
/// queued in arrival order until a wait takes it.
pub struct MessageReceiver {
    link: Link,
    connection: Connection,
    source: String,
    credential: Option<Arc<dyn TokenProvider>>,
    trace: bool,
    incoming: IncomingQueue,
    lifecycle: Arc<Lifecycle<MessageReceiverState>>,
}

impl fmt::Debug for MessageReceiver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageReceiver")
            .field("source", &self.source)
            .field("state", &self.state())
            .field("queued", &self.incoming.len())
            .finish()
    }
}

impl MessageReceiver {
    /// Creates a receiver from `source` on `session`. Nothing is sent until
    /// [`open`](Self::open).
    pub fn new(
        session: &Session,
        source: &str,
        options: MessageReceiverOptions,
        events: MessageReceiverEvents,
    ) -> AmqpResult<Self> {
        let name = if options.name.is_empty() {
            format!("receiver-{}", uuid::Uuid::new_v4())
        } else {
            options.name.clone()
        };
        let link = session.create_receiver_link(&name, source, &options.target_address)?;
        Self::build(link, source.to_string(), options, events)
    }

    /// Claims a link the peer attached as a sender, so the local side receives.
    pub fn from_endpoint(
        endpoint: LinkEndpoint,
        options: MessageReceiverOptions,
        events: MessageReceiverEvents,
    ) -> AmqpResult<Self> {
        if endpoint.role() != Role::Receiver {
            return Err(AmqpError::InvalidArgument(format!(
                "link endpoint '{}' is not a receiving endpoint",
                endpoint.name()
            )));
        }
        let source = endpoint.source().to_string();
        let link = Link::from_endpoint(endpoint)?;
        Self::build(link, source, options, events)
    }

    fn build(
        link: Link,
        source: String,
        options: MessageReceiverOptions,
        events: MessageReceiverEvents,
    ) -> AmqpResult<Self> {
        link.set_receiver_settle_mode(options.settle_mode)?;
        link.set_max_link_credit(options.max_link_credit)?;
        if !options.attach_properties.is_empty() {
            link.set_attach_properties(options.attach_properties)?;
        }

        let incoming: IncomingQueue = Arc::new(AsyncOperationQueue::fifo());
        let weak = Arc::downgrade(&incoming);
        let handler = events.on_message_received.clone();
        let trace = options.enable_trace;
        link.on_transfer(move |link, message| {
            if trace {
                log::trace!(
                    "receiver '{}': message {:?}",
                    link.name().unwrap_or_default(),
                    message.properties.message_id
                );
            }
            if let Some(handler) = &handler {
                return handler(message);
            }
            if let Some(incoming) = weak.upgrade() {
                incoming.complete_operation(Ok(message.clone()));
            }
            DeliveryState::Accepted
        })?;

        let weak = Arc::downgrade(&incoming);
        let on_failure: FailureHook = Arc::new(move |error| {
            if let Some(incoming) = weak.upgrade() {
                incoming.complete_operation(Err(error));
            }
        });
        let connection = link.connection()?;
        let lifecycle = Lifecycle::new(
            format!("receiver '{}'", link.name()?),
            events.on_state_changed,
            events.on_detached,
            Some(on_failure),
        );
        lifecycle.bind(&link)?;

        Ok(Self {
            link,
            connection,
            source,
            credential: options.credential,
            trace,
            incoming,
            lifecycle,
        })
    }

    /// Authenticates when a credential is configured, then attaches the link
    /// and waits for the peer's `attach`. Credit is granted once attached.
    pub async fn open(&self, ctx: &Context) -> AmqpResult<()> {
        let state = self.state();
        if state != MessageReceiverState::Idle {
            return Err(AmqpError::invalid_state(format!(
                "cannot open a receiver in state {state}"
            )));
        }
        if let Some(credential) = &self.credential {
            let session = self.link.session()?;
            cbs::authenticate(&session, credential.as_ref(), &self.source, self.trace, ctx)
                .await?;
        }
        self.lifecycle.open(&self.link, &self.connection, ctx).await
    }

    /// Detaches the link and waits for the peer's `detach`.
    pub async fn close(&self, ctx: &Context) -> AmqpResult<()> {
        self.lifecycle.close(&self.link, &self.connection, ctx).await
    }

    /// Waits for the next queued message while pumping the connection and
    /// `waiters`.
    ///
    /// Returns `Ok(None)` when `ctx` ends or one of `waiters` becomes ready
    /// first.
    ///
    /// # Errors
    ///
    /// Returns [`AmqpError::LinkDetached`] if the peer detached the link
    /// while it was open, or the connection error that failed the link.
    pub async fn wait_for_incoming_message(
        &self,
        ctx: &Context,
        waiters: &[&dyn Pollable],
    ) -> AmqpResult<Option<AmqpMessage>> {
        let mut pollables: Vec<&dyn Pollable> = Vec::with_capacity(waiters.len() + 1);
        pollables.push(&self.connection);
        pollables.extend_from_slice(waiters);
        self.incoming
            .wait_for_polled_result(ctx, &pollables)
            .await
            .transpose()
    }

    /// Takes the next queued message without waiting.
    pub fn try_wait_for_incoming_message(&self) -> AmqpResult<Option<AmqpMessage>> {
        self.incoming.try_take().transpose()
    }

    pub fn state(&self) -> MessageReceiverState {
        self.lifecycle.state()
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn link(&self) -> &Link {
        &self.link
    }
}

impl Pollable for MessageReceiver {
    fn poll(&self) -> AmqpResult<()> {
        self.connection.poll()
    }

    fn is_ready(&self) -> bool {
        !self.incoming.is_empty()
    }
}

impl Drop for MessageReceiver {
    fn drop(&mut self) {
        self.lifecycle.abandon(&self.link);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{ConnectionEvents, ConnectionOptions};
    use crate::session::{SessionEvents, SessionOptions};
    use claims::{assert_none, assert_ok};
    use std::time::Duration;

    fn receiver(options: MessageReceiverOptions) -> (Connection, MessageReceiver) {
        let connection = Connection::new(
            "amqp://localhost:5672",
            ConnectionOptions::default(),
            ConnectionEvents::new(),
        )
        .unwrap();
        let session =
            Session::new(&connection, SessionOptions::default(), SessionEvents::new()).unwrap();
        let receiver =
            MessageReceiver::new(&session, "orders", options, MessageReceiverEvents::new())
                .unwrap();
        (connection, receiver)
    }

    #[test]
    fn test_defaults() {
        let (_connection, receiver) = receiver(MessageReceiverOptions::default());
        assert_eq!(receiver.state(), MessageReceiverState::Idle);
        assert_eq!(receiver.source(), "orders");
        assert_eq!(receiver.link().role().unwrap(), Role::Receiver);
        assert_eq!(receiver.link().max_link_credit().unwrap(), 1);
        assert!(receiver.link().name().unwrap().starts_with("receiver-"));
    }

    #[test]
    fn test_options_reach_the_link() {
        let (_connection, receiver) = receiver(MessageReceiverOptions {
            name: "r".to_string(),
            target_address: "local".to_string(),
            settle_mode: ReceiverSettleMode::Second,
            max_link_credit: 50,
            ..Default::default()
        });
        let link = receiver.link();
        assert_eq!(link.target().unwrap(), "local");
        assert_eq!(link.receiver_settle_mode().unwrap(), ReceiverSettleMode::Second);
        assert_eq!(link.max_link_credit().unwrap(), 50);
    }

    #[tokio::test]
    async fn test_wait_on_idle_receiver_times_out_empty() {
        let (_connection, receiver) = receiver(MessageReceiverOptions::default());
        let ctx = Context::with_timeout(Duration::from_millis(20));

        let message = assert_ok!(receiver.wait_for_incoming_message(&ctx, &[]).await);
        assert_none!(message);
        assert_none!(receiver.try_wait_for_incoming_message().unwrap());
        assert!(!receiver.is_ready());
    }
}
