//! Sending messages over a sender link.

use crate::auth::TokenProvider;
use crate::cbs;
use crate::common::{Context, Pollable};
use crate::connection::Connection;
use crate::lifecycle::{DetachedFn, EndpointState, Lifecycle, StateChangedFn};
use crate::link::{Link, LinkEndpoint};
use crate::models::{
    AmqpErrorCondition, AmqpMessage, AmqpProperties, DeliveryState, Role, SenderSettleMode,
};
use crate::session::Session;
use crate::{AmqpError, AmqpResult};
use std::fmt;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageSenderState {
    Invalid,
    Idle,
    Opening,
    Open,
    Closing,
    Error,
}

impl fmt::Display for MessageSenderState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl EndpointState for MessageSenderState {
    const IDLE: Self = Self::Idle;
    const OPENING: Self = Self::Opening;
    const OPEN: Self = Self::Open;
    const CLOSING: Self = Self::Closing;
    const ERROR: Self = Self::Error;
}

/// Result of [`MessageSender::send`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageSendStatus {
    Invalid,
    Ok,
    Error,
    Timeout,
    Cancelled,
}

#[derive(Clone, Default)]
pub struct MessageSenderOptions {
    /// Link name; a random one is generated when empty.
    pub name: String,
    pub source_address: String,
    pub settle_mode: SenderSettleMode,
    pub initial_delivery_count: u32,
    pub max_message_size: u64,
    pub max_link_credit: u32,
    pub attach_properties: AmqpProperties,
    /// Token source used to authenticate through `$cbs` before attaching.
    pub credential: Option<Arc<dyn TokenProvider>>,
    pub enable_trace: bool,
}

impl fmt::Debug for MessageSenderOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageSenderOptions")
            .field("name", &self.name)
            .field("source_address", &self.source_address)
            .field("settle_mode", &self.settle_mode)
            .field("initial_delivery_count", &self.initial_delivery_count)
            .field("max_message_size", &self.max_message_size)
            .field("max_link_credit", &self.max_link_credit)
            .field("credential", &self.credential.is_some())
            .field("enable_trace", &self.enable_trace)
            .finish()
    }
}

/// Callbacks for a [`MessageSender`].
#[derive(Clone, Default)]
pub struct MessageSenderEvents {
    on_state_changed: Option<StateChangedFn<MessageSenderState>>,
    on_detached: Option<DetachedFn>,
}

impl MessageSenderEvents {
    pub fn new() -> Self {
        Self::default()
    }

    /// Called with `(new_state, old_state)`.
    pub fn on_state_changed<F>(mut self, callback: F) -> Self
    where
        F: Fn(MessageSenderState, MessageSenderState) + Send + Sync + 'static,
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
}

/// Sends messages to one target over a dedicated sender link.
///
/// Dropping an open sender detaches its link without waiting for the peer.
pub struct MessageSender {
    link: Link,
    connection: Connection,
    target: String,
    credential: Option<Arc<dyn TokenProvider>>,
    trace: bool,
    lifecycle: Arc<Lifecycle<MessageSenderState>>,
}

impl fmt::Debug for MessageSender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageSender")
            .field("target", &self.target)
            .field("state", &self.state())
            .finish()
    }
}

impl MessageSender {
    /// Creates a sender to `target` on `session`. Nothing is sent until
    /// [`open`](Self::open).
    pub fn new(
        session: &Session,
        target: &str,
        options: MessageSenderOptions,
        events: MessageSenderEvents,
    ) -> AmqpResult<Self> {
        let name = if options.name.is_empty() {
            format!("sender-{}", uuid::Uuid::new_v4())
        } else {
            options.name.clone()
        };
        let link = session.create_sender_link(&name, &options.source_address, target)?;
        Self::build(link, target.to_string(), options, events)
    }

    /// Claims a link the peer attached as a receiver, so the local side sends.
    pub fn from_endpoint(
        endpoint: LinkEndpoint,
        options: MessageSenderOptions,
        events: MessageSenderEvents,
    ) -> AmqpResult<Self> {
        if endpoint.role() != Role::Sender {
            return Err(AmqpError::InvalidArgument(format!(
                "link endpoint '{}' is not a sending endpoint",
                endpoint.name()
            )));
        }
        let target = endpoint.target().to_string();
        let link = Link::from_endpoint(endpoint)?;
        Self::build(link, target, options, events)
    }

    fn build(
        link: Link,
        target: String,
        options: MessageSenderOptions,
        events: MessageSenderEvents,
    ) -> AmqpResult<Self> {
        link.set_sender_settle_mode(options.settle_mode)?;
        link.set_initial_delivery_count(options.initial_delivery_count)?;
        link.set_max_message_size(options.max_message_size)?;
        link.set_max_link_credit(options.max_link_credit)?;
        if !options.attach_properties.is_empty() {
            link.set_attach_properties(options.attach_properties)?;
        }
        let connection = link.connection()?;
        let lifecycle = Lifecycle::new(
            format!("sender '{}'", link.name()?),
            events.on_state_changed,
            events.on_detached,
            None,
        );
        lifecycle.bind(&link)?;

        Ok(Self {
            link,
            connection,
            target,
            credential: options.credential,
            trace: options.enable_trace,
            lifecycle,
        })
    }

    /// Authenticates when a credential is configured, then attaches the link
    /// and waits for the peer's `attach`.
    ///
    /// # Errors
    ///
    /// Returns [`AmqpError::AuthenticationFailed`] if the token is refused,
    /// [`AmqpError::AttachFailed`] if the peer refuses the link, and a
    /// cancellation error if `ctx` ends first.
    pub async fn open(&self, ctx: &Context) -> AmqpResult<()> {
        let state = self.state();
        if state != MessageSenderState::Idle {
            return Err(AmqpError::invalid_state(format!(
                "cannot open a sender in state {state}"
            )));
        }
        if let Some(credential) = &self.credential {
            let session = self.link.session()?;
            cbs::authenticate(&session, credential.as_ref(), &self.target, self.trace, ctx)
                .await?;
        }
        self.lifecycle.open(&self.link, &self.connection, ctx).await
    }

    /// Detaches the link and waits for the peer's `detach`.
    pub async fn close(&self, ctx: &Context) -> AmqpResult<()> {
        self.lifecycle.close(&self.link, &self.connection, ctx).await
    }

    /// Transfers `message` and waits for its outcome.
    ///
    /// A rejected delivery or a detach while waiting yields
    /// [`MessageSendStatus::Error`] with the peer's error condition.
    ///
    /// # Errors
    ///
    /// Returns [`AmqpError::InvalidState`] if the sender is not open and
    /// [`AmqpError::MessageTooLarge`] if the message exceeds the peer's limit.
    pub async fn send(
        &self,
        message: AmqpMessage,
        ctx: &Context,
    ) -> AmqpResult<(MessageSendStatus, Option<AmqpErrorCondition>)> {
        let state = self.state();
        if state != MessageSenderState::Open {
            return Err(AmqpError::invalid_state(format!(
                "cannot send on a sender in state {state}"
            )));
        }
        let delivery = self.link.transfer(message)?;
        let outcome = delivery
            .wait(ctx, &[&self.connection as &dyn Pollable])
            .await;
        if self.trace {
            log::trace!("sender to '{}': delivery outcome {outcome:?}", self.target);
        }
        match outcome {
            Some(Ok(DeliveryState::Accepted)) => Ok((MessageSendStatus::Ok, None)),
            Some(Ok(DeliveryState::Rejected { error })) => Ok((MessageSendStatus::Error, error)),
            Some(Ok(other)) => {
                log::debug!("sender to '{}': delivery settled as {other:?}", self.target);
                Ok((MessageSendStatus::Error, None))
            }
            Some(Err(AmqpError::LinkDetached(error))) => Ok((MessageSendStatus::Error, error)),
            Some(Err(e)) => Err(e),
            None if ctx.is_expired() => Ok((MessageSendStatus::Timeout, None)),
            None => Ok((MessageSendStatus::Cancelled, None)),
        }
    }

    pub fn state(&self) -> MessageSenderState {
        self.lifecycle.state()
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn link(&self) -> &Link {
        &self.link
    }

    /// Largest message the peer accepts; zero means unlimited.
    ///
    /// # Errors
    ///
    /// Returns [`AmqpError::InvalidState`] until the sender is open.
    pub fn max_message_size(&self) -> AmqpResult<u64> {
        self.link.peer_max_message_size()
    }
}

impl Drop for MessageSender {
    fn drop(&mut self) {
        self.lifecycle.abandon(&self.link);
    }
}
