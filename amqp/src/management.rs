//! AMQP management request/response over a sender and receiver link pair.
//!
//! Requests go to the management node (`$management`, `$cbs`, ...) with a
//! per-client `message-id` and a `reply-to` naming this client's receiver.
//! Responses are matched on `correlation-id`.

use crate::common::{AsyncOperationQueue, Context, Pollable};
use crate::connection::Connection;
use crate::message_receiver::{
    MessageReceiver, MessageReceiverEvents, MessageReceiverOptions, MessageReceiverState,
};
use crate::message_sender::{
    MessageSendStatus, MessageSender, MessageSenderEvents, MessageSenderOptions,
    MessageSenderState,
};
use crate::models::{AmqpErrorCondition, AmqpMessage, AmqpValue, DeliveryState};
use crate::session::Session;
use crate::{AmqpError, AmqpResult};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

pub const DEFAULT_STATUS_CODE_KEY: &str = "statusCode";
pub const DEFAULT_STATUS_DESCRIPTION_KEY: &str = "statusDescription";

#[derive(Debug, Clone)]
pub struct ManagementClientOptions {
    /// Application property holding the response status code.
    pub status_code_key: String,
    /// Application property holding the response status description.
    pub status_description_key: String,
    pub enable_trace: bool,
}

impl Default for ManagementClientOptions {
    fn default() -> Self {
        Self {
            status_code_key: DEFAULT_STATUS_CODE_KEY.to_string(),
            status_description_key: DEFAULT_STATUS_DESCRIPTION_KEY.to_string(),
            enable_trace: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManagementOpenStatus {
    Invalid,
    Ok,
    Error,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManagementOperationStatus {
    Invalid,
    Ok,
    Error,
    FailedBadStatus,
    InstanceClosed,
}

/// Outcome of [`ManagementClient::execute_operation`].
#[derive(Debug, Clone, PartialEq)]
pub struct ManagementOperationResult {
    pub status: ManagementOperationStatus,
    /// Status code from the response, or zero when no response arrived.
    pub status_code: u32,
    pub description: String,
    /// Condition from a rejected request or a detached link.
    pub error: Option<AmqpErrorCondition>,
    pub message: Option<AmqpMessage>,
}

impl ManagementOperationResult {
    fn failed(status: ManagementOperationStatus, error: Option<AmqpErrorCondition>) -> Self {
        Self {
            status,
            status_code: 0,
            description: error
                .as_ref()
                .and_then(|error| error.description.clone())
                .unwrap_or_default(),
            error,
            message: None,
        }
    }
}

type ResponseQueue = Arc<AsyncOperationQueue<AmqpResult<AmqpMessage>>>;
type PendingRequests = Arc<Mutex<HashMap<u64, ResponseQueue>>>;

fn lock(pending: &Mutex<HashMap<u64, ResponseQueue>>) -> MutexGuard<'_, HashMap<u64, ResponseQueue>> {
    pending
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Completes every outstanding request with `error`.
fn fail_pending(pending: &Weak<Mutex<HashMap<u64, ResponseQueue>>>, error: AmqpError) {
    let Some(pending) = pending.upgrade() else {
        return;
    };
    let drained: Vec<ResponseQueue> = lock(&pending).drain().map(|(_, queue)| queue).collect();
    for queue in drained {
        queue.complete_operation(Err(error.clone()));
    }
}

fn correlation_id(message: &AmqpMessage) -> Option<u64> {
    match message.properties.correlation_id.as_ref()? {
        AmqpValue::ULong(id) => Some(*id),
        AmqpValue::String(id) => id.parse().ok(),
        other => other.as_i64().and_then(|id| u64::try_from(id).ok()),
    }
}

/// Request/response client for one management node.
pub struct ManagementClient {
    node: String,
    reply_to: String,
    options: ManagementClientOptions,
    connection: Connection,
    sender: MessageSender,
    receiver: MessageReceiver,
    next_message_id: AtomicU64,
    pending: PendingRequests,
}

impl fmt::Debug for ManagementClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagementClient")
            .field("node", &self.node)
            .field("reply_to", &self.reply_to)
            .field("sender", &self.sender.state())
            .field("receiver", &self.receiver.state())
            .finish()
    }
}

impl ManagementClient {
    /// Creates the link pair for `node` on `session`. Nothing is sent until
    /// [`open`](Self::open).
    pub fn new(
        session: &Session,
        node: &str,
        options: ManagementClientOptions,
    ) -> AmqpResult<Self> {
        if node.is_empty() {
            return Err(AmqpError::InvalidArgument(
                "management node name cannot be empty".to_string(),
            ));
        }
        let id = uuid::Uuid::new_v4().simple().to_string();
        let reply_to = format!("{node}-reply-{id}");
        let pending: PendingRequests = Arc::new(Mutex::new(HashMap::new()));

        let sender = MessageSender::new(
            session,
            node,
            MessageSenderOptions {
                name: format!("{node}-sender-{id}"),
                source_address: reply_to.clone(),
                enable_trace: options.enable_trace,
                ..Default::default()
            },
            MessageSenderEvents::new(),
        )?;

        let routed = Arc::downgrade(&pending);
        let on_detached = Arc::downgrade(&pending);
        let on_state = Arc::downgrade(&pending);
        let label = node.to_string();
        let receiver_events = MessageReceiverEvents::new()
            .on_message_received(move |message| {
                let queue = correlation_id(message).and_then(|id| {
                    routed.upgrade().and_then(|pending| lock(&pending).remove(&id))
                });
                match queue {
                    Some(queue) => queue.complete_operation(Ok(message.clone())),
                    None => log::warn!(
                        "{label}: dropping response with unknown correlation id {:?}",
                        message.properties.correlation_id
                    ),
                }
                DeliveryState::Accepted
            })
            .on_detached(move |error| {
                fail_pending(&on_detached, AmqpError::LinkDetached(error.cloned()));
            })
            .on_state_changed(move |new, _| {
                if new == MessageReceiverState::Error {
                    fail_pending(&on_state, AmqpError::LinkDetached(None));
                }
            });
        let receiver = MessageReceiver::new(
            session,
            node,
            MessageReceiverOptions {
                name: format!("{node}-receiver-{id}"),
                target_address: reply_to.clone(),
                max_link_credit: 100,
                enable_trace: options.enable_trace,
                ..Default::default()
            },
            receiver_events,
        )?;

        Ok(Self {
            node: node.to_string(),
            reply_to,
            options,
            connection: session.connection()?,
            sender,
            receiver,
            next_message_id: AtomicU64::new(0),
            pending,
        })
    }

    /// Attaches the receiver and then the sender.
    pub async fn open(&self, ctx: &Context) -> ManagementOpenStatus {
        if let Err(e) = self.receiver.open(ctx).await {
            return self.open_failed("receiver", &e);
        }
        if let Err(e) = self.sender.open(ctx).await {
            return self.open_failed("sender", &e);
        }
        log::debug!("{}: management client open", self.node);
        ManagementOpenStatus::Ok
    }

    fn open_failed(&self, direction: &str, error: &AmqpError) -> ManagementOpenStatus {
        if error.is_cancellation() {
            return ManagementOpenStatus::Cancelled;
        }
        log::warn!("{}: opening the {direction} failed: {error}", self.node);
        ManagementOpenStatus::Error
    }

    /// Sends a request and waits for its correlated response.
    ///
    /// `message` carries the request body and any extra application
    /// properties; `operation`, `type` and `locales` are added to it.
    ///
    /// # Errors
    ///
    /// Returns [`AmqpError::InvalidState`] if the client is not open, and a
    /// cancellation error if `ctx` ends before the response arrives.
    pub async fn execute_operation(
        &self,
        operation: &str,
        operation_type: &str,
        locales: &str,
        message: AmqpMessage,
        ctx: &Context,
    ) -> AmqpResult<ManagementOperationResult> {
        if self.sender.state() != MessageSenderState::Open
            || self.receiver.state() != MessageReceiverState::Open
        {
            return Ok(ManagementOperationResult::failed(
                ManagementOperationStatus::InstanceClosed,
                None,
            ));
        }

        let message_id = self.next_message_id.fetch_add(1, Ordering::Relaxed);
        let mut request = message
            .set_message_id(AmqpValue::ULong(message_id))
            .set_application_property("operation", operation)
            .set_application_property("type", operation_type);
        if !locales.is_empty() {
            request = request.set_application_property("locales", locales);
        }
        request.properties.reply_to = Some(self.reply_to.clone());

        let response: ResponseQueue = Arc::new(AsyncOperationQueue::new());
        lock(&self.pending).insert(message_id, response.clone());
        if self.options.enable_trace {
            log::trace!("{}: {operation} request {message_id}", self.node);
        }

        let sent = self.sender.send(request, ctx).await;
        let (status, error) = match sent {
            Ok(sent) => sent,
            Err(e) => {
                lock(&self.pending).remove(&message_id);
                return Err(e);
            }
        };
        match status {
            MessageSendStatus::Ok => {}
            MessageSendStatus::Timeout | MessageSendStatus::Cancelled => {
                lock(&self.pending).remove(&message_id);
                return Err(ctx.cancellation_error(operation));
            }
            MessageSendStatus::Error | MessageSendStatus::Invalid => {
                lock(&self.pending).remove(&message_id);
                return Ok(ManagementOperationResult::failed(
                    ManagementOperationStatus::Error,
                    error,
                ));
            }
        }

        let outcome = response
            .wait_for_polled_result(ctx, &[&self.connection as &dyn Pollable])
            .await;
        lock(&self.pending).remove(&message_id);
        match outcome {
            None => Err(ctx.cancellation_error(operation)),
            Some(Err(AmqpError::LinkDetached(error))) => Ok(ManagementOperationResult::failed(
                ManagementOperationStatus::InstanceClosed,
                error,
            )),
            Some(Err(e)) => {
                log::warn!("{}: {operation} abandoned: {e}", self.node);
                Ok(ManagementOperationResult::failed(
                    ManagementOperationStatus::InstanceClosed,
                    None,
                ))
            }
            Some(Ok(response)) => Ok(self.interpret(response)),
        }
    }

    fn interpret(&self, response: AmqpMessage) -> ManagementOperationResult {
        let properties = &response.application_properties;
        let description = properties
            .get(&self.options.status_description_key)
            .and_then(AmqpValue::as_str)
            .unwrap_or_default()
            .to_string();
        let status_code = properties
            .get(&self.options.status_code_key)
            .and_then(AmqpValue::as_i64)
            .and_then(|code| u32::try_from(code).ok());

        let (status, status_code) = match status_code {
            Some(code @ (200 | 202)) => (ManagementOperationStatus::Ok, code),
            Some(code) => (ManagementOperationStatus::FailedBadStatus, code),
            None => {
                log::warn!(
                    "{}: response has no '{}' property",
                    self.node,
                    self.options.status_code_key
                );
                (ManagementOperationStatus::Error, 0)
            }
        };
        ManagementOperationResult {
            status,
            status_code,
            description,
            error: None,
            message: Some(response),
        }
    }

    /// Detaches both links, waiting for the peer.
    pub async fn close(&self, ctx: &Context) -> AmqpResult<()> {
        let sender = self.sender.close(ctx).await;
        let receiver = self.receiver.close(ctx).await;
        sender.and(receiver)
    }

    pub fn node(&self) -> &str {
        &self.node
    }

    pub fn reply_to(&self) -> &str {
        &self.reply_to
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{ConnectionEvents, ConnectionOptions};
    use crate::session::{SessionEvents, SessionOptions};

    fn session() -> (Connection, Session) {
        let connection = Connection::new(
            "localhost:5672",
            ConnectionOptions::default(),
            ConnectionEvents::new(),
        )
        .unwrap();
        let session =
            Session::new(&connection, SessionOptions::default(), SessionEvents::new()).unwrap();
        (connection, session)
    }

    #[test]
    fn test_correlation_id_accepts_numeric_and_text_ids() {
        let mut message = AmqpMessage::new();
        assert_eq!(correlation_id(&message), None);
        message.properties.correlation_id = Some(AmqpValue::ULong(7));
        assert_eq!(correlation_id(&message), Some(7));
        message.properties.correlation_id = Some(AmqpValue::String("12".to_string()));
        assert_eq!(correlation_id(&message), Some(12));
        message.properties.correlation_id = Some(AmqpValue::Long(-1));
        assert_eq!(correlation_id(&message), None);
    }

    #[test]
    fn test_link_pair_addresses() {
        let (_connection, session) = session();
        let client =
            ManagementClient::new(&session, "$management", ManagementClientOptions::default())
                .unwrap();

        assert!(client.reply_to().starts_with("$management-reply-"));
        assert_eq!(client.sender.target(), "$management");
        assert_eq!(client.receiver.source(), "$management");
        assert_eq!(
            client.receiver.link().target().unwrap(),
            client.reply_to()
        );
    }

    #[test]
    fn test_status_codes() {
        let (_connection, session) = session();
        let client =
            ManagementClient::new(&session, "$management", ManagementClientOptions::default())
                .unwrap();
        let response = |code: i64| {
            AmqpMessage::new()
                .set_application_property(DEFAULT_STATUS_CODE_KEY, AmqpValue::Long(code))
                .set_application_property(DEFAULT_STATUS_DESCRIPTION_KEY, "text")
        };

        assert_eq!(client.interpret(response(200)).status, ManagementOperationStatus::Ok);
        assert_eq!(client.interpret(response(202)).status, ManagementOperationStatus::Ok);
        let failed = client.interpret(response(404));
        assert_eq!(failed.status, ManagementOperationStatus::FailedBadStatus);
        assert_eq!(failed.status_code, 404);
        assert_eq!(failed.description, "text");
        assert_eq!(
            client.interpret(AmqpMessage::new()).status,
            ManagementOperationStatus::Error
        );
    }

    #[tokio::test]
    async fn test_execute_before_open_reports_closed_instance() {
        let (_connection, session) = session();
        let client =
            ManagementClient::new(&session, "$management", ManagementClientOptions::default())
                .unwrap();
        let result = client
            .execute_operation("READ", "entity", "", AmqpMessage::new(), &Context::new())
            .await
            .unwrap();
        assert_eq!(result.status, ManagementOperationStatus::InstanceClosed);
    }

    #[test]
    fn test_empty_node_is_rejected() {
        let (_connection, session) = session();
        assert!(ManagementClient::new(&session, "", ManagementClientOptions::default()).is_err());
    }
}
