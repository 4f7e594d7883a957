use crate::models::AmqpErrorCondition;
use thiserror::Error;

/// Errors produced by the AMQP core.
///
/// The enum is `Clone` so a failure can be handed to every waiter parked on an
/// [`AsyncOperationQueue`](crate::common::AsyncOperationQueue) and to event
/// callbacks without re-creating it.
///
/// # Error Categories
///
/// ## Configuration and Precondition Errors
/// - [`Configuration`](AmqpError::Configuration) - Malformed connection strings and options
/// - [`InvalidArgument`](AmqpError::InvalidArgument) - Bad input to an operation
/// - [`InvalidState`](AmqpError::InvalidState) - Operation not legal in the current protocol state
///
/// ## Transport Errors
/// - [`Io`](AmqpError::Io) - Socket level failures
/// - [`ConnectionFailed`](AmqpError::ConnectionFailed) - Dial or negotiation failures
/// - [`ConnectionClosed`](AmqpError::ConnectionClosed) - The connection is no longer usable
/// - [`Protocol`](AmqpError::Protocol) - The peer violated the frame sequencing rules
///
/// ## Link and Authentication Errors
/// - [`AttachFailed`](AmqpError::AttachFailed) - The peer refused or aborted an attach
/// - [`LinkDetached`](AmqpError::LinkDetached) - The link went away while work was pending
/// - [`AuthenticationFailed`](AmqpError::AuthenticationFailed) - Claims-based security rejected the token
#[derive(Debug, Clone, Error)]
pub enum AmqpError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Connection closed: {0}")]
    ConnectionClosed(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Attach failed: {0}")]
    AttachFailed(String),

    #[error("Link detached{}", detach_suffix(.0))]
    LinkDetached(Option<AmqpErrorCondition>),

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Authentication error: {0}")]
    AuthenticationError(String),

    #[error("Operation cancelled: {0}")]
    OperationCancelled(String),

    #[error("Operation timeout: {0}")]
    OperationTimeout(String),

    #[error("Channel max exceeded: no free channel at or below {0}")]
    ChannelMaxExceeded(u16),

    #[error("Handle max exceeded: no free handle at or below {0}")]
    HandleMaxExceeded(u32),

    #[error("Message too large: {size} bytes exceeds the peer limit of {max} bytes")]
    MessageTooLarge { size: u64, max: u64 },

    #[error("Internal error: {0}")]
    InternalError(String),
}

fn detach_suffix(condition: &Option<AmqpErrorCondition>) -> String {
    match condition {
        Some(condition) => format!(": {condition}"),
        None => String::new(),
    }
}

/// Result alias used throughout the crate.
pub type AmqpResult<T> = Result<T, AmqpError>;

impl AmqpError {
    pub fn invalid_state(message: impl Into<String>) -> Self {
        AmqpError::InvalidState(message.into())
    }

    /// Error used when a handle outlives the connection that owned its state.
    pub fn connection_dropped() -> Self {
        AmqpError::ConnectionClosed("the owning connection has been dropped".to_string())
    }

    /// Check if the error means the transport can no longer be used.
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            AmqpError::Io(_) | AmqpError::ConnectionFailed(_) | AmqpError::ConnectionClosed(_)
        )
    }

    /// Check if the error came from a cancelled or expired wait.
    pub fn is_cancellation(&self) -> bool {
        matches!(
            self,
            AmqpError::OperationCancelled(_) | AmqpError::OperationTimeout(_)
        )
    }
}

impl From<std::io::Error> for AmqpError {
    fn from(err: std::io::Error) -> Self {
        AmqpError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for AmqpError {
    fn from(err: serde_json::Error) -> Self {
        AmqpError::Serialization(err.to_string())
    }
}

impl From<base64::DecodeError> for AmqpError {
    fn from(err: base64::DecodeError) -> Self {
        AmqpError::AuthenticationError(format!("Failed to decode key: {err}"))
    }
}

impl From<tokio::time::error::Elapsed> for AmqpError {
    fn from(err: tokio::time::error::Elapsed) -> Self {
        AmqpError::OperationTimeout(err.to_string())
    }
}
