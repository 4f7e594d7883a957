use super::value::AmqpProperties;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Well-known AMQP error condition symbols.
pub mod conditions {
    pub const INTERNAL_ERROR: &str = "amqp:internal-error";
    pub const NOT_FOUND: &str = "amqp:not-found";
    pub const UNAUTHORIZED_ACCESS: &str = "amqp:unauthorized-access";
    pub const DECODE_ERROR: &str = "amqp:decode-error";
    pub const RESOURCE_LIMIT_EXCEEDED: &str = "amqp:resource-limit-exceeded";
    pub const NOT_ALLOWED: &str = "amqp:not-allowed";
    pub const INVALID_FIELD: &str = "amqp:invalid-field";
    pub const NOT_IMPLEMENTED: &str = "amqp:not-implemented";
    pub const PRECONDITION_FAILED: &str = "amqp:precondition-failed";
    pub const CONNECTION_FORCED: &str = "amqp:connection:forced";
    pub const FRAMING_ERROR: &str = "amqp:connection:framing-error";
    pub const SESSION_HANDLE_IN_USE: &str = "amqp:session:handle-in-use";
    pub const SESSION_UNATTACHED_HANDLE: &str = "amqp:session:unattached-handle";
    pub const SESSION_WINDOW_VIOLATION: &str = "amqp:session:window-violation";
    pub const LINK_DETACH_FORCED: &str = "amqp:link:detach-forced";
    pub const LINK_MESSAGE_SIZE_EXCEEDED: &str = "amqp:link:message-size-exceeded";
}

/// Error carried by `detach`, `end`, `close` and rejected deliveries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AmqpErrorCondition {
    pub condition: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "AmqpProperties::is_empty")]
    pub info: AmqpProperties,
}

impl AmqpErrorCondition {
    pub fn new(condition: impl Into<String>, description: impl Into<String>) -> Self {
        let description = description.into();
        Self {
            condition: condition.into(),
            description: (!description.is_empty()).then_some(description),
            info: AmqpProperties::new(),
        }
    }

    pub fn with_info(mut self, info: AmqpProperties) -> Self {
        self.info = info;
        self
    }

    /// Builds a condition from call-site strings, treating an empty condition as none.
    pub fn from_parts(condition: &str, description: &str, info: AmqpProperties) -> Option<Self> {
        if condition.is_empty() {
            return None;
        }
        Some(Self::new(condition, description).with_info(info))
    }
}

impl fmt::Display for AmqpErrorCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.description {
            Some(description) => write!(f, "{} ({description})", self.condition),
            None => write!(f, "{}", self.condition),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_parts_mean_no_condition() {
        assert_eq!(
            AmqpErrorCondition::from_parts("", "ignored", AmqpProperties::new()),
            None
        );
        let condition =
            AmqpErrorCondition::from_parts(conditions::NOT_ALLOWED, "", AmqpProperties::new());
        assert_eq!(
            condition.map(|c| c.description),
            Some(None),
            "empty description is omitted"
        );
    }
}
