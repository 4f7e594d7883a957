use super::value::{AmqpProperties, AmqpValue};
use serde::{Deserialize, Serialize};

/// The immutable properties section of a message.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct MessageProperties {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<AmqpValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<AmqpValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MessageBody {
    #[default]
    Empty,
    Data(Vec<u8>),
    Value(AmqpValue),
}

/// An AMQP message as transferred over a link.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct AmqpMessage {
    #[serde(default)]
    pub properties: MessageProperties,
    #[serde(default, skip_serializing_if = "AmqpProperties::is_empty")]
    pub application_properties: AmqpProperties,
    #[serde(default)]
    pub body: MessageBody,
}

impl AmqpMessage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a message whose body is a single AMQP value.
    pub fn with_value(value: impl Into<AmqpValue>) -> Self {
        Self {
            body: MessageBody::Value(value.into()),
            ..Self::default()
        }
    }

    /// Creates a message whose body is one binary data section.
    pub fn with_data(data: impl Into<Vec<u8>>) -> Self {
        Self {
            body: MessageBody::Data(data.into()),
            ..Self::default()
        }
    }

    pub fn set_message_id(mut self, id: impl Into<AmqpValue>) -> Self {
        self.properties.message_id = Some(id.into());
        self
    }

    pub fn set_application_property(
        mut self,
        key: impl Into<String>,
        value: impl Into<AmqpValue>,
    ) -> Self {
        self.application_properties.insert(key.into(), value.into());
        self
    }

    /// Size of the encoded message, used against the peer's max message size.
    pub fn encoded_size(&self) -> u64 {
        serde_json::to_vec(self)
            .map(|bytes| bytes.len() as u64)
            .unwrap_or(u64::MAX)
    }

    /// Body value as text, for string-valued messages such as tokens.
    pub fn body_str(&self) -> Option<&str> {
        match &self.body {
            MessageBody::Value(value) => value.as_str(),
            MessageBody::Data(data) => std::str::from_utf8(data).ok(),
            MessageBody::Empty => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_sets_sections() {
        let message = AmqpMessage::with_value("token")
            .set_message_id(1u64)
            .set_application_property("operation", "put-token");

        assert_eq!(message.body_str(), Some("token"));
        assert_eq!(message.properties.message_id, Some(AmqpValue::ULong(1)));
        assert_eq!(
            message.application_properties.get("operation"),
            Some(&AmqpValue::from("put-token"))
        );
        assert!(message.encoded_size() > 0);
    }
}
