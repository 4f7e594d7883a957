use super::message::AmqpMessage;
use super::performatives::Performative;
use serde::{Deserialize, Serialize};

/// Protocol id announced in a protocol header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProtocolId {
    Amqp,
    Sasl,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SaslCode {
    Ok,
    Auth,
    Sys,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SaslFrame {
    Mechanisms {
        mechanisms: Vec<String>,
    },
    Init {
        mechanism: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        initial_response: Option<String>,
    },
    Outcome {
        code: SaslCode,
    },
}

/// Unit exchanged by [`Transport`](crate::network::Transport).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Frame {
    Header(ProtocolId),
    Amqp {
        channel: u16,
        performative: Performative,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        payload: Option<AmqpMessage>,
    },
    Sasl(SaslFrame),
    /// Heartbeat frame with no body.
    Empty,
}

impl Frame {
    pub fn amqp(channel: u16, performative: Performative) -> Self {
        Frame::Amqp {
            channel,
            performative,
            payload: None,
        }
    }

    pub fn describe(&self) -> String {
        match self {
            Frame::Header(id) => format!("header({id:?})"),
            Frame::Amqp {
                channel,
                performative,
                ..
            } => format!("{}[{channel}]", performative.name()),
            Frame::Sasl(frame) => format!("sasl({frame:?})"),
            Frame::Empty => "empty".to_string(),
        }
    }
}
