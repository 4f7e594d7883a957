use super::error_condition::AmqpErrorCondition;
use super::value::AmqpProperties;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Which end of a link a participant plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Role {
    Sender,
    Receiver,
}

impl Role {
    /// Role the peer plays on the same link.
    pub fn opposite(self) -> Self {
        match self {
            Role::Sender => Role::Receiver,
            Role::Receiver => Role::Sender,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Sender => write!(f, "Sender"),
            Role::Receiver => write!(f, "Receiver"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SenderSettleMode {
    #[default]
    Unsettled,
    Settled,
    Mixed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReceiverSettleMode {
    #[default]
    First,
    Second,
}

/// Outcome of a delivery as reported by the receiver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeliveryState {
    Accepted,
    Rejected {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<AmqpErrorCondition>,
    },
    Released,
    Modified {
        delivery_failed: bool,
        undeliverable_here: bool,
    },
}

impl DeliveryState {
    pub fn is_accepted(&self) -> bool {
        matches!(self, DeliveryState::Accepted)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Open {
    pub container_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    pub max_frame_size: u32,
    pub channel_max: u16,
    /// Zero means the sender does not enforce an idle timeout.
    pub idle_timeout_ms: u32,
    #[serde(default, skip_serializing_if = "AmqpProperties::is_empty")]
    pub properties: AmqpProperties,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Begin {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_channel: Option<u16>,
    pub next_outgoing_id: u32,
    pub incoming_window: u32,
    pub outgoing_window: u32,
    pub handle_max: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attach {
    pub name: String,
    pub handle: u32,
    pub role: Role,
    pub snd_settle_mode: SenderSettleMode,
    pub rcv_settle_mode: ReceiverSettleMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initial_delivery_count: Option<u32>,
    /// Zero means no limit.
    pub max_message_size: u64,
    #[serde(default, skip_serializing_if = "AmqpProperties::is_empty")]
    pub properties: AmqpProperties,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Flow {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_incoming_id: Option<u32>,
    pub incoming_window: u32,
    pub next_outgoing_id: u32,
    pub outgoing_window: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handle: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delivery_count: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link_credit: Option<u32>,
    #[serde(default)]
    pub drain: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transfer {
    pub handle: u32,
    pub delivery_id: u32,
    pub delivery_tag: String,
    pub message_format: u32,
    pub settled: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Disposition {
    pub role: Role,
    pub first: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last: Option<u32>,
    pub settled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<DeliveryState>,
}

impl Disposition {
    /// Returns true if `delivery_id` falls inside `first..=last`.
    pub fn covers(&self, delivery_id: u32) -> bool {
        let last = self.last.unwrap_or(self.first);
        delivery_id.wrapping_sub(self.first) <= last.wrapping_sub(self.first)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detach {
    pub handle: u32,
    pub closed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<AmqpErrorCondition>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct End {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<AmqpErrorCondition>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Close {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<AmqpErrorCondition>,
}

/// AMQP control message carried in an AMQP frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Performative {
    Open(Open),
    Begin(Begin),
    Attach(Attach),
    Flow(Flow),
    Transfer(Transfer),
    Disposition(Disposition),
    Detach(Detach),
    End(End),
    Close(Close),
}

impl Performative {
    pub fn name(&self) -> &'static str {
        match self {
            Performative::Open(_) => "open",
            Performative::Begin(_) => "begin",
            Performative::Attach(_) => "attach",
            Performative::Flow(_) => "flow",
            Performative::Transfer(_) => "transfer",
            Performative::Disposition(_) => "disposition",
            Performative::Detach(_) => "detach",
            Performative::End(_) => "end",
            Performative::Close(_) => "close",
        }
    }
}
