use serde::{Deserialize, Serialize};
use std::fmt;

/// How a credential expects the connection transport to be set up.
///
/// [`Plain`](TransportType::Plain) credentials authenticate each link through
/// CBS; [`SaslPlain`](TransportType::SaslPlain) credentials authenticate the
/// connection once during SASL negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TransportType {
    #[default]
    Plain,
    SaslPlain,
}

impl fmt::Display for TransportType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportType::Plain => write!(f, "plain"),
            TransportType::SaslPlain => write!(f, "sasl-plain"),
        }
    }
}
