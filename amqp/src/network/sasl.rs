use super::transport::Transport;
use crate::models::{Frame, ProtocolId, SaslCode, SaslFrame};
use crate::{AmqpError, AmqpResult};
use std::fmt;
use std::sync::Arc;
use zeroize::Zeroizing;

pub const MECHANISM_ANONYMOUS: &str = "ANONYMOUS";
pub const MECHANISM_PLAIN: &str = "PLAIN";

/// SASL mechanism used by a client connection, or presented to a listener.
#[derive(Clone, PartialEq, Eq)]
pub enum SaslMechanism {
    Anonymous,
    Plain {
        username: String,
        /// Wiped from memory when the mechanism is dropped.
        password: Zeroizing<String>,
    },
}

impl fmt::Debug for SaslMechanism {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SaslMechanism::Anonymous => write!(f, "Anonymous"),
            SaslMechanism::Plain { username, .. } => f
                .debug_struct("Plain")
                .field("username", username)
                .field("password", &"<REDACTED>")
                .finish(),
        }
    }
}

impl SaslMechanism {
    pub fn name(&self) -> &'static str {
        match self {
            SaslMechanism::Anonymous => MECHANISM_ANONYMOUS,
            SaslMechanism::Plain { .. } => MECHANISM_PLAIN,
        }
    }

    fn initial_response(&self) -> Option<String> {
        match self {
            SaslMechanism::Anonymous => None,
            SaslMechanism::Plain { username, password } => {
                Some(format!("\0{username}\0{}", password.as_str()))
            }
        }
    }

    fn from_init(mechanism: &str, initial_response: Option<&str>) -> AmqpResult<Self> {
        match mechanism {
            MECHANISM_ANONYMOUS => Ok(SaslMechanism::Anonymous),
            MECHANISM_PLAIN => {
                let response = initial_response.unwrap_or_default();
                let mut parts = response.splitn(3, '\0');
                let _authzid = parts.next();
                match (parts.next(), parts.next()) {
                    (Some(username), Some(password)) => Ok(SaslMechanism::Plain {
                        username: username.to_string(),
                        password: Zeroizing::new(password.to_string()),
                    }),
                    _ => Err(AmqpError::Protocol(
                        "Malformed SASL PLAIN initial response".to_string(),
                    )),
                }
            }
            other => Err(AmqpError::Protocol(format!(
                "Unsupported SASL mechanism: {other}"
            ))),
        }
    }
}

/// Decides whether a listener accepts the mechanism a client presented.
pub type SaslValidator = Arc<dyn Fn(&SaslMechanism) -> bool + Send + Sync>;

async fn expect_frame(transport: &mut Transport, stage: &str) -> AmqpResult<Frame> {
    match transport.next_frame().await {
        Some(frame) => frame,
        None => Err(AmqpError::ConnectionFailed(format!(
            "Peer closed the socket during SASL {stage}"
        ))),
    }
}

/// Runs the client side of the SASL exchange.
pub(crate) async fn negotiate_client(
    transport: &mut Transport,
    mechanism: &SaslMechanism,
) -> AmqpResult<()> {
    transport.send(Frame::Header(ProtocolId::Sasl)).await?;

    match expect_frame(transport, "header").await? {
        Frame::Header(ProtocolId::Sasl) => {}
        other => {
            return Err(AmqpError::ConnectionFailed(format!(
                "Expected SASL header, received {}",
                other.describe()
            )));
        }
    }

    match expect_frame(transport, "mechanisms").await? {
        Frame::Sasl(SaslFrame::Mechanisms { mechanisms }) => {
            if !mechanisms.iter().any(|m| m == mechanism.name()) {
                return Err(AmqpError::ConnectionFailed(format!(
                    "Peer does not offer SASL mechanism {} (offered: {})",
                    mechanism.name(),
                    mechanisms.join(", ")
                )));
            }
        }
        other => {
            return Err(AmqpError::ConnectionFailed(format!(
                "Expected SASL mechanisms, received {}",
                other.describe()
            )));
        }
    }

    transport
        .send(Frame::Sasl(SaslFrame::Init {
            mechanism: mechanism.name().to_string(),
            initial_response: mechanism.initial_response(),
        }))
        .await?;

    match expect_frame(transport, "outcome").await? {
        Frame::Sasl(SaslFrame::Outcome {
            code: SaslCode::Ok,
        }) => {
            log::debug!("SASL {} negotiation succeeded", mechanism.name());
            Ok(())
        }
        Frame::Sasl(SaslFrame::Outcome { code }) => Err(AmqpError::ConnectionFailed(format!(
            "SASL negotiation failed with code {code:?}"
        ))),
        other => Err(AmqpError::ConnectionFailed(format!(
            "Expected SASL outcome, received {}",
            other.describe()
        ))),
    }
}

/// Runs the listener side of the SASL exchange if the client asks for one.
///
/// Returns the first non-SASL frame read from the socket so the caller can
/// hand it to the connection. Clients that start with an AMQP header skip
/// SASL entirely.
pub(crate) async fn accept_server(
    transport: &mut Transport,
    validator: Option<&SaslValidator>,
) -> AmqpResult<Option<Frame>> {
    let first = match transport.next_frame().await {
        Some(frame) => frame?,
        None => return Ok(None),
    };
    if first != Frame::Header(ProtocolId::Sasl) {
        return Ok(Some(first));
    }

    transport.send(Frame::Header(ProtocolId::Sasl)).await?;
    transport
        .send(Frame::Sasl(SaslFrame::Mechanisms {
            mechanisms: vec![MECHANISM_PLAIN.to_string(), MECHANISM_ANONYMOUS.to_string()],
        }))
        .await?;

    let mechanism = match expect_frame(transport, "init").await? {
        Frame::Sasl(SaslFrame::Init {
            mechanism,
            initial_response,
        }) => SaslMechanism::from_init(&mechanism, initial_response.as_deref()),
        other => Err(AmqpError::Protocol(format!(
            "Expected SASL init, received {}",
            other.describe()
        ))),
    };

    let accepted = match &mechanism {
        Ok(mechanism) => validator.map(|validate| validate(mechanism)).unwrap_or(true),
        Err(e) => {
            log::warn!("Rejecting SASL init: {e}");
            false
        }
    };
    let code = if accepted { SaslCode::Ok } else { SaslCode::Auth };
    transport
        .send(Frame::Sasl(SaslFrame::Outcome { code }))
        .await?;

    if !accepted {
        return Err(AmqpError::AuthenticationFailed(
            "SASL credentials were rejected".to_string(),
        ));
    }

    match transport.next_frame().await {
        Some(frame) => Ok(Some(frame?)),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_initial_response_round_trip() {
        let mechanism = SaslMechanism::Plain {
            username: "RootManageSharedAccessKey".to_string(),
            password: Zeroizing::new("secret".to_string()),
        };
        let response = mechanism.initial_response();
        let parsed = SaslMechanism::from_init(MECHANISM_PLAIN, response.as_deref()).unwrap();
        assert_eq!(parsed, mechanism);
    }

    #[test]
    fn test_debug_hides_password() {
        let mechanism = SaslMechanism::Plain {
            username: "user".to_string(),
            password: Zeroizing::new("secret".to_string()),
        };
        let rendered = format!("{mechanism:?}");
        assert!(rendered.contains("user"));
        assert!(!rendered.contains("secret"));
    }

    #[test]
    fn test_parsed_password_is_zeroizing() {
        let parsed = SaslMechanism::from_init(MECHANISM_PLAIN, Some("\0user\0hunter2")).unwrap();
        let SaslMechanism::Plain { username, password } = parsed else {
            panic!("expected PLAIN");
        };
        assert_eq!(username, "user");
        let password: Zeroizing<String> = password;
        assert_eq!(password.as_str(), "hunter2");
    }

    #[test]
    fn test_unknown_mechanism_is_refused() {
        assert!(SaslMechanism::from_init("EXTERNAL", None).is_err());
    }
}
