use super::connection_string::ServiceBusSasConnectionStringCredential;
use crate::AmqpResult;
use crate::cbs::CbsTokenType;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::fmt;

/// Lifetime, in seconds, of SAS tokens minted for CBS.
pub const SAS_TOKEN_LIFETIME_SECS: i64 = 3600;

/// A security token and the time it stops being valid.
#[derive(Clone)]
pub struct AccessToken {
    pub token: String,
    pub expires_on: DateTime<Utc>,
}

impl AccessToken {
    pub fn new(token: impl Into<String>, expires_on: DateTime<Utc>) -> Self {
        Self {
            token: token.into(),
            expires_on,
        }
    }

    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_on
    }
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessToken")
            .field("token", &"<REDACTED>")
            .field("expires_on", &self.expires_on)
            .finish()
    }
}

/// Source of tokens that senders and receivers put to the `$cbs` node before
/// attaching.
///
/// # Examples
///
/// ```no_run
/// use amqp::auth::{AccessToken, TokenProvider};
/// use amqp::cbs::CbsTokenType;
/// use amqp::AmqpResult;
/// use async_trait::async_trait;
///
/// struct FixedProvider;
///
/// #[async_trait]
/// impl TokenProvider for FixedProvider {
///     async fn get_token(&self, _audience: &str) -> AmqpResult<AccessToken> {
///         Ok(AccessToken::new("token", chrono::Utc::now() + chrono::Duration::hours(1)))
///     }
///
///     fn token_type(&self) -> CbsTokenType {
///         CbsTokenType::Jwt
///     }
/// }
/// ```
#[async_trait]
pub trait TokenProvider: Send + Sync {
    /// Returns a token valid for `audience`.
    ///
    /// # Errors
    ///
    /// Returns an error if the token cannot be produced, for example because
    /// the signing key is malformed.
    async fn get_token(&self, audience: &str) -> AmqpResult<AccessToken>;

    fn token_type(&self) -> CbsTokenType;

    /// Audience to put a token for when attaching to `entity`.
    fn audience(&self, entity: &str) -> String {
        entity.to_string()
    }
}

#[async_trait]
impl TokenProvider for ServiceBusSasConnectionStringCredential {
    async fn get_token(&self, audience: &str) -> AmqpResult<AccessToken> {
        let expires_on = Utc::now() + Duration::seconds(SAS_TOKEN_LIFETIME_SECS);
        let token = self.generate_sas_token_for(audience, expires_on)?;
        Ok(AccessToken { token, expires_on })
    }

    fn token_type(&self) -> CbsTokenType {
        CbsTokenType::Sas
    }

    fn audience(&self, entity: &str) -> String {
        ServiceBusSasConnectionStringCredential::audience(self, entity)
    }
}

/// A pre-acquired bearer token, put as a JWT.
#[derive(Debug, Clone)]
pub struct StaticTokenProvider {
    token: AccessToken,
}

impl StaticTokenProvider {
    pub fn new(token: AccessToken) -> Self {
        Self { token }
    }
}

#[async_trait]
impl TokenProvider for StaticTokenProvider {
    async fn get_token(&self, _audience: &str) -> AmqpResult<AccessToken> {
        Ok(self.token.clone())
    }

    fn token_type(&self) -> CbsTokenType {
        CbsTokenType::Jwt
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_sas_credential_mints_one_hour_tokens() {
        let credential = ServiceBusSasConnectionStringCredential::new(
            "Endpoint=sb://ns/;SharedAccessKeyName=Root;SharedAccessKey=a2V5",
        )
        .unwrap();
        let before = Utc::now();
        let token = credential.get_token("sb://ns/queue").await.unwrap();

        assert!(token.token.starts_with("SharedAccessSignature sr=sb%3A%2F%2Fns%2Fqueue&"));
        assert!(token.expires_on >= before + Duration::minutes(59));
        assert!(!token.is_expired());
        assert_eq!(TokenProvider::token_type(&credential), CbsTokenType::Sas);
    }

    #[tokio::test]
    async fn test_static_provider_returns_its_token() {
        let expires_on = Utc::now() + Duration::minutes(5);
        let provider = StaticTokenProvider::new(AccessToken::new("jwt-value", expires_on));

        let token = provider.get_token("anything").await.unwrap();
        assert_eq!(token.token, "jwt-value");
        assert_eq!(provider.token_type(), CbsTokenType::Jwt);
        assert_eq!(provider.audience("queue"), "queue");
        assert!(!format!("{token:?}").contains("jwt-value"));
    }
}
