use crate::{AmqpError, AmqpResult};
use base64::{Engine as _, engine::general_purpose};
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Generator for Shared Access Signature (SAS) tokens scoped to one resource URI.
///
/// Tokens are signed with HMAC-SHA256 using the base64-decoded shared access
/// key. The same key, resource and expiry always produce the same token.
///
/// # Examples
///
/// ```no_run
/// use amqp::auth::SasTokenGenerator;
/// use chrono::{Duration, Utc};
///
/// let generator = SasTokenGenerator::new("sb://my-namespace.servicebus.windows.net/queue");
/// let token = generator.generate_sas_token(
///     "RootManageSharedAccessKey",
///     "c2VjcmV0",
///     Utc::now() + Duration::hours(1),
/// )?;
/// ```
#[derive(Debug, Clone)]
pub struct SasTokenGenerator {
    resource_uri: String,
}

impl SasTokenGenerator {
    pub fn new(resource_uri: impl Into<String>) -> Self {
        Self {
            resource_uri: resource_uri.into(),
        }
    }

    pub fn resource_uri(&self) -> &str {
        &self.resource_uri
    }

    /// Generates a SAS token expiring at `expires_on`.
    ///
    /// The expiry is written as whole seconds since the Unix epoch; any
    /// sub-second part of `expires_on` is truncated.
    ///
    /// # Arguments
    ///
    /// * `key_name` - The name of the shared access key policy
    /// * `key` - The base64-encoded shared access key
    /// * `expires_on` - Absolute expiration time of the token
    ///
    /// # Errors
    ///
    /// Returns [`AmqpError::AuthenticationError`] if the key is not valid
    /// base64 or the HMAC cannot be created from it.
    pub fn generate_sas_token(
        &self,
        key_name: &str,
        key: &str,
        expires_on: DateTime<Utc>,
    ) -> AmqpResult<String> {
        let expiry_timestamp = expires_on.timestamp();
        let encoded_uri = urlencoding::encode(&self.resource_uri);
        let string_to_sign = format!("{}\n{}", encoded_uri, expiry_timestamp);

        let key_bytes = general_purpose::STANDARD.decode(key).map_err(|e| {
            AmqpError::AuthenticationError(format!("Failed to decode key: {e}"))
        })?;

        let mut mac = HmacSha256::new_from_slice(&key_bytes).map_err(|e| {
            AmqpError::AuthenticationError(format!("Failed to create HMAC: {e}"))
        })?;

        mac.update(string_to_sign.as_bytes());
        let signature = mac.finalize();
        let signature_base64 = general_purpose::STANDARD.encode(signature.into_bytes());

        Ok(format!(
            "SharedAccessSignature sr={}&sig={}&se={}&skn={}",
            encoded_uri,
            urlencoding::encode(&signature_base64),
            expiry_timestamp,
            urlencoding::encode(key_name)
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    const KEY: &str = "MDEyMzQ1Njc4OWFiY2RlZjAxMjM0NTY3ODlhYmNkZWY=";

    fn expiry() -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000, 0).single().unwrap()
    }

    #[test]
    fn test_token_layout() {
        let generator = SasTokenGenerator::new("sb://ns.servicebus.windows.net/queue");
        let token = generator
            .generate_sas_token("Root Key", KEY, expiry())
            .unwrap();

        assert!(token.starts_with(
            "SharedAccessSignature sr=sb%3A%2F%2Fns.servicebus.windows.net%2Fqueue&sig="
        ));
        assert!(token.contains("&se=1700000000&"));
        assert!(token.ends_with("&skn=Root%20Key"));
    }

    #[test]
    fn test_expiry_is_truncated_to_seconds() {
        let generator = SasTokenGenerator::new("sb://ns/");
        let whole = generator.generate_sas_token("k", KEY, expiry()).unwrap();
        let fractional = generator
            .generate_sas_token("k", KEY, expiry() + Duration::milliseconds(999))
            .unwrap();
        assert_eq!(whole, fractional);
    }

    #[test]
    fn test_one_second_changes_signature() {
        let generator = SasTokenGenerator::new("sb://ns/");
        let first = generator.generate_sas_token("k", KEY, expiry()).unwrap();
        let second = generator
            .generate_sas_token("k", KEY, expiry() + Duration::seconds(1))
            .unwrap();

        let signature = |token: &str| {
            token
                .split('&')
                .find(|part| part.starts_with("sig="))
                .map(str::to_string)
        };
        assert_ne!(signature(&first), signature(&second));
        assert!(second.contains("se=1700000001"));
    }

    #[test]
    fn test_invalid_key_is_an_authentication_error() {
        let generator = SasTokenGenerator::new("sb://ns/");
        let err = generator
            .generate_sas_token("k", "not base64!", expiry())
            .unwrap_err();
        assert!(matches!(err, AmqpError::AuthenticationError(msg) if msg.starts_with("Failed to decode key")));
    }
}
