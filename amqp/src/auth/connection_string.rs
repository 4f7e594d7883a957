use super::sas_token_generator::SasTokenGenerator;
use super::types::TransportType;
use crate::connection::options::{AMQP_TLS_PORT, parse_host};
use crate::network::SaslMechanism;
use crate::{AmqpError, AmqpResult};
use chrono::{DateTime, Utc};
use std::fmt;
use zeroize::{Zeroize, Zeroizing};

/// Fields of a `Key=Value;Key=Value` connection string.
///
/// `Endpoint` is required and is read as a URL; its host becomes
/// [`host_name`](Self::host_name) and its port defaults to 5671. The shared
/// access key and the raw string are wiped from memory on drop.
#[derive(Clone, PartialEq, Eq)]
pub struct ConnectionStringCredential {
    connection_string: String,
    endpoint: String,
    host_name: String,
    port: u16,
    shared_access_key_name: String,
    shared_access_key: String,
    entity_path: String,
}

impl ConnectionStringCredential {
    /// Parses a connection string.
    ///
    /// # Errors
    ///
    /// Returns [`AmqpError::Configuration`] if the string is empty, a segment
    /// has no `=`, `Endpoint` is missing, or the endpoint has no usable host.
    pub fn new(connection_string: &str) -> AmqpResult<Self> {
        if connection_string.trim().is_empty() {
            return Err(AmqpError::Configuration(
                "Connection string cannot be empty".to_string(),
            ));
        }

        let mut endpoint = None;
        let mut shared_access_key_name = String::new();
        let mut shared_access_key = String::new();
        let mut entity_path = String::new();

        for (index, part) in connection_string.split(';').enumerate() {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }

            // Segment text is not echoed; it may hold the key.
            let (key, value) = part.split_once('=').ok_or_else(|| {
                AmqpError::Configuration(format!(
                    "Invalid connection string: segment {index} has no '=' delimiter"
                ))
            })?;

            match key.trim() {
                "Endpoint" => endpoint = Some(value.trim().to_string()),
                "SharedAccessKeyName" => shared_access_key_name = value.trim().to_string(),
                "SharedAccessKey" => shared_access_key = value.trim().to_string(),
                "EntityPath" => entity_path = value.trim().to_string(),
                other => log::debug!("Ignoring connection string key '{other}'"),
            }
        }

        let endpoint = endpoint.ok_or_else(|| {
            AmqpError::Configuration("Missing Endpoint in connection string".to_string())
        })?;
        let (host_name, port) = parse_host(&endpoint, AMQP_TLS_PORT)?;

        Ok(Self {
            connection_string: connection_string.to_string(),
            endpoint,
            host_name,
            port,
            shared_access_key_name,
            shared_access_key,
            entity_path,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn host_name(&self) -> &str {
        &self.host_name
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn shared_access_key_name(&self) -> &str {
        &self.shared_access_key_name
    }

    pub fn shared_access_key(&self) -> &str {
        &self.shared_access_key
    }

    pub fn entity_path(&self) -> &str {
        &self.entity_path
    }

    pub fn connection_string(&self) -> &str {
        &self.connection_string
    }

    /// `Endpoint` joined with `entity`, used as a token audience.
    pub fn resource_uri(&self, entity: &str) -> String {
        let base = self.endpoint.trim_end_matches('/');
        let entity = entity.trim_start_matches('/');
        if entity.is_empty() {
            format!("{base}/")
        } else {
            format!("{base}/{entity}")
        }
    }

    fn require_key(&self) -> AmqpResult<()> {
        if self.shared_access_key_name.is_empty() {
            return Err(AmqpError::Configuration(
                "Missing SharedAccessKeyName in connection string".to_string(),
            ));
        }
        if self.shared_access_key.is_empty() {
            return Err(AmqpError::Configuration(
                "Missing SharedAccessKey in connection string".to_string(),
            ));
        }
        Ok(())
    }
}

impl fmt::Debug for ConnectionStringCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionStringCredential")
            .field("endpoint", &self.endpoint)
            .field("host_name", &self.host_name)
            .field("port", &self.port)
            .field("shared_access_key_name", &self.shared_access_key_name)
            .field("shared_access_key", &"<REDACTED>")
            .field("entity_path", &self.entity_path)
            .finish()
    }
}

impl Drop for ConnectionStringCredential {
    fn drop(&mut self) {
        self.shared_access_key.zeroize();
        self.connection_string.zeroize();
    }
}

/// Connection string credential that authenticates with SAS tokens over CBS.
///
/// The connection itself uses a plain transport; each sender or receiver puts
/// a token for its own audience before attaching.
#[derive(Debug, Clone)]
pub struct ServiceBusSasConnectionStringCredential {
    credential: ConnectionStringCredential,
}

impl ServiceBusSasConnectionStringCredential {
    /// # Errors
    ///
    /// Returns [`AmqpError::Configuration`] if the string does not parse or
    /// lacks `SharedAccessKeyName` or `SharedAccessKey`.
    pub fn new(connection_string: &str) -> AmqpResult<Self> {
        let credential = ConnectionStringCredential::new(connection_string)?;
        credential.require_key()?;
        Ok(Self { credential })
    }

    pub fn credential(&self) -> &ConnectionStringCredential {
        &self.credential
    }

    pub fn transport_type(&self) -> TransportType {
        TransportType::Plain
    }

    /// Audience for `entity`, preferring the connection string's `EntityPath`.
    pub fn audience(&self, entity: &str) -> String {
        if self.credential.entity_path.is_empty() {
            self.credential.resource_uri(entity)
        } else {
            self.credential.resource_uri(&self.credential.entity_path)
        }
    }

    /// SAS token for the endpoint and entity path of the connection string.
    pub fn generate_sas_token(&self, expires_on: DateTime<Utc>) -> AmqpResult<String> {
        self.generate_sas_token_for(&self.audience(""), expires_on)
    }

    pub(crate) fn generate_sas_token_for(
        &self,
        resource_uri: &str,
        expires_on: DateTime<Utc>,
    ) -> AmqpResult<String> {
        SasTokenGenerator::new(resource_uri).generate_sas_token(
            &self.credential.shared_access_key_name,
            &self.credential.shared_access_key,
            expires_on,
        )
    }
}

/// Connection string credential that authenticates the connection with SASL PLAIN.
#[derive(Debug, Clone)]
pub struct SaslPlainConnectionStringCredential {
    credential: ConnectionStringCredential,
}

impl SaslPlainConnectionStringCredential {
    pub fn new(connection_string: &str) -> AmqpResult<Self> {
        let credential = ConnectionStringCredential::new(connection_string)?;
        credential.require_key()?;
        Ok(Self { credential })
    }

    pub fn credential(&self) -> &ConnectionStringCredential {
        &self.credential
    }

    pub fn transport_type(&self) -> TransportType {
        TransportType::SaslPlain
    }

    /// PLAIN mechanism with the key name as username and the key as password.
    pub fn sasl_mechanism(&self) -> SaslMechanism {
        SaslMechanism::Plain {
            username: self.credential.shared_access_key_name.clone(),
            password: Zeroizing::new(self.credential.shared_access_key.clone()),
        }
    }
}
