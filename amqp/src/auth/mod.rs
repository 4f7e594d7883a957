//! Connection string credentials, SAS token generation and token providers.

pub mod connection_string;
pub mod sas_token_generator;
pub mod token_provider;
pub mod types;

pub use connection_string::{
    ConnectionStringCredential, SaslPlainConnectionStringCredential,
    ServiceBusSasConnectionStringCredential,
};
pub use sas_token_generator::SasTokenGenerator;
pub use token_provider::{AccessToken, SAS_TOKEN_LIFETIME_SECS, StaticTokenProvider, TokenProvider};
pub use types::TransportType;
