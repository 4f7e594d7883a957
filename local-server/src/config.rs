use config::{Config, Environment, File};
use serde::Deserialize;
use std::time::Duration;

/// Prefix of environment overrides, e.g. `AMQP_LOCAL__SERVER__PORT=5673`.
pub const ENV_PREFIX: &str = "AMQP_LOCAL";
pub const DEFAULT_PORT: u16 = 5672;
const MIN_MAX_FRAME_SIZE: u32 = 512;
const MAX_OPERATION_TIMEOUT_SECS: u64 = 3600;

#[derive(Debug, Deserialize, Default, Clone)]
pub struct AppConfig {
    #[serde(default)]
    server: ServerConfig,
    #[serde(default)]
    client: ClientConfig,
    #[serde(default)]
    logging: LoggingConfig,
}

impl AppConfig {
    pub fn server(&self) -> &ServerConfig {
        &self.server
    }

    pub fn client(&self) -> &ClientConfig {
        &self.client
    }

    pub fn logging(&self) -> &LoggingConfig {
        &self.logging
    }

    pub fn server_mut(&mut self) -> &mut ServerConfig {
        &mut self.server
    }

    pub fn client_mut(&mut self) -> &mut ClientConfig {
        &mut self.client
    }

    /// Checks every section and returns all problems found.
    pub fn validate(&self) -> Result<(), Vec<ConfigValidationError>> {
        let mut errors = Vec::new();

        if self.server.port() == 0 {
            errors.push(ConfigValidationError::Port {
                section: "server",
            });
        }
        if self.client.port() == 0 {
            errors.push(ConfigValidationError::Port {
                section: "client",
            });
        }
        if let Some(max_frame_size) = self.server.max_frame_size {
            if max_frame_size < MIN_MAX_FRAME_SIZE {
                errors.push(ConfigValidationError::MaxFrameSize {
                    configured: max_frame_size,
                    min_limit: MIN_MAX_FRAME_SIZE,
                });
            }
        }
        let status = self.server.cbs_status_code();
        if !(100..=599).contains(&status) {
            errors.push(ConfigValidationError::CbsStatusCode { configured: status });
        }
        let timeout = self.client.timeout_secs();
        if timeout == 0 || timeout > MAX_OPERATION_TIMEOUT_SECS {
            errors.push(ConfigValidationError::Timeout {
                configured: timeout,
                limit: MAX_OPERATION_TIMEOUT_SECS,
            });
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

#[derive(Debug, Deserialize, Default, Clone)]
pub struct ServerConfig {
    port: Option<u16>,
    max_frame_size: Option<u32>,
    idle_timeout_secs: Option<u64>,
    /// Status code answered to every put-token request.
    cbs_status_code: Option<u32>,
    enable_trace: Option<bool>,
}

impl ServerConfig {
    pub fn port(&self) -> u16 {
        self.port.unwrap_or(DEFAULT_PORT)
    }

    pub fn set_port(&mut self, port: u16) {
        self.port = Some(port);
    }

    pub fn max_frame_size(&self) -> u32 {
        self.max_frame_size.unwrap_or(u32::MAX)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs.unwrap_or(60))
    }

    pub fn cbs_status_code(&self) -> u32 {
        self.cbs_status_code.unwrap_or(200)
    }

    pub fn enable_trace(&self) -> bool {
        self.enable_trace.unwrap_or(false)
    }
}

#[derive(Debug, Deserialize, Default, Clone)]
pub struct ClientConfig {
    host: Option<String>,
    port: Option<u16>,
    connection_string: Option<String>,
    timeout_secs: Option<u64>,
    enable_trace: Option<bool>,
}

impl ClientConfig {
    pub fn host(&self) -> &str {
        self.host.as_deref().unwrap_or("localhost")
    }

    pub fn port(&self) -> u16 {
        self.port.unwrap_or(DEFAULT_PORT)
    }

    pub fn connection_string(&self) -> Option<&str> {
        self.connection_string.as_deref()
    }

    pub fn timeout_secs(&self) -> u64 {
        self.timeout_secs.unwrap_or(30)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs())
    }

    pub fn enable_trace(&self) -> bool {
        self.enable_trace.unwrap_or(false)
    }

    pub fn set_host(&mut self, host: String) {
        self.host = Some(host);
    }

    pub fn set_port(&mut self, port: u16) {
        self.port = Some(port);
    }

    pub fn set_connection_string(&mut self, connection_string: String) {
        self.connection_string = Some(connection_string);
    }
}

#[derive(Debug, Deserialize, Default, Clone)]
pub struct LoggingConfig {
    level: Option<String>,
    file: Option<String>,
}

impl LoggingConfig {
    pub fn level(&self) -> &str {
        self.level.as_deref().unwrap_or("info")
    }

    pub fn file(&self) -> Option<&str> {
        self.file.as_deref()
    }

    pub fn with_level(mut self, level: &str) -> Self {
        self.level = Some(level.to_string());
        self
    }
}

/// Configuration validation errors
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigValidationError {
    #[error("Invalid {section}.port: must be greater than 0")]
    Port { section: &'static str },
    #[error("Invalid server.max_frame_size: {configured} (min: {min_limit})")]
    MaxFrameSize { configured: u32, min_limit: u32 },
    #[error("Invalid server.cbs_status_code: {configured} (expected 100-599)")]
    CbsStatusCode { configured: u32 },
    #[error("Invalid client.timeout_secs: {configured} (min: 1, max: {limit})")]
    Timeout { configured: u64, limit: u64 },
}

/// Loads `config.toml` when present, then environment overrides.
///
/// A `.env` file is read into the environment first.
pub fn load_config() -> Result<AppConfig, config::ConfigError> {
    dotenv::dotenv().ok();
    build_config(
        File::with_name("config.toml").required(false),
        Environment::with_prefix(ENV_PREFIX)
            .prefix_separator("__")
            .separator("__")
            .try_parsing(true),
    )
}

fn build_config<F, E>(file: F, environment: E) -> Result<AppConfig, config::ConfigError>
where
    F: config::Source + Send + Sync + 'static,
    E: config::Source + Send + Sync + 'static,
{
    Config::builder()
        .add_source(file)
        .add_source(environment)
        .build()?
        .try_deserialize::<AppConfig>()
}
