use std::time::Duration;

use crate::errors::{EmbedError, EmbedResult};

/// Default control API endpoint.
pub const DEFAULT_API_URL: &str = "https://api.parla.dev";

/// Prefix required on publishable API keys. Secret keys must never be
/// embedded in client applications and are rejected here.
pub const PUBLISHABLE_KEY_PREFIX: &str = "pk_";

/// Default number of transport connect attempts.
pub const DEFAULT_MAX_RETRY_ATTEMPTS: u32 = 3;

/// Default base delay between transport connect attempts.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(1000);

/// Client configuration supplied by the host application.
#[derive(Debug, Clone)]
pub struct EmbedConfig {
    /// Publishable API key (must start with `pk_`).
    pub api_key: String,
    /// Base URL of the control API.
    pub api_url: String,
    /// Enable verbose request/response logging.
    pub debug: bool,
    /// Maximum transport connect attempts before giving up.
    pub max_retry_attempts: u32,
    /// Base delay between connect attempts; grows by 1.5x per retry.
    pub retry_delay: Duration,
}

impl EmbedConfig {
    /// Create a configuration with defaults for everything but the key.
    pub fn new(api_key: impl Into<String>) -> Self {
        EmbedConfig {
            api_key: api_key.into(),
            ..Default::default()
        }
    }

    /// Validate the configuration. Performs no network I/O.
    pub fn validate(&self) -> EmbedResult<()> {
        if self.api_key.is_empty() {
            return Err(EmbedError::Configuration(
                "API key is required".to_string(),
            ));
        }
        if !self.api_key.starts_with(PUBLISHABLE_KEY_PREFIX) {
            return Err(EmbedError::Configuration(format!(
                "API key must be a publishable key starting with '{PUBLISHABLE_KEY_PREFIX}'"
            )));
        }
        if self.max_retry_attempts == 0 {
            return Err(EmbedError::Configuration(
                "max_retry_attempts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for EmbedConfig {
    fn default() -> Self {
        EmbedConfig {
            api_key: String::new(),
            api_url: DEFAULT_API_URL.to_string(),
            debug: false,
            max_retry_attempts: DEFAULT_MAX_RETRY_ATTEMPTS,
            retry_delay: DEFAULT_RETRY_DELAY,
        }
    }
}
