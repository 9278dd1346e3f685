//! Host-level configuration.
//!
//! The connection string comes from `DATABASE_URL`; everything else is
//! plumbed in by the binary through the per-subsystem config structs
//! (`BrowserConfig`, `SchedulerConfig`, `InteractionsConfig`).

use crate::error::ConfigError;

/// Environment variable holding the PostgreSQL connection string.
pub const DATABASE_URL_VAR: &str = "DATABASE_URL";

/// Database connection configuration.
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    url: String,
    /// Maximum number of pooled connections.
    pub pool_size: usize,
}

impl DatabaseConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            pool_size: 8,
        }
    }

    /// Read the connection string from the environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        let url = std::env::var(DATABASE_URL_VAR).map_err(|_| ConfigError::MissingEnv {
            name: DATABASE_URL_VAR.to_string(),
        })?;
        if url.is_empty() {
            return Err(ConfigError::InvalidValue {
                key: DATABASE_URL_VAR.to_string(),
                reason: "connection string is empty".to_string(),
            });
        }
        Ok(Self::new(url))
    }

    pub fn with_pool_size(mut self, size: usize) -> Self {
        self.pool_size = size;
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}
