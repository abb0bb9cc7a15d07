use dte_core::{AppError, EngineConfig};

/// Configuration for the broker's connection pool.
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

impl DatabaseConfig {
    /// Read the broker settings out of the engine environment.
    ///
    /// - `DTE_BROKER_URL`, then `DATABASE_URL`, else built from the
    ///   `POSTGRES_*` variables
    /// - `DATABASE_MAX_CONNECTIONS` (optional, defaults to 5)
    pub fn from_env() -> Result<Self, AppError> {
        Ok(Self::from(&EngineConfig::from_env()?))
    }
}

impl From<&EngineConfig> for DatabaseConfig {
    fn from(config: &EngineConfig) -> Self {
        Self {
            url: config.broker_url.clone(),
            max_connections: config.max_connections,
        }
    }
}
