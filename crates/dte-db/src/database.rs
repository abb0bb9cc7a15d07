use std::time::Duration;

use dte_core::AppError;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

use crate::config::DatabaseConfig;
use crate::queue::PgJobQueue;
use crate::store::PgResultStore;

/// Central database facade: owns the connection pool, runs migrations,
/// and vends the queue and store backed by it.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Connect to PostgreSQL with the given configuration.
    pub async fn connect(config: &DatabaseConfig) -> Result<Self, AppError> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(Duration::from_secs(5))
            .connect(&config.url)
            .await
            .map_err(|e| AppError::InfrastructureError(format!("Failed to connect: {e}")))?;

        Ok(Self { pool })
    }

    /// Create a `Database` from an existing pool (useful for testing).
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run all pending migrations.
    pub async fn migrate(&self) -> Result<(), AppError> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .map_err(|e| AppError::InfrastructureError(format!("Migration failed: {e}")))?;
        Ok(())
    }

    /// Get a [`PgJobQueue`] backed by this pool.
    pub fn job_queue(&self, visibility_timeout: Duration) -> PgJobQueue {
        PgJobQueue::new(self.pool.clone(), visibility_timeout)
    }

    /// Get a [`PgResultStore`] backed by this pool.
    pub fn result_store(&self) -> PgResultStore {
        PgResultStore::new(self.pool.clone())
    }

    /// Get a reference to the underlying pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}
