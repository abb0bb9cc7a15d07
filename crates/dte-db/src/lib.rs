pub mod config;
pub mod database;
pub mod queue;
pub mod store;

pub use config::DatabaseConfig;
pub use database::Database;
pub use queue::PgJobQueue;
pub use store::PgResultStore;
