// breakq Infrastructure - SQLite Adapter
// Implements: RequestRepository

mod connection;
mod migration;
mod request_repository;

pub use connection::create_pool;
pub use migration::run_migrations;
pub use request_repository::SqliteRequestRepository;

// Note: sqlx::Error conversion is handled by wrapping in helper functions
// due to Rust's orphan rules (cannot implement From<sqlx::Error> for AppError here)
