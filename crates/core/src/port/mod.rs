// Port Layer - Interfaces for external dependencies

pub mod id_provider; // For deterministic testing
pub mod request_repository;
pub mod time_provider;

// Re-exports
pub use id_provider::IdProvider;
pub use request_repository::RequestRepository;
pub use time_provider::TimeProvider;
