// Domain Error Types

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DomainError {
    #[error("Invalid break request transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("User {user_id} already has an active break request in group {group}")]
    DuplicateRequest { user_id: String, group: String },

    #[error("Break request cannot expire yet ({remaining_ms}ms remaining)")]
    NotYetExpirable { remaining_ms: i64 },

    #[error("Validation error: {0}")]
    Validation(String),
}

pub type Result<T> = std::result::Result<T, DomainError>;
