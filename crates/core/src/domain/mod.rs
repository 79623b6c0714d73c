// Domain Layer - Pure business logic and entities

pub mod break_request;
pub mod error;
pub mod group_queue;

// Re-exports
pub use break_request::{
    validate_group, validate_user_id, BreakRequest, BreakStatus, GroupId, RequestId, UserId,
};
pub use error::DomainError;
pub use group_queue::{GroupQueue, ReinsertSlot, QUEUE_KEY_STEP};
