// Application Layer - Use Cases and Business Logic

pub mod break_queue;
pub mod constants;
pub mod reaper;
mod shutdown;

// Re-exports
pub use break_queue::BreakQueue;
pub use reaper::ExpiryReaper;
pub use shutdown::{shutdown_channel, ShutdownSender, ShutdownToken};
