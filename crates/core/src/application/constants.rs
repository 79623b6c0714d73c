// Queue constants (No magic values)

/// Notified requests may expire once this much time has passed (90s)
pub const DEFAULT_EXPIRY_WINDOW_MS: i64 = 90 * 1000;

/// A postponed request goes back two slots behind the Waiting head
pub const DEFAULT_REINSERTION_SHIFT: usize = 2;

/// Reaper sweep interval (1s)
pub const DEFAULT_SWEEP_INTERVAL_MS: u64 = 1000;

/// Resolved requests are kept for 7 days
pub const DEFAULT_RESOLVED_RETENTION_MS: i64 = 7 * 24 * 60 * 60 * 1000;

/// Reaper purges resolved requests once every N sweeps (1h at the default interval)
pub const PURGE_EVERY_N_SWEEPS: u64 = 3600;
