// Queue configuration
// Defaults live in application::constants; overrides come from BREAKQ_* env vars

use crate::application::constants::{
    DEFAULT_EXPIRY_WINDOW_MS, DEFAULT_REINSERTION_SHIFT, DEFAULT_RESOLVED_RETENTION_MS,
    DEFAULT_SWEEP_INTERVAL_MS,
};
use crate::error::{AppError, Result};
use std::str::FromStr;
use std::time::Duration;

pub const ENV_EXPIRY_WINDOW_MS: &str = "BREAKQ_EXPIRY_WINDOW_MS";
pub const ENV_REINSERTION_SHIFT: &str = "BREAKQ_REINSERTION_SHIFT";
pub const ENV_SWEEP_INTERVAL_MS: &str = "BREAKQ_SWEEP_INTERVAL_MS";
pub const ENV_RESOLVED_RETENTION_MS: &str = "BREAKQ_RESOLVED_RETENTION_MS";

/// Break queue configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueConfig {
    /// Time a Notified request may stay unanswered before it can expire
    pub expiry_window_ms: i64,

    /// Slots behind the Waiting head where a postponed request is reinserted
    pub reinsertion_shift: usize,

    /// How often the reaper sweeps for expirable requests
    pub sweep_interval_ms: u64,

    /// How long resolved requests are kept in the repository
    pub resolved_retention_ms: i64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            expiry_window_ms: DEFAULT_EXPIRY_WINDOW_MS,
            reinsertion_shift: DEFAULT_REINSERTION_SHIFT,
            sweep_interval_ms: DEFAULT_SWEEP_INTERVAL_MS,
            resolved_retention_ms: DEFAULT_RESOLVED_RETENTION_MS,
        }
    }
}

impl QueueConfig {
    /// Load configuration from the process environment
    ///
    /// Unset variables keep their defaults.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary key lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let config = Self {
            expiry_window_ms: parse_or(&lookup, ENV_EXPIRY_WINDOW_MS, defaults.expiry_window_ms)?,
            reinsertion_shift: parse_or(
                &lookup,
                ENV_REINSERTION_SHIFT,
                defaults.reinsertion_shift,
            )?,
            sweep_interval_ms: parse_or(
                &lookup,
                ENV_SWEEP_INTERVAL_MS,
                defaults.sweep_interval_ms,
            )?,
            resolved_retention_ms: parse_or(
                &lookup,
                ENV_RESOLVED_RETENTION_MS,
                defaults.resolved_retention_ms,
            )?,
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject values the queue cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.expiry_window_ms <= 0 {
            return Err(AppError::Config(format!(
                "expiry_window_ms must be positive, got {}",
                self.expiry_window_ms
            )));
        }
        if self.sweep_interval_ms == 0 {
            return Err(AppError::Config(
                "sweep_interval_ms must be positive".to_string(),
            ));
        }
        if self.resolved_retention_ms < 0 {
            return Err(AppError::Config(format!(
                "resolved_retention_ms must not be negative, got {}",
                self.resolved_retention_ms
            )));
        }
        Ok(())
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| AppError::Config(format!("{}={:?}: {}", key, raw, e))),
    }
}
