// Break Request Domain Model

use crate::domain::error::{DomainError, Result};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Break request ID (UUID v4)
pub type RequestId = String;

/// Owning user identifier (validated by the roster collaborator)
pub type UserId = String;

/// Work-group identifier (shift/team scoping an independent queue)
pub type GroupId = String;

/// Maximum length of user and group identifiers
pub const MAX_IDENTIFIER_LEN: usize = 64;

/// Break request status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BreakStatus {
    Waiting,
    Notified,
    Confirmed,
    Postponed,
    Expired,
    Cancelled,
}

impl BreakStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            BreakStatus::Waiting => "WAITING",
            BreakStatus::Notified => "NOTIFIED",
            BreakStatus::Confirmed => "CONFIRMED",
            BreakStatus::Postponed => "POSTPONED",
            BreakStatus::Expired => "EXPIRED",
            BreakStatus::Cancelled => "CANCELLED",
        }
    }

    /// Confirmed, Expired and Cancelled requests never change again
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            BreakStatus::Confirmed | BreakStatus::Expired | BreakStatus::Cancelled
        )
    }

    /// Waiting and Notified requests occupy a slot in the group sequence
    pub fn is_active(self) -> bool {
        matches!(self, BreakStatus::Waiting | BreakStatus::Notified)
    }
}

impl std::fmt::Display for BreakStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BreakStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "WAITING" => Ok(BreakStatus::Waiting),
            "NOTIFIED" => Ok(BreakStatus::Notified),
            "CONFIRMED" => Ok(BreakStatus::Confirmed),
            "POSTPONED" => Ok(BreakStatus::Postponed),
            "EXPIRED" => Ok(BreakStatus::Expired),
            "CANCELLED" => Ok(BreakStatus::Cancelled),
            other => Err(DomainError::Validation(format!(
                "Unknown break status: {}",
                other
            ))),
        }
    }
}

/// Break Request Entity
///
/// Invariants:
/// - `notified_at` is `Some` if and only if `status == Notified`
/// - `resolved_at` is `Some` if and only if the status is terminal
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakRequest {
    pub id: RequestId,
    pub user_id: UserId,
    pub group: GroupId,
    pub status: BreakStatus,

    pub enqueued_at: i64, // epoch ms
    pub notified_at: Option<i64>,
    pub resolved_at: Option<i64>,

    pub postpone_count: u32,

    /// Sort key of the request among its group's Waiting requests
    pub queue_key: i64,
}

impl BreakRequest {
    /// Create a new Waiting request
    ///
    /// # Arguments
    ///
    /// * `id` - Unique request ID (injected, not generated)
    /// * `user_id` - Requesting user
    /// * `group` - Work-group the request is queued in
    /// * `enqueued_at` - Creation timestamp in epoch ms (injected, not system time)
    pub fn new(
        id: impl Into<String>,
        user_id: impl Into<String>,
        group: impl Into<String>,
        enqueued_at: i64,
    ) -> Self {
        Self {
            id: id.into(),
            user_id: user_id.into(),
            group: group.into(),
            status: BreakStatus::Waiting,
            enqueued_at,
            notified_at: None,
            resolved_at: None,
            postpone_count: 0,
            queue_key: 0,
        }
    }

    fn invalid(&self, to: BreakStatus) -> DomainError {
        DomainError::InvalidTransition {
            from: self.status.to_string(),
            to: to.to_string(),
        }
    }

    fn require(&self, from: BreakStatus, to: BreakStatus) -> Result<()> {
        if self.status != from {
            return Err(self.invalid(to));
        }
        Ok(())
    }

    /// Waiting -> Notified
    pub fn notify(&mut self, now_millis: i64) -> Result<()> {
        self.require(BreakStatus::Waiting, BreakStatus::Notified)?;
        self.status = BreakStatus::Notified;
        self.notified_at = Some(now_millis);
        Ok(())
    }

    /// Notified -> Confirmed (terminal)
    pub fn confirm(&mut self, now_millis: i64) -> Result<()> {
        self.require(BreakStatus::Notified, BreakStatus::Confirmed)?;
        self.resolve(BreakStatus::Confirmed, now_millis);
        Ok(())
    }

    /// Notified -> Postponed, bumping `postpone_count`
    pub fn postpone(&mut self) -> Result<()> {
        self.require(BreakStatus::Notified, BreakStatus::Postponed)?;
        self.status = BreakStatus::Postponed;
        self.notified_at = None;
        self.postpone_count += 1;
        Ok(())
    }

    /// Postponed -> Waiting (re-entry into the sequence)
    pub fn requeue(&mut self) -> Result<()> {
        self.require(BreakStatus::Postponed, BreakStatus::Waiting)?;
        self.status = BreakStatus::Waiting;
        Ok(())
    }

    /// Milliseconds left before a Notified request may expire (0 once due)
    pub fn expiry_remaining_ms(&self, now_millis: i64, window_ms: i64) -> Option<i64> {
        self.notified_at
            .map(|notified_at| (window_ms - (now_millis - notified_at)).max(0))
    }

    /// True if the request is Notified and its window has elapsed
    pub fn is_expirable(&self, now_millis: i64, window_ms: i64) -> bool {
        self.status == BreakStatus::Notified
            && self.expiry_remaining_ms(now_millis, window_ms) == Some(0)
    }

    /// Notified -> Expired (terminal), only once `window_ms` has elapsed
    pub fn expire(&mut self, now_millis: i64, window_ms: i64) -> Result<()> {
        self.require(BreakStatus::Notified, BreakStatus::Expired)?;
        match self.expiry_remaining_ms(now_millis, window_ms) {
            Some(0) => {
                self.resolve(BreakStatus::Expired, now_millis);
                Ok(())
            }
            Some(remaining_ms) => Err(DomainError::NotYetExpirable { remaining_ms }),
            // Notified without notified_at breaks the invariant; treat as due
            None => {
                self.resolve(BreakStatus::Expired, now_millis);
                Ok(())
            }
        }
    }

    /// Any non-terminal status -> Cancelled (terminal)
    pub fn cancel(&mut self, now_millis: i64) -> Result<()> {
        if self.status.is_terminal() {
            return Err(self.invalid(BreakStatus::Cancelled));
        }
        self.resolve(BreakStatus::Cancelled, now_millis);
        Ok(())
    }

    fn resolve(&mut self, status: BreakStatus, now_millis: i64) {
        self.status = status;
        self.notified_at = None;
        self.resolved_at = Some(now_millis);
    }
}

fn validate_identifier(kind: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(DomainError::Validation(format!("{} is empty", kind)));
    }
    if value.len() > MAX_IDENTIFIER_LEN {
        return Err(DomainError::Validation(format!(
            "{} too long ({} > {} chars)",
            kind,
            value.len(),
            MAX_IDENTIFIER_LEN
        )));
    }
    Ok(())
}

/// Validate a user identifier (non-empty, bounded length)
pub fn validate_user_id(user_id: &str) -> Result<()> {
    validate_identifier("User id", user_id)
}

/// Validate a group name (non-empty, bounded length, alphanumeric/'-'/'_')
pub fn validate_group(group: &str) -> Result<()> {
    validate_identifier("Group name", group)?;
    if !group
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(DomainError::Validation(format!(
            "Group name must be alphanumeric with '-' or '_': {}",
            group
        )));
    }
    Ok(())
}
