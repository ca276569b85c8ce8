//! # Disputes and the Dispute Window
//!
//! A dispute freezes a completed or released milestone for manual review.
//! It may be filed by either party while the window is open, measured from
//! `released_at` when the milestone was released, else from `completed_at`.

use chrono::Duration;
use serde::{Deserialize, Serialize};

use escrow_core::{DisputeId, MilestoneId, Role, Timestamp, UserId, ValidationError};

/// A filed dispute. Terminal until resolved outside the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dispute {
    /// Dispute identifier.
    pub id: DisputeId,
    /// The disputed milestone.
    pub milestone_id: MilestoneId,
    /// Side of the case that filed.
    pub filed_by: Role,
    /// The filing user.
    pub filed_by_user: UserId,
    /// Short reason.
    pub reason: String,
    /// Free-form description for the reviewer.
    pub description: String,
    /// When the dispute was filed.
    pub filed_at: Timestamp,
}

impl Dispute {
    /// Build a dispute record. The reason must not be blank.
    pub fn file(
        milestone_id: MilestoneId,
        filed_by: Role,
        filed_by_user: UserId,
        reason: impl Into<String>,
        description: impl Into<String>,
        filed_at: Timestamp,
    ) -> Result<Self, ValidationError> {
        let reason = reason.into().trim().to_string();
        if reason.is_empty() {
            return Err(ValidationError::EmptyField { field: "reason" });
        }
        Ok(Self {
            id: DisputeId::new(),
            milestone_id,
            filed_by,
            filed_by_user,
            reason,
            description: description.into(),
            filed_at,
        })
    }
}

/// How long after completion or release a dispute is accepted.
///
/// The window is inclusive: a dispute at exactly `anchor + window` is
/// still accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DisputeWindow(Duration);

impl DisputeWindow {
    /// Default window length in days.
    pub const DEFAULT_DAYS: i64 = 30;

    /// A window of `days` days. Must be positive.
    pub fn days(days: i64) -> Result<Self, ValidationError> {
        Duration::try_days(days)
            .filter(|d| *d > Duration::zero())
            .map(Self)
            .ok_or(ValidationError::OutOfRange {
                field: "dispute window",
                reason: "must be a positive number of days",
            })
    }

    /// The window length.
    pub fn duration(&self) -> Duration {
        self.0
    }

    /// Last instant a dispute is accepted for `anchor`.
    pub fn deadline(&self, anchor: Timestamp) -> Timestamp {
        anchor.saturating_add(self.0)
    }

    /// Whether `now` falls inside the window opened at `anchor`.
    pub fn is_open(&self, anchor: Timestamp, now: Timestamp) -> bool {
        now.since(anchor) <= self.0
    }
}

impl Default for DisputeWindow {
    fn default() -> Self {
        Self(Duration::days(Self::DEFAULT_DAYS))
    }
}
