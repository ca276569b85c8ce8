//! # Milestone Status
//!
//! The flat status view of a milestone and the legal transition table:
//!
//! ```text
//! Pending ──fund──▶ Funded ──complete──▶ Completed ──release──▶ Released
//!                                            │                     │
//!                                            └──────dispute────────┴──▶ Disputed
//! ```
//!
//! Any edge not drawn above is rejected. There is no implicit skipping.

use serde::{Deserialize, Serialize};

/// Lifecycle status of a milestone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MilestoneStatus {
    /// Scoped but not yet paid for.
    Pending,
    /// Client funds captured by the gateway and held.
    Funded,
    /// Provider has marked the work done.
    Completed,
    /// Funds paid out to the provider.
    Released,
    /// Frozen pending manual resolution. Terminal for the engine.
    Disputed,
}

impl MilestoneStatus {
    /// All statuses, in lifecycle order.
    pub const ALL: [MilestoneStatus; 5] = [
        Self::Pending,
        Self::Funded,
        Self::Completed,
        Self::Released,
        Self::Disputed,
    ];

    /// The canonical string name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Funded => "funded",
            Self::Completed => "completed",
            Self::Released => "released",
            Self::Disputed => "disputed",
        }
    }

    /// Parse a canonical name.
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.as_str() == name)
    }

    /// Statuses directly reachable from this one.
    pub fn valid_transitions(&self) -> &'static [MilestoneStatus] {
        match self {
            Self::Pending => &[Self::Funded],
            Self::Funded => &[Self::Completed],
            Self::Completed => &[Self::Released, Self::Disputed],
            Self::Released => &[Self::Disputed],
            Self::Disputed => &[],
        }
    }

    /// Whether `self → to` is an edge of the table.
    pub fn can_transition_to(&self, to: MilestoneStatus) -> bool {
        self.valid_transitions().contains(&to)
    }

    /// Whether no further engine-driven transition exists.
    pub fn is_terminal(&self) -> bool {
        self.valid_transitions().is_empty()
    }

    /// Whether client funds have been captured.
    pub fn is_funded(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

impl std::fmt::Display for MilestoneStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
