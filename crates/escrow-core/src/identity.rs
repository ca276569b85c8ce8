//! # Domain Identity Newtypes
//!
//! Newtype wrappers for every identifier the escrow engine handles. You
//! cannot pass a `CaseId` where a `MilestoneId` is expected, nor a
//! `TransferId` where an `ExternalPaymentId` is expected.
//!
//! Internal identifiers are UUIDs. Identifiers minted by the payment
//! gateway are opaque strings validated for shape only.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ValidationError;

// ── UUID identifiers ────────────────────────────────────────────────

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            /// Generate a new random identifier.
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            /// Wrap an existing UUID.
            pub fn from_uuid(id: Uuid) -> Self {
                Self(id)
            }

            /// Access the inner UUID.
            pub fn as_uuid(&self) -> &Uuid {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, concat!($prefix, ":{}"), self.0)
            }
        }
    };
}

uuid_id!(
    /// Unique identifier for a milestone.
    MilestoneId,
    "milestone"
);

uuid_id!(
    /// Unique identifier for a case (the unit of legal work a milestone belongs to).
    CaseId,
    "case"
);

uuid_id!(
    /// Stable identifier of an authenticated user.
    UserId,
    "user"
);

uuid_id!(
    /// Unique identifier for a dispute record.
    DisputeId,
    "dispute"
);

// ── Opaque string identifiers ───────────────────────────────────────

const MAX_OPAQUE_LEN: usize = 255;

fn validate_opaque(kind: &'static str, value: String) -> Result<String, ValidationError> {
    let reject = |reason| ValidationError::InvalidIdentifier {
        kind,
        value: value.clone(),
        reason,
    };
    if value.is_empty() {
        return Err(reject("must not be empty"));
    }
    if value.len() > MAX_OPAQUE_LEN {
        return Err(reject("longer than 255 bytes"));
    }
    if !value.chars().all(|c| c.is_ascii_graphic()) {
        return Err(reject("must be printable ASCII without whitespace"));
    }
    Ok(value)
}

macro_rules! opaque_id {
    ($(#[$meta:meta])* $name:ident, $kind:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(try_from = "String", into = "String")]
        pub struct $name(String);

        impl $name {
            /// Validate and wrap an identifier.
            pub fn new(value: impl Into<String>) -> Result<Self, ValidationError> {
                validate_opaque($kind, value.into()).map(Self)
            }

            /// Borrow the identifier text.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl TryFrom<String> for $name {
            type Error = ValidationError;

            fn try_from(value: String) -> Result<Self, Self::Error> {
                Self::new(value)
            }
        }

        impl From<$name> for String {
            fn from(id: $name) -> Self {
                id.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

opaque_id!(
    /// Caller-stable token giving a gateway call at most one financial effect.
    ///
    /// Generated once when a milestone is created and reused for every
    /// funding attempt on it. See [`IdempotencyKey::for_attempt`].
    IdempotencyKey,
    "idempotency key"
);

opaque_id!(
    /// Gateway reference of a captured charge.
    ExternalPaymentId,
    "external payment id"
);

opaque_id!(
    /// Gateway reference of a completed payout transfer.
    TransferId,
    "transfer id"
);

opaque_id!(
    /// Gateway reference of a provider's payable destination account.
    DestinationAccountRef,
    "destination account"
);

opaque_id!(
    /// Gateway reference of a client's stored payment instrument.
    PaymentInstrumentRef,
    "payment instrument"
);

opaque_id!(
    /// Tag grouping every transfer made for one milestone.
    ///
    /// Each payout attempt is sent under a key derived from the group (see
    /// [`TransferGroup::attempt_key`]), so a lost response followed by a
    /// retry never pays out twice.
    TransferGroup,
    "transfer group"
);

impl IdempotencyKey {
    /// Mint a fresh key for a newly created milestone.
    pub fn generate() -> Self {
        Self(format!("ms_{}", Uuid::new_v4().simple()))
    }

    /// Gateway key for the given funding attempt.
    ///
    /// Attempt 0 uses the milestone key verbatim. Later attempts, which
    /// only follow a definitive decline, get a `-r<n>` suffix.
    pub fn for_attempt(&self, attempt: u32) -> IdempotencyKey {
        if attempt == 0 {
            self.clone()
        } else {
            Self(format!("{}-r{attempt}", self.0))
        }
    }

    /// Split a gateway key into the milestone key and attempt number.
    ///
    /// Inverse of [`IdempotencyKey::for_attempt`]. A key without a
    /// well-formed `-r<n>` suffix is attempt 0.
    pub fn split_attempt(&self) -> (IdempotencyKey, u32) {
        if let Some((base, n)) = self.0.rsplit_once("-r") {
            if let Ok(attempt) = n.parse::<u32>() {
                if attempt > 0 && !base.is_empty() {
                    return (Self(base.to_string()), attempt);
                }
            }
        }
        (self.clone(), 0)
    }
}

impl TransferGroup {
    /// The transfer group owned by a milestone.
    pub fn for_milestone(id: &MilestoneId) -> Self {
        Self(format!("milestone_{}", id.as_uuid().simple()))
    }

    /// Gateway key for the given payout attempt.
    ///
    /// Attempt 0 is keyed by the group itself. A failed payout is retried
    /// as a new attempt with a `-r<n>` suffix, since the gateway replays a
    /// stored failure for a reused key.
    pub fn attempt_key(&self, attempt: u32) -> IdempotencyKey {
        IdempotencyKey(self.0.clone()).for_attempt(attempt)
    }

    /// The milestone this group was derived from, if it is one of ours.
    pub fn milestone_id(&self) -> Option<MilestoneId> {
        let raw = self.0.strip_prefix("milestone_")?;
        Uuid::try_parse(raw).ok().map(MilestoneId::from_uuid)
    }
}
