//! # Validation Errors
//!
//! Every validated constructor in this crate fails with a
//! [`ValidationError`] that names the offending field or value, so callers
//! can surface a precise client error without string parsing.

use thiserror::Error;

/// Rejection of a malformed domain value.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// A required text field was empty or whitespace-only.
    #[error("{field} must not be empty")]
    EmptyField {
        /// Name of the offending field.
        field: &'static str,
    },

    /// A string identifier failed its format check.
    #[error("invalid {kind} {value:?}: {reason}")]
    InvalidIdentifier {
        /// Identifier kind (e.g. "idempotency key").
        kind: &'static str,
        /// The rejected input.
        value: String,
        /// Why it was rejected.
        reason: &'static str,
    },

    /// Currency codes are three ASCII letters.
    #[error("invalid currency code {0:?}: expected three ASCII letters")]
    InvalidCurrency(String),

    /// Amounts are strictly positive integers in minor units.
    #[error("amount must be greater than zero minor units")]
    NonPositiveAmount,

    /// Fee rate outside `[0, 1)` or not representable in basis points.
    #[error("invalid fee rate {value:?}: {reason}")]
    InvalidFeeRate {
        /// The rejected input.
        value: String,
        /// Why it was rejected.
        reason: &'static str,
    },

    /// A numeric setting outside its permitted range.
    #[error("{field} out of range: {reason}")]
    OutOfRange {
        /// Name of the offending field.
        field: &'static str,
        /// The permitted range.
        reason: &'static str,
    },

    /// Timestamp input that could not be parsed.
    #[error("invalid timestamp {0:?}")]
    InvalidTimestamp(String),

    /// A case whose client and provider are the same user.
    #[error("client and provider must be different users")]
    SameParty,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_field_display_names_field() {
        let err = ValidationError::EmptyField { field: "title" };
        assert_eq!(format!("{err}"), "title must not be empty");
    }

    #[test]
    fn invalid_identifier_display_includes_value_and_reason() {
        let err = ValidationError::InvalidIdentifier {
            kind: "transfer group",
            value: "a b".into(),
            reason: "contains whitespace",
        };
        let msg = format!("{err}");
        assert!(msg.contains("transfer group"));
        assert!(msg.contains("\"a b\""));
        assert!(msg.contains("contains whitespace"));
    }

    #[test]
    fn fee_rate_display() {
        let err = ValidationError::InvalidFeeRate {
            value: "1.5".into(),
            reason: "must be below 1",
        };
        assert!(format!("{err}").contains("1.5"));
    }
}
