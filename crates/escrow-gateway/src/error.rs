//! Payment gateway error types.

/// Errors from payment gateway calls.
///
/// Callers must distinguish *ambiguous* failures, where the gateway may
/// have acted on the request, from *definitive* ones. See
/// [`GatewayError::is_ambiguous`].
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// The request could not be delivered or its response was lost.
    #[error("transport error during {operation}: {reason}")]
    Transport {
        /// Gateway operation (e.g. "charge").
        operation: String,
        /// Underlying failure.
        reason: String,
    },

    /// No response within the configured timeout.
    #[error("{operation} timed out after {elapsed_ms}ms")]
    Timeout {
        /// Gateway operation.
        operation: String,
        /// Configured timeout in milliseconds.
        elapsed_ms: u64,
    },

    /// The gateway answered with a 5xx status.
    #[error("gateway {operation} returned {status}: {body}")]
    ServerError {
        /// Gateway operation.
        operation: String,
        /// HTTP status code.
        status: u16,
        /// Response body excerpt.
        body: String,
    },

    /// A success response whose body could not be decoded.
    #[error("failed to decode {operation} response: {reason}")]
    Deserialization {
        /// Gateway operation.
        operation: String,
        /// Decoder error.
        reason: String,
    },

    /// The gateway refused the request (4xx). Nothing was executed.
    #[error("gateway rejected {operation} with {status}: {body}")]
    Rejected {
        /// Gateway operation.
        operation: String,
        /// HTTP status code.
        status: u16,
        /// Response body excerpt.
        body: String,
    },

    /// The adapter is missing configuration.
    #[error("payment gateway not configured: {reason}")]
    NotConfigured {
        /// What is missing.
        reason: String,
    },
}

impl GatewayError {
    /// Whether the gateway may have executed the request.
    ///
    /// Ambiguous outcomes must be reconciled by querying before any state
    /// change. Definitive errors guarantee nothing happened gateway-side.
    pub fn is_ambiguous(&self) -> bool {
        matches!(
            self,
            Self::Transport { .. }
                | Self::Timeout { .. }
                | Self::ServerError { .. }
                | Self::Deserialization { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_timeout_and_5xx_are_ambiguous() {
        let cases = [
            GatewayError::Transport {
                operation: "charge".into(),
                reason: "reset".into(),
            },
            GatewayError::Timeout {
                operation: "charge".into(),
                elapsed_ms: 30_000,
            },
            GatewayError::ServerError {
                operation: "transfer".into(),
                status: 503,
                body: String::new(),
            },
            GatewayError::Deserialization {
                operation: "charge".into(),
                reason: "eof".into(),
            },
        ];
        for err in cases {
            assert!(err.is_ambiguous(), "{err}");
        }
    }

    #[test]
    fn rejections_are_definitive() {
        let err = GatewayError::Rejected {
            operation: "charge".into(),
            status: 400,
            body: "bad instrument".into(),
        };
        assert!(!err.is_ambiguous());
        assert!(!GatewayError::NotConfigured {
            reason: "no key".into()
        }
        .is_ambiguous());
    }

    #[test]
    fn display_includes_operation() {
        let err = GatewayError::Timeout {
            operation: "transfer".into(),
            elapsed_ms: 5_000,
        };
        assert_eq!(err.to_string(), "transfer timed out after 5000ms");
    }
}
