//! Tracing subscriber setup and metric names.
//!
//! The engine only emits through the `tracing` and `metrics` facades.
//! Embedding services call [`init_tracing`] once at startup and install
//! whatever metrics recorder they export with.

use std::str::FromStr;

use tracing_subscriber::EnvFilter;

/// Funding attempts by outcome.
pub const FUNDING_TOTAL: &str = "escrow_funding_total";
/// Release attempts by outcome.
pub const RELEASE_TOTAL: &str = "escrow_release_total";
/// Dispute filings by outcome.
pub const DISPUTE_TOTAL: &str = "escrow_dispute_total";
/// Reconciliations and gateway events by outcome.
pub const RECONCILE_TOTAL: &str = "escrow_reconcile_total";
/// Outbox events delivered, by sink.
pub const RELAY_EVENTS_TOTAL: &str = "escrow_relay_events_total";

/// Increment an outcome-labelled counter.
pub(crate) fn count_outcome(metric: &'static str, outcome: &'static str) {
    metrics::counter!(metric, "outcome" => outcome).increment(1);
}

/// Increment the relay counter for a sink.
pub(crate) fn count_relayed(sink: &'static str) {
    metrics::counter!(RELAY_EVENTS_TOTAL, "sink" => sink).increment(1);
}

/// Log line format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Human-readable single-line output.
    #[default]
    Plain,
    /// One JSON object per line.
    Json,
}

impl FromStr for LogFormat {
    type Err = TelemetryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "plain" | "text" | "pretty" => Ok(Self::Plain),
            "json" => Ok(Self::Json),
            other => Err(TelemetryError::UnknownFormat(other.to_string())),
        }
    }
}

/// Errors from telemetry setup.
#[derive(Debug, thiserror::Error)]
pub enum TelemetryError {
    /// Unrecognised log format name.
    #[error("unknown log format {0:?}, expected \"plain\" or \"json\"")]
    UnknownFormat(String),
    /// A global subscriber was already installed.
    #[error("failed to install tracing subscriber: {0}")]
    Install(String),
}

/// Install the global tracing subscriber.
///
/// Filtering follows `RUST_LOG`, defaulting to `info`.
pub fn init_tracing(format: LogFormat) -> Result<(), TelemetryError> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    let result = match format {
        LogFormat::Plain => builder.try_init(),
        LogFormat::Json => builder.json().try_init(),
    };
    result.map_err(|e| TelemetryError::Install(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_format_parses_case_insensitively() {
        assert_eq!("JSON".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert_eq!("plain".parse::<LogFormat>().unwrap(), LogFormat::Plain);
        assert!("xml".parse::<LogFormat>().is_err());
    }

    #[test]
    fn second_install_is_an_error_not_a_panic() {
        let _ = init_tracing(LogFormat::Plain);
        assert!(init_tracing(LogFormat::Json).is_err());
    }
}
