//! Custom error types for the crate.
//!
//! This module defines the primary error type, `Sr400Error`, used across the
//! library. Using the `thiserror` crate, it provides a centralized and
//! consistent way to classify the failure modes of instrument control:
//!
//! - **`Connection`**: transport-level failures (port open, write, read).
//! - **`Validation`**: an out-of-range parameter rejected locally, before any
//!   byte reaches the wire.
//! - **`Protocol`**: a reply was received but could not be parsed, even after
//!   numeric-token extraction.
//! - **`DeviceBusy`**: an operation was refused because a sweep or a
//!   monitoring session currently owns the device.
//! - **`SweepAborted`**: a sweep ended early on an unexpected failure; the
//!   points collected up to that moment travel with the error.
//!
//! Query-level `Connection`/`Protocol` errors are normally caught by the
//! device facade, reported on the event channel, and degraded to "no value";
//! see the facade documentation for the exact policy.

use thiserror::Error;

use crate::sweep::SweepResult;

/// Convenience alias for results using the crate error type.
pub type Result<T> = std::result::Result<T, Sr400Error>;

/// Error type covering transport, protocol, validation and sweep failures.
#[derive(Error, Debug)]
pub enum Sr400Error {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Protocol error: unparsable reply {0:?}")]
    Protocol(String),

    #[error("Device busy: {0} in progress")]
    DeviceBusy(&'static str),

    #[error("Sweep aborted: {reason}")]
    SweepAborted {
        /// Human-readable cause of the abort.
        reason: String,
        /// Points collected before the abort; may be empty.
        partial: SweepResult,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[cfg(feature = "storage_csv")]
    #[error("Export error: {0}")]
    Csv(#[from] csv::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sweep_aborted_carries_partial_data() {
        let mut partial = SweepResult::default();
        partial.push(-0.05, 120.0);
        let err = Sr400Error::SweepAborted {
            reason: "level set failed".into(),
            partial,
        };
        match err {
            Sr400Error::SweepAborted { partial, .. } => {
                assert_eq!(partial.len(), 1);
            }
            other => panic!("unexpected variant: {other:?}"),
        }
    }

    #[test]
    fn display_includes_reply_text() {
        let err = Sr400Error::Protocol("GARBAGE".into());
        assert!(err.to_string().contains("GARBAGE"));
    }
}
