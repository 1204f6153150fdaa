//! Error taxonomy for a pipe transfer run.
//!
//! Session and filesystem layers report plain `String` errors; the engine
//! classifies them by the stage in which they surfaced.

use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferSide {
    Source,
    Destination,
}

impl std::fmt::Display for TransferSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            TransferSide::Source => "source",
            TransferSide::Destination => "destination",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutScope {
    Deadline,
    GracePeriod,
}

impl std::fmt::Display for TimeoutScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TimeoutScope::Deadline => f.write_str("transfer deadline"),
            TimeoutScope::GracePeriod => f.write_str("producer grace period"),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum TransferError {
    #[error("Invalid transfer request: {0}")]
    InvalidRequest(String),

    #[error("Connection to {side} failed: {reason}")]
    Connection { side: TransferSide, reason: String },

    #[error("Schema introspection failed for {table}: {reason}")]
    SchemaIntrospection { table: String, reason: String },

    #[error("Transfer timed out: {scope} of {limit:?} elapsed")]
    Timeout { scope: TimeoutScope, limit: Duration },

    #[error("Transfer failed during {stage}: {reason}")]
    TransferFailed { stage: String, reason: String },

    #[error("Cleanup step '{step}' failed: {reason}")]
    Cleanup { step: String, reason: String },
}

impl TransferError {
    pub fn failed(stage: impl Into<String>, reason: impl Into<String>) -> Self {
        TransferError::TransferFailed {
            stage: stage.into(),
            reason: reason.into(),
        }
    }

    pub fn connection(side: TransferSide, reason: impl Into<String>) -> Self {
        TransferError::Connection {
            side,
            reason: reason.into(),
        }
    }

    pub fn cleanup(step: impl Into<String>, reason: impl Into<String>) -> Self {
        TransferError::Cleanup {
            step: step.into(),
            reason: reason.into(),
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, TransferError::Timeout { .. })
    }
}

pub type TransferResult<T> = std::result::Result<T, TransferError>;
