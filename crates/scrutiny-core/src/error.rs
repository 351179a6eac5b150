// ── Core error types ──
//
// User-facing errors from scrutiny-core. Consumers never see socket or
// JSON failures directly: the `From<scrutiny_api::Error>` impl translates
// wire-layer errors into domain-appropriate variants.

use std::time::Duration;

use thiserror::Error;

use crate::model::{Datatype, ValueStatus};

/// Unified error type for the core crate.
#[derive(Debug, Error)]
pub enum CoreError {
    // ── Connection errors ────────────────────────────────────────────
    #[error("Cannot connect to server at {addr}: {reason}")]
    Connection { addr: String, reason: String },

    #[error("Timed out after {timeout:?} waiting for {operation}")]
    Timeout {
        operation: String,
        timeout: Duration,
    },

    #[error("Not connected to the server")]
    Disconnected,

    #[error("No server status received yet")]
    NoServerStatus,

    // ── Value access errors ──────────────────────────────────────────
    #[error("Value of {path} is unavailable: {status}")]
    InvalidValue { path: String, status: ValueStatus },

    #[error("{path} has datatype {datatype}, cannot read it as {expected}")]
    TypeMismatch {
        path: String,
        expected: &'static str,
        datatype: Datatype,
    },

    #[error("Invalid watchable path {path}: {reason}")]
    InvalidPath { path: String, reason: String },

    #[error("{path} is no longer watched")]
    Unwatched { path: String },

    // ── Write errors ─────────────────────────────────────────────────
    #[error("Write to {path} rejected: {reason}")]
    WriteRejected { path: String, reason: String },

    #[error("Batch write failed at entry {index} ({path}): {reason}")]
    BatchWrite {
        index: usize,
        path: String,
        reason: String,
    },

    /// The outcome is unknown: some entries may have been applied.
    #[error("Write of {count} value(s) not confirmed within {timeout:?}")]
    WriteTimeout { count: usize, timeout: Duration },

    // ── Server errors ────────────────────────────────────────────────
    #[error("Request rejected by server: {message}")]
    Rejected { message: String },

    #[error("Unexpected server response: {message}")]
    Protocol { message: String },

    #[error("Validation failed: {message}")]
    Validation { message: String },

    // ── Internal errors ──────────────────────────────────────────────
    #[error("Internal error: {0}")]
    Internal(String),
}

impl CoreError {
    /// Returns `true` if the error is caused by a lost or absent connection.
    pub fn is_disconnect(&self) -> bool {
        matches!(self, Self::Disconnected | Self::Connection { .. })
    }

    pub(crate) fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }
}

// ── Conversion from wire-layer errors ────────────────────────────────

impl From<scrutiny_api::Error> for CoreError {
    fn from(err: scrutiny_api::Error) -> Self {
        if err.is_disconnect() {
            return CoreError::Disconnected;
        }
        match err {
            scrutiny_api::Error::Connect { addr, source } => CoreError::Connection {
                addr,
                reason: source.to_string(),
            },
            scrutiny_api::Error::Timeout { addr, timeout } => CoreError::Timeout {
                operation: format!("connection to {addr}"),
                timeout,
            },
            scrutiny_api::Error::Closed => CoreError::Disconnected,
            scrutiny_api::Error::Io(e) => CoreError::Internal(format!("I/O error: {e}")),
            scrutiny_api::Error::FrameTooLarge { size, mtu } => CoreError::Validation {
                message: format!("request of {size} bytes exceeds the link MTU of {mtu} bytes"),
            },
            e @ (scrutiny_api::Error::IntegrityTag { .. }
            | scrutiny_api::Error::Decompress(_)
            | scrutiny_api::Error::Json(_)) => CoreError::protocol(e.to_string()),
        }
    }
}
