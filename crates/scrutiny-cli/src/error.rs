//! CLI error types with miette diagnostics.
//!
//! Maps `CoreError` and `ConfigError` into user-facing errors with
//! actionable help text and a stable exit code.

use miette::Diagnostic;
use thiserror::Error;

use scrutiny_config::ConfigError;
use scrutiny_core::CoreError;

pub mod exit_code {
    pub const GENERAL: i32 = 1;
    pub const USAGE: i32 = 2;
    pub const NOT_FOUND: i32 = 4;
    pub const CONNECTION: i32 = 7;
    pub const TIMEOUT: i32 = 8;
}

#[derive(Debug, Error, Diagnostic)]
pub enum CliError {
    // ── Connection ───────────────────────────────────────────────────

    #[error("Could not connect to the Scrutiny server at {addr}")]
    #[diagnostic(
        code(scrutiny::connection_failed),
        help(
            "Check that the server is running and reachable.\n\
             Reason: {reason}\n\
             Try: scrutiny --host <HOST> --port <PORT> status"
        )
    )]
    ConnectionFailed { addr: String, reason: String },

    #[error("Connection to the server was lost")]
    #[diagnostic(code(scrutiny::disconnected))]
    Disconnected,

    // ── Timeout ──────────────────────────────────────────────────────

    #[error("Timed out after {timeout} waiting for {operation}")]
    #[diagnostic(
        code(scrutiny::timeout),
        help("Increase the timeout with --timeout or check that the device is responding.")
    )]
    Timeout { operation: String, timeout: String },

    // ── Watchables ───────────────────────────────────────────────────

    #[error("Watchable {path} not found")]
    #[diagnostic(
        code(scrutiny::not_found),
        help("{reason}\nPaths start with /alias/, /var/ or /rpv/.")
    )]
    NotFound { path: String, reason: String },

    #[error("{path} has no readable value: {reason}")]
    #[diagnostic(code(scrutiny::value_unavailable))]
    ValueUnavailable { path: String, reason: String },

    #[error("Write failed: {message}")]
    #[diagnostic(code(scrutiny::write_failed))]
    WriteFailed { message: String },

    // ── Server ───────────────────────────────────────────────────────

    #[error("Server error: {message}")]
    #[diagnostic(code(scrutiny::server_error))]
    Server { message: String },

    // ── Validation ───────────────────────────────────────────────────

    #[error("Invalid value for {field}: {reason}")]
    #[diagnostic(code(scrutiny::validation))]
    Validation { field: String, reason: String },

    // ── Configuration ────────────────────────────────────────────────

    #[error("Profile '{name}' not found in configuration")]
    #[diagnostic(
        code(scrutiny::profile_not_found),
        help(
            "Available profiles: {available}\n\
             Create one with: scrutiny config init --name {name}"
        )
    )]
    ProfileNotFound { name: String, available: String },

    #[error("Profile '{profile}' has no device link")]
    #[diagnostic(
        code(scrutiny::no_device_link),
        help("Add a [profiles.{profile}.device_link] table, or use: scrutiny link set '<JSON>'")
    )]
    NoDeviceLink { profile: String },

    #[error("Config file already exists at {path}")]
    #[diagnostic(code(scrutiny::config_exists), help("Pass --force to overwrite it."))]
    ConfigExists { path: String },

    #[error(transparent)]
    #[diagnostic(code(scrutiny::config))]
    Config(Box<ConfigError>),

    // ── IO / Serialization ────────────────────────────────────────────

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    #[diagnostic(code(scrutiny::internal))]
    Internal(String),
}

impl From<ConfigError> for CliError {
    fn from(err: ConfigError) -> Self {
        match err {
            ConfigError::Validation { field, reason } => Self::Validation { field, reason },
            other => Self::Config(Box::new(other)),
        }
    }
}

impl CliError {
    /// Map this error to an exit code for process termination.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::ConnectionFailed { .. } | Self::Disconnected => exit_code::CONNECTION,
            Self::Timeout { .. } => exit_code::TIMEOUT,
            Self::NotFound { .. } | Self::ProfileNotFound { .. } => exit_code::NOT_FOUND,
            Self::Validation { .. } | Self::NoDeviceLink { .. } | Self::ConfigExists { .. } => {
                exit_code::USAGE
            }
            _ => exit_code::GENERAL,
        }
    }
}

// ── CoreError → CliError mapping ─────────────────────────────────────

impl From<CoreError> for CliError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::Connection { addr, reason } => CliError::ConnectionFailed { addr, reason },

            CoreError::Disconnected => CliError::Disconnected,

            CoreError::Timeout { operation, timeout } => CliError::Timeout {
                operation,
                timeout: humantime::format_duration(timeout).to_string(),
            },

            CoreError::WriteTimeout { count, timeout } => CliError::Timeout {
                operation: format!("the device to confirm {count} write(s)"),
                timeout: humantime::format_duration(timeout).to_string(),
            },

            CoreError::InvalidPath { path, reason } => CliError::NotFound { path, reason },

            CoreError::InvalidValue { path, status } => CliError::ValueUnavailable {
                path,
                reason: status.to_string(),
            },

            err @ (CoreError::TypeMismatch { .. } | CoreError::Validation { .. }) => {
                CliError::Validation {
                    field: "value".into(),
                    reason: err.to_string(),
                }
            }

            err @ (CoreError::WriteRejected { .. }
            | CoreError::BatchWrite { .. }
            | CoreError::Unwatched { .. }) => CliError::WriteFailed {
                message: err.to_string(),
            },

            CoreError::Rejected { message } => CliError::Server { message },

            err @ CoreError::Protocol { .. } => CliError::Server {
                message: err.to_string(),
            },

            CoreError::NoServerStatus => CliError::Server {
                message: "the server has not reported its status".into(),
            },

            CoreError::Internal(message) => CliError::Internal(message),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn exit_codes_follow_error_kind() {
        let refused = CliError::from(CoreError::Connection {
            addr: "localhost:8765".into(),
            reason: "refused".into(),
        });
        assert_eq!(refused.exit_code(), exit_code::CONNECTION);

        let slow = CliError::from(CoreError::WriteTimeout {
            count: 2,
            timeout: Duration::from_secs(5),
        });
        assert_eq!(slow.exit_code(), exit_code::TIMEOUT);
        assert!(slow.to_string().contains("5s"));

        let missing = CliError::from(CoreError::InvalidPath {
            path: "/alias/nope".into(),
            reason: "unknown watchable".into(),
        });
        assert_eq!(missing.exit_code(), exit_code::NOT_FOUND);

        let rejected = CliError::from(CoreError::Rejected {
            message: "busy".into(),
        });
        assert_eq!(rejected.exit_code(), exit_code::GENERAL);
    }
}
