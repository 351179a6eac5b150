use std::time::Duration;

use thiserror::Error;

/// Top-level error type for the `scrutiny-api` crate.
///
/// Covers the wire layer only: opening links, moving bytes, framing, and
/// JSON decoding. `scrutiny-core` maps these into user-facing errors.
#[derive(Debug, Error)]
pub enum Error {
    // ── Link ────────────────────────────────────────────────────────
    /// The link could not be established (refused, unreachable, bad address).
    #[error("Cannot open link to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// Opening the link did not complete in time.
    #[error("Link to {addr} timed out after {timeout:?}")]
    Timeout { addr: String, timeout: Duration },

    /// The link was closed, locally or by the peer.
    #[error("Link closed")]
    Closed,

    /// Socket I/O error on an established link.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // ── Framing ─────────────────────────────────────────────────────
    /// An outgoing payload does not fit in the configured MTU.
    #[error("Datagram of {size} bytes exceeds the MTU ({mtu} bytes)")]
    FrameTooLarge { size: usize, mtu: usize },

    /// A datagram's integrity tag does not match its payload.
    #[error("Integrity tag mismatch on {size}-byte datagram")]
    IntegrityTag { size: usize },

    /// A compressed payload could not be inflated.
    #[error("Failed to decompress datagram: {0}")]
    Decompress(String),

    // ── Data ────────────────────────────────────────────────────────
    /// JSON encoding or decoding failed.
    #[error("Invalid JSON message: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Returns `true` if the error means the link is no longer usable.
    pub fn is_disconnect(&self) -> bool {
        match self {
            Self::Closed => true,
            Self::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::UnexpectedEof
            ),
            _ => false,
        }
    }
}
