// ── Runtime connection configuration ──
//
// Describes *how* to reach a Scrutiny server and how long to wait for it.
// Never touches disk: the CLI (via scrutiny-config) builds a `ClientConfig`
// and hands it in.

use std::time::Duration;

use scrutiny_api::TransportConfig;

pub const DEFAULT_PORT: u16 = 8765;

/// Configuration for one server connection.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Server host name or address.
    pub host: String,
    pub port: u16,
    /// Socket kind, connect timeout and framing options.
    pub transport: TransportConfig,
    /// Bound on every request/response exchange.
    pub request_timeout: Duration,
    /// Bound on a direct write or a batch without its own timeout.
    pub write_timeout: Duration,
    /// How often to ask the server for a status broadcast.
    pub status_poll_interval: Duration,
    /// Block `connect()` until the first status broadcast arrives.
    pub wait_status_on_connect: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: "localhost".into(),
            port: DEFAULT_PORT,
            transport: TransportConfig::default(),
            request_timeout: Duration::from_secs(4),
            write_timeout: Duration::from_secs(5),
            status_poll_interval: Duration::from_secs(2),
            wait_status_on_connect: true,
        }
    }
}

impl ClientConfig {
    pub fn address(&self) -> String {
        socket_address(&self.host, self.port)
    }
}

/// `host:port`, bracketing bare IPv6 literals.
pub(crate) fn socket_address(host: &str, port: u16) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}
