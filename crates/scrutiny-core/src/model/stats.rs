// ── Statistics ──

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Measured by this client.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct LocalStatistics {
    pub rx_bytes: u64,
    pub tx_bytes: u64,
    pub rx_messages: u64,
    pub tx_messages: u64,
    /// Bytes per second over the last one-second window.
    pub rx_data_rate: f64,
    pub tx_data_rate: f64,
    /// Messages per second over the last one-second window.
    pub rx_message_rate: f64,
    pub tx_message_rate: f64,
    pub last_request_latency: Option<Duration>,
    pub average_request_latency: Option<Duration>,
    pub connect_count: u64,
    /// Connections after the first one.
    pub reconnect_count: u64,
}

/// Reported by the server on request.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ServerStatistics {
    pub uptime: Duration,
    pub invalid_request_count: u64,
    pub unexpected_error_count: u64,
    pub client_count: u64,
    pub to_all_clients_datarate_byte_per_sec: f64,
    pub from_any_client_datarate_byte_per_sec: f64,
    pub msg_received: u64,
    pub msg_sent: u64,
    pub device_session_count: u64,
    pub to_device_datarate_byte_per_sec: f64,
    pub from_device_datarate_byte_per_sec: f64,
    pub device_request_per_sec: f64,
}

/// Number of watchables the server can serve, per category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct WatchableCount {
    pub alias: u64,
    pub var: u64,
    pub rpv: u64,
}

impl WatchableCount {
    pub fn total(&self) -> u64 {
        self.alias + self.var + self.rpv
    }
}
