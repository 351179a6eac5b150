// ── Client events ──

use serde::Serialize;

/// Lifecycle notifications broadcast by a [`Client`](crate::Client).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ClientEvent {
    Connected { host: String, port: u16 },
    Disconnected,
    StatusUpdated,
    DeviceReady { session_id: String },
    DeviceGone { session_id: String },
    SfdLoaded { firmware_id: String },
    SfdUnloaded { firmware_id: String },
}
