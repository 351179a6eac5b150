// ── Server status and connection state ──

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use super::link::DeviceLinkConfig;

/// Device status as reported by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, Display, EnumString)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum DeviceCommStatus {
    #[default]
    Unknown,
    Disconnected,
    Connecting,
    Connected,
    ConnectedReady,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, Display, EnumString)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum DataloggingState {
    #[default]
    Unavailable,
    Standby,
    WaitingForTrigger,
    Acquiring,
    Downloading,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct DataloggingStatus {
    pub state: DataloggingState,
    /// 0.0 to 1.0 while acquiring or downloading.
    pub completion_ratio: Option<f64>,
}

/// Link between the server and the device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceLinkInfo {
    /// `None` when the server reports a link type this client does not know.
    pub config: Option<DeviceLinkConfig>,
    pub link_type: String,
    pub operational: bool,
    pub demo_mode: bool,
}

/// Features the connected device advertises.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SupportedFeatureMap {
    pub memory_write: bool,
    pub datalogging: bool,
    pub user_command: bool,
    pub sixtyfour_bits: bool,
}

impl SupportedFeatureMap {
    pub(crate) fn from_wire(map: &std::collections::HashMap<String, bool>) -> Self {
        let get = |key: &str| map.get(key).copied().unwrap_or(false);
        Self {
            memory_write: get("memory_write"),
            datalogging: get("datalogging"),
            user_command: get("user_command"),
            sixtyfour_bits: get("_64bits"),
        }
    }
}

/// One status broadcast. Replaced as a whole on every broadcast.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerStatus {
    pub device_status: DeviceCommStatus,
    pub device_session_id: Option<String>,
    pub loaded_sfd_firmware_id: Option<String>,
    pub datalogging: DataloggingStatus,
    pub device_link: DeviceLinkInfo,
    /// Present only while a device session is open.
    pub supported_features: Option<SupportedFeatureMap>,
    /// Extra server-specific feature flags not mapped above.
    pub extra_features: BTreeMap<String, bool>,
    pub received_at: DateTime<Utc>,
}

impl ServerStatus {
    pub fn device_link_state(&self) -> DeviceLinkState {
        DeviceLinkState::from(self.device_status)
    }
}

// ── Connection state machine ─────────────────────────────────────────

/// Device side of a live server connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
pub enum DeviceLinkState {
    #[strum(serialize = "no device")]
    NoDevice,
    #[strum(serialize = "handshaking")]
    Handshaking,
    #[strum(serialize = "ready")]
    Ready,
}

impl From<DeviceCommStatus> for DeviceLinkState {
    fn from(status: DeviceCommStatus) -> Self {
        match status {
            DeviceCommStatus::Unknown | DeviceCommStatus::Disconnected => Self::NoDevice,
            DeviceCommStatus::Connecting | DeviceCommStatus::Connected => Self::Handshaking,
            DeviceCommStatus::ConnectedReady => Self::Ready,
        }
    }
}

/// Connection state observable by consumers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected(DeviceLinkState),
    /// The link failed. Left only by `connect()` or `disconnect()`.
    Error { reason: String },
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected(_))
    }

    pub fn is_device_ready(&self) -> bool {
        matches!(self, Self::Connected(DeviceLinkState::Ready))
    }
}
