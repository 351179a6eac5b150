//! JSON messages exchanged with a Scrutiny server.
//!
//! Every message is a JSON object with a `cmd` discriminator. Requests carry
//! a client-chosen `reqid` that the server echoes in its response; pushed
//! messages (`welcome`, `inform_server_status`, `watchable_update`,
//! `inform_write_completion`) carry a null or absent `reqid`.
//!
//! Enumerated fields (`dtype`, `type`, `device_status`, ...) are kept as
//! strings here. `scrutiny-core` maps them to its domain types.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Error;

// ── Client → server ──────────────────────────────────────────────────

/// A request envelope: `reqid` plus the command body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub reqid: u32,
    #[serde(flatten)]
    pub body: ClientMessage,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum ClientMessage {
    GetServerStatus,
    GetServerStats,
    GetWatchableCount,
    GetWatchableList {
        max_per_response: u32,
        filter: WatchableListFilter,
    },
    GetInstalledSfd,
    GetLoadedSfd,
    GetDeviceInfo,
    SubscribeWatchable { watchables: Vec<String> },
    UnsubscribeWatchable { watchables: Vec<String> },
    WriteWatchable { updates: Vec<UpdateRecord> },
    SetLinkConfig {
        link_type: String,
        link_config: Value,
    },
}

impl ClientMessage {
    /// The `cmd` string sent for this message.
    pub fn cmd(&self) -> &'static str {
        match self {
            Self::GetServerStatus => "get_server_status",
            Self::GetServerStats => "get_server_stats",
            Self::GetWatchableCount => "get_watchable_count",
            Self::GetWatchableList { .. } => "get_watchable_list",
            Self::GetInstalledSfd => "get_installed_sfd",
            Self::GetLoadedSfd => "get_loaded_sfd",
            Self::GetDeviceInfo => "get_device_info",
            Self::SubscribeWatchable { .. } => "subscribe_watchable",
            Self::UnsubscribeWatchable { .. } => "unsubscribe_watchable",
            Self::WriteWatchable { .. } => "write_watchable",
            Self::SetLinkConfig { .. } => "set_link_config",
        }
    }
}

/// Restricts a `get_watchable_list` request. Empty lists match everything.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct WatchableListFilter {
    /// `alias`, `var` or `rpv`.
    #[serde(rename = "type", default)]
    pub types: Vec<String>,
    /// Glob patterns matched against the display path.
    #[serde(rename = "name", default, skip_serializing_if = "Vec::is_empty")]
    pub names: Vec<String>,
}

/// One entry of a `write_watchable` request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateRecord {
    /// Position in the batch, echoed back in the completion.
    pub batch_index: u32,
    /// Server id of the target watchable.
    pub watchable: String,
    pub value: WireValue,
}

/// A scalar as it appears on the wire.
///
/// Strings are only sent by clients: `"true"`, `"false"`, or an arithmetic
/// expression the server evaluates (see [`crate::expr`]).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WireValue {
    Bool(bool),
    Int(i64),
    Uint(u64),
    Float(f64),
    Str(String),
}

// ── Server → client ──────────────────────────────────────────────────

/// A server message: optional `reqid` echo plus the command body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerMessage {
    #[serde(default)]
    pub reqid: Option<u32>,
    #[serde(flatten)]
    pub body: ServerBody,
}

impl ServerMessage {
    pub fn parse(payload: &[u8]) -> Result<Self, Error> {
        Ok(serde_json::from_slice(payload)?)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "cmd")]
pub enum ServerBody {
    #[serde(rename = "welcome")]
    Welcome { server_time_zero_timestamp: f64 },

    #[serde(rename = "inform_server_status")]
    ServerStatus(ServerStatusMessage),

    #[serde(rename = "response_subscribe_watchable")]
    SubscribeWatchable {
        subscribed: HashMap<String, WatchableDefinition>,
    },

    #[serde(rename = "response_unsubscribe_watchable")]
    UnsubscribeWatchable { unsubscribed: Vec<String> },

    #[serde(rename = "watchable_update")]
    WatchableUpdate { updates: Vec<WatchableUpdateRecord> },

    #[serde(rename = "response_write_watchable")]
    WriteWatchable { count: u32, request_token: String },

    #[serde(rename = "inform_write_completion")]
    WriteCompletion(WriteCompletion),

    #[serde(rename = "response_set_link_config")]
    SetLinkConfig,

    #[serde(rename = "response_get_server_stats")]
    ServerStats(ServerStatsMessage),

    #[serde(rename = "response_get_watchable_count")]
    WatchableCount { qty: WatchableCount },

    /// One segment of the list. The last one has `done` set.
    #[serde(rename = "response_get_watchable_list")]
    WatchableList(WatchableListMessage),

    #[serde(rename = "response_get_installed_sfd")]
    InstalledSfd { sfd_list: Vec<SfdInfoMessage> },

    #[serde(rename = "response_get_loaded_sfd")]
    LoadedSfd {
        #[serde(default)]
        sfd: Option<SfdInfoMessage>,
    },

    #[serde(rename = "response_get_device_info")]
    DeviceInfo {
        available: bool,
        #[serde(default)]
        device_info: Option<DeviceInfoMessage>,
    },

    #[serde(rename = "error")]
    Error {
        #[serde(default)]
        request_cmd: String,
        msg: String,
    },

    /// Any command this client does not handle.
    #[serde(other)]
    Other,
}

// ── Payload types ────────────────────────────────────────────────────

/// `inform_server_status`, pushed periodically and on request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerStatusMessage {
    /// `unknown`, `disconnected`, `connecting`, `connected` or `connected_ready`.
    pub device_status: String,
    pub device_session_id: Option<String>,
    pub loaded_sfd_firmware_id: Option<String>,
    pub datalogging_status: DataloggingStatusMessage,
    pub device_comm_link: DeviceCommLink,
    /// Features reported by the device, keyed by feature name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub supported_features: Option<HashMap<String, bool>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataloggingStatusMessage {
    pub datalogging_state: String,
    pub completion_ratio: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceCommLink {
    pub link_type: String,
    pub link_config: Value,
    pub link_operational: bool,
    #[serde(default)]
    pub demo_mode: bool,
}

/// Definition of a subscribed watchable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WatchableDefinition {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    pub dtype: String,
    #[serde(rename = "type")]
    pub watchable_type: String,
    #[serde(rename = "enum", default, skip_serializing_if = "Option::is_none")]
    pub enum_def: Option<EnumDefinition>,
}

/// A named enum: value name to integer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnumDefinition {
    pub name: String,
    pub values: HashMap<String, i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WatchableUpdateRecord {
    pub id: String,
    /// Server time of the change, microseconds since the welcome timestamp.
    pub t: f64,
    pub v: WireValue,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WriteCompletion {
    pub request_token: String,
    pub batch_index: u32,
    pub watchable: String,
    pub success: bool,
    pub completion_server_time_us: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct WatchableCount {
    pub alias: u64,
    pub var: u64,
    pub rpv: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WatchableListMessage {
    pub qty: WatchableCount,
    pub content: WatchableListContent,
    pub done: bool,
}

/// Entries of one list segment by type. Variable factories are not listed.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct WatchableListContent {
    #[serde(default)]
    pub rpv: Vec<WatchableListEntry>,
    #[serde(default)]
    pub alias: Vec<WatchableListEntry>,
    #[serde(default)]
    pub var: Vec<WatchableListEntry>,
}

/// A listed watchable. The type is given by the list it appears in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WatchableListEntry {
    pub path: String,
    pub dtype: String,
    #[serde(rename = "enum", default, skip_serializing_if = "Option::is_none")]
    pub enum_def: Option<EnumDefinition>,
}

/// A firmware description installed on the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SfdInfoMessage {
    pub firmware_id: String,
    #[serde(default)]
    pub metadata: Option<SfdMetadataMessage>,
    /// Signed so that a negative size reaches validation.
    #[serde(default)]
    pub filesize: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SfdMetadataMessage {
    #[serde(default)]
    pub project_name: Option<String>,
    #[serde(default)]
    pub author: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub generation_info: Option<SfdGenerationInfoMessage>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SfdGenerationInfoMessage {
    /// Unix seconds.
    #[serde(default)]
    pub time: Option<i64>,
    #[serde(default)]
    pub python_version: Option<String>,
    #[serde(default)]
    pub scrutiny_version: Option<String>,
    #[serde(default)]
    pub system_type: Option<String>,
}

/// Device parameters learned during the server's handshake with it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceInfoMessage {
    pub session_id: String,
    pub device_id: String,
    pub display_name: String,
    pub max_tx_data_size: u32,
    pub max_rx_data_size: u32,
    #[serde(default)]
    pub max_bitrate_bps: Option<u64>,
    pub rx_timeout_us: u64,
    pub heartbeat_timeout_us: u64,
    pub address_size_bits: u32,
    pub protocol_major: u32,
    pub protocol_minor: u32,
    pub supported_feature_map: HashMap<String, bool>,
    #[serde(default)]
    pub forbidden_memory_regions: Vec<MemoryRegionMessage>,
    #[serde(default)]
    pub readonly_memory_regions: Vec<MemoryRegionMessage>,
}

/// Inclusive address range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryRegionMessage {
    pub start: u64,
    pub end: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerStatsMessage {
    pub uptime: f64,
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

// ── Tests ────────────────────────────────────────────────────────────
