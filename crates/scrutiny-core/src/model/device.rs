// ── Device information ──

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::status::SupportedFeatureMap;

/// What the server learned about the device during its handshake.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub session_id: String,
    pub device_id: String,
    pub display_name: String,
    pub max_tx_data_size: u32,
    pub max_rx_data_size: u32,
    /// `None` when the device sets no limit.
    pub max_bitrate_bps: Option<u64>,
    pub rx_timeout: Duration,
    pub heartbeat_timeout: Duration,
    pub address_size_bits: u32,
    pub protocol_major: u32,
    pub protocol_minor: u32,
    pub supported_features: SupportedFeatureMap,
    pub forbidden_memory_regions: Vec<MemoryRegion>,
    pub readonly_memory_regions: Vec<MemoryRegion>,
}

impl DeviceInfo {
    pub fn protocol_version(&self) -> String {
        format!("{}.{}", self.protocol_major, self.protocol_minor)
    }
}

/// A contiguous address range on the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryRegion {
    pub start: u64,
    pub size: u64,
}

impl MemoryRegion {
    /// Last address inside the region.
    pub fn end(&self) -> u64 {
        self.start + self.size.saturating_sub(1)
    }

    pub fn contains(&self, address: u64) -> bool {
        address >= self.start && address <= self.end()
    }
}
