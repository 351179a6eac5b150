// ── Wire → domain conversions ──
//
// Maps scrutiny-api protocol payloads into the model types. Unknown enum
// strings degrade to a sensible default for status fields, but are errors
// for watchable definitions since a handle cannot work without them.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use scrutiny_api::protocol::{
    self, DeviceInfoMessage, MemoryRegionMessage, ServerStatsMessage, ServerStatusMessage,
    SfdInfoMessage, SfdMetadataMessage, WatchableDefinition, WatchableListContent,
};
use tracing::debug;

use crate::error::CoreError;
use crate::model::{
    DataloggingState, DataloggingStatus, DeviceCommStatus, DeviceInfo, DeviceLinkConfig,
    DeviceLinkInfo, EnumDefinition, MemoryRegion, ServerStatistics, ServerStatus,
    SfdGenerationInfo, SfdInfo, SfdMetadata, SupportedFeatureMap, WatchableConfiguration,
    WatchableCount, WatchableInfo, WatchableList, WatchablePath, WatchableType,
};

const KNOWN_FEATURES: [&str; 4] = ["memory_write", "datalogging", "user_command", "_64bits"];

pub(crate) fn server_status(msg: ServerStatusMessage, received_at: DateTime<Utc>) -> ServerStatus {
    let device_status = msg.device_status.parse().unwrap_or_else(|_| {
        debug!(status = %msg.device_status, "unknown device status");
        DeviceCommStatus::Unknown
    });
    let datalogging_state = msg
        .datalogging_status
        .datalogging_state
        .parse()
        .unwrap_or(DataloggingState::Unavailable);

    let link = msg.device_comm_link;
    let device_link = DeviceLinkInfo {
        config: DeviceLinkConfig::from_wire(&link.link_type, &link.link_config),
        link_type: link.link_type,
        operational: link.link_operational,
        demo_mode: link.demo_mode,
    };

    let (supported_features, extra_features) = match msg.supported_features {
        Some(map) => {
            let extra: BTreeMap<String, bool> = map
                .iter()
                .filter(|(k, _)| !KNOWN_FEATURES.contains(&k.as_str()))
                .map(|(k, v)| (k.clone(), *v))
                .collect();
            (Some(SupportedFeatureMap::from_wire(&map)), extra)
        }
        None => (None, BTreeMap::new()),
    };

    ServerStatus {
        device_status,
        device_session_id: msg.device_session_id,
        loaded_sfd_firmware_id: msg.loaded_sfd_firmware_id,
        datalogging: DataloggingStatus {
            state: datalogging_state,
            completion_ratio: msg.datalogging_status.completion_ratio,
        },
        device_link,
        supported_features,
        extra_features,
        received_at,
    }
}

pub(crate) fn watchable_configuration(
    def: &WatchableDefinition,
) -> Result<WatchableConfiguration, CoreError> {
    let datatype = def
        .dtype
        .parse()
        .map_err(|_| CoreError::protocol(format!("unknown datatype '{}'", def.dtype)))?;
    let watchable_type = def.watchable_type.parse().map_err(|_| {
        CoreError::protocol(format!("unknown watchable type '{}'", def.watchable_type))
    })?;

    Ok(WatchableConfiguration {
        server_id: def.id.clone(),
        watchable_type,
        datatype,
        enum_def: def.enum_def.as_ref().map(enum_definition),
    })
}

fn enum_definition(def: &protocol::EnumDefinition) -> EnumDefinition {
    EnumDefinition {
        name: def.name.clone(),
        values: def.values.iter().map(|(k, v)| (k.clone(), *v)).collect(),
    }
}

pub(crate) fn server_statistics(msg: &ServerStatsMessage) -> ServerStatistics {
    ServerStatistics {
        uptime: Duration::try_from_secs_f64(msg.uptime).unwrap_or_default(),
        invalid_request_count: msg.invalid_request_count,
        unexpected_error_count: msg.unexpected_error_count,
        client_count: msg.client_count,
        to_all_clients_datarate_byte_per_sec: msg.to_all_clients_datarate_byte_per_sec,
        from_any_client_datarate_byte_per_sec: msg.from_any_client_datarate_byte_per_sec,
        msg_received: msg.msg_received,
        msg_sent: msg.msg_sent,
        device_session_count: msg.device_session_count,
        to_device_datarate_byte_per_sec: msg.to_device_datarate_byte_per_sec,
        from_device_datarate_byte_per_sec: msg.from_device_datarate_byte_per_sec,
        device_request_per_sec: msg.device_request_per_sec,
    }
}

pub(crate) fn watchable_count(qty: protocol::WatchableCount) -> WatchableCount {
    WatchableCount {
        alias: qty.alias,
        var: qty.var,
        rpv: qty.rpv,
    }
}

/// Append one `get_watchable_list` segment to `list`.
pub(crate) fn watchable_list_segment(
    content: WatchableListContent,
    list: &mut WatchableList,
) -> Result<(), CoreError> {
    let groups = [
        (WatchableType::RuntimePublishedValue, content.rpv),
        (WatchableType::Alias, content.alias),
        (WatchableType::Variable, content.var),
    ];
    for (expected, entries) in groups {
        for entry in entries {
            let path = WatchablePath::parse(&entry.path).map_err(|_| {
                CoreError::protocol(format!("server listed an invalid path '{}'", entry.path))
            })?;
            if path.watchable_type() != expected {
                return Err(CoreError::protocol(format!(
                    "server listed {path} among the {expected} entries"
                )));
            }
            let datatype = entry.dtype.parse().map_err(|_| {
                CoreError::protocol(format!("unknown datatype '{}' for {path}", entry.dtype))
            })?;
            list.push(WatchableInfo {
                path,
                datatype,
                enum_def: entry.enum_def.as_ref().map(enum_definition),
            });
        }
    }
    Ok(())
}

pub(crate) fn sfd_info(msg: SfdInfoMessage) -> Result<SfdInfo, CoreError> {
    let filesize = match msg.filesize {
        None => None,
        Some(_) if msg.firmware_id.is_empty() => {
            return Err(CoreError::protocol("firmware description without a firmware id"));
        }
        Some(size) => Some(u64::try_from(size).map_err(|_| {
            CoreError::protocol(format!(
                "firmware description {} has an invalid size {size}",
                msg.firmware_id
            ))
        })?),
    };
    Ok(SfdInfo {
        firmware_id: msg.firmware_id,
        metadata: msg.metadata.map(sfd_metadata),
        filesize,
    })
}

fn sfd_metadata(msg: SfdMetadataMessage) -> SfdMetadata {
    let generation = msg.generation_info.unwrap_or_default();
    SfdMetadata {
        project_name: msg.project_name,
        author: msg.author,
        version: msg.version,
        generation_info: SfdGenerationInfo {
            timestamp: generation
                .time
                .and_then(|secs| Utc.timestamp_opt(secs, 0).single()),
            python_version: generation.python_version,
            scrutiny_version: generation.scrutiny_version,
            system_type: generation.system_type,
        },
    }
}

pub(crate) fn device_info(msg: DeviceInfoMessage) -> Result<DeviceInfo, CoreError> {
    let forbidden_memory_regions = memory_regions(&msg.forbidden_memory_regions, "forbidden")?;
    let readonly_memory_regions = memory_regions(&msg.readonly_memory_regions, "read-only")?;
    Ok(DeviceInfo {
        supported_features: SupportedFeatureMap::from_wire(&msg.supported_feature_map),
        session_id: msg.session_id,
        device_id: msg.device_id,
        display_name: msg.display_name,
        max_tx_data_size: msg.max_tx_data_size,
        max_rx_data_size: msg.max_rx_data_size,
        max_bitrate_bps: msg.max_bitrate_bps,
        rx_timeout: Duration::from_micros(msg.rx_timeout_us),
        heartbeat_timeout: Duration::from_micros(msg.heartbeat_timeout_us),
        address_size_bits: msg.address_size_bits,
        protocol_major: msg.protocol_major,
        protocol_minor: msg.protocol_minor,
        forbidden_memory_regions,
        readonly_memory_regions,
    })
}

/// Wire regions carry an inclusive end address.
fn memory_regions(
    regions: &[MemoryRegionMessage],
    kind: &str,
) -> Result<Vec<MemoryRegion>, CoreError> {
    regions
        .iter()
        .map(|r| {
            if r.end <= r.start {
                return Err(CoreError::protocol(format!(
                    "{kind} memory region {:#x}-{:#x} ends before it starts",
                    r.start, r.end
                )));
            }
            Ok(MemoryRegion {
                start: r.start,
                size: r.end - r.start + 1,
            })
        })
        .collect()
}

/// Server time (microseconds after `zero`, itself Unix seconds) to UTC.
#[allow(clippy::cast_possible_truncation, clippy::as_conversions)]
pub(crate) fn server_time(zero: Option<f64>, offset_us: f64) -> DateTime<Utc> {
    let Some(zero) = zero else {
        return Utc::now();
    };
    let micros = (zero * 1e6 + offset_us).round() as i64;
    Utc.timestamp_micros(micros).single().unwrap_or_else(Utc::now)
}
