//! Server catalog commands: watchable listing, device parameters and
//! installed firmware descriptions.

use bytesize::ByteSize;
use serde::Serialize;
use tabled::Tabled;

use scrutiny_core::{
    Client, Datatype, DeviceInfo, EnumDefinition, MemoryRegion, SfdInfo, WatchableInfo,
    WatchableType,
};

use crate::cli::{GlobalOpts, ListArgs};
use crate::error::CliError;
use crate::output;

// ── Watchable list ──────────────────────────────────────────────────

#[derive(Serialize)]
struct ListedView {
    path: String,
    #[serde(rename = "type")]
    watchable_type: WatchableType,
    datatype: Datatype,
    #[serde(rename = "enum", skip_serializing_if = "Option::is_none")]
    enum_def: Option<EnumDefinition>,
}

impl From<&WatchableInfo> for ListedView {
    fn from(info: &WatchableInfo) -> Self {
        Self {
            path: info.path.to_string(),
            watchable_type: info.watchable_type(),
            datatype: info.datatype,
            enum_def: info.enum_def.clone(),
        }
    }
}

#[derive(Tabled)]
struct ListedRow {
    #[tabled(rename = "Path")]
    path: String,
    #[tabled(rename = "Type")]
    watchable_type: String,
    #[tabled(rename = "Datatype")]
    datatype: String,
    #[tabled(rename = "Enum")]
    enum_name: String,
}

impl From<&ListedView> for ListedRow {
    fn from(v: &ListedView) -> Self {
        Self {
            path: v.path.clone(),
            watchable_type: v.watchable_type.to_string(),
            datatype: v.datatype.to_string(),
            enum_name: v
                .enum_def
                .as_ref()
                .map_or_else(|| "-".into(), |e| e.name.clone()),
        }
    }
}

pub async fn handle_list(
    client: &Client,
    args: ListArgs,
    global: &GlobalOpts,
) -> Result<(), CliError> {
    let list = client.download_watchable_list(&args.filter()).await?;
    let views: Vec<ListedView> = list.entries().map(ListedView::from).collect();
    let out = output::render_list(
        &global.output,
        &views,
        |v| ListedRow::from(v),
        |v| v.path.clone(),
    );
    output::print_output(&out, global.quiet);
    Ok(())
}

// ── Device ──────────────────────────────────────────────────────────

#[derive(Serialize)]
struct DeviceView {
    available: bool,
    #[serde(flatten)]
    info: Option<DeviceInfo>,
}

fn regions(regions: &[MemoryRegion]) -> String {
    if regions.is_empty() {
        return "-".into();
    }
    regions
        .iter()
        .map(|r| format!("{:#x}-{:#x}", r.start, r.end()))
        .collect::<Vec<_>>()
        .join(", ")
}

fn device_detail(view: &DeviceView) -> String {
    let Some(d) = &view.info else {
        return output::render_detail(&[("Device", "none connected".into())]);
    };
    let features = &d.supported_features;
    let enabled: Vec<&str> = [
        ("memory write", features.memory_write),
        ("datalogging", features.datalogging),
        ("user command", features.user_command),
        ("64 bits", features.sixtyfour_bits),
    ]
    .into_iter()
    .filter_map(|(name, on)| on.then_some(name))
    .collect();

    output::render_detail(&[
        ("Device", d.display_name.clone()),
        ("Device ID", d.device_id.clone()),
        ("Session", d.session_id.clone()),
        ("Protocol", d.protocol_version()),
        ("Address size", format!("{} bits", d.address_size_bits)),
        ("Max TX payload", ByteSize::b(u64::from(d.max_tx_data_size)).to_string()),
        ("Max RX payload", ByteSize::b(u64::from(d.max_rx_data_size)).to_string()),
        (
            "Max bitrate",
            d.max_bitrate_bps
                .map_or_else(|| "unlimited".into(), |b| format!("{b} bps")),
        ),
        ("RX timeout", humantime::format_duration(d.rx_timeout).to_string()),
        (
            "Heartbeat timeout",
            humantime::format_duration(d.heartbeat_timeout).to_string(),
        ),
        ("Features", enabled.join(", ")),
        ("Forbidden regions", regions(&d.forbidden_memory_regions)),
        ("Read-only regions", regions(&d.readonly_memory_regions)),
    ])
}

pub async fn handle_device(client: &Client, global: &GlobalOpts) -> Result<(), CliError> {
    let info = client.get_device_info().await?;
    let view = DeviceView {
        available: info.is_some(),
        info,
    };
    let out = output::render_single(&global.output, &view, device_detail, |v| {
        v.info
            .as_ref()
            .map_or_else(|| "none".into(), |d| d.device_id.clone())
    });
    output::print_output(&out, global.quiet);
    Ok(())
}

// ── Firmware descriptions ───────────────────────────────────────────

#[derive(Serialize)]
struct SfdView {
    loaded: bool,
    #[serde(flatten)]
    info: SfdInfo,
}

#[derive(Tabled)]
struct SfdRow {
    #[tabled(rename = "Firmware ID")]
    firmware_id: String,
    #[tabled(rename = "Project")]
    project: String,
    #[tabled(rename = "Author")]
    author: String,
    #[tabled(rename = "Generated")]
    generated: String,
    #[tabled(rename = "Size")]
    size: String,
    #[tabled(rename = "Loaded")]
    loaded: String,
}

impl From<&SfdView> for SfdRow {
    fn from(v: &SfdView) -> Self {
        let meta = v.info.metadata.as_ref();
        let dash = || "-".to_owned();
        Self {
            firmware_id: v.info.firmware_id.clone(),
            project: v.info.display_name(),
            author: meta.and_then(|m| m.author.clone()).unwrap_or_else(dash),
            generated: meta
                .and_then(|m| m.generation_info.timestamp)
                .map_or_else(dash, |t| t.format("%Y-%m-%d %H:%M").to_string()),
            size: v.info.filesize.map_or_else(dash, |b| ByteSize::b(b).to_string()),
            loaded: if v.loaded { "yes".into() } else { String::new() },
        }
    }
}

pub async fn handle_sfd(client: &Client, global: &GlobalOpts) -> Result<(), CliError> {
    let (installed, loaded) =
        tokio::try_join!(client.get_installed_sfds(), client.get_loaded_sfd())?;
    let loaded_id = loaded.map(|sfd| sfd.firmware_id);
    let views: Vec<SfdView> = installed
        .into_values()
        .map(|info| SfdView {
            loaded: loaded_id.as_deref() == Some(info.firmware_id.as_str()),
            info,
        })
        .collect();
    let out = output::render_list(
        &global.output,
        &views,
        |v| SfdRow::from(v),
        |v| v.info.firmware_id.clone(),
    );
    output::print_output(&out, global.quiet);
    Ok(())
}
