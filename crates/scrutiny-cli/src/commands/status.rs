//! Server status command.

use std::sync::Arc;

use serde::Serialize;

use scrutiny_core::{Client, ConnectionState, DeviceLinkState, ServerStatus};

use crate::cli::{GlobalOpts, StatusArgs};
use crate::error::CliError;
use crate::output::{self, Tone};

// ── View ────────────────────────────────────────────────────────────

#[derive(Serialize)]
struct StatusView {
    server: String,
    state: String,
    #[serde(flatten)]
    status: ServerStatus,
}

pub(crate) fn state_label(state: &ConnectionState) -> (String, Tone) {
    match state {
        ConnectionState::Disconnected => ("disconnected".into(), Tone::Bad),
        ConnectionState::Connecting => ("connecting".into(), Tone::Pending),
        ConnectionState::Connected(DeviceLinkState::Ready) => ("device ready".into(), Tone::Good),
        ConnectionState::Connected(link) => (format!("connected, {link}"), Tone::Pending),
        ConnectionState::Error { reason } => (format!("error: {reason}"), Tone::Bad),
    }
}

fn detail(view: &StatusView, color: bool) -> String {
    let s = &view.status;
    let (state, tone) = state_label(&ConnectionState::Connected(s.device_link_state()));
    let link = &s.device_link;
    let link_label = if link.operational {
        output::paint(&link.link_type, Tone::Good, color)
    } else {
        output::paint(&format!("{} (down)", link.link_type), Tone::Bad, color)
    };

    let mut pairs = vec![
        ("Server", view.server.clone()),
        ("State", output::paint(&state, tone, color)),
        ("Device", s.device_status.to_string()),
        ("Session", s.device_session_id.clone().unwrap_or_else(|| "-".into())),
        (
            "Firmware description",
            s.loaded_sfd_firmware_id.clone().unwrap_or_else(|| "-".into()),
        ),
        ("Device link", link_label),
    ];
    if link.demo_mode {
        pairs.push(("Demo mode", "yes".into()));
    }
    let logging = match s.datalogging.completion_ratio {
        Some(ratio) => format!("{} ({:.0}%)", s.datalogging.state, ratio * 100.0),
        None => s.datalogging.state.to_string(),
    };
    pairs.push(("Datalogging", logging));
    if let Some(features) = &s.supported_features {
        let enabled: Vec<&str> = [
            ("memory write", features.memory_write),
            ("datalogging", features.datalogging),
            ("user command", features.user_command),
            ("64 bits", features.sixtyfour_bits),
        ]
        .into_iter()
        .filter_map(|(name, on)| on.then_some(name))
        .collect();
        pairs.push(("Features", enabled.join(", ")));
    }
    pairs.push((
        "Received",
        s.received_at.format("%Y-%m-%d %H:%M:%S%.3f UTC").to_string(),
    ));
    output::render_detail(&pairs)
}

/// Last status broadcast, asking the server for one if none arrived yet.
pub(crate) async fn latest(client: &Client) -> Result<Arc<ServerStatus>, CliError> {
    if let Ok(status) = client.get_latest_server_status() {
        return Ok(status);
    }
    // Subscribe before asking so the broadcast can't be missed.
    let (status, sent) = tokio::join!(
        client.wait_server_status_update(client.config().request_timeout),
        async { client.request_server_status_update() },
    );
    sent?;
    Ok(status?)
}

// ── Handler ─────────────────────────────────────────────────────────

pub async fn handle(
    client: &Client,
    args: StatusArgs,
    global: &GlobalOpts,
) -> Result<(), CliError> {
    if let Some(timeout) = args.wait_device {
        client.wait_device_ready(timeout).await?;
    }

    let status = latest(client).await?;
    let state = client.connection_state().borrow().clone();
    let view = StatusView {
        server: client.config().address(),
        state: state_label(&state).0,
        status: (*status).clone(),
    };

    let color = output::should_color(&global.color);
    let out = output::render_single(
        &global.output,
        &view,
        |v| detail(v, color),
        |v| v.status.device_status.to_string(),
    );
    output::print_output(&out, global.quiet);
    Ok(())
}
