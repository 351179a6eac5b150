//! Statistics command handlers.

use std::time::Duration;

use bytesize::ByteSize;

use scrutiny_core::{Client, LocalStatistics, ServerStatistics, WatchableCount};

use crate::cli::{GlobalOpts, StatsArgs, StatsCommand};
use crate::error::CliError;
use crate::output;

// ── Formatting helpers ──────────────────────────────────────────────

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::as_conversions)]
fn rate(bytes_per_sec: f64) -> String {
    let bytes = if bytes_per_sec.is_finite() && bytes_per_sec > 0.0 {
        bytes_per_sec.round() as u64
    } else {
        0
    };
    format!("{}/s", ByteSize::b(bytes))
}

fn whole(d: Duration) -> String {
    humantime::format_duration(Duration::from_secs(d.as_secs())).to_string()
}

fn latency(d: Option<Duration>) -> String {
    d.map_or_else(|| "-".into(), |d| format!("{:.1} ms", d.as_secs_f64() * 1000.0))
}

fn server_detail(s: &ServerStatistics) -> String {
    output::render_detail(&[
        ("Uptime", whole(s.uptime)),
        ("Clients", s.client_count.to_string()),
        ("Messages received", s.msg_received.to_string()),
        ("Messages sent", s.msg_sent.to_string()),
        ("Invalid requests", s.invalid_request_count.to_string()),
        ("Unexpected errors", s.unexpected_error_count.to_string()),
        ("To clients", rate(s.to_all_clients_datarate_byte_per_sec)),
        ("From clients", rate(s.from_any_client_datarate_byte_per_sec)),
        ("Device sessions", s.device_session_count.to_string()),
        ("To device", rate(s.to_device_datarate_byte_per_sec)),
        ("From device", rate(s.from_device_datarate_byte_per_sec)),
        ("Device requests", format!("{:.1}/s", s.device_request_per_sec)),
    ])
}

fn count_detail(c: &WatchableCount) -> String {
    output::render_detail(&[
        ("Aliases", c.alias.to_string()),
        ("Variables", c.var.to_string()),
        ("Runtime published values", c.rpv.to_string()),
        ("Total", c.total().to_string()),
    ])
}

fn local_detail(l: &LocalStatistics) -> String {
    output::render_detail(&[
        ("Received", ByteSize::b(l.rx_bytes).to_string()),
        ("Sent", ByteSize::b(l.tx_bytes).to_string()),
        ("Messages received", l.rx_messages.to_string()),
        ("Messages sent", l.tx_messages.to_string()),
        ("Receive rate", rate(l.rx_data_rate)),
        ("Send rate", rate(l.tx_data_rate)),
        (
            "Message rate",
            format!("{:.1}/s in, {:.1}/s out", l.rx_message_rate, l.tx_message_rate),
        ),
        ("Last latency", latency(l.last_request_latency)),
        ("Average latency", latency(l.average_request_latency)),
        ("Connections", l.connect_count.to_string()),
    ])
}

// ── Handler ─────────────────────────────────────────────────────────

pub async fn handle(client: &Client, args: StatsArgs, global: &GlobalOpts) -> Result<(), CliError> {
    let out = match args.command {
        StatsCommand::Server => {
            let stats = client.get_server_stats().await?;
            output::render_single(&global.output, &stats, server_detail, |s| {
                whole(s.uptime)
            })
        }
        StatsCommand::Count => {
            let count = client.get_watchable_count().await?;
            output::render_single(&global.output, &count, count_detail, |c| {
                c.total().to_string()
            })
        }
        StatsCommand::Local => {
            // One round trip so the latency figures are populated.
            client.get_watchable_count().await?;
            let stats = client.get_local_stats();
            output::render_single(&global.output, &stats, local_detail, |l| {
                format!("{} {}", l.rx_bytes, l.tx_bytes)
            })
        }
    };
    output::print_output(&out, global.quiet);
    Ok(())
}
