//! Watch command: read watchables once, or follow their updates.

use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use futures_util::stream::select_all;
use serde::Serialize;
use tabled::Tabled;

use scrutiny_core::{Client, CoreError, ValueStatus, WatchableHandle, WatchableValue};

use crate::cli::{GlobalOpts, OutputFormat, WatchArgs};
use crate::error::CliError;
use crate::output::{self, Tone};

// ── View ────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct WatchView {
    path: String,
    #[serde(rename = "type")]
    watchable_type: String,
    datatype: String,
    value: Option<WatchableValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    enum_name: Option<String>,
    status: ValueStatus,
    update_counter: u64,
    last_update: Option<DateTime<Utc>>,
}

impl WatchView {
    fn from_handle(handle: &WatchableHandle) -> Self {
        let snap = handle.snapshot();
        Self {
            path: handle.display_path().to_owned(),
            watchable_type: handle.watchable_type().to_string(),
            datatype: handle.datatype().to_string(),
            enum_name: snap.value.and_then(|v| enum_name(handle, v)),
            value: snap.value,
            status: snap.status,
            update_counter: snap.update_counter,
            last_update: snap.last_update_timestamp,
        }
    }

    fn shown_value(&self) -> String {
        match (&self.enum_name, self.value) {
            (Some(name), _) => name.clone(),
            (None, Some(v)) => v.to_string(),
            (None, None) => "-".into(),
        }
    }
}

fn enum_name(handle: &WatchableHandle, value: WatchableValue) -> Option<String> {
    let def = handle.enum_definition()?;
    def.name_of(value.as_i64()?).map(str::to_owned)
}

#[derive(Tabled)]
struct WatchRow {
    #[tabled(rename = "Path")]
    path: String,
    #[tabled(rename = "Type")]
    watchable_type: String,
    #[tabled(rename = "Datatype")]
    datatype: String,
    #[tabled(rename = "Value")]
    value: String,
    #[tabled(rename = "Status")]
    status: String,
    #[tabled(rename = "Updated")]
    updated: String,
}

impl WatchRow {
    fn new(view: &WatchView, color: bool) -> Self {
        let tone = match view.status {
            ValueStatus::Valid => Tone::Good,
            ValueStatus::NeverSet => Tone::Pending,
            _ => Tone::Bad,
        };
        Self {
            path: view.path.clone(),
            watchable_type: view.watchable_type.clone(),
            datatype: view.datatype.clone(),
            value: view.shown_value(),
            status: output::paint(&view.status.to_string(), tone, color),
            updated: view
                .last_update
                .map(|t| t.format("%H:%M:%S%.3f").to_string())
                .unwrap_or_default(),
        }
    }
}

/// One followed update.
#[derive(Serialize)]
struct UpdateLine<'a> {
    path: &'a str,
    value: WatchableValue,
    #[serde(skip_serializing_if = "Option::is_none")]
    enum_name: Option<String>,
    time: DateTime<Utc>,
}

fn render_update(format: &OutputFormat, line: &UpdateLine<'_>) -> String {
    let shown = line
        .enum_name
        .clone()
        .unwrap_or_else(|| line.value.to_string());
    match format {
        OutputFormat::Table => {
            format!("{}  {}  {shown}", line.time.format("%H:%M:%S%.3f"), line.path)
        }
        OutputFormat::Plain => format!("{}={shown}", line.path),
        // Followed output is a stream: one compact document per update.
        OutputFormat::Json | OutputFormat::JsonCompact => {
            serde_json::to_string(line).unwrap_or_default()
        }
        OutputFormat::Yaml => format!(
            "---\n{}",
            serde_yaml::to_string(line).unwrap_or_default().trim_end()
        ),
    }
}

// ── Handler ─────────────────────────────────────────────────────────

pub async fn handle(client: &Client, args: WatchArgs, global: &GlobalOpts) -> Result<(), CliError> {
    let mut handles = Vec::with_capacity(args.paths.len());
    for path in &args.paths {
        handles.push(client.watch(path).await?);
    }

    if args.follow {
        return follow(client, &handles, args.count, global).await;
    }

    match client.wait_new_value_for_all(args.wait).await {
        Ok(()) => {}
        // Report what arrived; silent watchables show as never set.
        Err(CoreError::Timeout { .. }) => {
            tracing::warn!(wait = ?args.wait, "not every watchable received a value");
        }
        Err(e) => return Err(e.into()),
    }

    let views: Vec<WatchView> = handles.iter().map(WatchView::from_handle).collect();
    let color = output::should_color(&global.color);
    let out = output::render_list(
        &global.output,
        &views,
        |v| WatchRow::new(v, color),
        |v| format!("{}={}", v.path, v.shown_value()),
    );
    output::print_output(&out, global.quiet);
    Ok(())
}

async fn follow(
    client: &Client,
    handles: &[WatchableHandle],
    count: Option<usize>,
    global: &GlobalOpts,
) -> Result<(), CliError> {
    let mut updates = select_all(handles.iter().map(|h| {
        let h = h.clone();
        h.subscribe().map(move |v| (h.clone(), v))
    }));
    let mut state = client.connection_state();
    let interrupted = tokio::signal::ctrl_c();
    tokio::pin!(interrupted);
    let mut printed = 0usize;

    loop {
        if count.is_some_and(|n| printed >= n) {
            return Ok(());
        }
        tokio::select! {
            biased;
            _ = &mut interrupted => return Ok(()),
            changed = state.changed() => {
                if changed.is_err() || !state.borrow_and_update().is_connected() {
                    return Err(CliError::Disconnected);
                }
            }
            next = updates.next() => {
                let Some((handle, value)) = next else {
                    // Every handle was invalidated.
                    let paths: Vec<&str> =
                        handles.iter().map(WatchableHandle::display_path).collect();
                    let reason = handles
                        .first()
                        .map(|h| h.status().to_string())
                        .unwrap_or_default();
                    return Err(CliError::ValueUnavailable {
                        path: paths.join(", "),
                        reason,
                    });
                };
                let line = UpdateLine {
                    path: handle.display_path(),
                    value,
                    enum_name: enum_name(&handle, value),
                    time: handle.last_update_timestamp().unwrap_or_else(Utc::now),
                };
                output::print_output(&render_update(&global.output, &line), global.quiet);
                printed += 1;
            }
        }
    }
}
