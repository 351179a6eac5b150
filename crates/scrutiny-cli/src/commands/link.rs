//! Device link command handlers.

use scrutiny_core::{Client, DeviceLinkConfig, DeviceLinkInfo};

use crate::cli::{GlobalOpts, LinkArgs, LinkCommand};
use crate::config::Resolved;
use crate::error::CliError;
use crate::output::{self, Tone};

fn detail(info: &DeviceLinkInfo, color: bool) -> String {
    let (state, tone) = if info.operational {
        ("operational", Tone::Good)
    } else {
        ("down", Tone::Bad)
    };
    let config = info.config.as_ref().map_or_else(
        || "-".into(),
        |c| serde_json::to_string(c).unwrap_or_default(),
    );
    output::render_detail(&[
        ("Type", info.link_type.clone()),
        ("State", output::paint(state, tone, color)),
        ("Demo mode", if info.demo_mode { "yes" } else { "no" }.into()),
        ("Config", config),
    ])
}

async fn apply(
    client: &Client,
    link: &DeviceLinkConfig,
    global: &GlobalOpts,
) -> Result<(), CliError> {
    client.configure_device_link(link).await?;
    tracing::info!(link_type = link.link_type(), "device link configured");
    if !global.quiet {
        eprintln!("Device link set to {}", link.link_type());
    }
    Ok(())
}

pub async fn handle(
    client: &Client,
    args: LinkArgs,
    global: &GlobalOpts,
    resolved: &Resolved,
) -> Result<(), CliError> {
    match args.command {
        LinkCommand::Show => {
            let status = super::status::latest(client).await?;
            let color = output::should_color(&global.color);
            let out = output::render_single(
                &global.output,
                &status.device_link,
                |info| detail(info, color),
                |info| info.link_type.clone(),
            );
            output::print_output(&out, global.quiet);
            Ok(())
        }

        LinkCommand::Apply => {
            let link = resolved
                .profile
                .device_link
                .as_ref()
                .ok_or_else(|| CliError::NoDeviceLink {
                    profile: resolved.name.clone(),
                })?;
            apply(client, link, global).await
        }

        LinkCommand::Set { link } => apply(client, &link, global).await,

        LinkCommand::Disable => apply(client, &DeviceLinkConfig::Disabled, global).await,
    }
}
