//! Config subcommand handlers. None of these touch the network.

use serde::Serialize;
use tabled::Tabled;

use scrutiny_config::Transport;
use scrutiny_core::DEFAULT_PORT;

use crate::cli::{ConfigArgs, ConfigCommand, GlobalOpts};
use crate::config::{self, Config, Profile};
use crate::error::CliError;
use crate::output;

// ── Profiles table ──────────────────────────────────────────────────

#[derive(Serialize)]
struct ProfileView<'a> {
    name: &'a str,
    default: bool,
    #[serde(flatten)]
    profile: &'a Profile,
}

#[derive(Tabled)]
struct ProfileRow {
    #[tabled(rename = "Name")]
    name: String,
    #[tabled(rename = "Server")]
    server: String,
    #[tabled(rename = "Transport")]
    transport: String,
    #[tabled(rename = "Device link")]
    link: String,
}

impl From<&ProfileView<'_>> for ProfileRow {
    fn from(v: &ProfileView<'_>) -> Self {
        let marker = if v.default { " *" } else { "" };
        Self {
            name: format!("{}{marker}", v.name),
            server: format!("{}:{}", v.profile.host, v.profile.port),
            transport: match v.profile.transport {
                Transport::Tcp => "tcp".into(),
                Transport::Udp => "udp".into(),
            },
            link: v
                .profile
                .device_link
                .as_ref()
                .map_or_else(|| "-".into(), |l| l.link_type().to_owned()),
        }
    }
}

fn profile_views(cfg: &Config) -> Vec<ProfileView<'_>> {
    let mut views: Vec<_> = cfg
        .profiles
        .iter()
        .map(|(name, profile)| ProfileView {
            name,
            default: cfg.default_profile.as_deref() == Some(name.as_str()),
            profile,
        })
        .collect();
    views.sort_by(|a, b| a.name.cmp(b.name));
    views
}

/// Tables don't fit a nested config; show it as the file would read.
fn to_toml(cfg: &Config) -> String {
    toml::to_string_pretty(cfg).unwrap_or_else(|e| format!("# cannot render config: {e}"))
}

// ── Handler ─────────────────────────────────────────────────────────

pub fn handle(args: ConfigArgs, global: &GlobalOpts) -> Result<(), CliError> {
    let path = config::config_file(global);

    match args.command {
        ConfigCommand::Init {
            name,
            server_host,
            server_port,
            force,
        } => {
            if path.exists() && !force {
                return Err(CliError::ConfigExists {
                    path: path.display().to_string(),
                });
            }
            let mut cfg = Config {
                default_profile: Some(name.clone()),
                ..Config::default()
            };
            cfg.profiles.insert(
                name,
                Profile {
                    host: server_host,
                    port: server_port.unwrap_or(DEFAULT_PORT),
                    ..Profile::default()
                },
            );
            config::save_config_to(&cfg, &path)?;
            if !global.quiet {
                eprintln!("Config written to {}", path.display());
            }
            Ok(())
        }

        ConfigCommand::Show => {
            let cfg = config::load(global)?;
            let out = output::render_single(&global.output, &cfg, to_toml, to_toml);
            output::print_output(out.trim_end(), global.quiet);
            Ok(())
        }

        ConfigCommand::Profiles => {
            let cfg = config::load(global)?;
            let views = profile_views(&cfg);
            let out = output::render_list(
                &global.output,
                &views,
                |v| ProfileRow::from(v),
                |v| v.name.to_owned(),
            );
            output::print_output(&out, global.quiet);
            Ok(())
        }

        ConfigCommand::Use { name } => {
            let mut cfg = config::load(global)?;
            if !cfg.profiles.contains_key(&name) {
                return Err(CliError::ProfileNotFound {
                    available: config::available_profiles(&cfg),
                    name,
                });
            }
            cfg.default_profile = Some(name.clone());
            config::save_config_to(&cfg, &path)?;
            if !global.quiet {
                eprintln!("Default profile set to '{name}'");
            }
            Ok(())
        }

        ConfigCommand::Path => {
            output::print_output(&path.display().to_string(), global.quiet);
            Ok(())
        }
    }
}
