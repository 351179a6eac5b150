//! CLI configuration: a thin wrapper around `scrutiny_config`.
//!
//! Adds the resolution step that respects `GlobalOpts` flag overrides
//! (--config, --profile, --host, --port, --transport, --timeout).

use std::path::PathBuf;

use scrutiny_config::{ConfigError, Transport};
use scrutiny_core::{ClientConfig, LinkKind};

use crate::cli::{GlobalOpts, TransportArg};
use crate::error::CliError;

pub use scrutiny_config::{Config, Profile, load_config_from, save_config_to};

/// A profile after flag overrides, with the client settings built from it.
#[derive(Debug)]
pub struct Resolved {
    pub name: String,
    pub profile: Profile,
    pub client: ClientConfig,
}

/// Config file in effect: `--config` or the platform default.
pub fn config_file(global: &GlobalOpts) -> PathBuf {
    global
        .config
        .clone()
        .unwrap_or_else(scrutiny_config::config_path)
}

pub fn load(global: &GlobalOpts) -> Result<Config, CliError> {
    Ok(load_config_from(&config_file(global))?)
}

/// Resolve the active profile and translate it into a `ClientConfig`.
///
/// CLI flag overrides take priority over profile values.
pub fn resolve(global: &GlobalOpts) -> Result<Resolved, CliError> {
    let cfg = load(global)?;
    let (name, mut profile) = cfg
        .resolve_profile(global.profile.as_deref())
        .map_err(|err| match err {
            ConfigError::UnknownProfile { profile } => CliError::ProfileNotFound {
                name: profile,
                available: available_profiles(&cfg),
            },
            other => other.into(),
        })?;

    if let Some(host) = &global.host {
        profile.host.clone_from(host);
    }
    if let Some(port) = global.port {
        profile.port = port;
    }
    if let Some(transport) = global.transport {
        profile.transport = match transport {
            TransportArg::Tcp => Transport::Tcp,
            TransportArg::Udp => Transport::Udp,
        };
    }

    let mut client = scrutiny_config::profile_to_client_config(&profile, &cfg.defaults)?;
    if let Some(timeout) = global.timeout {
        if timeout.is_zero() {
            return Err(CliError::Validation {
                field: "timeout".into(),
                reason: "must be greater than zero".into(),
            });
        }
        client.request_timeout = timeout;
    }

    tracing::debug!(
        profile = %name,
        addr = %client.address(),
        udp = client.transport.kind == LinkKind::Udp,
        "resolved connection settings"
    );
    Ok(Resolved {
        name,
        profile,
        client,
    })
}

pub fn available_profiles(cfg: &Config) -> String {
    let mut names: Vec<_> = cfg.profiles.keys().map(String::as_str).collect();
    if names.is_empty() {
        return "(none)".into();
    }
    names.sort_unstable();
    names.join(", ")
}
