//! Shared configuration for Scrutiny tools.
//!
//! TOML profiles naming a server (and optionally the device link it should
//! use), loaded through figment and translated to
//! `scrutiny_core::ClientConfig`. The CLI layers its flag overrides on top.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use scrutiny_core::{ClientConfig, DEFAULT_PORT, DeviceLinkConfig, LinkKind, TransportConfig};

// ── Error ───────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid {field}: {reason}")]
    Validation { field: String, reason: String },

    #[error("profile '{profile}' not found in config")]
    UnknownProfile { profile: String },

    #[error("failed to serialize config: {0}")]
    Serialization(#[from] toml::ser::Error),

    #[error("config loading failed: {0}")]
    Figment(Box<figment::Error>),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        Self::Figment(Box::new(err))
    }
}

// ── TOML config structs ─────────────────────────────────────────────

/// Top-level TOML configuration.
#[derive(Debug, Deserialize, Serialize)]
pub struct Config {
    /// Profile used when none is named on the command line.
    pub default_profile: Option<String>,

    /// Global defaults.
    #[serde(default)]
    pub defaults: Defaults,

    /// Named server profiles.
    #[serde(default)]
    pub profiles: HashMap<String, Profile>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            default_profile: Some("default".into()),
            defaults: Defaults::default(),
            profiles: HashMap::new(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize)]
pub struct Defaults {
    #[serde(default = "default_output")]
    pub output: String,

    #[serde(default = "default_color")]
    pub color: String,

    /// Request timeout in seconds, for profiles that don't set one.
    #[serde(default = "default_request_timeout")]
    pub request_timeout: f64,
}

impl Default for Defaults {
    fn default() -> Self {
        Self {
            output: default_output(),
            color: default_color(),
            request_timeout: default_request_timeout(),
        }
    }
}

fn default_output() -> String {
    "table".into()
}
fn default_color() -> String {
    "auto".into()
}
fn default_request_timeout() -> f64 {
    4.0
}

/// Socket kind, as written in config files.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    #[default]
    Tcp,
    Udp,
}

impl From<Transport> for LinkKind {
    fn from(t: Transport) -> Self {
        match t {
            Transport::Tcp => Self::Tcp,
            Transport::Udp => Self::Udp,
        }
    }
}

/// A named server profile. Durations are in seconds.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Profile {
    /// Server host name or address.
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default)]
    pub transport: Transport,

    pub connect_timeout: Option<f64>,
    pub request_timeout: Option<f64>,
    pub write_timeout: Option<f64>,

    /// Status poll period. Zero disables polling.
    pub status_poll_interval: Option<f64>,

    pub wait_status_on_connect: Option<bool>,

    /// Compress outgoing datagrams.
    pub compress: Option<bool>,

    /// Append an integrity tag to outgoing datagrams.
    pub integrity_tag: Option<bool>,

    /// Largest accepted datagram payload, in bytes.
    pub mtu: Option<usize>,

    /// Device link the server should be switched to by `scrutiny link apply`.
    pub device_link: Option<DeviceLinkConfig>,
}

impl Default for Profile {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            transport: Transport::default(),
            connect_timeout: None,
            request_timeout: None,
            write_timeout: None,
            status_poll_interval: None,
            wait_status_on_connect: None,
            compress: None,
            integrity_tag: None,
            mtu: None,
            device_link: None,
        }
    }
}

fn default_host() -> String {
    "localhost".into()
}
fn default_port() -> u16 {
    DEFAULT_PORT
}

impl Config {
    /// Resolve a profile by name, falling back to `default_profile`.
    ///
    /// An explicitly named profile must exist. When the default profile is
    /// missing, built-in defaults are used so a fresh install can still reach
    /// a local server.
    pub fn resolve_profile(&self, name: Option<&str>) -> Result<(String, Profile), ConfigError> {
        if let Some(name) = name {
            return self
                .profiles
                .get(name)
                .cloned()
                .map(|p| (name.to_owned(), p))
                .ok_or_else(|| ConfigError::UnknownProfile {
                    profile: name.into(),
                });
        }

        let name = self.default_profile.as_deref().unwrap_or("default");
        let profile = self.profiles.get(name).cloned().unwrap_or_default();
        Ok((name.to_owned(), profile))
    }
}

// ── Config file path ────────────────────────────────────────────────

/// Resolve the config file path via XDG / platform conventions.
pub fn config_path() -> PathBuf {
    ProjectDirs::from("org", "scrutinydebugger", "scrutiny").map_or_else(
        || {
            let mut p = dirs_fallback();
            p.push("config.toml");
            p
        },
        |dirs| dirs.config_dir().join("config.toml"),
    )
}

fn dirs_fallback() -> PathBuf {
    let mut p = PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| ".".into()));
    p.push(".config");
    p.push("scrutiny");
    p
}

// ── Config loading ──────────────────────────────────────────────────

/// Load the full Config from the canonical file + environment.
pub fn load_config() -> Result<Config, ConfigError> {
    load_config_from(&config_path())
}

/// Load from an explicit file. A missing file yields the defaults;
/// `SCRUTINY_`-prefixed variables override both (`__` separates keys).
pub fn load_config_from(path: &Path) -> Result<Config, ConfigError> {
    let figment = Figment::new()
        .merge(Serialized::defaults(Config::default()))
        .merge(Toml::file(path))
        .merge(Env::prefixed("SCRUTINY_").split("__"));

    let config: Config = figment.extract()?;
    Ok(config)
}

// ── Config saving ───────────────────────────────────────────────────

/// Serialize config to TOML and write it, creating parent directories.
pub fn save_config_to(cfg: &Config, path: &Path) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let toml_str = toml::to_string_pretty(cfg)?;
    std::fs::write(path, toml_str)?;
    Ok(())
}

// ── Translation ─────────────────────────────────────────────────────

/// Build a `ClientConfig` from a profile. Unset fields take the
/// `ClientConfig` defaults, except the request timeout which falls back to
/// `[defaults]`.
pub fn profile_to_client_config(
    profile: &Profile,
    defaults: &Defaults,
) -> Result<ClientConfig, ConfigError> {
    if profile.host.trim().is_empty() {
        return Err(ConfigError::Validation {
            field: "host".into(),
            reason: "must not be empty".into(),
        });
    }
    if let Some(link) = &profile.device_link {
        link.validate().map_err(|e| ConfigError::Validation {
            field: "device_link".into(),
            reason: e.to_string(),
        })?;
    }

    let base = ClientConfig::default();
    let mut transport = TransportConfig {
        kind: profile.transport.into(),
        ..TransportConfig::default()
    };
    if let Some(secs) = profile.connect_timeout {
        transport.connect_timeout = timeout("connect_timeout", secs)?;
    }
    if let Some(compress) = profile.compress {
        transport.framing.compress = compress;
    }
    if let Some(tag) = profile.integrity_tag {
        transport.framing.use_hash = tag;
    }
    if let Some(mtu) = profile.mtu {
        if mtu == 0 {
            return Err(ConfigError::Validation {
                field: "mtu".into(),
                reason: "must be greater than zero".into(),
            });
        }
        transport.framing.mtu = mtu;
    }

    let request_timeout = timeout(
        "request_timeout",
        profile.request_timeout.unwrap_or(defaults.request_timeout),
    )?;
    let write_timeout = profile
        .write_timeout
        .map(|secs| timeout("write_timeout", secs))
        .transpose()?
        .unwrap_or(base.write_timeout);
    let status_poll_interval = profile
        .status_poll_interval
        .map(|secs| seconds("status_poll_interval", secs))
        .transpose()?
        .unwrap_or(base.status_poll_interval);

    Ok(ClientConfig {
        host: profile.host.clone(),
        port: profile.port,
        transport,
        request_timeout,
        write_timeout,
        status_poll_interval,
        wait_status_on_connect: profile
            .wait_status_on_connect
            .unwrap_or(base.wait_status_on_connect),
    })
}

fn seconds(field: &str, secs: f64) -> Result<Duration, ConfigError> {
    Duration::try_from_secs_f64(secs).map_err(|e| ConfigError::Validation {
        field: field.into(),
        reason: format!("{secs} is not a valid number of seconds: {e}"),
    })
}

fn timeout(field: &str, secs: f64) -> Result<Duration, ConfigError> {
    let d = seconds(field, secs)?;
    if d.is_zero() {
        return Err(ConfigError::Validation {
            field: field.into(),
            reason: "must be greater than zero".into(),
        });
    }
    Ok(d)
}
