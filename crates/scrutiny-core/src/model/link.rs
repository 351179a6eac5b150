// ── Device link configuration ──
//
// The link between the server and the embedded device. Exactly one is
// active per server. Serialized with an internal `type` tag for config
// files; `to_wire`/`from_wire` give the `(link_type, link_config)` pair the
// server speaks.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum::Display;

use crate::error::CoreError;

const CAN_STANDARD_ID_MAX: u32 = 0x7FF;
const CAN_EXTENDED_ID_MAX: u32 = 0x1FFF_FFFF;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum DeviceLinkConfig {
    #[serde(rename = "none")]
    Disabled,
    Udp(IpLinkConfig),
    Tcp(IpLinkConfig),
    Serial(SerialLinkConfig),
    Rtt(RttLinkConfig),
    Canbus(CanLinkConfig),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpLinkConfig {
    pub host: String,
    pub port: u16,
}

// ── Serial ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SerialLinkConfig {
    pub portname: String,
    pub baudrate: u32,
    #[serde(default)]
    pub stopbits: StopBits,
    #[serde(default = "default_databits")]
    pub databits: u8,
    #[serde(default)]
    pub parity: Parity,
    /// Seconds to wait after opening the port before talking to the device.
    #[serde(default)]
    pub start_delay: f64,
}

fn default_databits() -> u8 {
    8
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, Display)]
pub enum StopBits {
    #[default]
    #[serde(rename = "1")]
    #[strum(serialize = "1")]
    One,
    #[serde(rename = "1.5")]
    #[strum(serialize = "1.5")]
    OnePointFive,
    #[serde(rename = "2")]
    #[strum(serialize = "2")]
    Two,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Parity {
    #[default]
    None,
    Even,
    Odd,
    Mark,
    Space,
}

// ── RTT ──────────────────────────────────────────────────────────────

/// Segger J-Link Real Time Transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RttLinkConfig {
    pub target_device: String,
    #[serde(default)]
    pub jlink_interface: JLinkInterface,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum JLinkInterface {
    Jtag,
    #[default]
    Swd,
    Fine,
    Icsp,
    Spi,
    C2,
}

// ── CAN bus ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanLinkConfig {
    #[serde(flatten)]
    pub interface: CanInterface,
    pub txid: u32,
    pub rxid: u32,
    #[serde(default)]
    pub extended_id: bool,
    #[serde(default)]
    pub fd: bool,
    #[serde(default)]
    pub bitrate_switch: bool,
}

/// Vendor interface plus its specific settings, sent as
/// `interface` + `subconfig`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "interface", content = "subconfig", rename_all = "lowercase")]
pub enum CanInterface {
    SocketCan(SocketCanConfig),
    Vector(VectorCanConfig),
    KVaser(KVaserCanConfig),
    Pcan(PcanConfig),
    Etas(EtasCanConfig),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SocketCanConfig {
    pub channel: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VectorCanConfig {
    pub channel: VectorChannel,
    pub bitrate: u32,
    pub data_bitrate: u32,
}

/// Vector channels are addressed by index or by name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum VectorChannel {
    Index(u32),
    Name(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KVaserCanConfig {
    pub channel: u32,
    pub bitrate: u32,
    pub data_bitrate: u32,
    #[serde(default)]
    pub fd_non_iso: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PcanConfig {
    pub channel: String,
    pub bitrate: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EtasCanConfig {
    pub channel: String,
    pub bitrate: u32,
    pub data_bitrate: u32,
}

// ── Wire conversion and validation ───────────────────────────────────

impl DeviceLinkConfig {
    /// The `link_type` string used on the wire.
    pub fn link_type(&self) -> &'static str {
        match self {
            Self::Disabled => "none",
            Self::Udp(_) => "udp",
            Self::Tcp(_) => "tcp",
            Self::Serial(_) => "serial",
            Self::Rtt(_) => "rtt",
            Self::Canbus(_) => "canbus",
        }
    }

    /// Split into `(link_type, link_config)` for `set_link_config`.
    pub fn to_wire(&self) -> Result<(&'static str, Value), CoreError> {
        let config = match self {
            Self::Disabled => Ok(Value::Object(serde_json::Map::new())),
            Self::Udp(c) | Self::Tcp(c) => serde_json::to_value(c),
            Self::Serial(c) => serde_json::to_value(c),
            Self::Rtt(c) => serde_json::to_value(c),
            Self::Canbus(c) => serde_json::to_value(c),
        }
        .map_err(|e| CoreError::Internal(format!("cannot encode link config: {e}")))?;
        Ok((self.link_type(), config))
    }

    /// Rebuild from what the server reports. `None` for link types this
    /// client does not know or configs it cannot read.
    pub fn from_wire(link_type: &str, config: &Value) -> Option<Self> {
        let parsed = match link_type {
            "none" => return Some(Self::Disabled),
            "udp" => serde_json::from_value(config.clone()).map(Self::Udp),
            "tcp" => serde_json::from_value(config.clone()).map(Self::Tcp),
            "serial" => serde_json::from_value(config.clone()).map(Self::Serial),
            "rtt" => serde_json::from_value(config.clone()).map(Self::Rtt),
            "canbus" => serde_json::from_value(config.clone()).map(Self::Canbus),
            _ => return None,
        };
        parsed.ok()
    }

    /// Local checks run before anything is sent to the server.
    pub fn validate(&self) -> Result<(), CoreError> {
        let invalid = |message: String| Err(CoreError::Validation { message });
        match self {
            Self::Disabled => Ok(()),
            Self::Udp(c) | Self::Tcp(c) => {
                if c.host.is_empty() {
                    return invalid("host must not be empty".into());
                }
                if c.port == 0 {
                    return invalid("port must be non-zero".into());
                }
                Ok(())
            }
            Self::Serial(c) => {
                if c.portname.is_empty() {
                    return invalid("serial port name must not be empty".into());
                }
                if c.baudrate == 0 {
                    return invalid("baudrate must be non-zero".into());
                }
                if !(5..=8).contains(&c.databits) {
                    return invalid(format!("databits must be between 5 and 8, got {}", c.databits));
                }
                if !c.start_delay.is_finite() || c.start_delay < 0.0 {
                    return invalid("start_delay must be a positive number of seconds".into());
                }
                Ok(())
            }
            Self::Rtt(c) => {
                if c.target_device.is_empty() {
                    return invalid("RTT target device must not be empty".into());
                }
                Ok(())
            }
            Self::Canbus(c) => c.validate(),
        }
    }
}

impl CanLinkConfig {
    fn validate(&self) -> Result<(), CoreError> {
        if self.bitrate_switch && !self.fd {
            return Err(CoreError::Validation {
                message: "bitrate switch requires CAN FD".into(),
            });
        }
        let max = if self.extended_id {
            CAN_EXTENDED_ID_MAX
        } else {
            CAN_STANDARD_ID_MAX
        };
        for (name, id) in [("txid", self.txid), ("rxid", self.rxid)] {
            if id > max {
                return Err(CoreError::Validation {
                    message: format!("{name} {id:#x} is above the maximum {max:#x}"),
                });
            }
        }
        Ok(())
    }
}
