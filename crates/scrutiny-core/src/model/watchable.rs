// ── Watchable identity and type information ──

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString, IntoStaticStr};

use crate::error::CoreError;

/// Category of a watchable, derived from the first path segment.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    IntoStaticStr,
)]
pub enum WatchableType {
    #[strum(serialize = "alias")]
    #[serde(rename = "alias")]
    Alias,
    #[strum(serialize = "var")]
    #[serde(rename = "var")]
    Variable,
    #[strum(serialize = "rpv")]
    #[serde(rename = "rpv")]
    RuntimePublishedValue,
}

impl WatchableType {
    /// Types that depend on a loaded firmware description.
    pub fn needs_sfd(self) -> bool {
        matches!(self, Self::Alias | Self::Variable)
    }
}

/// Embedded data type of a watchable, as named on the wire.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    IntoStaticStr,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Datatype {
    Sint8,
    Sint16,
    Sint32,
    Sint64,
    Sint128,
    Sint256,
    Uint8,
    Uint16,
    Uint32,
    Uint64,
    Uint128,
    Uint256,
    Float8,
    Float16,
    Float32,
    Float64,
    Float128,
    Float256,
    Cfloat8,
    Cfloat16,
    Cfloat32,
    Cfloat64,
    Cfloat128,
    Cfloat256,
    Boolean,
}

/// Broad family of a [`Datatype`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatatypeKind {
    Signed,
    Unsigned,
    Float,
    Bool,
}

impl Datatype {
    pub fn kind(self) -> DatatypeKind {
        match self {
            Self::Sint8
            | Self::Sint16
            | Self::Sint32
            | Self::Sint64
            | Self::Sint128
            | Self::Sint256 => DatatypeKind::Signed,
            Self::Uint8
            | Self::Uint16
            | Self::Uint32
            | Self::Uint64
            | Self::Uint128
            | Self::Uint256 => DatatypeKind::Unsigned,
            Self::Float8
            | Self::Float16
            | Self::Float32
            | Self::Float64
            | Self::Float128
            | Self::Float256
            | Self::Cfloat8
            | Self::Cfloat16
            | Self::Cfloat32
            | Self::Cfloat64
            | Self::Cfloat128
            | Self::Cfloat256 => DatatypeKind::Float,
            Self::Boolean => DatatypeKind::Bool,
        }
    }

    pub fn is_integer(self) -> bool {
        matches!(self.kind(), DatatypeKind::Signed | DatatypeKind::Unsigned)
    }
}

/// Enumeration attached to an integer watchable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnumDefinition {
    pub name: String,
    pub values: BTreeMap<String, i64>,
}

impl EnumDefinition {
    pub fn value_of(&self, name: &str) -> Option<i64> {
        self.values.get(name).copied()
    }

    pub fn name_of(&self, value: i64) -> Option<&str> {
        self.values
            .iter()
            .find(|(_, v)| **v == value)
            .map(|(k, _)| k.as_str())
    }
}

// ── WatchablePath ────────────────────────────────────────────────────

/// A validated display path: `/alias/<name>`, `/rpv/<id>` or `/var/<...>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WatchablePath {
    raw: String,
    watchable_type: WatchableType,
}

impl WatchablePath {
    pub fn parse(path: &str) -> Result<Self, CoreError> {
        let invalid = |reason: &str| CoreError::InvalidPath {
            path: path.to_owned(),
            reason: reason.to_owned(),
        };

        let rest = path
            .strip_prefix('/')
            .ok_or_else(|| invalid("path must start with '/'"))?;
        let (prefix, tail) = rest
            .split_once('/')
            .ok_or_else(|| invalid("missing name after the type segment"))?;
        let watchable_type: WatchableType = prefix
            .parse()
            .map_err(|_| invalid("type segment must be one of alias, rpv, var"))?;

        if tail.is_empty() || tail.split('/').any(str::is_empty) {
            return Err(invalid("empty path segment"));
        }

        Ok(Self {
            raw: path.to_owned(),
            watchable_type,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn watchable_type(&self) -> WatchableType {
        self.watchable_type
    }

    /// Last segment of the path.
    pub fn name(&self) -> &str {
        self.raw.rsplit('/').next().unwrap_or(&self.raw)
    }
}

impl fmt::Display for WatchablePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl std::str::FromStr for WatchablePath {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Everything the server tells us about a watchable when subscribing.
#[derive(Debug, Clone, PartialEq)]
pub struct WatchableConfiguration {
    pub server_id: String,
    pub watchable_type: WatchableType,
    pub datatype: Datatype,
    pub enum_def: Option<EnumDefinition>,
}

// ── Watchable listing ────────────────────────────────────────────────

/// A watchable available in the server's datastore.
#[derive(Debug, Clone, PartialEq)]
pub struct WatchableInfo {
    pub path: WatchablePath,
    pub datatype: Datatype,
    pub enum_def: Option<EnumDefinition>,
}

impl WatchableInfo {
    pub fn watchable_type(&self) -> WatchableType {
        self.path.watchable_type()
    }
}

/// Which watchables to list, and how many per server message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchableListFilter {
    /// Empty lists every type.
    pub types: Vec<WatchableType>,
    /// Glob patterns on the display path. A watchable is listed when it
    /// matches any of them. Empty lists everything.
    pub name_patterns: Vec<String>,
    pub max_per_response: u32,
}

impl WatchableListFilter {
    pub const DEFAULT_MAX_PER_RESPONSE: u32 = 500;

    pub fn of_types(types: impl IntoIterator<Item = WatchableType>) -> Self {
        Self {
            types: types.into_iter().collect(),
            ..Self::default()
        }
    }

    pub fn with_name_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.name_patterns.push(pattern.into());
        self
    }
}

impl Default for WatchableListFilter {
    fn default() -> Self {
        Self {
            types: Vec::new(),
            name_patterns: Vec::new(),
            max_per_response: Self::DEFAULT_MAX_PER_RESPONSE,
        }
    }
}

/// Result of a watchable list download, grouped by type in server order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WatchableList {
    pub rpv: Vec<WatchableInfo>,
    pub alias: Vec<WatchableInfo>,
    pub var: Vec<WatchableInfo>,
}

impl WatchableList {
    pub fn of_type(&self, watchable_type: WatchableType) -> &[WatchableInfo] {
        match watchable_type {
            WatchableType::RuntimePublishedValue => &self.rpv,
            WatchableType::Alias => &self.alias,
            WatchableType::Variable => &self.var,
        }
    }

    pub(crate) fn push(&mut self, info: WatchableInfo) {
        match info.watchable_type() {
            WatchableType::RuntimePublishedValue => self.rpv.push(info),
            WatchableType::Alias => self.alias.push(info),
            WatchableType::Variable => self.var.push(info),
        }
    }

    /// Runtime published values first, variables last.
    pub fn entries(&self) -> impl Iterator<Item = &WatchableInfo> {
        self.rpv.iter().chain(&self.alias).chain(&self.var)
    }

    pub fn len(&self) -> usize {
        self.rpv.len() + self.alias.len() + self.var.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
