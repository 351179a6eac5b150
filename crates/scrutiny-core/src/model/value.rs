// ── Watchable values ──
//
// Values read from and written to watchables. Reads are typed by the
// watchable's datatype; writes may also be a textual expression that the
// server evaluates before applying it to the device.

use std::fmt;

use scrutiny_api::WireValue;
use scrutiny_api::expr::{self, ExprError};
use serde::{Deserialize, Serialize};
use strum::Display;

use super::watchable::{Datatype, DatatypeKind};

/// A value received from the server, normalized to the watchable's datatype.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WatchableValue {
    Bool(bool),
    Int(i64),
    Uint(u64),
    Float(f64),
}

impl WatchableValue {
    /// Normalize a wire scalar according to `datatype`.
    ///
    /// Returns `None` for strings and for numbers that do not fit the
    /// datatype's family.
    #[allow(clippy::cast_precision_loss, clippy::as_conversions)]
    pub fn from_wire(value: &WireValue, datatype: Datatype) -> Option<Self> {
        match (datatype.kind(), value) {
            (DatatypeKind::Bool, WireValue::Bool(b)) => Some(Self::Bool(*b)),
            (DatatypeKind::Bool, WireValue::Int(i)) => Some(Self::Bool(*i != 0)),
            (DatatypeKind::Bool, WireValue::Uint(u)) => Some(Self::Bool(*u != 0)),

            (DatatypeKind::Signed, WireValue::Int(i)) => Some(Self::Int(*i)),
            (DatatypeKind::Signed, WireValue::Uint(u)) => i64::try_from(*u).ok().map(Self::Int),
            (DatatypeKind::Unsigned, WireValue::Uint(u)) => Some(Self::Uint(*u)),
            (DatatypeKind::Unsigned, WireValue::Int(i)) => u64::try_from(*i).ok().map(Self::Uint),
            (DatatypeKind::Signed | DatatypeKind::Unsigned, WireValue::Float(f))
                if f.fract() == 0.0 && f.is_finite() =>
            {
                if *f < 0.0 {
                    Some(Self::Int(*f as i64))
                } else {
                    Some(Self::Uint(*f as u64))
                }
            }
            (DatatypeKind::Signed, WireValue::Bool(b)) => Some(Self::Int(i64::from(*b))),
            (DatatypeKind::Unsigned, WireValue::Bool(b)) => Some(Self::Uint(u64::from(*b))),

            (DatatypeKind::Float, WireValue::Float(f)) => Some(Self::Float(*f)),
            (DatatypeKind::Float, WireValue::Int(i)) => Some(Self::Float(*i as f64)),
            (DatatypeKind::Float, WireValue::Uint(u)) => Some(Self::Float(*u as f64)),

            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            Self::Uint(u) => i64::try_from(*u).ok(),
            _ => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Self::Uint(u) => Some(*u),
            Self::Int(i) => u64::try_from(*i).ok(),
            _ => None,
        }
    }

    /// Any numeric value widened to `f64`. Booleans are not numbers here.
    #[allow(clippy::cast_precision_loss, clippy::as_conversions)]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int(i) => Some(*i as f64),
            Self::Uint(u) => Some(*u as f64),
            Self::Float(f) => Some(*f),
            Self::Bool(_) => None,
        }
    }
}

impl fmt::Display for WatchableValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(b) => write!(f, "{b}"),
            Self::Int(i) => write!(f, "{i}"),
            Self::Uint(u) => write!(f, "{u}"),
            Self::Float(v) => write!(f, "{v}"),
        }
    }
}

// ── WriteValue ───────────────────────────────────────────────────────

/// A value to write. `Expression` is evaluated server side.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteValue {
    Bool(bool),
    Int(i64),
    Uint(u64),
    Float(f64),
    Expression(String),
}

impl WriteValue {
    pub(crate) fn into_wire(self) -> WireValue {
        match self {
            Self::Bool(b) => WireValue::Bool(b),
            Self::Int(i) => WireValue::Int(i),
            Self::Uint(u) => WireValue::Uint(u),
            Self::Float(f) => WireValue::Float(f),
            Self::Expression(s) => WireValue::Str(s),
        }
    }

    /// Parse user input: `true`/`false`, an integer, a float, or else an
    /// expression left for the server.
    pub fn parse(input: &str) -> Self {
        let trimmed = input.trim();
        match trimmed {
            "true" => Self::Bool(true),
            "false" => Self::Bool(false),
            _ => {
                if let Ok(i) = trimmed.parse::<i64>() {
                    Self::Int(i)
                } else if let Ok(u) = trimmed.parse::<u64>() {
                    Self::Uint(u)
                } else if let Some(f) = trimmed.parse::<f64>().ok().filter(|f| f.is_finite()) {
                    Self::Float(f)
                } else {
                    Self::Expression(trimmed.to_owned())
                }
            }
        }
    }

    /// Check an expression with the grammar the server evaluates it with.
    ///
    /// Literals always pass. A bare identifier also passes: it may name an
    /// enum member, which only the watchable's definition can resolve.
    pub fn check(&self) -> Result<(), ExprError> {
        let Self::Expression(text) = self else {
            return Ok(());
        };
        match expr::evaluate(text) {
            Ok(_) => Ok(()),
            Err(ExprError::UnknownIdentifier(_)) if is_identifier(text) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

fn is_identifier(text: &str) -> bool {
    let mut chars = text.chars();
    chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

impl From<bool> for WriteValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i64> for WriteValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<i32> for WriteValue {
    fn from(v: i32) -> Self {
        Self::Int(i64::from(v))
    }
}

impl From<u64> for WriteValue {
    fn from(v: u64) -> Self {
        Self::Uint(v)
    }
}

impl From<u32> for WriteValue {
    fn from(v: u32) -> Self {
        Self::Uint(u64::from(v))
    }
}

impl From<f64> for WriteValue {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<&str> for WriteValue {
    fn from(v: &str) -> Self {
        Self::Expression(v.to_owned())
    }
}

impl From<String> for WriteValue {
    fn from(v: String) -> Self {
        Self::Expression(v)
    }
}

impl From<WatchableValue> for WriteValue {
    fn from(v: WatchableValue) -> Self {
        match v {
            WatchableValue::Bool(b) => Self::Bool(b),
            WatchableValue::Int(i) => Self::Int(i),
            WatchableValue::Uint(u) => Self::Uint(u),
            WatchableValue::Float(f) => Self::Float(f),
        }
    }
}

// ── ValueStatus ──────────────────────────────────────────────────────

/// Why a handle's value is, or is not, readable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
pub enum ValueStatus {
    #[strum(serialize = "valid")]
    Valid,
    #[strum(serialize = "never set")]
    NeverSet,
    #[strum(serialize = "server gone")]
    ServerGone,
    #[strum(serialize = "device gone")]
    DeviceGone,
    #[strum(serialize = "firmware description unloaded")]
    SfdUnloaded,
    #[strum(serialize = "not watched")]
    NotWatched,
}

impl ValueStatus {
    /// Invalidated for good: the handle will not receive updates again.
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Valid | Self::NeverSet)
    }
}
