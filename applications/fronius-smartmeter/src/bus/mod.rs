//! The process bus the normalized metrics are published on.
//!
//! A service is a tree of paths (`/Ac/L1/Voltage`, `/Role`, ...) each holding
//! a [`BusValue`] plus a text rendering. The poll loop only needs the
//! [`ProcessBus`] operations; [`ObjectTree`] is the in-process tree and
//! [`mqtt`] carries it to an external broker.

pub mod directory;
pub mod mqtt;
pub mod tree;

pub use directory::{BusDirectory, BusSnapshot};
pub use tree::{ObjectTree, PathUpdate};

use crate::error::BusError;
use crate::model::Metric;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum BusValue {
    Null,
    Int(i64),
    Float(f64),
    Text(String),
    List(Vec<String>),
}

impl BusValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            BusValue::Int(i) => Some(*i as f64),
            BusValue::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            BusValue::Text(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for BusValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BusValue::Null => Ok(()),
            BusValue::Int(i) => write!(f, "{i}"),
            BusValue::Float(v) => write!(f, "{v}"),
            BusValue::Text(s) => f.write_str(s),
            BusValue::List(items) => f.write_str(&items.join(", ")),
        }
    }
}

impl From<Metric> for BusValue {
    fn from(m: Metric) -> Self {
        match m {
            Metric::Value(v) => BusValue::Float(v),
            Metric::Unavailable => BusValue::Null,
        }
    }
}

impl From<f64> for BusValue {
    fn from(v: f64) -> Self {
        BusValue::Float(v)
    }
}

impl From<i64> for BusValue {
    fn from(v: i64) -> Self {
        BusValue::Int(v)
    }
}

impl From<u32> for BusValue {
    fn from(v: u32) -> Self {
        BusValue::Int(v.into())
    }
}

impl From<u8> for BusValue {
    fn from(v: u8) -> Self {
        BusValue::Int(v.into())
    }
}

impl From<&str> for BusValue {
    fn from(v: &str) -> Self {
        BusValue::Text(v.to_string())
    }
}

impl From<String> for BusValue {
    fn from(v: String) -> Self {
        BusValue::Text(v)
    }
}

/// Human-readable rendering attached to a path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TextFormat {
    Volt,
    Ampere,
    Watt,
    Hertz,
    KiloWattHour,
    Millis,
    #[default]
    Raw,
}

impl TextFormat {
    pub fn render(&self, value: &BusValue) -> String {
        let number = match value.as_f64() {
            Some(n) => n,
            None => return value.to_string(),
        };
        match self {
            TextFormat::Volt => format!("{number:.1}V"),
            TextFormat::Ampere => format!("{number:.1}A"),
            TextFormat::Watt => format!("{number:.1}W"),
            TextFormat::KiloWattHour => format!("{number:.2}kWh"),
            TextFormat::Hertz => format!("{value}Hz"),
            TextFormat::Millis => format!("{value}ms"),
            TextFormat::Raw => value.to_string(),
        }
    }
}

/// Invoked when an external writer changes a writable path.
/// Returning `false` refuses the write.
pub type ChangeCallback = Arc<dyn Fn(&str, &BusValue) -> bool + Send + Sync>;

pub fn change_callback<F>(f: F) -> ChangeCallback
where
    F: Fn(&str, &BusValue) -> bool + Send + Sync + 'static,
{
    Arc::new(f)
}

#[derive(Clone)]
pub struct PathSpec {
    pub path: String,
    pub initial: BusValue,
    pub format: TextFormat,
    pub writable: bool,
    pub on_change: Option<ChangeCallback>,
}

impl PathSpec {
    pub fn new(path: impl Into<String>, initial: impl Into<BusValue>) -> Self {
        Self {
            path: path.into(),
            initial: initial.into(),
            format: TextFormat::Raw,
            writable: false,
            on_change: None,
        }
    }

    pub fn format(mut self, format: TextFormat) -> Self {
        self.format = format;
        self
    }

    pub fn writable(mut self, on_change: ChangeCallback) -> Self {
        self.writable = true;
        self.on_change = Some(on_change);
        self
    }
}

impl fmt::Debug for PathSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PathSpec")
            .field("path", &self.path)
            .field("initial", &self.initial)
            .field("format", &self.format)
            .field("writable", &self.writable)
            .finish()
    }
}

/// What the poll loop needs from the publishing layer.
pub trait ProcessBus: Send + Sync {
    fn set(&self, path: &str, value: BusValue) -> Result<(), BusError>;
    fn get(&self, path: &str) -> Option<BusValue>;
    /// Hook `callback` onto a path; it is consulted on every external write.
    fn on_change(&self, path: &str, callback: ChangeCallback) -> Result<(), BusError>;
}
