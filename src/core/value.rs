//! Table values: a tagged variant plus a monotonic timestamp.

use std::fmt;
use std::sync::OnceLock;
use std::time::Instant;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Value type tags. Discriminants form a bitmask so type filters can be
/// expressed as an OR of tags (`types & value.entry_type().bit() != 0`).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u32)]
pub enum EntryType {
    #[default]
    Unassigned = 0,
    Boolean = 0x01,
    Double = 0x02,
    String = 0x04,
    Raw = 0x08,
    BooleanArray = 0x10,
    DoubleArray = 0x20,
    StringArray = 0x40,
    Rpc = 0x80,
}

impl EntryType {
    pub fn bit(self) -> u32 {
        self as u32
    }
}

/// The variant payload of a [`Value`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum ValueData {
    Boolean(bool),
    Double(f64),
    String(String),
    Raw(Bytes),
    BooleanArray(Vec<bool>),
    DoubleArray(Vec<f64>),
    StringArray(Vec<String>),
    /// RPC definition blob; marks the entry as remotely callable.
    Rpc(Bytes),
}

impl ValueData {
    pub fn entry_type(&self) -> EntryType {
        match self {
            ValueData::Boolean(_) => EntryType::Boolean,
            ValueData::Double(_) => EntryType::Double,
            ValueData::String(_) => EntryType::String,
            ValueData::Raw(_) => EntryType::Raw,
            ValueData::BooleanArray(_) => EntryType::BooleanArray,
            ValueData::DoubleArray(_) => EntryType::DoubleArray,
            ValueData::StringArray(_) => EntryType::StringArray,
            ValueData::Rpc(_) => EntryType::Rpc,
        }
    }
}

/// One table value.
///
/// `time` records when the value was materialized locally (monotonic
/// microseconds). Two values compare equal when their data matches; the
/// timestamp never participates, so replaying an identical write is silent.
#[derive(Clone, Serialize, Deserialize)]
pub struct Value {
    data: ValueData,
    time: u64,
}

impl Value {
    pub fn new(data: ValueData, time: u64) -> Self {
        Self { data, time }
    }

    pub fn boolean(value: bool) -> Self {
        Self::new(ValueData::Boolean(value), now())
    }

    pub fn double(value: f64) -> Self {
        Self::new(ValueData::Double(value), now())
    }

    pub fn string(value: impl Into<String>) -> Self {
        Self::new(ValueData::String(value.into()), now())
    }

    pub fn raw(value: impl Into<Bytes>) -> Self {
        Self::new(ValueData::Raw(value.into()), now())
    }

    pub fn boolean_array(value: Vec<bool>) -> Self {
        Self::new(ValueData::BooleanArray(value), now())
    }

    pub fn double_array(value: Vec<f64>) -> Self {
        Self::new(ValueData::DoubleArray(value), now())
    }

    pub fn string_array(value: Vec<String>) -> Self {
        Self::new(ValueData::StringArray(value), now())
    }

    pub fn rpc(def: impl Into<Bytes>) -> Self {
        Self::new(ValueData::Rpc(def.into()), now())
    }

    pub fn with_time(mut self, time: u64) -> Self {
        self.time = time;
        self
    }

    pub fn data(&self) -> &ValueData {
        &self.data
    }

    pub fn entry_type(&self) -> EntryType {
        self.data.entry_type()
    }

    pub fn time(&self) -> u64 {
        self.time
    }

    pub fn is_rpc(&self) -> bool {
        matches!(self.data, ValueData::Rpc(_))
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.data == other.data
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Value")
            .field("data", &self.data)
            .field("time", &self.time)
            .finish()
    }
}

/// Monotonic microseconds since the first call in this process.
pub fn now() -> u64 {
    static ANCHOR: OnceLock<Instant> = OnceLock::new();
    let anchor = *ANCHOR.get_or_init(Instant::now);
    Instant::now().duration_since(anchor).as_micros() as u64
}
