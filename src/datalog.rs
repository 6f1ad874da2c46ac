//! Data-log sink interface.
//!
//! Storage fans entry changes out to registered sinks; the sink owns the log
//! file format. Entry ids returned by [`DataLogSink::start`] are opaque to
//! storage and handed back on every append/finish.

use bytes::Bytes;

pub const TYPE_BOOLEAN: &str = "boolean";
pub const TYPE_DOUBLE: &str = "double";
pub const TYPE_STRING: &str = "string";
pub const TYPE_RAW: &str = "raw";
pub const TYPE_BOOLEAN_ARRAY: &str = "boolean[]";
pub const TYPE_DOUBLE_ARRAY: &str = "double[]";
pub const TYPE_STRING_ARRAY: &str = "string[]";

/// Metadata attached to every log stream started by the table.
pub const LOG_METADATA: &str = "{\"source\":\"NT\"}";

pub trait DataLogSink: Send + Sync {
    /// Open a log stream; returns the sink's entry id for it.
    fn start(&self, name: &str, type_str: &str, metadata: &str, timestamp: u64) -> i32;
    fn finish(&self, entry: i32, timestamp: u64);

    fn append_boolean(&self, entry: i32, value: bool, timestamp: u64);
    fn append_double(&self, entry: i32, value: f64, timestamp: u64);
    fn append_string(&self, entry: i32, value: &str, timestamp: u64);
    fn append_raw(&self, entry: i32, value: &Bytes, timestamp: u64);
    fn append_boolean_array(&self, entry: i32, value: &[bool], timestamp: u64);
    fn append_double_array(&self, entry: i32, value: &[f64], timestamp: u64);
    fn append_string_array(&self, entry: i32, value: &[String], timestamp: u64);
}
