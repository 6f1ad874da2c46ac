#![forbid(unsafe_code)]

pub mod core;
pub mod datalog;
pub mod error;
pub mod notify;
pub mod rpc;
pub mod storage;
pub mod transport;

pub use error::{Error, LoadError, SaveError};
pub type Result<T> = std::result::Result<T, Error>;

// Re-export core types at crate root for convenience
pub use crate::core::{
    EntryType, Handle, HandleType, Message, SequenceNumber, UNASSIGNED_ID, Value, ValueData,
};
pub use crate::datalog::DataLogSink;
pub use crate::notify::{EntryNotification, Notifier};
pub use crate::rpc::{RpcAnswer, RpcHandler, SendResponseFn};
pub use crate::storage::{EntryInfo, Storage};
pub use crate::transport::{ConnectionInfo, ConnectionState, Dispatcher, NetworkConnection};
