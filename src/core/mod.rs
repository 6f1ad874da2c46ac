//! Core model: values, sequence numbers, protocol messages, handles.

pub mod handle;
pub mod message;
pub mod seqnum;
pub mod value;

pub use handle::{Handle, HandleType};
pub use message::{Message, UNASSIGNED_ID};
pub use seqnum::SequenceNumber;
pub use value::{EntryType, Value, ValueData, now};
