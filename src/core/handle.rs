//! Packed 32-bit handles exposed to user code.
//!
//! Layout: bits 30-24 type, bits 23-20 instance index, bits 19-0 index.

use serde::{Deserialize, Serialize};

/// Handle type tags. Values start above the reserved base range so handles
/// are distinguishable from plain indices.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum HandleType {
    ConnectionListener = 16,
    ConnectionListenerPoller,
    Entry,
    EntryListener,
    EntryListenerPoller,
    Instance,
    Logger,
    LoggerPoller,
    RpcCall,
    RpcCallPoller,
    DataLogger,
    ConnectionDataLogger,
}

pub const INDEX_MAX: u32 = 0xfffff;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Handle(u32);

impl Handle {
    /// Pack an instance index and item index under a type tag. Out-of-range
    /// inputs produce the invalid handle 0.
    pub fn new(inst: i32, index: i32, kind: HandleType) -> Self {
        if inst < 0 || index < 0 || inst > 0xf || index as u32 > INDEX_MAX {
            return Self(0);
        }
        Self(((kind as u32 & 0x7f) << 24) | ((inst as u32 & 0xf) << 20) | (index as u32 & INDEX_MAX))
    }

    pub fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    pub fn raw(self) -> u32 {
        self.0
    }

    pub fn index(self) -> u32 {
        self.0 & INDEX_MAX
    }

    pub fn inst(self) -> u32 {
        (self.0 >> 20) & 0xf
    }

    fn type_bits(self) -> u32 {
        (self.0 >> 24) & 0x7f
    }

    pub fn is_type(self, kind: HandleType) -> bool {
        self.type_bits() == kind as u32
    }

    /// Index if the handle carries the expected type tag.
    pub fn typed_index(self, kind: HandleType) -> Option<u32> {
        self.is_type(kind).then(|| self.index())
    }
}
