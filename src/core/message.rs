//! Logical protocol messages.
//!
//! These are the records the storage engine consumes and produces; turning
//! them into wire bytes is the dispatcher stack's problem.

use crate::core::seqnum::SequenceNumber;
use crate::core::value::Value;

/// Network id sentinel meaning "not yet assigned by the server".
pub const UNASSIGNED_ID: u32 = 0xffff;

#[derive(Clone, Debug, PartialEq)]
pub enum Message {
    KeepAlive,
    ClientHello {
        self_id: String,
    },
    ProtoUnsup,
    ServerHelloDone,
    ServerHello {
        flags: u32,
        self_id: String,
    },
    ClientHelloDone,
    EntryAssign {
        name: String,
        id: u32,
        seq_num: SequenceNumber,
        value: Value,
        flags: u32,
    },
    EntryUpdate {
        id: u32,
        seq_num: SequenceNumber,
        value: Value,
    },
    FlagsUpdate {
        id: u32,
        flags: u32,
    },
    EntryDelete {
        id: u32,
    },
    ClearEntries,
    ExecuteRpc {
        id: u32,
        call_uid: u16,
        params: String,
    },
    RpcResponse {
        id: u32,
        call_uid: u16,
        result: String,
    },
}

impl Message {
    pub fn kind(&self) -> &'static str {
        match self {
            Message::KeepAlive => "KEEP_ALIVE",
            Message::ClientHello { .. } => "CLIENT_HELLO",
            Message::ProtoUnsup => "PROTO_UNSUP",
            Message::ServerHelloDone => "SERVER_HELLO_DONE",
            Message::ServerHello { .. } => "SERVER_HELLO",
            Message::ClientHelloDone => "CLIENT_HELLO_DONE",
            Message::EntryAssign { .. } => "ENTRY_ASSIGN",
            Message::EntryUpdate { .. } => "ENTRY_UPDATE",
            Message::FlagsUpdate { .. } => "FLAGS_UPDATE",
            Message::EntryDelete { .. } => "ENTRY_DELETE",
            Message::ClearEntries => "CLEAR_ENTRIES",
            Message::ExecuteRpc { .. } => "EXECUTE_RPC",
            Message::RpcResponse { .. } => "RPC_RESPONSE",
        }
    }
}
