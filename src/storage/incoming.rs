//! Inbound protocol state machine.
//!
//! Every handler follows the same discipline: lock, mutate, collect any
//! outbound messages, release, queue. Malformed or stale input is logged at
//! debug level and dropped; nothing propagates back to the caller.

use std::sync::Arc;

use tracing::debug;

use crate::core::{Message, SequenceNumber, UNASSIGNED_ID, Value};
use crate::notify::{NOTIFY_FLAGS, NOTIFY_NEW, NOTIFY_UPDATE};
use crate::rpc::SendResponseFn;
use crate::storage::{PERSISTENT, Storage, queue_all};
use crate::transport::NetworkConnection;

impl Storage {
    /// Apply one message from a peer connection.
    pub fn process_incoming(&self, msg: Message, conn: &Arc<dyn NetworkConnection>) {
        match msg {
            // Handshake traffic is the dispatcher's concern; tolerate strays.
            Message::KeepAlive
            | Message::ClientHello { .. }
            | Message::ProtoUnsup
            | Message::ServerHelloDone
            | Message::ServerHello { .. }
            | Message::ClientHelloDone => {}
            Message::EntryAssign {
                name,
                id,
                seq_num,
                value,
                flags,
            } => self.process_entry_assign(name, id, seq_num, value, flags, conn),
            Message::EntryUpdate { id, seq_num, value } => {
                self.process_entry_update(id, seq_num, value, conn)
            }
            Message::FlagsUpdate { id, flags } => self.process_flags_update(id, flags, conn),
            Message::EntryDelete { id } => self.process_entry_delete(id, conn),
            Message::ClearEntries => self.process_clear_entries(conn),
            Message::ExecuteRpc {
                id,
                call_uid,
                params,
            } => self.process_execute_rpc(id, call_uid, params, conn),
            Message::RpcResponse {
                id,
                call_uid,
                result,
            } => self.process_rpc_response(id, call_uid, result),
        }
    }

    fn process_entry_assign(
        &self,
        name: String,
        id: u32,
        seq_num: SequenceNumber,
        value: Value,
        msg_flags: u32,
        conn: &Arc<dyn NetworkConnection>,
    ) {
        let core = &self.core;
        let mut inner = core.lock();
        let mut may_need_update = false;
        let local_id;

        if inner.server {
            // An id of 0xffff is a request for an assignment; materialize it
            // and let the shared write path broadcast the new id.
            if id == UNASSIGNED_ID {
                let lid = inner.table.get_or_new(&name);
                if inner.table.entries[lid].id != UNASSIGNED_ID {
                    return; // already assigned; ignore
                }
                inner.table.entries[lid].flags = msg_flags;
                inner.table.entries[lid].seq_num = seq_num;
                let mut out = Vec::new();
                core.set_entry_value_impl(&mut inner, lid, value, false, &mut out);
                let dispatcher = inner.dispatcher.clone();
                drop(inner);
                queue_all(dispatcher, out);
                return;
            }
            match inner.table.by_net_id(id) {
                Some(lid) => local_id = lid,
                None => {
                    // stale assignment, e.g. to a deleted entry
                    drop(inner);
                    debug!("server: received assignment to unknown entry");
                    return;
                }
            }
        } else {
            if id == UNASSIGNED_ID {
                drop(inner);
                debug!("client: received entry assignment request?");
                return;
            }
            match inner.table.by_net_id(id) {
                Some(lid) => local_id = lid,
                None => {
                    let lid = inner.table.get_or_new(&name);
                    inner.table.entries[lid].id = id;
                    inner.table.set_net_id(id, lid);
                    if inner.table.entries[lid].value.is_none() {
                        // first observation of this entry; adopt wholesale
                        let entry = &mut inner.table.entries[lid];
                        entry.value = Some(value);
                        entry.flags = msg_flags;
                        entry.seq_num = seq_num;
                        core.notify(&mut inner, lid, NOTIFY_NEW, false, None);
                        return;
                    }
                    // A local write beat the server's reply; we may need to
                    // push our newer value back.
                    may_need_update = true;

                    // If the flags don't match what we sent, we changed them
                    // locally in the interim; the client's flags win.
                    if msg_flags != inner.table.entries[lid].flags {
                        let flags = inner.table.entries[lid].flags;
                        if let Some(dispatcher) = inner.dispatcher.clone() {
                            drop(inner);
                            dispatcher.queue_outgoing(
                                Message::FlagsUpdate { id, flags },
                                None,
                                None,
                            );
                            inner = core.lock();
                        }
                    }
                    local_id = lid;
                }
            }
        }

        // Common handling once the entry exists on both roles.
        if seq_num < inner.table.entries[local_id].seq_num {
            // Stale. If this was the answer to our assignment request, force
            // our newer value onto the peer.
            if may_need_update {
                let entry = &inner.table.entries[local_id];
                if let Some(value) = entry.value.clone() {
                    let msg = Message::EntryUpdate {
                        id: entry.id,
                        seq_num: entry.seq_num,
                        value,
                    };
                    let dispatcher = inner.dispatcher.clone();
                    drop(inner);
                    if let Some(dispatcher) = dispatcher {
                        dispatcher.queue_outgoing(msg, None, None);
                    }
                }
            }
            return;
        }

        if name != inner.table.entries[local_id].name {
            drop(inner);
            debug!("entry assignment for same id with different name?");
            return;
        }

        let mut notify_flags = NOTIFY_UPDATE;

        // Flags aren't part of the message before 3.0, and a server reply to
        // our own assignment request must not clobber local flag edits.
        if !may_need_update && conn.proto_rev() >= 0x0300 {
            let old_flags = inner.table.entries[local_id].flags;
            if (old_flags ^ msg_flags) & PERSISTENT != 0 {
                inner.persistent_dirty = true;
            }
            if old_flags != msg_flags {
                notify_flags |= NOTIFY_FLAGS;
            }
            inner.table.entries[local_id].flags = msg_flags;
        }

        if inner.table.entries[local_id].is_persistent()
            && inner.table.entries[local_id].value.as_ref() != Some(&value)
        {
            inner.persistent_dirty = true;
        }

        {
            let entry = &mut inner.table.entries[local_id];
            entry.value = Some(value.clone());
            entry.seq_num = seq_num;
        }

        core.notify(&mut inner, local_id, notify_flags, false, None);

        // Relay to every other connection. A client has no others.
        if inner.server {
            if let Some(dispatcher) = inner.dispatcher.clone() {
                let entry = &inner.table.entries[local_id];
                let out = Message::EntryAssign {
                    name: entry.name.clone(),
                    id,
                    seq_num,
                    value,
                    flags: entry.flags,
                };
                drop(inner);
                dispatcher.queue_outgoing(out, None, Some(conn));
            }
        }
    }

    fn process_entry_update(
        &self,
        id: u32,
        seq_num: SequenceNumber,
        value: Value,
        conn: &Arc<dyn NetworkConnection>,
    ) {
        let core = &self.core;
        let mut inner = core.lock();
        let Some(local_id) = inner.table.by_net_id(id) else {
            drop(inner);
            debug!("received update to unknown entry");
            return;
        };

        if seq_num <= inner.table.entries[local_id].seq_num {
            return;
        }

        {
            let entry = &mut inner.table.entries[local_id];
            entry.value = Some(value.clone());
            entry.seq_num = seq_num;
        }

        if inner.table.entries[local_id].is_persistent() {
            inner.persistent_dirty = true;
        }

        core.notify(&mut inner, local_id, NOTIFY_UPDATE, false, None);

        if inner.server {
            if let Some(dispatcher) = inner.dispatcher.clone() {
                drop(inner);
                dispatcher.queue_outgoing(
                    Message::EntryUpdate { id, seq_num, value },
                    None,
                    Some(conn),
                );
            }
        }
    }

    fn process_flags_update(&self, id: u32, flags: u32, conn: &Arc<dyn NetworkConnection>) {
        let core = &self.core;
        let mut inner = core.lock();
        let Some(local_id) = inner.table.by_net_id(id) else {
            drop(inner);
            debug!("received flags update to unknown entry");
            return;
        };

        let mut out = Vec::new();
        core.set_entry_flags_impl(&mut inner, local_id, flags, false, &mut out);

        if inner.server {
            if let Some(dispatcher) = inner.dispatcher.clone() {
                drop(inner);
                dispatcher.queue_outgoing(Message::FlagsUpdate { id, flags }, None, Some(conn));
            }
        }
    }

    fn process_entry_delete(&self, id: u32, conn: &Arc<dyn NetworkConnection>) {
        let core = &self.core;
        let mut inner = core.lock();
        let Some(local_id) = inner.table.by_net_id(id) else {
            drop(inner);
            debug!("received delete to unknown entry");
            return;
        };

        let mut out = Vec::new();
        core.delete_entry_impl(&mut inner, local_id, false, &mut out);

        if inner.server {
            if let Some(dispatcher) = inner.dispatcher.clone() {
                drop(inner);
                dispatcher.queue_outgoing(Message::EntryDelete { id }, None, Some(conn));
            }
        }
    }

    fn process_clear_entries(&self, conn: &Arc<dyn NetworkConnection>) {
        let core = &self.core;
        let mut inner = core.lock();
        core.delete_all_entries_impl(&mut inner, false, |entry| !entry.is_persistent());

        if inner.server {
            if let Some(dispatcher) = inner.dispatcher.clone() {
                drop(inner);
                dispatcher.queue_outgoing(Message::ClearEntries, None, Some(conn));
            }
        }
    }

    fn process_execute_rpc(
        &self,
        id: u32,
        call_uid: u16,
        params: String,
        conn: &Arc<dyn NetworkConnection>,
    ) {
        let core = &self.core;
        let inner = core.lock();
        if !inner.server {
            return; // only processed on the server
        }
        let Some(local_id) = inner.table.by_net_id(id) else {
            drop(inner);
            debug!("received RPC call to unknown entry");
            return;
        };
        let entry = &inner.table.entries[local_id];
        let is_rpc = entry.value.as_ref().is_some_and(Value::is_rpc);
        if !is_rpc {
            drop(inner);
            debug!("received RPC call to non-RPC entry");
            return;
        }
        let name = entry.name.clone();
        let rpc_uid = entry.rpc_uid;
        drop(inner);

        let conn_info = conn.info();
        let conn_weak = Arc::downgrade(conn);
        // The response callback re-upgrades at emit time; if the connection
        // died in the meantime the result is silently dropped.
        let send_response: SendResponseFn = Box::new(move |result: String| {
            if let Some(conn) = conn_weak.upgrade() {
                conn.queue_outgoing(Message::RpcResponse {
                    id,
                    call_uid,
                    result,
                });
            }
        });
        core.rpc_handler.process_rpc(
            local_id,
            call_uid,
            &name,
            &params,
            &conn_info,
            send_response,
            rpc_uid,
        );
    }

    fn process_rpc_response(&self, id: u32, call_uid: u16, result: String) {
        let core = &self.core;
        let mut inner = core.lock();
        if inner.server {
            return; // only processed on a client
        }
        let Some(local_id) = inner.table.by_net_id(id) else {
            drop(inner);
            debug!("received RPC response to unknown entry");
            return;
        };
        let entry = &inner.table.entries[local_id];
        if !entry.value.as_ref().is_some_and(Value::is_rpc) {
            drop(inner);
            debug!("received RPC response to non-RPC entry");
            return;
        }
        inner.rpc_results.insert((local_id, call_uid), result);
        core.rpc_results_cond.notify_all();
    }
}
