//! Initial synchronization between a server and a (re)connecting client.

use std::sync::Arc;

use tracing::debug;

use crate::core::{Message, UNASSIGNED_ID};
use crate::notify::{NOTIFY_FLAGS, NOTIFY_NEW, NOTIFY_UPDATE};
use crate::storage::Storage;
use crate::transport::{ConnectionState, NetworkConnection};

impl Storage {
    /// Server side: snapshot every valued entry as an assignment for a newly
    /// synchronized connection.
    pub fn get_initial_assignments(
        &self,
        conn: &Arc<dyn NetworkConnection>,
        msgs: &mut Vec<Message>,
    ) {
        let inner = self.core.lock();
        conn.set_state(ConnectionState::Synchronized);
        for entry in &inner.table.entries {
            let Some(value) = &entry.value else { continue };
            msgs.push(Message::EntryAssign {
                name: entry.name.clone(),
                id: entry.id,
                seq_num: entry.seq_num,
                value: value.clone(),
                flags: entry.flags,
            });
        }
    }

    /// Client side: reconcile local state against the server's snapshot.
    ///
    /// Locally written non-persistent values survive and are pushed back as
    /// updates; persistent values defer to the server; entries the server
    /// doesn't know about are re-advertised (if locally written, via
    /// `out_msgs`) or deleted.
    pub fn apply_initial_assignments(
        &self,
        conn: &Arc<dyn NetworkConnection>,
        msgs: Vec<Message>,
        _new_server: bool,
        out_msgs: &mut Vec<Message>,
    ) {
        let core = &self.core;
        let mut inner = core.lock();
        if inner.server {
            return; // never applied on the server
        }

        conn.set_state(ConnectionState::Synchronized);

        let mut update_msgs = Vec::new();

        // All ids are re-derived from this snapshot.
        for entry in &mut inner.table.entries {
            entry.id = UNASSIGNED_ID;
        }
        inner.table.clear_id_map();

        for msg in msgs {
            let Message::EntryAssign {
                name,
                id,
                seq_num,
                value,
                flags,
            } = msg
            else {
                debug!("client: received non-entry assignment request?");
                continue;
            };
            if id == UNASSIGNED_ID {
                debug!("client: received entry assignment request?");
                continue;
            }

            let local_id = inner.table.get_or_new(&name);
            inner.table.entries[local_id].seq_num = seq_num;
            inner.table.entries[local_id].id = id;

            if inner.table.entries[local_id].value.is_none() {
                let entry = &mut inner.table.entries[local_id];
                entry.value = Some(value);
                entry.flags = flags;
                core.notify(&mut inner, local_id, NOTIFY_NEW, false, None);
            } else {
                let keep_local = inner.table.entries[local_id].local_write
                    && !inner.table.entries[local_id].is_persistent();
                if keep_local {
                    // Our write wins; advertise it back with a fresh seq.
                    let entry = &mut inner.table.entries[local_id];
                    entry.seq_num.increment();
                    if let Some(value) = entry.value.clone() {
                        update_msgs.push(Message::EntryUpdate {
                            id,
                            seq_num: entry.seq_num,
                            value,
                        });
                    }
                } else {
                    let mut notify_flags = NOTIFY_UPDATE;
                    // Flags aren't part of the message before 3.0.
                    if conn.proto_rev() >= 0x0300 {
                        let old_flags = inner.table.entries[local_id].flags;
                        if old_flags != flags {
                            notify_flags |= NOTIFY_FLAGS;
                        }
                        inner.table.entries[local_id].flags = flags;
                    }
                    inner.table.entries[local_id].value = Some(value);
                    core.notify(&mut inner, local_id, notify_flags, false, None);
                }
            }

            inner.table.set_net_id(id, local_id);
        }

        // Entries the server didn't cover: re-advertise locally written
        // ones, delete the rest.
        core.delete_all_entries_impl(&mut inner, false, |entry| {
            if entry.id != UNASSIGNED_ID {
                return false; // assigned by the server above
            }
            if entry.local_write {
                if let Some(value) = &entry.value {
                    out_msgs.push(Message::EntryAssign {
                        name: entry.name.clone(),
                        id: entry.id,
                        seq_num: entry.seq_num,
                        value: value.clone(),
                        flags: entry.flags,
                    });
                }
                return false;
            }
            true
        });

        let dispatcher = inner.dispatcher.clone();
        drop(inner);
        if let Some(dispatcher) = dispatcher {
            for msg in update_msgs {
                dispatcher.queue_outgoing(msg, None, None);
            }
        }
    }
}
