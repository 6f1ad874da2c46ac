//! The storage engine: authoritative entry table, user API, and the glue to
//! the injected dispatcher, notifier, RPC handler, and data-log sinks.
//!
//! One mutex guards the whole table. Every public operation locks on entry,
//! collects any outbound messages while the lock is held, and queues them on
//! the dispatcher only after releasing it; the notifier is the exception and
//! is invoked under the lock (it only enqueues).

pub mod datalog;
pub mod handshake;
pub mod incoming;
pub mod persist;
pub mod rpc;
mod table;

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};

use crate::core::{EntryType, Handle, HandleType, Message, UNASSIGNED_ID, Value};
use crate::notify::{
    ListenerCallback, NOTIFY_DELETE, NOTIFY_FLAGS, NOTIFY_IMMEDIATE, NOTIFY_LOCAL, NOTIFY_NEW,
    NOTIFY_UPDATE, Notifier,
};
use crate::rpc::RpcHandler;
use crate::transport::Dispatcher;

pub use rpc::RpcResultError;
pub(crate) use table::{DataLogEntry, Entry, EntryTable};

/// Entry flag: included in persistent saves and survives clear-all.
pub const PERSISTENT: u32 = 0x01;

/// Snapshot of one entry for user queries.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct EntryInfo {
    pub entry: Handle,
    pub name: String,
    pub entry_type: EntryType,
    pub flags: u32,
    pub last_change: u64,
}

pub(crate) struct DataLogger {
    pub sink: Arc<dyn crate::datalog::DataLogSink>,
    pub prefix: String,
    pub log_prefix: String,
}

pub(crate) struct Inner {
    pub table: EntryTable,
    pub rpc_results: HashMap<(usize, u16), String>,
    pub rpc_blocking_calls: HashSet<(usize, u16)>,
    pub dataloggers: Vec<Option<DataLogger>>,
    /// True when a persistent entry's value, flags, or existence changed
    /// since the last successful save.
    pub persistent_dirty: bool,
    pub dispatcher: Option<Arc<dyn Dispatcher>>,
    pub server: bool,
}

pub(crate) struct StorageCore {
    pub inner: Mutex<Inner>,
    pub rpc_results_cond: Condvar,
    pub terminating: AtomicBool,
    pub notifier: Arc<dyn Notifier>,
    pub rpc_handler: Arc<dyn RpcHandler>,
}

impl StorageCore {
    pub fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Fan a change out to the notifier and any attached data logs.
    /// `value_override` carries the old value on deletes.
    pub(crate) fn notify(
        &self,
        inner: &mut Inner,
        local_id: usize,
        notify_flags: u32,
        local: bool,
        value_override: Option<Value>,
    ) {
        let entry = &inner.table.entries[local_id];
        let value = match value_override.or_else(|| entry.value.clone()) {
            Some(value) => value,
            None => return,
        };
        let flags = notify_flags | if local { NOTIFY_LOCAL } else { 0 };
        self.notifier
            .notify_entry(local_id, &entry.name, &value, flags, None);
        datalog::log_notify(inner, local_id, notify_flags, &value);
    }

    /// Shared write path for local and inbound value stores.
    pub(crate) fn set_entry_value_impl(
        &self,
        inner: &mut Inner,
        local_id: usize,
        value: Value,
        local: bool,
        out: &mut Vec<Message>,
    ) {
        let old_value = inner.table.entries[local_id].value.replace(value.clone());

        if inner.server && inner.table.entries[local_id].id == UNASSIGNED_ID {
            inner.table.assign_next_id(local_id);
        }

        let changed = match &old_value {
            None => true,
            Some(old) => *old != value,
        };
        if inner.table.entries[local_id].is_persistent() && changed {
            inner.persistent_dirty = true;
        }

        if old_value.is_none() {
            self.notify(inner, local_id, NOTIFY_NEW, local, None);
        } else if changed {
            self.notify(inner, local_id, NOTIFY_UPDATE, local, None);
        }

        if local {
            inner.table.entries[local_id].local_write = true;
        }

        // Peer writes are rebroadcast by the incoming handlers; this path
        // only emits for local changes (or a server materializing a peer's
        // assignment request).
        if inner.dispatcher.is_none() || (!local && !inner.server) {
            return;
        }
        let type_changed = match &old_value {
            None => true,
            Some(old) => old.entry_type() != value.entry_type(),
        };
        let entry = &mut inner.table.entries[local_id];
        if type_changed {
            if local {
                entry.seq_num.increment();
            }
            out.push(Message::EntryAssign {
                name: entry.name.clone(),
                id: entry.id,
                seq_num: entry.seq_num,
                value,
                flags: entry.flags,
            });
        } else if changed {
            if local {
                entry.seq_num.increment();
            }
            // An update with no assigned id is deferred; the eventual
            // assignment carries the incremented sequence number.
            if entry.id != UNASSIGNED_ID {
                out.push(Message::EntryUpdate {
                    id: entry.id,
                    seq_num: entry.seq_num,
                    value,
                });
            }
        }
    }

    pub(crate) fn set_entry_flags_impl(
        &self,
        inner: &mut Inner,
        local_id: usize,
        flags: u32,
        local: bool,
        out: &mut Vec<Message>,
    ) {
        {
            let entry = &inner.table.entries[local_id];
            if entry.value.is_none() || entry.flags == flags {
                return;
            }
        }
        let old_flags = inner.table.entries[local_id].flags;
        if (old_flags ^ flags) & PERSISTENT != 0 {
            inner.persistent_dirty = true;
        }
        inner.table.entries[local_id].flags = flags;

        self.notify(inner, local_id, NOTIFY_FLAGS, local, None);

        if !local || inner.dispatcher.is_none() {
            return;
        }
        let id = inner.table.entries[local_id].id;
        if id != UNASSIGNED_ID {
            out.push(Message::FlagsUpdate { id, flags });
        }
    }

    pub(crate) fn delete_entry_impl(
        &self,
        inner: &mut Inner,
        local_id: usize,
        local: bool,
        out: &mut Vec<Message>,
    ) {
        let id = inner.table.entries[local_id].id;
        if id != UNASSIGNED_ID {
            inner.table.clear_net_id(id);
        }

        let entry = &mut inner.table.entries[local_id];
        let old_value = entry.value.take();
        entry.id = UNASSIGNED_ID;
        entry.local_write = false;

        let rpc_uid = entry.rpc_uid.take();
        let was_persistent = entry.is_persistent();
        entry.flags = 0;

        if let Some(uid) = rpc_uid {
            self.rpc_handler.remove_rpc(uid);
        }
        if was_persistent {
            inner.persistent_dirty = true;
        }

        let Some(old_value) = old_value else {
            return; // was not previously assigned
        };

        self.notify(inner, local_id, NOTIFY_DELETE, local, Some(old_value));

        if local && id != UNASSIGNED_ID && inner.dispatcher.is_some() {
            out.push(Message::EntryDelete { id });
        }
    }

    /// Delete every valued entry the predicate selects. Flags are left in
    /// place so persistent markings survive a clear-all.
    pub(crate) fn delete_all_entries_impl(
        &self,
        inner: &mut Inner,
        local: bool,
        mut should_delete: impl FnMut(&Entry) -> bool,
    ) {
        for local_id in 0..inner.table.entries.len() {
            {
                let entry = &inner.table.entries[local_id];
                if entry.value.is_none() || !should_delete(entry) {
                    continue;
                }
            }
            self.notify(inner, local_id, NOTIFY_DELETE, local, None);
            let id = inner.table.entries[local_id].id;
            if id != UNASSIGNED_ID {
                inner.table.clear_net_id(id);
            }
            let entry = &mut inner.table.entries[local_id];
            entry.id = UNASSIGNED_ID;
            entry.local_write = false;
            entry.value = None;
        }
    }
}

/// Queue collected messages to every connection; call only after the
/// storage lock has been released.
pub(crate) fn queue_all(dispatcher: Option<Arc<dyn Dispatcher>>, msgs: Vec<Message>) {
    if let Some(dispatcher) = dispatcher {
        for msg in msgs {
            dispatcher.queue_outgoing(msg, None, None);
        }
    }
}

/// The replicated table storage engine.
pub struct Storage {
    pub(crate) core: Arc<StorageCore>,
}

impl Storage {
    pub fn new(notifier: Arc<dyn Notifier>, rpc_handler: Arc<dyn RpcHandler>) -> Self {
        Self {
            core: Arc::new(StorageCore {
                inner: Mutex::new(Inner {
                    table: EntryTable::default(),
                    rpc_results: HashMap::new(),
                    rpc_blocking_calls: HashSet::new(),
                    dataloggers: Vec::new(),
                    persistent_dirty: false,
                    dispatcher: None,
                    server: true,
                }),
                rpc_results_cond: Condvar::new(),
                terminating: AtomicBool::new(false),
                notifier,
                rpc_handler,
            }),
        }
    }

    /// Attach the outbound message queue and fix the replication role.
    pub fn set_dispatcher(&self, dispatcher: Arc<dyn Dispatcher>, server: bool) {
        let mut inner = self.core.lock();
        inner.dispatcher = Some(dispatcher);
        inner.server = server;
    }

    pub fn clear_dispatcher(&self) {
        self.core.lock().dispatcher = None;
    }

    /// Unblock all RPC waiters; they return cancelled.
    pub fn terminate(&self) {
        self.core.terminating.store(true, Ordering::SeqCst);
        self.core.rpc_results_cond.notify_all();
    }

    /// Entry value type for a network id. Needed by 2.0-protocol decoding,
    /// where updates don't carry their type on the wire.
    pub fn get_message_entry_type(&self, id: u32) -> EntryType {
        let inner = self.core.lock();
        let Some(local_id) = inner.table.by_net_id(id) else {
            return EntryType::Unassigned;
        };
        match &inner.table.entries[local_id].value {
            Some(value) => value.entry_type(),
            None => EntryType::Unassigned,
        }
    }

    /// Stable local id for a name, creating a vacant entry if absent.
    /// The empty name has no entry.
    pub fn get_entry(&self, name: &str) -> Option<usize> {
        if name.is_empty() {
            return None;
        }
        let mut inner = self.core.lock();
        Some(inner.table.get_or_new(name))
    }

    pub fn get_entry_value(&self, name: &str) -> Option<Value> {
        let inner = self.core.lock();
        let local_id = inner.table.local_id(name)?;
        inner.table.entries[local_id].value.clone()
    }

    pub fn get_entry_value_by_id(&self, local_id: usize) -> Option<Value> {
        let inner = self.core.lock();
        inner.table.get(local_id)?.value.clone()
    }

    /// Set a value only if the entry has none yet. Returns whether the entry
    /// (now or already) holds a value of this type.
    pub fn set_default_entry_value(&self, name: &str, value: Value) -> bool {
        if name.is_empty() {
            return false;
        }
        let mut out = Vec::new();
        let dispatcher;
        {
            let mut inner = self.core.lock();
            let local_id = inner.table.get_or_new(name);
            if let Some(existing) = &inner.table.entries[local_id].value {
                return existing.entry_type() == value.entry_type();
            }
            self.core
                .set_entry_value_impl(&mut inner, local_id, value, true, &mut out);
            dispatcher = inner.dispatcher.clone();
        }
        queue_all(dispatcher, out);
        true
    }

    pub fn set_default_entry_value_by_id(&self, local_id: usize, value: Value) -> bool {
        let mut out = Vec::new();
        let dispatcher;
        {
            let mut inner = self.core.lock();
            if local_id >= inner.table.entries.len() {
                return false;
            }
            if let Some(existing) = &inner.table.entries[local_id].value {
                return existing.entry_type() == value.entry_type();
            }
            self.core
                .set_entry_value_impl(&mut inner, local_id, value, true, &mut out);
            dispatcher = inner.dispatcher.clone();
        }
        queue_all(dispatcher, out);
        true
    }

    /// Store a value; rejects type changes on an existing value. The empty
    /// name is accepted as a no-op.
    pub fn set_entry_value(&self, name: &str, value: Value) -> bool {
        if name.is_empty() {
            return true;
        }
        let mut out = Vec::new();
        let dispatcher;
        {
            let mut inner = self.core.lock();
            let local_id = inner.table.get_or_new(name);
            if let Some(existing) = &inner.table.entries[local_id].value {
                if existing.entry_type() != value.entry_type() {
                    return false;
                }
            }
            self.core
                .set_entry_value_impl(&mut inner, local_id, value, true, &mut out);
            dispatcher = inner.dispatcher.clone();
        }
        queue_all(dispatcher, out);
        true
    }

    pub fn set_entry_value_by_id(&self, local_id: usize, value: Value) -> bool {
        let mut out = Vec::new();
        let dispatcher;
        {
            let mut inner = self.core.lock();
            if local_id >= inner.table.entries.len() {
                return true;
            }
            if let Some(existing) = &inner.table.entries[local_id].value {
                if existing.entry_type() != value.entry_type() {
                    return false;
                }
            }
            self.core
                .set_entry_value_impl(&mut inner, local_id, value, true, &mut out);
            dispatcher = inner.dispatcher.clone();
        }
        queue_all(dispatcher, out);
        true
    }

    /// Store a value, allowing the type to change. A type change goes out as
    /// a fresh assignment rather than an update.
    pub fn set_entry_type_value(&self, name: &str, value: Value) {
        if name.is_empty() {
            return;
        }
        let mut out = Vec::new();
        let dispatcher;
        {
            let mut inner = self.core.lock();
            let local_id = inner.table.get_or_new(name);
            self.core
                .set_entry_value_impl(&mut inner, local_id, value, true, &mut out);
            dispatcher = inner.dispatcher.clone();
        }
        queue_all(dispatcher, out);
    }

    pub fn set_entry_type_value_by_id(&self, local_id: usize, value: Value) {
        let mut out = Vec::new();
        let dispatcher;
        {
            let mut inner = self.core.lock();
            if local_id >= inner.table.entries.len() {
                return;
            }
            self.core
                .set_entry_value_impl(&mut inner, local_id, value, true, &mut out);
            dispatcher = inner.dispatcher.clone();
        }
        queue_all(dispatcher, out);
    }

    pub fn set_entry_flags(&self, name: &str, flags: u32) {
        if name.is_empty() {
            return;
        }
        let mut out = Vec::new();
        let dispatcher;
        {
            let mut inner = self.core.lock();
            let Some(local_id) = inner.table.local_id(name) else {
                return;
            };
            self.core
                .set_entry_flags_impl(&mut inner, local_id, flags, true, &mut out);
            dispatcher = inner.dispatcher.clone();
        }
        queue_all(dispatcher, out);
    }

    pub fn set_entry_flags_by_id(&self, local_id: usize, flags: u32) {
        let mut out = Vec::new();
        let dispatcher;
        {
            let mut inner = self.core.lock();
            if local_id >= inner.table.entries.len() {
                return;
            }
            self.core
                .set_entry_flags_impl(&mut inner, local_id, flags, true, &mut out);
            dispatcher = inner.dispatcher.clone();
        }
        queue_all(dispatcher, out);
    }

    pub fn get_entry_flags(&self, name: &str) -> u32 {
        let inner = self.core.lock();
        match inner.table.local_id(name) {
            Some(local_id) => inner.table.entries[local_id].flags,
            None => 0,
        }
    }

    pub fn get_entry_flags_by_id(&self, local_id: usize) -> u32 {
        let inner = self.core.lock();
        inner.table.get(local_id).map_or(0, |entry| entry.flags)
    }

    pub fn delete_entry(&self, name: &str) {
        let mut out = Vec::new();
        let dispatcher;
        {
            let mut inner = self.core.lock();
            let Some(local_id) = inner.table.local_id(name) else {
                return;
            };
            self.core
                .delete_entry_impl(&mut inner, local_id, true, &mut out);
            dispatcher = inner.dispatcher.clone();
        }
        queue_all(dispatcher, out);
    }

    pub fn delete_entry_by_id(&self, local_id: usize) {
        let mut out = Vec::new();
        let dispatcher;
        {
            let mut inner = self.core.lock();
            if local_id >= inner.table.entries.len() {
                return;
            }
            self.core
                .delete_entry_impl(&mut inner, local_id, true, &mut out);
            dispatcher = inner.dispatcher.clone();
        }
        queue_all(dispatcher, out);
    }

    /// Delete every non-persistent entry and tell the peers once.
    pub fn delete_all_entries(&self) {
        let dispatcher;
        {
            let mut inner = self.core.lock();
            if inner.table.is_empty() {
                return;
            }
            self.core
                .delete_all_entries_impl(&mut inner, true, |entry| !entry.is_persistent());
            dispatcher = inner.dispatcher.clone();
        }
        if let Some(dispatcher) = dispatcher {
            dispatcher.queue_outgoing(Message::ClearEntries, None, None);
        }
    }

    /// Local ids of valued entries matching a name prefix and, when
    /// `types != 0`, an OR of [`EntryType`] bits.
    pub fn get_entries(&self, prefix: &str, types: u32) -> Vec<usize> {
        let inner = self.core.lock();
        let mut ids = Vec::new();
        for entry in &inner.table.entries {
            let Some(value) = &entry.value else { continue };
            if !entry.name.starts_with(prefix) {
                continue;
            }
            if types != 0 && types & value.entry_type().bit() == 0 {
                continue;
            }
            ids.push(entry.local_id);
        }
        ids
    }

    pub fn get_entry_info(&self, inst: i32, prefix: &str, types: u32) -> Vec<EntryInfo> {
        let inner = self.core.lock();
        let mut infos = Vec::new();
        for entry in &inner.table.entries {
            let Some(value) = &entry.value else { continue };
            if !entry.name.starts_with(prefix) {
                continue;
            }
            if types != 0 && types & value.entry_type().bit() == 0 {
                continue;
            }
            infos.push(EntryInfo {
                entry: Handle::new(inst, entry.local_id as i32, HandleType::Entry),
                name: entry.name.clone(),
                entry_type: value.entry_type(),
                flags: entry.flags,
                last_change: value.time(),
            });
        }
        infos
    }

    pub fn get_entry_info_by_id(&self, inst: i32, local_id: usize) -> EntryInfo {
        let inner = self.core.lock();
        let Some(entry) = inner.table.get(local_id) else {
            return EntryInfo::default();
        };
        let Some(value) = &entry.value else {
            return EntryInfo::default();
        };
        EntryInfo {
            entry: Handle::new(inst, local_id as i32, HandleType::Entry),
            name: entry.name.clone(),
            entry_type: value.entry_type(),
            flags: entry.flags,
            last_change: value.time(),
        }
    }

    pub fn get_entry_name(&self, local_id: usize) -> Option<String> {
        let inner = self.core.lock();
        inner.table.get(local_id).map(|entry| entry.name.clone())
    }

    pub fn get_entry_type(&self, local_id: usize) -> EntryType {
        let inner = self.core.lock();
        inner
            .table
            .get(local_id)
            .and_then(|entry| entry.value.as_ref())
            .map_or(EntryType::Unassigned, Value::entry_type)
    }

    pub fn get_entry_last_change(&self, local_id: usize) -> u64 {
        let inner = self.core.lock();
        inner
            .table
            .get(local_id)
            .and_then(|entry| entry.value.as_ref())
            .map_or(0, Value::time)
    }

    /// Register a prefix listener with the notifier, delivering immediate
    /// NEW notifications for already-valued entries when asked.
    pub fn add_listener(&self, prefix: &str, callback: ListenerCallback, flags: u32) -> usize {
        let inner = self.core.lock();
        let uid = self.core.notifier.add_listener(callback, prefix, flags);
        if flags & NOTIFY_IMMEDIATE != 0 && flags & NOTIFY_NEW != 0 {
            for entry in &inner.table.entries {
                let Some(value) = &entry.value else { continue };
                if !entry.name.starts_with(prefix) {
                    continue;
                }
                self.core.notifier.notify_entry(
                    entry.local_id,
                    &entry.name,
                    value,
                    NOTIFY_IMMEDIATE | NOTIFY_NEW,
                    Some(uid),
                );
            }
        }
        uid
    }

    pub fn add_entry_listener(
        &self,
        local_id: usize,
        callback: ListenerCallback,
        flags: u32,
    ) -> usize {
        let inner = self.core.lock();
        let uid = self.core.notifier.add_entry_listener(callback, local_id, flags);
        if flags & NOTIFY_IMMEDIATE != 0 && flags & NOTIFY_NEW != 0 {
            if let Some(entry) = inner.table.get(local_id) {
                if let Some(value) = &entry.value {
                    self.core.notifier.notify_entry(
                        local_id,
                        &entry.name,
                        value,
                        NOTIFY_IMMEDIATE | NOTIFY_NEW,
                        Some(uid),
                    );
                }
            }
        }
        uid
    }

    pub fn add_polled_listener(&self, poller_uid: usize, prefix: &str, flags: u32) -> usize {
        let inner = self.core.lock();
        let uid = self.core.notifier.add_polled_listener(poller_uid, prefix, flags);
        if flags & NOTIFY_IMMEDIATE != 0 && flags & NOTIFY_NEW != 0 {
            for entry in &inner.table.entries {
                let Some(value) = &entry.value else { continue };
                if !entry.name.starts_with(prefix) {
                    continue;
                }
                self.core.notifier.notify_entry(
                    entry.local_id,
                    &entry.name,
                    value,
                    NOTIFY_IMMEDIATE | NOTIFY_NEW,
                    Some(uid),
                );
            }
        }
        uid
    }

    pub fn add_polled_entry_listener(
        &self,
        poller_uid: usize,
        local_id: usize,
        flags: u32,
    ) -> usize {
        let inner = self.core.lock();
        let uid = self
            .core
            .notifier
            .add_polled_entry_listener(poller_uid, local_id, flags);
        if flags & NOTIFY_IMMEDIATE != 0 && flags & NOTIFY_NEW != 0 {
            if let Some(entry) = inner.table.get(local_id) {
                if let Some(value) = &entry.value {
                    self.core.notifier.notify_entry(
                        local_id,
                        &entry.name,
                        value,
                        NOTIFY_IMMEDIATE | NOTIFY_NEW,
                        Some(uid),
                    );
                }
            }
        }
        uid
    }
}

impl Drop for Storage {
    fn drop(&mut self) {
        self.terminate();
    }
}
