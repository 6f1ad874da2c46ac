//! The entry table: one arena of entries with name and network-id views.

use std::collections::HashMap;
use std::sync::Arc;

use crate::core::{EntryType, SequenceNumber, UNASSIGNED_ID, Value};
use crate::datalog::DataLogSink;
use crate::storage::PERSISTENT;

/// One live data-log stream attached to an entry.
pub(crate) struct DataLogEntry {
    pub sink: Arc<dyn DataLogSink>,
    pub entry: i32,
    pub logger_uid: usize,
}

/// Data for one table entry. The slot survives deletion so local ids stay
/// valid for the process lifetime.
pub(crate) struct Entry {
    /// Stored redundantly so id-map lookups don't need the name map.
    pub name: String,
    pub value: Option<Value>,
    pub flags: u32,
    /// Network id; assigned by the server, so on a client this stays
    /// [`UNASSIGNED_ID`] until an assignment comes back.
    pub id: u32,
    pub local_id: usize,
    pub seq_num: SequenceNumber,
    /// Whether this process wrote the value. Drives the client handshake
    /// decision to keep or drop local state.
    pub local_write: bool,
    pub rpc_uid: Option<usize>,
    /// Last uid used when calling this RPC; incremented per call.
    pub rpc_call_uid: u16,
    pub datalogs: Vec<DataLogEntry>,
    pub datalog_type: EntryType,
}

impl Entry {
    fn new(name: String, local_id: usize) -> Self {
        Self {
            name,
            value: None,
            flags: 0,
            id: UNASSIGNED_ID,
            local_id,
            seq_num: SequenceNumber::default(),
            local_write: false,
            rpc_uid: None,
            rpc_call_uid: 0,
            datalogs: Vec::new(),
            datalog_type: EntryType::Unassigned,
        }
    }

    pub fn is_persistent(&self) -> bool {
        self.flags & PERSISTENT != 0
    }
}

/// Three views of the same entries: by name, by network id, by local id.
/// The arena owns; the maps hold indices into it.
#[derive(Default)]
pub(crate) struct EntryTable {
    names: HashMap<String, usize>,
    id_map: Vec<Option<usize>>,
    pub entries: Vec<Entry>,
}

impl EntryTable {
    pub fn get_or_new(&mut self, name: &str) -> usize {
        if let Some(&local_id) = self.names.get(name) {
            return local_id;
        }
        let local_id = self.entries.len();
        self.entries.push(Entry::new(name.to_string(), local_id));
        self.names.insert(name.to_string(), local_id);
        local_id
    }

    pub fn local_id(&self, name: &str) -> Option<usize> {
        self.names.get(name).copied()
    }

    pub fn get(&self, local_id: usize) -> Option<&Entry> {
        self.entries.get(local_id)
    }

    /// Resolve a network id to a local id.
    pub fn by_net_id(&self, id: u32) -> Option<usize> {
        self.id_map.get(id as usize).copied().flatten()
    }

    /// Record `id -> local_id`, growing the id map as needed.
    pub fn set_net_id(&mut self, id: u32, local_id: usize) {
        let index = id as usize;
        if index >= self.id_map.len() {
            self.id_map.resize(index + 1, None);
        }
        self.id_map[index] = Some(local_id);
    }

    pub fn clear_net_id(&mut self, id: u32) {
        if let Some(slot) = self.id_map.get_mut(id as usize) {
            *slot = None;
        }
    }

    /// Server-side id assignment: the next id is the current map length.
    pub fn assign_next_id(&mut self, local_id: usize) -> u32 {
        let id = self.id_map.len() as u32;
        self.entries[local_id].id = id;
        self.id_map.push(Some(local_id));
        id
    }

    pub fn clear_id_map(&mut self) {
        self.id_map.clear();
    }

    pub fn id_map_len(&self) -> usize {
        self.id_map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}
