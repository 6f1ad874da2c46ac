//! Data-log fan-out: entries matching a registered logger prefix stream
//! their values into the logger's sink.

use std::sync::Arc;

use crate::core::value::now;
use crate::core::{EntryType, Value, ValueData};
use crate::datalog::{
    DataLogSink, LOG_METADATA, TYPE_BOOLEAN, TYPE_BOOLEAN_ARRAY, TYPE_DOUBLE, TYPE_DOUBLE_ARRAY,
    TYPE_RAW, TYPE_STRING, TYPE_STRING_ARRAY,
};
use crate::notify::{NOTIFY_DELETE, NOTIFY_NEW};
use crate::storage::{DataLogEntry, DataLogger, Inner, Storage};

fn log_type_str(entry_type: EntryType) -> Option<&'static str> {
    match entry_type {
        EntryType::Boolean => Some(TYPE_BOOLEAN),
        EntryType::Double => Some(TYPE_DOUBLE),
        EntryType::String => Some(TYPE_STRING),
        EntryType::Raw => Some(TYPE_RAW),
        EntryType::BooleanArray => Some(TYPE_BOOLEAN_ARRAY),
        EntryType::DoubleArray => Some(TYPE_DOUBLE_ARRAY),
        EntryType::StringArray => Some(TYPE_STRING_ARRAY),
        EntryType::Unassigned | EntryType::Rpc => None,
    }
}

fn append(datalogs: &[DataLogEntry], value: &Value) {
    let time = value.time();
    match value.data() {
        ValueData::Boolean(v) => {
            for dl in datalogs {
                dl.sink.append_boolean(dl.entry, *v, time);
            }
        }
        ValueData::Double(v) => {
            for dl in datalogs {
                dl.sink.append_double(dl.entry, *v, time);
            }
        }
        ValueData::String(v) => {
            for dl in datalogs {
                dl.sink.append_string(dl.entry, v, time);
            }
        }
        ValueData::Raw(v) => {
            for dl in datalogs {
                dl.sink.append_raw(dl.entry, v, time);
            }
        }
        ValueData::BooleanArray(v) => {
            for dl in datalogs {
                dl.sink.append_boolean_array(dl.entry, v, time);
            }
        }
        ValueData::DoubleArray(v) => {
            for dl in datalogs {
                dl.sink.append_double_array(dl.entry, v, time);
            }
        }
        ValueData::StringArray(v) => {
            for dl in datalogs {
                dl.sink.append_string_array(dl.entry, v, time);
            }
        }
        ValueData::Rpc(_) => {}
    }
}

/// Called from the notification path, lock held. Lazily opens streams on
/// first touch, reopens on type change, finishes on delete.
pub(crate) fn log_notify(inner: &mut Inner, local_id: usize, flags: u32, value: &Value) {
    if inner.dataloggers.iter().flatten().next().is_none() {
        return;
    }

    // Fast-path the common case of an untracked entry that isn't new.
    if inner.table.entries[local_id].datalogs.is_empty() && flags & NOTIFY_NEW == 0 {
        return;
    }

    if flags & NOTIFY_DELETE != 0 {
        let time = now();
        let entry = &mut inner.table.entries[local_id];
        for dl in entry.datalogs.drain(..) {
            dl.sink.finish(dl.entry, time);
        }
        entry.datalog_type = EntryType::Unassigned;
        return;
    }

    if value.entry_type() != inner.table.entries[local_id].datalog_type {
        {
            let entry = &mut inner.table.entries[local_id];
            if !entry.datalogs.is_empty() {
                // Type changed under a running stream: finish at the new
                // value's timestamp before reopening.
                for dl in entry.datalogs.drain(..) {
                    dl.sink.finish(dl.entry, value.time());
                }
            }
        }

        let Some(type_str) = log_type_str(value.entry_type()) else {
            return; // not a type we log
        };

        let name = inner.table.entries[local_id].name.clone();
        let mut opened = Vec::new();
        for (uid, logger) in inner.dataloggers.iter().enumerate() {
            let Some(logger) = logger else { continue };
            if !name.starts_with(&logger.prefix) {
                continue;
            }
            let log_name = format!("{}{}", logger.log_prefix, &name[logger.prefix.len()..]);
            let entry_id = logger
                .sink
                .start(&log_name, type_str, LOG_METADATA, value.time());
            opened.push(DataLogEntry {
                sink: Arc::clone(&logger.sink),
                entry: entry_id,
                logger_uid: uid,
            });
        }

        if opened.is_empty() {
            return; // nothing to log
        }
        let entry = &mut inner.table.entries[local_id];
        entry.datalogs = opened;
        entry.datalog_type = value.entry_type();
    }

    append(&inner.table.entries[local_id].datalogs, value);
}

impl Storage {
    /// Register a sink for every entry under `prefix`, logging under names
    /// rewritten to `log_prefix`. Already-valued entries start streaming
    /// immediately. Returns the logger uid for [`Storage::stop_data_log`].
    pub fn start_data_log(
        &self,
        sink: Arc<dyn DataLogSink>,
        prefix: &str,
        log_prefix: &str,
    ) -> usize {
        let mut inner = self.core.lock();

        let logger = DataLogger {
            sink: Arc::clone(&sink),
            prefix: prefix.to_string(),
            log_prefix: log_prefix.to_string(),
        };
        let uid = match inner.dataloggers.iter().position(Option::is_none) {
            Some(slot) => {
                inner.dataloggers[slot] = Some(logger);
                slot
            }
            None => {
                inner.dataloggers.push(Some(logger));
                inner.dataloggers.len() - 1
            }
        };

        let time = now();
        for local_id in 0..inner.table.entries.len() {
            let (value, log_name) = {
                let entry = &inner.table.entries[local_id];
                if !entry.name.starts_with(prefix) {
                    continue;
                }
                let Some(value) = &entry.value else { continue };
                let log_name = format!("{log_prefix}{}", &entry.name[prefix.len()..]);
                (value.clone(), log_name)
            };
            let Some(type_str) = log_type_str(value.entry_type()) else {
                continue;
            };
            let entry_id = sink.start(&log_name, type_str, LOG_METADATA, time);
            {
                let entry = &mut inner.table.entries[local_id];
                entry.datalogs.push(DataLogEntry {
                    sink: Arc::clone(&sink),
                    entry: entry_id,
                    logger_uid: uid,
                });
                entry.datalog_type = value.entry_type();
            }
            // Seed the new stream with the current value.
            if let Some(last) = inner.table.entries[local_id].datalogs.last() {
                append(std::slice::from_ref(last), &value);
            }
        }

        uid
    }

    /// Unregister a logger and finish every stream it owns. Must be called
    /// before the sink is retired.
    pub fn stop_data_log(&self, uid: usize) {
        let mut inner = self.core.lock();
        match inner.dataloggers.get_mut(uid) {
            Some(slot) if slot.is_some() => *slot = None,
            _ => return,
        }

        let time = now();
        for entry in &mut inner.table.entries {
            if entry.datalogs.is_empty() {
                continue;
            }
            entry.datalogs.retain(|dl| {
                if dl.logger_uid == uid {
                    dl.sink.finish(dl.entry, time);
                    false
                } else {
                    true
                }
            });
        }
    }
}
