//! Filename-based save/load of table entries.
//!
//! Saves are atomic: write a temp file, rotate the previous file to `.bak`,
//! rename the temp into place, and roll back to the backup if the final
//! rename fails. The dirty flag is cleared before the write and re-asserted
//! on a periodic failure so the next cycle retries.

mod load;
mod save;

use std::fs::{self, File};
use std::io::{self, BufRead, BufReader, Write};
use std::path::Path;

use tracing::debug;

use crate::core::{Message, UNASSIGNED_ID, Value};
use crate::error::{LoadError, SaveError};
use crate::notify::{NOTIFY_FLAGS, NOTIFY_NEW, NOTIFY_UPDATE};
use crate::storage::{PERSISTENT, Storage, StorageCore, queue_all};

impl StorageCore {
    /// Name-sorted snapshot of persistent entries. For a periodic save this
    /// returns `None` when nothing changed; the dirty flag is cleared before
    /// the disk write so a concurrent mutation re-marks it.
    fn persistent_entries(&self, periodic: bool) -> Option<Vec<(String, Value)>> {
        let mut inner = self.lock();
        if periodic && !inner.persistent_dirty {
            return None;
        }
        inner.persistent_dirty = false;
        let mut entries: Vec<(String, Value)> = inner
            .table
            .entries
            .iter()
            .filter(|entry| entry.is_persistent())
            .filter_map(|entry| {
                entry
                    .value
                    .as_ref()
                    .map(|value| (entry.name.clone(), value.clone()))
            })
            .collect();
        drop(inner);
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        Some(entries)
    }

    fn entries_with_prefix(&self, prefix: &str) -> Vec<(String, Value)> {
        let inner = self.lock();
        let mut entries: Vec<(String, Value)> = inner
            .table
            .entries
            .iter()
            .filter(|entry| entry.name.starts_with(prefix))
            .filter_map(|entry| {
                entry
                    .value
                    .as_ref()
                    .map(|value| (entry.name.clone(), value.clone()))
            })
            .collect();
        drop(inner);
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }

    fn set_persistent_dirty(&self) {
        self.lock().persistent_dirty = true;
    }
}

fn save_to_file(path: &Path, text: &str) -> Result<(), SaveError> {
    let tmp = path.with_extension(extended_extension(path, "tmp"));
    let bak = path.with_extension(extended_extension(path, "bak"));

    let mut file = File::create(&tmp).map_err(SaveError::Open)?;
    if let Err(err) = file.write_all(text.as_bytes()).and_then(|()| file.sync_all()) {
        drop(file);
        let _ = fs::remove_file(&tmp);
        return Err(SaveError::Write(err));
    }
    drop(file);

    // Rotate to the real file; backup failures are ignored.
    let _ = fs::remove_file(&bak);
    let _ = fs::rename(path, &bak);
    if let Err(err) = fs::rename(&tmp, path) {
        let _ = fs::rename(&bak, path); // attempt to restore backup
        return Err(SaveError::Rename(err));
    }
    Ok(())
}

fn extended_extension(path: &Path, suffix: &str) -> String {
    match path.extension().and_then(|ext| ext.to_str()) {
        Some(ext) => format!("{ext}.{suffix}"),
        None => suffix.to_string(),
    }
}

impl Storage {
    /// Save all persistent entries. A periodic save is a no-op when nothing
    /// changed; a periodic failure re-marks the table dirty for retry.
    pub fn save_persistent(&self, path: impl AsRef<Path>, periodic: bool) -> Result<(), SaveError> {
        let Some(entries) = self.core.persistent_entries(periodic) else {
            return Ok(());
        };
        let path = path.as_ref();
        debug!(file = %path.display(), "saving persistent file");

        let mut text = String::new();
        save::write_entries(&mut text, &entries);

        let result = save_to_file(path, &text);
        if result.is_err() && periodic {
            self.core.set_persistent_dirty();
        }
        result
    }

    /// Stream variant of [`Storage::save_persistent`], exposed for testing
    /// and embedding.
    pub fn save_persistent_to<W: Write>(&self, writer: &mut W, periodic: bool) -> io::Result<()> {
        let Some(entries) = self.core.persistent_entries(periodic) else {
            return Ok(());
        };
        let mut text = String::new();
        save::write_entries(&mut text, &entries);
        writer.write_all(text.as_bytes())
    }

    /// Save every valued entry under a name prefix, persistent or not.
    pub fn save_entries(&self, path: impl AsRef<Path>, prefix: &str) -> Result<(), SaveError> {
        let entries = self.core.entries_with_prefix(prefix);
        let path = path.as_ref();
        debug!(file = %path.display(), "saving entries file");

        let mut text = String::new();
        save::write_entries(&mut text, &entries);
        save_to_file(path, &text)
    }

    pub fn save_entries_to<W: Write>(&self, writer: &mut W, prefix: &str) -> io::Result<()> {
        let entries = self.core.entries_with_prefix(prefix);
        let mut text = String::new();
        save::write_entries(&mut text, &entries);
        writer.write_all(text.as_bytes())
    }

    /// Load a persistent file, marking every loaded entry persistent.
    /// Per-line problems go to `warn(line, message)` and the load continues.
    pub fn load_persistent(
        &self,
        path: impl AsRef<Path>,
        warn: impl FnMut(usize, &str),
    ) -> Result<(), LoadError> {
        let file = File::open(path.as_ref()).map_err(LoadError::Open)?;
        self.load_entries_from(BufReader::new(file), "", true, warn)
    }

    /// Load entries under a name prefix without forcing the persistent flag.
    pub fn load_entries(
        &self,
        path: impl AsRef<Path>,
        prefix: &str,
        warn: impl FnMut(usize, &str),
    ) -> Result<(), LoadError> {
        let file = File::open(path.as_ref()).map_err(LoadError::Open)?;
        self.load_entries_from(BufReader::new(file), prefix, false, warn)
    }

    /// Stream variant of the loaders.
    pub fn load_entries_from<R: BufRead>(
        &self,
        reader: R,
        prefix: &str,
        persistent: bool,
        mut warn: impl FnMut(usize, &str),
    ) -> Result<(), LoadError> {
        let entries = load::read_entries(reader, prefix, &mut warn)?;
        self.apply_loaded(entries, persistent);
        Ok(())
    }

    /// Merge loaded entries into the table. Loaded state wins: a type
    /// conflict is overwritten rather than rejected, and for a persistent
    /// load the PERSISTENT bit is OR-ed in.
    fn apply_loaded(&self, entries: Vec<(String, Value)>, persistent: bool) {
        let core = &self.core;
        let mut msgs = Vec::new();
        let mut inner = core.lock();

        for (name, value) in entries {
            let local_id = inner.table.get_or_new(&name);
            let old_value = inner.table.entries[local_id].value.replace(value.clone());
            let was_persistent = inner.table.entries[local_id].is_persistent();
            if !was_persistent && persistent {
                inner.table.entries[local_id].flags |= PERSISTENT;
                inner.persistent_dirty = true;
            }

            if inner.server && inner.table.entries[local_id].id == UNASSIGNED_ID {
                inner.table.assign_next_id(local_id);
            }

            if core.notifier.local_notifiers() {
                let changed = old_value.as_ref() != Some(&value);
                if old_value.is_none() {
                    core.notify(&mut inner, local_id, NOTIFY_NEW, true, None);
                } else if changed {
                    let mut notify_flags = NOTIFY_UPDATE;
                    if !was_persistent && persistent {
                        notify_flags |= NOTIFY_FLAGS;
                    }
                    core.notify(&mut inner, local_id, notify_flags, true, None);
                } else if !was_persistent && persistent {
                    core.notify(&mut inner, local_id, NOTIFY_FLAGS, true, None);
                }
            }

            if inner.dispatcher.is_none() {
                continue;
            }
            inner.table.entries[local_id].seq_num.increment();

            let type_changed = match &old_value {
                None => true,
                Some(old) => old.entry_type() != value.entry_type(),
            };
            let entry = &inner.table.entries[local_id];
            if type_changed {
                msgs.push(Message::EntryAssign {
                    name: entry.name.clone(),
                    id: entry.id,
                    seq_num: entry.seq_num,
                    value,
                    flags: entry.flags,
                });
            } else if entry.id != UNASSIGNED_ID {
                // An update with no assigned id is deferred to the eventual
                // assignment.
                if old_value.as_ref() != Some(&value) {
                    msgs.push(Message::EntryUpdate {
                        id: entry.id,
                        seq_num: entry.seq_num,
                        value,
                    });
                }
                if !was_persistent && persistent {
                    msgs.push(Message::FlagsUpdate {
                        id: entry.id,
                        flags: entry.flags,
                    });
                }
            }
        }

        let dispatcher = inner.dispatcher.clone();
        drop(inner);
        queue_all(dispatcher, msgs);
    }
}
