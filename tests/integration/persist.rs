//! Persistent save/load through the engine.

use std::io::Cursor;
use std::sync::Mutex;

use nettable::notify::{NOTIFY_FLAGS, NOTIFY_LOCAL, NOTIFY_NEW, NOTIFY_UPDATE};
use nettable::storage::PERSISTENT;
use nettable::{EntryType, LoadError, Message, Value};

use crate::fixtures::Rig;

fn populate_persistent(rig: &Rig) {
    let s = &rig.storage;
    s.set_entry_type_value("boolean/true", Value::boolean(true));
    s.set_entry_type_value("boolean/false", Value::boolean(false));
    s.set_entry_type_value("double/neg", Value::double(-1.5));
    s.set_entry_type_value("double/zero", Value::double(0.0));
    s.set_entry_type_value("double/big", Value::double(1.3e8));
    s.set_entry_type_value("string/empty", Value::string(""));
    s.set_entry_type_value("string/normal", Value::string("hello"));
    s.set_entry_type_value("string/special", Value::string("\x00\x03\x05\n"));
    s.set_entry_type_value("string/quoted", Value::string("\"a\""));
    s.set_entry_type_value("raw/empty", Value::raw(&b""[..]));
    s.set_entry_type_value("raw/normal", Value::raw(&b"hello"[..]));
    s.set_entry_type_value("raw/special", Value::raw(&b"\x00\x03\x05\n"[..]));
    s.set_entry_type_value("booleanarr/empty", Value::boolean_array(vec![]));
    s.set_entry_type_value("booleanarr/one", Value::boolean_array(vec![true]));
    s.set_entry_type_value("booleanarr/two", Value::boolean_array(vec![true, false]));
    s.set_entry_type_value("doublearr/empty", Value::double_array(vec![]));
    s.set_entry_type_value("doublearr/one", Value::double_array(vec![0.5]));
    s.set_entry_type_value("doublearr/two", Value::double_array(vec![0.5, -0.25]));
    s.set_entry_type_value("stringarr/empty", Value::string_array(vec![]));
    s.set_entry_type_value("stringarr/one", Value::string_array(vec!["hello".to_string()]));
    s.set_entry_type_value(
        "stringarr/two",
        Value::string_array(vec!["hello".to_string(), "world\n".to_string()]),
    );
    s.set_entry_type_value("\x00\x03\x05\n", Value::boolean(true));
    s.set_entry_type_value("=", Value::boolean(true));

    for local_id in s.get_entries("", 0) {
        s.set_entry_flags_by_id(local_id, PERSISTENT);
    }
}

const SAVED: &str = "\
[NetworkTables Storage 3.0]
boolean \"\\x00\\x03\\x05\\n\"=true
boolean \"\\x3D\"=true
boolean \"boolean/false\"=false
boolean \"boolean/true\"=true
array boolean \"booleanarr/empty\"=
array boolean \"booleanarr/one\"=true
array boolean \"booleanarr/two\"=true,false
double \"double/big\"=1.3e+08
double \"double/neg\"=-1.5
double \"double/zero\"=0
array double \"doublearr/empty\"=
array double \"doublearr/one\"=0.5
array double \"doublearr/two\"=0.5,-0.25
raw \"raw/empty\"=
raw \"raw/normal\"=aGVsbG8=
raw \"raw/special\"=AAMFCg==
string \"string/empty\"=\"\"
string \"string/normal\"=\"hello\"
string \"string/quoted\"=\"\\\"a\\\"\"
string \"string/special\"=\"\\x00\\x03\\x05\\n\"
array string \"stringarr/empty\"=
array string \"stringarr/one\"=\"hello\"
array string \"stringarr/two\"=\"hello\",\"world\\n\"
";

#[test]
fn save_is_byte_exact_and_name_sorted() {
    let rig = Rig::server();
    populate_persistent(&rig);

    let mut out = Vec::new();
    rig.storage.save_persistent_to(&mut out, false).unwrap();
    assert_eq!(String::from_utf8(out).unwrap(), SAVED);
}

#[test]
fn save_without_persistent_entries_is_header_only() {
    let rig = Rig::server();
    rig.storage.set_entry_type_value("volatile", Value::double(1.0));

    let mut out = Vec::new();
    rig.storage.save_persistent_to(&mut out, false).unwrap();
    assert_eq!(String::from_utf8(out).unwrap(), "[NetworkTables Storage 3.0]\n");
}

#[test]
fn periodic_save_skips_when_clean() {
    let rig = Rig::server();
    rig.storage.set_entry_type_value("p", Value::double(1.0));
    rig.storage.set_entry_flags("p", PERSISTENT);

    let mut out = Vec::new();
    rig.storage.save_persistent_to(&mut out, true).unwrap();
    assert!(!out.is_empty(), "dirty table saves");

    // Nothing changed since; the next periodic save writes nothing.
    let mut out = Vec::new();
    rig.storage.save_persistent_to(&mut out, true).unwrap();
    assert!(out.is_empty());

    // A persistent mutation re-marks the table.
    rig.storage.set_entry_value("p", Value::double(2.0));
    let mut out = Vec::new();
    rig.storage.save_persistent_to(&mut out, true).unwrap();
    assert!(!out.is_empty());
}

#[test]
fn save_and_load_files_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("storage.ini");

    let rig = Rig::server();
    populate_persistent(&rig);
    rig.storage.save_persistent(&path, false).unwrap();

    let rig2 = Rig::server();
    let warnings = Mutex::new(Vec::new());
    rig2.storage
        .load_persistent(&path, |line, msg| {
            warnings.lock().unwrap().push((line, msg.to_string()));
        })
        .unwrap();
    assert!(warnings.lock().unwrap().is_empty());

    assert_eq!(
        rig2.storage.get_entry_value("boolean/true"),
        Some(Value::boolean(true))
    );
    assert_eq!(
        rig2.storage.get_entry_value("double/big"),
        Some(Value::double(1.3e8))
    );
    assert_eq!(
        rig2.storage.get_entry_value("raw/special"),
        Some(Value::raw(&b"\x00\x03\x05\n"[..]))
    );
    assert_eq!(
        rig2.storage.get_entry_value("\x00\x03\x05\n"),
        Some(Value::boolean(true))
    );
    assert_eq!(rig2.storage.get_entry_value("="), Some(Value::boolean(true)));
    assert_eq!(rig2.storage.get_entry_flags("="), PERSISTENT);
    assert_eq!(rig2.storage.get_entries("", 0).len(), 23);

    // Saving it back reproduces the same bytes.
    let mut out = Vec::new();
    rig2.storage.save_persistent_to(&mut out, false).unwrap();
    assert_eq!(String::from_utf8(out).unwrap(), SAVED);
}

#[test]
fn resave_rotates_a_backup() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("storage.ini");

    let rig = Rig::server();
    rig.storage.set_entry_type_value("p", Value::double(1.0));
    rig.storage.set_entry_flags("p", PERSISTENT);
    rig.storage.save_persistent(&path, false).unwrap();

    rig.storage.set_entry_value("p", Value::double(2.0));
    rig.storage.save_persistent(&path, false).unwrap();

    let bak = dir.path().join("storage.ini.bak");
    assert!(bak.exists());
    let old = std::fs::read_to_string(&bak).unwrap();
    let new = std::fs::read_to_string(&path).unwrap();
    assert!(old.contains("=1\n"));
    assert!(new.contains("=2\n"));
}

#[test]
fn load_missing_file_is_an_open_error() {
    let rig = Rig::server();
    let result = rig
        .storage
        .load_persistent("/nonexistent/storage.ini", |_, _| {});
    assert!(matches!(result, Err(LoadError::Open(_))));
}

#[test]
fn loaded_new_entry_is_assigned_and_announced() {
    let rig = Rig::server();
    let input = "[NetworkTables Storage 3.0]\nboolean \"foo\"=true\n";
    rig.storage
        .load_entries_from(Cursor::new(input), "", true, |_, _| {})
        .unwrap();

    assert_eq!(
        rig.storage.get_entry_value("foo"),
        Some(Value::boolean(true))
    );
    assert_eq!(rig.storage.get_entry_flags("foo"), PERSISTENT);

    let events = rig.notifier.take();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].flags, NOTIFY_NEW | NOTIFY_LOCAL);

    let sent = rig.dispatcher.take();
    assert_eq!(sent.len(), 1);
    let Message::EntryAssign { id, seq_num, flags, .. } = &sent[0].msg else {
        panic!("expected assign, got {:?}", sent[0].msg);
    };
    assert_eq!(*id, 0);
    assert_eq!(seq_num.value(), 1);
    assert_eq!(*flags, PERSISTENT);
}

#[test]
fn load_onto_equal_value_updates_flags_only() {
    let rig = Rig::server();
    rig.storage.set_entry_type_value("foo", Value::double(0.0));
    rig.dispatcher.take();
    rig.notifier.take();

    let input = "[NetworkTables Storage 3.0]\ndouble \"foo\"=0.0\n";
    rig.storage
        .load_entries_from(Cursor::new(input), "", true, |_, _| {})
        .unwrap();

    let events = rig.notifier.take();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].flags, NOTIFY_FLAGS | NOTIFY_LOCAL);

    let sent = rig.dispatcher.take();
    assert_eq!(sent.len(), 1);
    assert_eq!(
        sent[0].msg,
        Message::FlagsUpdate {
            id: 0,
            flags: PERSISTENT
        }
    );
}

#[test]
fn load_onto_changed_value_updates_value_and_flags() {
    let rig = Rig::server();
    rig.storage.set_entry_type_value("foo", Value::double(0.0)); // seq 1
    rig.dispatcher.take();
    rig.notifier.take();

    let input = "[NetworkTables Storage 3.0]\ndouble \"foo\"=1.0\n";
    rig.storage
        .load_entries_from(Cursor::new(input), "", true, |_, _| {})
        .unwrap();

    assert_eq!(rig.storage.get_entry_value("foo"), Some(Value::double(1.0)));

    let events = rig.notifier.take();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].flags, NOTIFY_UPDATE | NOTIFY_FLAGS | NOTIFY_LOCAL);

    let sent = rig.dispatcher.take();
    assert_eq!(sent.len(), 2);
    let Message::EntryUpdate { id, seq_num, value } = &sent[0].msg else {
        panic!("expected update, got {:?}", sent[0].msg);
    };
    assert_eq!(*id, 0);
    assert_eq!(seq_num.value(), 2);
    assert_eq!(*value, Value::double(1.0));
    assert_eq!(
        sent[1].msg,
        Message::FlagsUpdate {
            id: 0,
            flags: PERSISTENT
        }
    );
}

#[test]
fn loaded_type_conflict_is_overwritten() {
    let rig = Rig::server();
    rig.storage
        .set_entry_type_value("foo", Value::boolean(true));
    rig.dispatcher.take();

    let input = "[NetworkTables Storage 3.0]\ndouble \"foo\"=1.5\n";
    rig.storage
        .load_entries_from(Cursor::new(input), "", true, |_, _| {})
        .unwrap();

    assert_eq!(rig.storage.get_entry_value("foo"), Some(Value::double(1.5)));
    assert_eq!(rig.storage.get_entry_type(rig.storage.get_entry("foo").unwrap()), EntryType::Double);

    // The type change goes out as a fresh assignment.
    let sent = rig.dispatcher.take();
    assert_eq!(sent.len(), 1);
    assert!(matches!(sent[0].msg, Message::EntryAssign { .. }));
}

#[test]
fn load_entries_applies_prefix_without_persistence() {
    let rig = Rig::server();
    let input =
        "[NetworkTables Storage 3.0]\nboolean \"a/x\"=true\nboolean \"b/y\"=true\n";
    rig.storage
        .load_entries_from(Cursor::new(input), "a/", false, |_, _| {})
        .unwrap();

    assert_eq!(
        rig.storage.get_entry_value("a/x"),
        Some(Value::boolean(true))
    );
    assert_eq!(rig.storage.get_entry_value("b/y"), None);
    assert_eq!(rig.storage.get_entry_flags("a/x"), 0);
}

#[test]
fn save_entries_filters_by_prefix() {
    let rig = Rig::server();
    rig.storage.set_entry_type_value("a/x", Value::boolean(true));
    rig.storage.set_entry_type_value("b/y", Value::boolean(true));

    let mut out = Vec::new();
    rig.storage.save_entries_to(&mut out, "a/").unwrap();
    let text = String::from_utf8(out).unwrap();
    assert!(text.contains("\"a/x\""));
    assert!(!text.contains("\"b/y\""));
}

#[test]
fn bad_header_aborts_and_warns() {
    let rig = Rig::server();
    let warnings = Mutex::new(Vec::new());
    let result = rig.storage.load_entries_from(
        Cursor::new("[NetworkTables"),
        "",
        true,
        |line, msg| {
            warnings.lock().unwrap().push((line, msg.to_string()));
        },
    );
    assert!(matches!(result, Err(LoadError::BadHeader)));
    assert_eq!(
        *warnings.lock().unwrap(),
        vec![(1, "header line mismatch, ignoring rest of file".to_string())]
    );
    assert!(rig.storage.get_entries("", 0).is_empty());
}
