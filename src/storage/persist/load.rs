//! Tolerant line parser for the persistent storage format.
//!
//! Blank lines, `;`/`#` comments, and anything before the header are
//! skipped. A bad header aborts the whole load; a bad entry line produces
//! one warning and parsing continues.

use std::io::BufRead;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use bytes::Bytes;

use super::save::HEADER;
use crate::core::{EntryType, Value};
use crate::error::LoadError;

pub(crate) fn read_entries<R: BufRead>(
    mut reader: R,
    prefix: &str,
    warn: &mut dyn FnMut(usize, &str),
) -> Result<Vec<(String, Value)>, LoadError> {
    let mut entries = Vec::new();
    let mut buf = Vec::new();
    let mut line_num = 0usize;
    let mut header_seen = false;

    loop {
        buf.clear();
        let read = reader.read_until(b'\n', &mut buf).map_err(LoadError::Read)?;
        if read == 0 {
            break;
        }
        line_num += 1;

        while buf.last() == Some(&b'\n') || buf.last() == Some(&b'\r') {
            buf.pop();
        }
        let line = String::from_utf8_lossy(&buf);
        let line = line.as_ref();

        if line.is_empty() || line.starts_with(';') || line.starts_with('#') {
            continue;
        }

        if !header_seen {
            if line != HEADER {
                warn(line_num, "header line mismatch, ignoring rest of file");
                return Err(LoadError::BadHeader);
            }
            header_seen = true;
            continue;
        }

        match parse_line(line) {
            Ok((name, value)) => {
                // Empty names never made it into a valid save; drop quietly.
                if name.is_empty() || !name.starts_with(prefix) {
                    continue;
                }
                entries.push((name, value));
            }
            Err(msg) => warn(line_num, msg),
        }
    }

    if !header_seen {
        warn(line_num.max(1), "header line mismatch, ignoring rest of file");
        return Err(LoadError::BadHeader);
    }

    Ok(entries)
}

fn parse_line(line: &str) -> Result<(String, Value), &'static str> {
    let (entry_type, rest) = parse_type(line)?;
    let (name, rest) = parse_quoted(rest)?;
    let rest = rest.strip_prefix('=').ok_or("expected '=' after name")?;
    let value = parse_value(entry_type, rest)?;
    Ok((name, value))
}

fn parse_type(line: &str) -> Result<(EntryType, &str), &'static str> {
    const TAGS: [(&str, EntryType); 7] = [
        ("boolean ", EntryType::Boolean),
        ("double ", EntryType::Double),
        ("string ", EntryType::String),
        ("raw ", EntryType::Raw),
        ("array boolean ", EntryType::BooleanArray),
        ("array double ", EntryType::DoubleArray),
        ("array string ", EntryType::StringArray),
    ];
    for (tag, entry_type) in TAGS {
        if let Some(rest) = line.strip_prefix(tag) {
            return Ok((entry_type, rest));
        }
    }
    Err("unrecognized type")
}

/// Read a double-quoted, escaped string; returns it unescaped plus the text
/// after the closing quote.
fn parse_quoted(s: &str) -> Result<(String, &str), &'static str> {
    let bytes = s.as_bytes();
    if bytes.first() != Some(&b'"') {
        return Err("expected quoted string");
    }
    let mut out: Vec<u8> = Vec::new();
    let mut i = 1;
    while i < bytes.len() {
        match bytes[i] {
            b'"' => {
                return Ok((String::from_utf8_lossy(&out).into_owned(), &s[i + 1..]));
            }
            b'\\' => {
                i += 1;
                match bytes.get(i) {
                    None => return Err("unterminated string"),
                    Some(b'\\') => out.push(b'\\'),
                    Some(b'"') => out.push(b'"'),
                    Some(b't') => out.push(b'\t'),
                    Some(b'n') => out.push(b'\n'),
                    Some(b'x') => {
                        let mut value: u8 = 0;
                        let mut digits = 0;
                        while digits < 2 {
                            let Some(digit) = bytes
                                .get(i + 1)
                                .and_then(|b| (*b as char).to_digit(16))
                            else {
                                break;
                            };
                            value = (value << 4) | digit as u8;
                            i += 1;
                            digits += 1;
                        }
                        if digits == 0 {
                            out.push(b'x');
                        } else {
                            out.push(value);
                        }
                    }
                    Some(&other) => {
                        // Unknown escape passes through untouched.
                        out.push(b'\\');
                        out.push(other);
                    }
                }
                i += 1;
            }
            byte => {
                out.push(byte);
                i += 1;
            }
        }
    }
    Err("unterminated string")
}

fn parse_bool(token: &str) -> Result<bool, &'static str> {
    match token {
        "true" => Ok(true),
        "false" => Ok(false),
        _ => Err("unrecognized boolean value, not 'true' or 'false'"),
    }
}

fn parse_value(entry_type: EntryType, rest: &str) -> Result<Value, &'static str> {
    match entry_type {
        EntryType::Boolean => Ok(Value::boolean(parse_bool(rest)?)),
        EntryType::Double => {
            let value: f64 = rest.trim().parse().map_err(|_| "invalid double value")?;
            Ok(Value::double(value))
        }
        EntryType::String => {
            let (value, _) = parse_quoted(rest)?;
            Ok(Value::string(value))
        }
        EntryType::Raw => {
            let decoded = STANDARD
                .decode(rest.trim_end())
                .map_err(|_| "invalid base64 value")?;
            Ok(Value::raw(Bytes::from(decoded)))
        }
        EntryType::BooleanArray => {
            if rest.is_empty() {
                return Ok(Value::boolean_array(Vec::new()));
            }
            let mut values = Vec::new();
            for token in rest.split(',') {
                values.push(parse_bool(token.trim())?);
            }
            Ok(Value::boolean_array(values))
        }
        EntryType::DoubleArray => {
            if rest.is_empty() {
                return Ok(Value::double_array(Vec::new()));
            }
            let mut values = Vec::new();
            for token in rest.split(',') {
                values.push(token.trim().parse().map_err(|_| "invalid double value")?);
            }
            Ok(Value::double_array(values))
        }
        EntryType::StringArray => {
            let mut values = Vec::new();
            let mut rest = rest;
            if !rest.is_empty() {
                loop {
                    let (value, after) = parse_quoted(rest)?;
                    values.push(value);
                    match after.strip_prefix(',') {
                        Some(next) => rest = next,
                        None if after.is_empty() => break,
                        None => return Err("expected ',' between strings"),
                    }
                }
            }
            Ok(Value::string_array(values))
        }
        EntryType::Unassigned | EntryType::Rpc => Err("unrecognized type"),
    }
}
