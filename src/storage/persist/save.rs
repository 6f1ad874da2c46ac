//! Text writer for the persistent storage format.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;

use crate::core::{EntryType, Value, ValueData};

pub(crate) const HEADER: &str = "[NetworkTables Storage 3.0]";

pub(crate) fn type_prefix(entry_type: EntryType) -> Option<&'static str> {
    match entry_type {
        EntryType::Boolean => Some("boolean "),
        EntryType::Double => Some("double "),
        EntryType::String => Some("string "),
        EntryType::Raw => Some("raw "),
        EntryType::BooleanArray => Some("array boolean "),
        EntryType::DoubleArray => Some("array double "),
        EntryType::StringArray => Some("array string "),
        EntryType::Unassigned | EntryType::Rpc => None,
    }
}

/// Escape and write a string, quotes included. Printable ASCII passes
/// through except `=` (it would split the line), backslash, and the quote;
/// everything else becomes `\xHH`.
pub(crate) fn write_escaped(out: &mut String, raw: &[u8]) {
    out.push('"');
    for &byte in raw {
        match byte {
            b'\\' => out.push_str("\\\\"),
            b'\t' => out.push_str("\\t"),
            b'\n' => out.push_str("\\n"),
            b'"' => out.push_str("\\\""),
            0x20..=0x7e if byte != b'=' => out.push(byte as char),
            _ => {
                out.push_str("\\x");
                out.push(char::from_digit((byte >> 4) as u32, 16).unwrap_or('0').to_ascii_uppercase());
                out.push(char::from_digit((byte & 0xf) as u32, 16).unwrap_or('0').to_ascii_uppercase());
            }
        }
    }
    out.push('"');
}

/// printf `%g` rendering: six significant digits, trailing zeros stripped,
/// scientific notation outside [1e-4, 1e6) with a signed two-digit exponent.
pub(crate) fn format_g(value: f64) -> String {
    if value == 0.0 {
        return if value.is_sign_negative() {
            "-0".to_string()
        } else {
            "0".to_string()
        };
    }
    if value.is_nan() {
        return "nan".to_string();
    }
    if value.is_infinite() {
        return if value < 0.0 { "-inf" } else { "inf" }.to_string();
    }

    let formatted = format!("{value:.5e}");
    let (mantissa, exp) = formatted
        .split_once('e')
        .expect("exponential float format always contains 'e'");
    let exp: i32 = exp.parse().expect("float exponent is an integer");
    let negative = mantissa.starts_with('-');
    let digits: String = mantissa.chars().filter(char::is_ascii_digit).collect();
    let digits = digits.trim_end_matches('0');
    let digits = if digits.is_empty() { "0" } else { digits };

    let mut out = String::new();
    if negative {
        out.push('-');
    }
    if !(-4..6).contains(&exp) {
        out.push_str(&digits[..1]);
        if digits.len() > 1 {
            out.push('.');
            out.push_str(&digits[1..]);
        }
        out.push('e');
        out.push(if exp < 0 { '-' } else { '+' });
        out.push_str(&format!("{:02}", exp.abs()));
    } else if exp >= 0 {
        let int_len = (exp + 1) as usize;
        if digits.len() <= int_len {
            out.push_str(digits);
            for _ in digits.len()..int_len {
                out.push('0');
            }
        } else {
            out.push_str(&digits[..int_len]);
            out.push('.');
            out.push_str(&digits[int_len..]);
        }
    } else {
        out.push_str("0.");
        for _ in 0..(-exp - 1) {
            out.push('0');
        }
        out.push_str(digits);
    }
    out
}

fn write_value(out: &mut String, value: &Value) {
    match value.data() {
        ValueData::Boolean(v) => out.push_str(if *v { "true" } else { "false" }),
        ValueData::Double(v) => out.push_str(&format_g(*v)),
        ValueData::String(v) => write_escaped(out, v.as_bytes()),
        ValueData::Raw(v) => out.push_str(&STANDARD.encode(v)),
        ValueData::BooleanArray(v) => {
            for (i, elem) in v.iter().enumerate() {
                if i != 0 {
                    out.push(',');
                }
                out.push_str(if *elem { "true" } else { "false" });
            }
        }
        ValueData::DoubleArray(v) => {
            for (i, elem) in v.iter().enumerate() {
                if i != 0 {
                    out.push(',');
                }
                out.push_str(&format_g(*elem));
            }
        }
        ValueData::StringArray(v) => {
            for (i, elem) in v.iter().enumerate() {
                if i != 0 {
                    out.push(',');
                }
                write_escaped(out, elem.as_bytes());
            }
        }
        ValueData::Rpc(_) => {}
    }
}

/// Render the header plus one line per entry. Entries must already be
/// name-sorted; RPC-typed values are skipped.
pub(crate) fn write_entries(out: &mut String, entries: &[(String, Value)]) {
    out.push_str(HEADER);
    out.push('\n');
    for (name, value) in entries {
        let Some(prefix) = type_prefix(value.entry_type()) else {
            continue;
        };
        out.push_str(prefix);
        write_escaped(out, name.as_bytes());
        out.push('=');
        write_value(out, value);
        out.push('\n');
    }
}
