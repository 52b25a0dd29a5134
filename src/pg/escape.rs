//! String, identifier and bytea escaping.
//!
//! Escaping of string literals depends on the session's
//! `standard_conforming_strings` setting. The connection-free functions here
//! use the most recent value reported by any connection in the process, which
//! starts out `off` until a server says otherwise.

use std::fmt::Write;
use std::sync::atomic::{AtomicBool, Ordering};

static STANDARD_CONFORMING_STRINGS: AtomicBool = AtomicBool::new(false);

/// The last `standard_conforming_strings` value reported by any server.
pub fn standard_conforming_strings() -> bool {
    STANDARD_CONFORMING_STRINGS.load(Ordering::Relaxed)
}

/// Record a ParameterStatus report for `standard_conforming_strings`.
pub(crate) fn observe_standard_conforming_strings(value: &str) {
    STANDARD_CONFORMING_STRINGS.store(value == "on", Ordering::Relaxed);
}

/// Escape a string for use inside a single-quoted SQL literal.
///
/// The surrounding quotes are not added.
pub fn escape_string(s: &str) -> String {
    escape_string_with(s, standard_conforming_strings())
}

/// Escape a string literal for a session with the given
/// `standard_conforming_strings` setting.
pub fn escape_string_with(s: &str, std_strings: bool) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    for c in s.chars() {
        match c {
            '\0' => break,
            '\'' => out.push_str("''"),
            '\\' if !std_strings => out.push_str("\\\\"),
            _ => out.push(c),
        }
    }
    out
}

/// Quote a string as a SQL literal.
///
/// Literals containing backslashes use the `E'...'` form so they read the
/// same under either `standard_conforming_strings` setting.
pub fn escape_literal(s: &str) -> String {
    let s = until_nul(s);
    let mut out = String::with_capacity(s.len() + 4);
    if s.contains('\\') {
        out.push_str(" E");
    }
    out.push('\'');
    for c in s.chars() {
        match c {
            '\'' => out.push_str("''"),
            '\\' => out.push_str("\\\\"),
            _ => out.push(c),
        }
    }
    out.push('\'');
    out
}

/// Quote an identifier (table, column, channel name) with double quotes.
pub fn escape_identifier(s: &str) -> String {
    let s = until_nul(s);
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for c in s.chars() {
        if c == '"' {
            out.push('"');
        }
        out.push(c);
    }
    out.push('"');
    out
}

/// Alias for [`escape_identifier`].
pub fn quote_ident(s: &str) -> String {
    escape_identifier(s)
}

/// Quote each part of a qualified name, joined by dots (`"schema"."table"`).
pub fn quote_qualified(parts: &[&str]) -> String {
    parts
        .iter()
        .map(|p| escape_identifier(p))
        .collect::<Vec<_>>()
        .join(".")
}

/// Escape binary data for a bytea string literal, using the escape format
/// and the process-wide `standard_conforming_strings` value.
pub fn escape_bytea(data: &[u8]) -> String {
    escape_bytea_with(data, standard_conforming_strings(), false)
}

/// Escape binary data for a bytea string literal.
///
/// `hex` selects the `\x...` format understood by 9.0+ servers; otherwise
/// non-printable bytes are written as backslash-octal triples.
pub fn escape_bytea_with(data: &[u8], std_strings: bool, hex: bool) -> String {
    let slash = if std_strings { "\\" } else { "\\\\" };

    if hex {
        let mut out = String::with_capacity(slash.len() + 1 + data.len() * 2);
        out.push_str(slash);
        out.push('x');
        push_hex(&mut out, data);
        return out;
    }

    let mut out = String::with_capacity(data.len());
    for &b in data {
        match b {
            b'\'' => out.push_str("''"),
            b'\\' => {
                out.push_str(slash);
                out.push_str(slash);
            }
            0x20..=0x7e => out.push(b as char),
            _ => {
                out.push_str(slash);
                let _ = write!(out, "{:03o}", b);
            }
        }
    }
    out
}

/// Text form of a bytea value in hex format, suitable as a text parameter.
pub(crate) fn hex_bytea(data: &[u8]) -> String {
    let mut out = String::with_capacity(2 + data.len() * 2);
    out.push_str("\\x");
    push_hex(&mut out, data);
    out
}

/// Decode the text output of a bytea column, in hex or escape format.
pub fn unescape_bytea(text: &[u8]) -> Vec<u8> {
    if let Some(hex) = text.strip_prefix(b"\\x") {
        return unhex(hex);
    }

    let mut out = Vec::with_capacity(text.len());
    let mut i = 0;
    while i < text.len() {
        if text[i] != b'\\' {
            out.push(text[i]);
            i += 1;
            continue;
        }

        i += 1;
        match text.get(i..i + 3) {
            Some([a @ b'0'..=b'3', b @ b'0'..=b'7', c @ b'0'..=b'7']) => {
                out.push(((a - b'0') << 6) | ((b - b'0') << 3) | (c - b'0'));
                i += 3;
            }
            _ => {
                if text.get(i) == Some(&b'\\') {
                    out.push(b'\\');
                    i += 1;
                }
                // An unrecognised escape drops the backslash
            }
        }
    }
    out
}

fn until_nul(s: &str) -> &str {
    match s.find('\0') {
        Some(pos) => &s[..pos],
        None => s,
    }
}

fn push_hex(out: &mut String, data: &[u8]) {
    const HEX: &[u8; 16] = b"0123456789abcdef";
    for &b in data {
        out.push(HEX[(b >> 4) as usize] as char);
        out.push(HEX[(b & 0x0f) as usize] as char);
    }
}

fn unhex(hex: &[u8]) -> Vec<u8> {
    fn nibble(c: u8) -> Option<u8> {
        match c {
            b'0'..=b'9' => Some(c - b'0'),
            b'a'..=b'f' => Some(c - b'a' + 10),
            b'A'..=b'F' => Some(c - b'A' + 10),
            _ => None,
        }
    }

    let mut out = Vec::with_capacity(hex.len() / 2);
    let mut digits = hex.iter().filter(|c| !c.is_ascii_whitespace());
    while let Some(&hi) = digits.next() {
        let (Some(hi), Some(lo)) = (nibble(hi), digits.next().and_then(|&c| nibble(c))) else {
            break;
        };
        out.push((hi << 4) | lo);
    }
    out
}
