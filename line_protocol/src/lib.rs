#![deny(rustdoc::broken_intra_doc_links, rust_2018_idioms)]
#![warn(
    missing_copy_implementations,
    missing_debug_implementations,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

//! # line_protocol
//!
//! Just enough line-protocol scanning for a proxy: extract the measurement
//! key that drives routing, sanity-check the shape of a point, and normalize
//! trailing timestamps to nanoseconds. Full parsing of tags and fields is
//! intentionally left to the backends.

use chrono::Utc;
use thiserror::Error;

/// Errors returned while scanning a single line-protocol point.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// The line ended before an unescaped space or comma terminated the
    /// measurement key.
    #[error("unexpected end of line while scanning measurement key")]
    UnterminatedKey,

    /// A `\` escape had no byte following it.
    #[error("dangling escape at end of line")]
    DanglingEscape,
}

/// A specialized `Result` for line scanning errors.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Extracts the measurement key from the start of a line-protocol point.
///
/// Walks bytes until the first unescaped space or comma; `\` escapes the
/// following byte into the key. Returns the unescaped key together with the
/// byte offset at which the key ended (the start of the tag/field portion),
/// which differs from the key length when escapes are present.
pub fn scan_key(point: &[u8]) -> Result<(String, usize)> {
    let mut key = Vec::with_capacity(point.len().min(100));
    let mut i = 0;
    while i < point.len() {
        match point[i] {
            b'\\' => {
                i += 1;
                let c = *point.get(i).ok_or(Error::DanglingEscape)?;
                key.push(c);
            }
            b' ' | b',' => {
                return Ok((String::from_utf8_lossy(&key).into_owned(), i));
            }
            c => key.push(c),
        }
        i += 1;
    }
    Err(Error::UnterminatedKey)
}

/// Validates that the portion of a point following the measurement key has
/// the minimal shape `[,tags] fields [timestamp]` by counting unescaped,
/// unquoted whitespace runs. Malformed points are dropped by the caller.
pub fn rapid_check(rest: &[u8]) -> bool {
    let cnt = scan_space(rest);
    cnt == 1 || cnt == 2
}

/// Counts runs of unescaped, unquoted spaces and tabs.
fn scan_space(buf: &[u8]) -> usize {
    let mut cnt = 0;
    let mut i = 0;
    while i < buf.len() {
        match buf[i] {
            b'\\' => i += 2,
            b'"' => match scan_quoted(buf, i) {
                Some(end) => i = end,
                // Unterminated or ill-escaped string value. Stop counting;
                // the shape check downstream rejects the point.
                None => return cnt,
            },
            b' ' | b'\t' => {
                if i == 0 || (buf[i - 1] != b' ' && buf[i - 1] != b'\t') {
                    cnt += 1;
                }
                i += 1;
            }
            _ => i += 1,
        }
    }
    cnt
}

/// Advances past a double-quoted string value starting at `start`, honoring
/// `\"` escapes. Returns the index just past the closing quote.
fn scan_quoted(buf: &[u8], start: usize) -> Option<usize> {
    let mut i = start + 1;
    while i < buf.len() {
        match buf[i] {
            b'"' => return Some(i + 1),
            b'\\' => i += 2,
            _ => i += 1,
        }
    }
    None
}

/// Nanoseconds per unit for the precisions accepted on `/write`.
fn precision_multiplier(precision: &str) -> i64 {
    match precision {
        "n" | "ns" => 1,
        "u" => 1_000,
        "ms" => 1_000_000,
        "s" => 1_000_000_000,
        "m" => 60_000_000_000,
        "h" => 3_600_000_000_000,
        _ => 1,
    }
}

/// Rewrites the trailing timestamp of `line` to nanosecond precision.
///
/// The common precisions multiply by a power of 1000, which is done
/// textually by appending zeros rather than parsing the integer. A line
/// without a timestamp gets the current wall clock appended.
pub fn line_to_nano(line: &[u8], precision: &str) -> Vec<u8> {
    let line = trim_right(line);
    match scan_time(line) {
        Some(pos) => match precision {
            "n" | "ns" => line.to_vec(),
            "u" => [line, b"000"].concat(),
            "ms" => [line, b"000000"].concat(),
            "s" => [line, b"000000000"].concat(),
            other => {
                let nanos = digits_to_i64(&line[pos + 1..]) * precision_multiplier(other);
                let mut out = line[..pos].to_vec();
                out.push(b' ');
                out.extend_from_slice(nanos.to_string().as_bytes());
                out
            }
        },
        None => {
            let mut out = line.to_vec();
            out.push(b' ');
            out.extend_from_slice(now_nanos().to_string().as_bytes());
            out
        }
    }
}

/// Current wall clock in nanoseconds since the epoch.
pub fn now_nanos() -> i64 {
    Utc::now().timestamp_nanos_opt().unwrap_or_default()
}

/// Locates a trailing timestamp: the maximal suffix of ASCII digits preceded
/// by a space, tab or NUL. Returns the index of the separator byte.
fn scan_time(buf: &[u8]) -> Option<usize> {
    let mut i = buf.len() as isize - 1;
    while i >= 0 && buf[i as usize].is_ascii_digit() {
        i -= 1;
    }
    let i = if i < 0 { return None } else { i as usize };
    (i > 0 && i < buf.len() - 1 && matches!(buf[i], b' ' | b'\t' | 0)).then_some(i)
}

fn digits_to_i64(buf: &[u8]) -> i64 {
    buf.iter().fold(0i64, |acc, b| {
        acc.wrapping_mul(10).wrapping_add(i64::from(b - b'0'))
    })
}

fn trim_right(line: &[u8]) -> &[u8] {
    let mut end = line.len();
    while end > 0 && matches!(line[end - 1], b' ' | b'\t' | b'\r' | b'\n') {
        end -= 1;
    }
    &line[..end]
}
