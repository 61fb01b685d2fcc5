#![deny(rustdoc::broken_intra_doc_links, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

//! # influxql
//!
//! A deliberately shallow view of InfluxQL: the proxy only needs to split a
//! statement into tokens, find the measurement behind `FROM`, and classify
//! the statement against policy regexes. Anything deeper is the backends'
//! business.

use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

/// Errors returned by the tokenizer.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// A backslash escaped something other than the surrounding quote.
    #[error("wrong quote escape")]
    WrongQuote,

    /// A quoted token was never closed.
    #[error("unmatched quote")]
    UnmatchedQuote,

    /// A `(`, `[` or `{` token was never closed.
    #[error("unclosed bracket")]
    Unclosed,

    /// The statement has no extractable measurement.
    #[error("illegal InfluxQL")]
    IllegalQl,
}

/// A specialized `Result` for InfluxQL scanning errors.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Statements that are never forwarded anywhere.
static FORBIDDEN: Lazy<Vec<Regex>> = Lazy::new(|| {
    compile(&[
        r"(?i)^\s*grant",
        r"(?i)^\s*revoke",
        r"(?i)^\s*kill",
        r"(?i)select\s+.+\s+into\s+",
    ])
});

/// A plain query must match at least one of these to be accepted; it keeps
/// unbounded scans off the backends.
static OBLIGATED: Lazy<Vec<Regex>> = Lazy::new(|| compile(&[r"(?i)where.*time", r"(?i)show.*from"]));

/// Statements that require the cluster executor rather than single-backend
/// routing.
static CLUSTER_EXECUTED: Lazy<Vec<Regex>> = Lazy::new(|| {
    compile(&[
        r"(?i)^\s*show",
        r"(?i)^\s*create",
        r"(?i)^\s*delete",
        r"(?i)^\s*drop",
    ])
});

fn compile(patterns: &[&str]) -> Vec<Regex> {
    patterns
        .iter()
        .map(|p| Regex::new(p).expect("statement policy regex is valid"))
        .collect()
}

/// Splits a statement into tokens.
///
/// Runs of spaces separate tokens. A token starting with `"` or `'` extends
/// to the matching close quote; backslash escapes only the quote character
/// itself. A token starting with `(`, `[` or `{` extends to the matching
/// closer and is treated as opaque. Everything else extends to the next
/// space.
pub fn tokenize(q: &str) -> Result<Vec<String>> {
    let data = q.as_bytes();
    let mut tokens = Vec::new();
    let mut pos = 0;
    while pos < data.len() {
        while pos < data.len() && data[pos] == b' ' {
            pos += 1;
        }
        if pos == data.len() {
            break;
        }
        let end = match data[pos] {
            quote @ (b'"' | b'\'') => find_end_with_quote(data, pos, quote)?,
            b'(' => find_closer(data, pos, b')')?,
            b'[' => find_closer(data, pos, b']')?,
            b'{' => find_closer(data, pos, b'}')?,
            _ => data[pos..]
                .iter()
                .position(|&c| c == b' ')
                .map(|i| pos + i)
                .unwrap_or(data.len()),
        };
        tokens.push(String::from_utf8_lossy(&data[pos..end]).into_owned());
        pos = end;
    }
    Ok(tokens)
}

/// Scans past a quoted token, resolving `\<quote>` escapes. Returns the
/// index just past the closing quote.
fn find_end_with_quote(data: &[u8], start: usize, quote: u8) -> Result<usize> {
    let mut i = start + 1;
    while i < data.len() {
        match data[i] {
            c if c == quote => return Ok(i + 1),
            b'\\' => {
                if i + 1 >= data.len() {
                    return Err(Error::UnmatchedQuote);
                }
                if data[i + 1] != quote {
                    return Err(Error::WrongQuote);
                }
                i += 2;
            }
            _ => i += 1,
        }
    }
    Err(Error::UnmatchedQuote)
}

fn find_closer(data: &[u8], start: usize, closer: u8) -> Result<usize> {
    data[start..]
        .iter()
        .position(|&c| c == closer)
        .map(|i| start + i + 1)
        .ok_or(Error::Unclosed)
}

/// Joins the first `n` tokens lowercased, e.g. `"show field keys"`.
pub fn head_stmt_from_tokens(tokens: &[String], n: usize) -> String {
    tokens
        .iter()
        .take(n)
        .map(|t| t.to_lowercase())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Strips one layer of matching quotes.
fn unquote(s: &str) -> String {
    let b = s.as_bytes();
    if b.len() >= 2 && (b[0] == b'"' || b[0] == b'\'') && b[b.len() - 1] == b[0] {
        s[1..s.len() - 1].to_owned()
    } else {
        s.to_owned()
    }
}

/// Resolves the measurement named by the token(s) following `FROM`.
///
/// A `/regex/` target is returned verbatim; otherwise surrounding quotes and
/// a leading `db.rp.` qualifier are stripped.
fn measurement_from_target(tokens: &[String]) -> Result<String> {
    let target = if tokens.len() >= 2 && tokens[1].starts_with('.') {
        // Qualifier and measurement were split into separate tokens, as in
        // `FROM "db" ."rp".cpu`.
        &tokens[1][1..]
    } else {
        tokens.first().ok_or(Error::IllegalQl)?.as_str()
    };
    if target.starts_with('/') {
        return Ok(target.to_owned());
    }
    if target.starts_with('"') || target.starts_with('\'') {
        return Ok(unquote(target));
    }
    Ok(unquote(target.rsplit('.').next().unwrap_or(target)))
}

/// Extracts the measurement a statement operates on, looking behind `FROM`
/// first and `MEASUREMENT` second (for `DROP MEASUREMENT`).
pub fn measurement_from_tokens(tokens: &[String]) -> Result<String> {
    for (i, t) in tokens.iter().enumerate() {
        if t.eq_ignore_ascii_case("from") && i + 1 < tokens.len() {
            return measurement_from_target(&tokens[i + 1..]);
        }
    }
    for (i, t) in tokens.iter().enumerate() {
        if t.eq_ignore_ascii_case("measurement") && i + 1 < tokens.len() {
            return Ok(unquote(&tokens[i + 1]));
        }
    }
    Err(Error::IllegalQl)
}

/// Convenience over [`tokenize`] + [`measurement_from_tokens`].
pub fn measurement_from_influxql(q: &str) -> Result<String> {
    measurement_from_tokens(&tokenize(q)?)
}

/// Classification of one client statement.
#[derive(Debug, Clone)]
pub struct CheckedQuery {
    /// The statement split into tokens (empty when tokenization failed).
    pub tokens: Vec<String>,
    /// False when the statement is forbidden or fails the obligated set.
    pub allowed: bool,
    /// True when any token is `FROM`.
    pub has_from: bool,
}

/// Matches a statement against the forbidden / obligated / cluster-executed
/// policy sets.
pub fn check_query(q: &str) -> CheckedQuery {
    let Ok(tokens) = tokenize(q) else {
        return CheckedQuery {
            tokens: vec![],
            allowed: false,
            has_from: false,
        };
    };
    let has_from = tokens.iter().any(|t| t.eq_ignore_ascii_case("from"));
    if tokens.is_empty() || FORBIDDEN.iter().any(|re| re.is_match(q)) {
        return CheckedQuery {
            tokens,
            allowed: false,
            has_from,
        };
    }
    let allowed = is_cluster_statement(q) || OBLIGATED.iter().any(|re| re.is_match(q));
    CheckedQuery {
        tokens,
        allowed,
        has_from,
    }
}

/// True when the statement must fan out through the cluster executor.
pub fn is_cluster_statement(q: &str) -> bool {
    CLUSTER_EXECUTED.iter().any(|re| re.is_match(q))
}

/// Looks for an `ON <db>` clause and `SHOW DATABASES`. Returns
/// `(found_on_clause, is_show_databases, db)`.
pub fn database_from_on_clause(tokens: &[String]) -> (bool, bool, Option<String>) {
    let show_db = head_stmt_from_tokens(tokens, 2) == "show databases";
    for (i, t) in tokens.iter().enumerate() {
        if t.eq_ignore_ascii_case("on") && i + 1 < tokens.len() {
            return (true, show_db, Some(unquote(&tokens[i + 1])));
        }
    }
    (false, show_db, None)
}

/// The database named directly in the statement, as in `CREATE DATABASE x`.
pub fn database_from_tokens(tokens: &[String]) -> Option<String> {
    for (i, t) in tokens.iter().enumerate() {
        if t.eq_ignore_ascii_case("database") && i + 1 < tokens.len() {
            return Some(unquote(&tokens[i + 1]));
        }
    }
    None
}
