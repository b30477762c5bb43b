//! Canonical serialization and content hashing.
//!
//! Every write path (daemon, fallback, jobs) derives dedupe keys and record
//! hashes through this module, so a record hashes the same no matter which
//! process wrote it.

use serde::Serialize;
use serde_json::Value;
use sha2::{Digest as _, Sha256};

use crate::error::Result;
use crate::models::EventRef;

/// Compact JSON with object keys sorted at every depth.
///
/// Going through [`Value`] sorts keys because `serde_json` keeps objects in
/// a `BTreeMap`; its `Display` form is compact and leaves non-ASCII as UTF-8.
pub fn canonical_json<T: Serialize + ?Sized>(value: &T) -> Result<String> {
    Ok(serde_json::to_value(value)?.to_string())
}

pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Line-ending and whitespace normalization applied before hashing text.
///
/// CRLF and CR become LF, trailing whitespace is stripped per line, and runs
/// of spaces/tabs collapse to a single space.
pub fn normalize_text(text: &str) -> String {
    let unified = text.replace("\r\n", "\n").replace('\r', "\n");
    let lines: Vec<String> = unified
        .split('\n')
        .map(|line| collapse_blanks(line.trim_end()))
        .collect();
    lines.join("\n")
}

fn collapse_blanks(line: &str) -> String {
    let mut out = String::with_capacity(line.len());
    let mut in_run = false;
    for ch in line.chars() {
        if ch == ' ' || ch == '\t' {
            if !in_run {
                out.push(' ');
            }
            in_run = true;
        } else {
            out.push(ch);
            in_run = false;
        }
    }
    out
}

/// Identity fields that feed the dedupe key.
pub struct DedupeInput<'a> {
    pub source_name: &'a str,
    pub source_locator: Option<&'a str>,
    pub event_type: &'a str,
    pub refs: &'a [EventRef],
    pub text: &'a str,
    pub content: &'a Value,
}

/// Stable identity hash over source identity and normalized content.
///
/// Timestamps and tags are deliberately left out: re-ingesting the same
/// message at a different time, or with extra tags, is still a duplicate.
pub fn dedupe_key(input: &DedupeInput<'_>) -> Result<String> {
    let span = match input.refs.first().and_then(|r| r.span.as_ref()) {
        Some(span) => canonical_json(span)?,
        None => String::new(),
    };
    let material = format!(
        "v1|{}|{}|{}|{}|{}|{}",
        input.source_name,
        input.source_locator.unwrap_or(""),
        input.event_type,
        span,
        normalize_text(input.text),
        canonical_json(input.content)?,
    );
    Ok(sha256_hex(material.as_bytes()))
}
