//! Payload parsing: structured JSON first, then a permissive text scan.

use std::ops::Range;

use rustc_hash::FxHashSet;
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{debug, trace};

use crate::category::{Category, Icao};
use crate::error::FetchError;

use super::{CategoryRecord, FieldSchema};

/// Which parser produced the records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ParsePath {
    Structured,
    Permissive,
}

/// One parsing strategy bound to a field schema.
#[derive(Debug, Clone, Copy)]
pub enum PayloadParser<'s> {
    /// A JSON array of objects, optionally wrapped as `{"data": [...]}`.
    Structured(&'s FieldSchema),
    /// Scan raw text for `"<field>": "<value>"` pairs.
    Permissive(&'s FieldSchema),
}

impl PayloadParser<'_> {
    pub fn path(&self) -> ParsePath {
        match self {
            PayloadParser::Structured(_) => ParsePath::Structured,
            PayloadParser::Permissive(_) => ParsePath::Permissive,
        }
    }

    pub fn parse(&self, body: &str) -> Result<Vec<CategoryRecord>, String> {
        match self {
            PayloadParser::Structured(schema) => parse_structured(body, schema),
            PayloadParser::Permissive(schema) => Ok(scan(body, schema)),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParsedPayload {
    pub records: Vec<CategoryRecord>,
    pub path: ParsePath,
    /// Why the structured parser was abandoned, when the scan was used.
    pub structured_error: Option<String>,
}

/// Parse a response body into category records.
///
/// A structured parse that succeeds is authoritative even when it yields no
/// records. Otherwise the permissive scan is tried and must find at least one.
pub fn parse_payload(body: &[u8], schema: &FieldSchema) -> Result<ParsedPayload, FetchError> {
    let text = String::from_utf8_lossy(body);
    if text.trim().is_empty() {
        return Err(FetchError::EmptyOrMalformedPayload);
    }

    let structured = PayloadParser::Structured(schema);
    let structured_error = match structured.parse(&text) {
        Ok(records) => {
            return Ok(ParsedPayload {
                records,
                path: structured.path(),
                structured_error: None,
            });
        }
        Err(err) => err,
    };

    debug!(error = %structured_error, "Structured parse failed, scanning payload");
    let permissive = PayloadParser::Permissive(schema);
    match permissive.parse(&text) {
        Ok(records) if !records.is_empty() => Ok(ParsedPayload {
            records,
            path: permissive.path(),
            structured_error: Some(structured_error),
        }),
        _ => Err(FetchError::JsonParse(structured_error)),
    }
}

fn parse_structured(body: &str, schema: &FieldSchema) -> Result<Vec<CategoryRecord>, String> {
    let value: Value = serde_json::from_str(body).map_err(|err| err.to_string())?;

    let entries = match &value {
        Value::Array(entries) => entries,
        Value::Object(envelope) => match envelope.get("data") {
            Some(Value::Array(entries)) => entries,
            _ => return Err("object payload without a data array".to_string()),
        },
        _ => return Err("payload is neither an array nor an envelope".to_string()),
    };

    Ok(entries
        .iter()
        .filter_map(Value::as_object)
        .filter_map(|entry| record_from_object(entry, schema))
        .collect())
}

fn record_from_object(entry: &Map<String, Value>, schema: &FieldSchema) -> Option<CategoryRecord> {
    let raw_key = first_alias(entry, schema.identifier)?;
    let Some(key) = Icao::parse(raw_key) else {
        trace!(raw_key, "Skipping record with invalid identifier");
        return None;
    };
    let raw_category = first_alias(entry, schema.category)?.trim();
    if raw_category.is_empty() {
        return None;
    }

    Some(CategoryRecord {
        key,
        category: Category::parse(raw_category),
    })
}

fn first_alias<'v>(entry: &'v Map<String, Value>, aliases: &[&str]) -> Option<&'v str> {
    aliases
        .iter()
        .find_map(|alias| entry.get(*alias).and_then(Value::as_str))
}

/// A `"<alias>": "<value>"` occurrence in raw text.
struct FieldMatch<'b> {
    key_start: usize,
    value: &'b str,
    value_end: usize,
}

fn scan(body: &str, schema: &FieldSchema) -> Vec<CategoryRecord> {
    let objects = object_spans(body);
    let mut used = FxHashSet::default();
    let mut records = Vec::new();
    let mut pos = 0;

    while let Some(id) = find_field(body, pos, schema.identifier) {
        pos = id.value_end;
        let Some(key) = Icao::parse(id.value) else {
            continue;
        };

        // Inside an object the category may sit on either side of the
        // identifier but never outside that object. In loose text it must
        // sit between this identifier and the next one.
        let span = match enclosing(&objects, id.key_start) {
            Some(span) if !used.insert(span.start) => continue,
            Some(span) => span,
            None => {
                let bound = find_field(body, pos, schema.identifier)
                    .map(|next| next.key_start)
                    .unwrap_or(body.len());
                pos..bound
            }
        };

        let Some(category) = find_field(&body[..span.end], span.start, schema.category) else {
            continue;
        };
        let raw = category.value.trim();
        if raw.is_empty() {
            continue;
        }

        records.push(CategoryRecord {
            key,
            category: Category::parse(raw),
        });
    }

    records
}

/// Byte ranges of every `{...}` outside string literals. An object left
/// open by truncation runs to the end of the body.
fn object_spans(body: &str) -> Vec<Range<usize>> {
    let mut spans = Vec::new();
    let mut open = Vec::new();
    let mut in_string = false;
    let mut escaped = false;

    for (i, byte) in body.bytes().enumerate() {
        if in_string {
            match byte {
                _ if escaped => escaped = false,
                b'\\' => escaped = true,
                b'"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match byte {
            b'"' => in_string = true,
            b'{' => open.push(i),
            b'}' => {
                if let Some(start) = open.pop() {
                    spans.push(start..i + 1);
                }
            }
            _ => {}
        }
    }
    spans.extend(open.into_iter().map(|start| start..body.len()));

    spans
}

/// Innermost object containing `at`.
fn enclosing(objects: &[Range<usize>], at: usize) -> Option<Range<usize>> {
    objects
        .iter()
        .filter(|span| span.start < at && at < span.end)
        .max_by_key(|span| span.start)
        .cloned()
}

/// Earliest match of any alias at or after `from`.
fn find_field<'b>(body: &'b str, from: usize, aliases: &[&str]) -> Option<FieldMatch<'b>> {
    aliases
        .iter()
        .filter_map(|alias| match_alias(body, from, alias))
        .min_by_key(|found| found.key_start)
}

fn match_alias<'b>(body: &'b str, from: usize, alias: &str) -> Option<FieldMatch<'b>> {
    let needle = format!("\"{alias}\"");
    let bytes = body.as_bytes();
    let mut search = from;

    while search < body.len() {
        let key_start = search + body.get(search..)?.find(&needle)?;
        search = key_start + 1;

        let mut p = key_start + needle.len();
        while p < bytes.len() && bytes[p].is_ascii_whitespace() {
            p += 1;
        }
        if bytes.get(p) != Some(&b':') {
            continue;
        }
        p += 1;
        while p < bytes.len() && bytes[p].is_ascii_whitespace() {
            p += 1;
        }
        if bytes.get(p) != Some(&b'"') {
            continue;
        }

        let value_start = p + 1;
        let close = body[value_start..].find('"')?;
        return Some(FieldMatch {
            key_start,
            value: &body[value_start..value_start + close],
            value_end: value_start + close + 1,
        });
    }

    None
}
