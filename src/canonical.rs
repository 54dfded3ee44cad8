//! Canonical record form and its SHA-256 hash.
//!
//! Both stores must agree on a record's hash regardless of how they order
//! fields or type values, so the canonical form sorts keys and normalizes
//! every value to a string: strings stay as-is, everything else becomes its
//! compact JSON text.

use std::collections::BTreeMap;

use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::operation::Record;

/// Stable text form of a record.
#[must_use]
pub fn canonical_form(record: &Record) -> String {
    let normalized: BTreeMap<&str, String> = record
        .iter()
        .map(|(field, value)| (field.as_str(), normalize(value)))
        .collect();
    // A BTreeMap of strings always serializes
    serde_json::to_string(&normalized).unwrap_or_default()
}

fn normalize(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Hex SHA-256 of [`canonical_form`].
#[must_use]
pub fn record_hash(record: &Record) -> String {
    hex::encode(Sha256::digest(canonical_form(record).as_bytes()))
}
