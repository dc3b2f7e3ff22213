//! Decoded shape of the CVE API response envelope.
//!
//! Only the fields the mirror consumes are modeled; each record's `cve`
//! object rides along verbatim so the persisted snapshot loses nothing.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::Deserialize;
use serde_json::Value;

use crate::client::error::Error;

/// Top-level page envelope returned by the CVE API.
///
/// The same shape is written to (and read back from) cache partitions.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CveApiEnvelope {
    pub results_per_page: u32,
    pub start_index: u32,
    pub total_results: u32,
    #[serde(default)]
    pub timestamp: Option<String>,
    #[serde(default)]
    pub vulnerabilities: Vec<VulnerabilityEntry>,
}

#[derive(Debug, Deserialize)]
pub struct VulnerabilityEntry {
    pub cve: Value,
}

impl CveApiEnvelope {
    /// The server's snapshot timestamp, if present and parseable.
    pub fn server_timestamp(&self) -> Option<DateTime<Utc>> {
        self.timestamp.as_deref().and_then(parse_timestamp)
    }

    /// Extract the records, failing on any entry that lacks the identity or
    /// date fields the mirror keys on.
    pub fn into_records(self) -> Result<Vec<CveRecord>, Error> {
        self.vulnerabilities
            .into_iter()
            .map(|entry| CveRecord::from_body(entry.cve))
            .collect()
    }
}

/// A CVE record: the fields the mirror itself reads, plus the verbatim body.
#[derive(Debug, Clone, PartialEq)]
pub struct CveRecord {
    pub id: String,
    pub published: DateTime<Utc>,
    pub last_modified: DateTime<Utc>,
    /// The full `cve` object as received; re-serialized unchanged.
    pub body: Value,
}

impl CveRecord {
    /// Build a record from a raw `cve` object.
    pub fn from_body(body: Value) -> Result<Self, Error> {
        let id = body
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| decode_error("record is missing \"id\""))?
            .to_string();
        let published = required_timestamp(&body, "published", &id)?;
        let last_modified = required_timestamp(&body, "lastModified", &id)?;

        Ok(Self {
            id,
            published,
            last_modified,
            body,
        })
    }
}

fn required_timestamp(body: &Value, field: &str, id: &str) -> Result<DateTime<Utc>, Error> {
    body.get(field)
        .and_then(Value::as_str)
        .and_then(parse_timestamp)
        .ok_or_else(|| decode_error(&format!("{id} is missing a parseable \"{field}\"")))
}

fn decode_error(reason: &str) -> Error {
    Error::Decode {
        context: "CVE API",
        reason: reason.to_string(),
    }
}

/// Parse a service timestamp.
///
/// The API emits both offset-qualified timestamps and zone-less ones like
/// `2023-03-01T13:00:00.000`; the latter are UTC by the API contract.
pub(crate) fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    if let Ok(parsed) = DateTime::parse_from_rfc3339(value) {
        return Some(parsed.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}
