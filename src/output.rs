//! Streaming JSON emission for runs that bypass the cache.

use std::io::{self, Write};

use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde::Serialize;

use crate::cache::format_timestamp;
use crate::nvd::CveRecord;

/// Trailing status object of the output envelope.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunStatus {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_modified_date: Option<String>,
}

impl RunStatus {
    /// Every request returned 200 and at least one batch was emitted.
    pub fn success(count: usize, last_modified: Option<DateTime<Utc>>) -> Self {
        Self {
            success: true,
            reason: None,
            count,
            last_modified_date: last_modified.as_ref().map(format_timestamp),
        }
    }

    /// The fetch stopped on a non-success status.
    pub fn upstream_failure(
        status: StatusCode,
        count: usize,
        last_modified: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            success: false,
            reason: Some(format!("Received HTTP Status Code: {}", status.as_u16())),
            count,
            last_modified_date: last_modified.as_ref().map(format_timestamp),
        }
    }
}

/// Streams `{ "cves": [...], "results": {...} }` to a byte sink.
///
/// Record payloads are written verbatim as batches arrive; the envelope
/// closes when [`CveJsonWriter::finish`] receives the run's outcome.
#[derive(Debug)]
pub struct CveJsonWriter<W: Write> {
    out: W,
    count: usize,
    opened: bool,
}

impl<W: Write> CveJsonWriter<W> {
    pub fn new(out: W) -> Self {
        Self {
            out,
            count: 0,
            opened: false,
        }
    }

    /// Records emitted so far.
    pub fn count(&self) -> usize {
        self.count
    }

    /// Append one batch's payloads to the `cves` array.
    pub fn write_batch(&mut self, records: &[CveRecord]) -> io::Result<()> {
        self.open_if_needed()?;
        for record in records {
            if self.count > 0 {
                self.out.write_all(b",")?;
            }
            serde_json::to_writer(&mut self.out, &record.body).map_err(io::Error::other)?;
            self.count += 1;
        }
        Ok(())
    }

    /// Close the array, emit the status object, and return the sink.
    pub fn finish(mut self, status: &RunStatus) -> io::Result<W> {
        self.open_if_needed()?;
        self.out.write_all(b"],\"results\":")?;
        serde_json::to_writer(&mut self.out, status).map_err(io::Error::other)?;
        self.out.write_all(b"}")?;
        self.out.flush()?;
        Ok(self.out)
    }

    fn open_if_needed(&mut self) -> io::Result<()> {
        if !self.opened {
            self.out.write_all(b"{\"cves\":[")?;
            self.opened = true;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use serde_json::{json, Value};

    use super::*;

    fn record(id: &str) -> CveRecord {
        CveRecord::from_body(json!({
            "id": id,
            "published": "2024-01-10T00:00:00.000",
            "lastModified": "2024-04-01T12:00:00.000"
        }))
        .unwrap()
    }

    #[test]
    fn batches_stream_into_one_envelope() {
        let mut writer = CveJsonWriter::new(Vec::new());
        writer
            .write_batch(&[record("CVE-2024-0001"), record("CVE-2024-0002")])
            .unwrap();
        writer.write_batch(&[record("CVE-2024-0003")]).unwrap();

        let last_modified = Utc.with_ymd_and_hms(2024, 4, 1, 12, 0, 0).unwrap();
        let out = writer
            .finish(&RunStatus::success(3, Some(last_modified)))
            .unwrap();

        let value: Value = serde_json::from_slice(&out).unwrap();
        assert_eq!(value["cves"].as_array().unwrap().len(), 3);
        assert_eq!(value["cves"][0]["id"], "CVE-2024-0001");
        assert_eq!(value["results"]["success"], true);
        assert_eq!(value["results"]["count"], 3);
        assert_eq!(value["results"]["lastModifiedDate"], "2024-04-01T12:00:00Z");
        assert!(value["results"].get("reason").is_none());
    }

    #[test]
    fn upstream_failure_reports_the_status_code() {
        let mut writer = CveJsonWriter::new(Vec::new());
        writer.write_batch(&[record("CVE-2024-0001")]).unwrap();

        let out = writer
            .finish(&RunStatus::upstream_failure(StatusCode::NOT_FOUND, 1, None))
            .unwrap();

        let value: Value = serde_json::from_slice(&out).unwrap();
        assert_eq!(value["results"]["success"], false);
        assert_eq!(
            value["results"]["reason"],
            "Received HTTP Status Code: 404"
        );
    }

    #[test]
    fn empty_run_still_emits_a_complete_envelope() {
        let writer = CveJsonWriter::new(Vec::new());
        let out = writer
            .finish(&RunStatus::upstream_failure(
                StatusCode::SERVICE_UNAVAILABLE,
                0,
                None,
            ))
            .unwrap();

        let value: Value = serde_json::from_slice(&out).unwrap();
        assert_eq!(value["cves"].as_array().unwrap().len(), 0);
        assert_eq!(value["results"]["count"], 0);
    }
}
