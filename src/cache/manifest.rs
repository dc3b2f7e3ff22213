//! The `cache.properties` manifest.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::fs;
use std::io;
use std::path::Path;

use chrono::{DateTime, Utc};
use tracing::warn;

use super::{format_timestamp, write_atomic, CacheError};
use crate::nvd::parse_timestamp;

/// Manifest file name inside the cache directory.
pub const MANIFEST_FILE: &str = "cache.properties";

/// Default partition filename prefix.
pub const DEFAULT_PREFIX: &str = "nvdcve-";

const PER_PARTITION_KEY: &str = "lastModifiedDate.";

/// Cache-wide persisted state: the partition filename prefix, the latest
/// server-reported update across runs, and one timestamp per partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheManifest {
    pub prefix: String,
    pub last_modified: Option<DateTime<Utc>>,
    /// Keyed by partition label (`"2002"` .. `"modified"`).
    pub partition_modified: BTreeMap<String, DateTime<Utc>>,
}

impl Default for CacheManifest {
    fn default() -> Self {
        Self {
            prefix: DEFAULT_PREFIX.to_string(),
            last_modified: None,
            partition_modified: BTreeMap::new(),
        }
    }
}

impl CacheManifest {
    /// Read the manifest from `dir`, `None` when absent.
    pub fn load(dir: &Path) -> Result<Option<Self>, CacheError> {
        let path = dir.join(MANIFEST_FILE);
        let text = match fs::read_to_string(&path) {
            Ok(text) => text,
            Err(error) if error.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(CacheError::Io { path, source }),
        };

        let mut manifest = Self::default();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                return Err(CacheError::MalformedManifest {
                    line: line.to_string(),
                });
            };
            match key {
                "prefix" => manifest.prefix = value.to_string(),
                "lastModifiedDate" => {
                    manifest.last_modified = Some(parse_manifest_timestamp(value, &path)?)
                }
                _ => {
                    if let Some(label) = key.strip_prefix(PER_PARTITION_KEY) {
                        manifest
                            .partition_modified
                            .insert(label.to_string(), parse_manifest_timestamp(value, &path)?);
                    } else {
                        warn!(key, "Ignoring unknown manifest key");
                    }
                }
            }
        }

        Ok(Some(manifest))
    }

    /// Write the manifest to `dir`, replacing it atomically.
    pub fn store(&self, dir: &Path) -> Result<(), CacheError> {
        let mut text = String::new();
        let _ = writeln!(text, "prefix={}", self.prefix);
        if let Some(last_modified) = self.last_modified {
            let _ = writeln!(text, "lastModifiedDate={}", format_timestamp(&last_modified));
        }
        for (label, timestamp) in &self.partition_modified {
            let _ = writeln!(
                text,
                "{PER_PARTITION_KEY}{label}={}",
                format_timestamp(timestamp)
            );
        }

        write_atomic(&dir.join(MANIFEST_FILE), text.as_bytes())
    }
}

fn parse_manifest_timestamp(value: &str, path: &Path) -> Result<DateTime<Utc>, CacheError> {
    parse_timestamp(value).ok_or_else(|| CacheError::BadTimestamp {
        value: value.to_string(),
        path: path.to_path_buf(),
    })
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use chrono::TimeZone;

    use super::*;

    #[test]
    fn round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = CacheManifest {
            prefix: "nvdcve-".to_string(),
            last_modified: Some(Utc.with_ymd_and_hms(2024, 4, 1, 12, 0, 0).unwrap()),
            partition_modified: [
                (
                    "2023".to_string(),
                    Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap(),
                ),
                (
                    "modified".to_string(),
                    Utc.with_ymd_and_hms(2024, 4, 1, 12, 0, 0).unwrap(),
                ),
            ]
            .into_iter()
            .collect(),
        };

        manifest.store(dir.path()).unwrap();
        let loaded = CacheManifest::load(dir.path()).unwrap().unwrap();
        assert_eq!(loaded, manifest);
    }

    #[test]
    fn absent_manifest_loads_as_none() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(CacheManifest::load(dir.path()).unwrap(), None);
    }

    #[test]
    fn malformed_lines_are_fatal() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(MANIFEST_FILE), "prefix nvdcve-\n").unwrap();

        assert_matches!(
            CacheManifest::load(dir.path()),
            Err(CacheError::MalformedManifest { .. })
        );
    }

    #[test]
    fn unknown_keys_are_tolerated() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join(MANIFEST_FILE),
            "prefix=nvdcve-\nsomeFutureKey=1\n",
        )
        .unwrap();

        let manifest = CacheManifest::load(dir.path()).unwrap().unwrap();
        assert_eq!(manifest.prefix, "nvdcve-");
    }
}
