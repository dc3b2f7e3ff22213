//! Sidecar metadata describing a written partition.

use std::path::Path;

use chrono::{DateTime, Utc};

use super::{format_timestamp, CacheError};
use crate::nvd::parse_timestamp;

/// Integrity sidecar stored next to each `.json.gz` partition.
///
/// `size` is the uncompressed envelope length, `gz_size` the on-disk length
/// of the compressed file, and `sha256` the lowercase hex digest of the
/// compressed bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionMeta {
    pub last_modified: DateTime<Utc>,
    pub size: u64,
    pub gz_size: u64,
    pub sha256: String,
}

impl PartitionMeta {
    /// Render in the `key:value` sidecar format.
    pub fn to_text(&self) -> String {
        format!(
            "lastModifiedDate:{}\nsize:{}\ngzSize:{}\nsha256:{}\n",
            format_timestamp(&self.last_modified),
            self.size,
            self.gz_size,
            self.sha256,
        )
    }

    /// Parse a sidecar file's contents. `path` is reporting context only.
    pub fn parse(text: &str, path: &Path) -> Result<Self, CacheError> {
        let mut last_modified = None;
        let mut size = None;
        let mut gz_size = None;
        let mut sha256 = None;

        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let Some((key, value)) = line.split_once(':') else {
                return Err(CacheError::Corrupt {
                    path: path.to_path_buf(),
                    reason: format!("sidecar line {line:?} is not a key:value pair"),
                });
            };
            match key {
                "lastModifiedDate" => {
                    last_modified = Some(parse_timestamp(value).ok_or_else(|| {
                        CacheError::BadTimestamp {
                            value: value.to_string(),
                            path: path.to_path_buf(),
                        }
                    })?)
                }
                "size" => size = value.parse().ok(),
                "gzSize" => gz_size = value.parse().ok(),
                "sha256" => sha256 = Some(value.to_string()),
                _ => {}
            }
        }

        match (last_modified, size, gz_size, sha256) {
            (Some(last_modified), Some(size), Some(gz_size), Some(sha256)) => Ok(Self {
                last_modified,
                size,
                gz_size,
                sha256,
            }),
            _ => Err(CacheError::Corrupt {
                path: path.to_path_buf(),
                reason: "sidecar is missing required keys".to_string(),
            }),
        }
    }
}

/// Lowercase hex rendering of a digest.
pub(crate) fn hex_digest(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}
