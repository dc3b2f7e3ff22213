//! Year-partitioned on-disk persistence of the CVE corpus.
//!
//! One gzipped JSON envelope plus one integrity sidecar per partition, and a
//! `cache.properties` manifest tying the set together. Partition writes go
//! through a temp file and a rename so readers never observe torn state.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{self, BufReader, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Datelike, SecondsFormat, Utc};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::Serialize;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, info};

use crate::nvd::{CveApiEnvelope, CveRecord};

mod manifest;
mod meta;
mod partition;

pub use manifest::{CacheManifest, DEFAULT_PREFIX, MANIFEST_FILE};
pub use meta::PartitionMeta;
pub use partition::{in_modified_window, PartitionKey, FLOOR_YEAR, MODIFIED_WINDOW_DAYS};

const ENVELOPE_FORMAT: &str = "NVD_CVE";
const ENVELOPE_VERSION: &str = "2.0";

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum CacheError {
    #[error("Cache I/O failed on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Partition {path} is corrupt: {reason}")]
    Corrupt { path: PathBuf, reason: String },

    #[error("Manifest line {line:?} is not a key=value pair")]
    MalformedManifest { line: String },

    #[error("Unparseable timestamp {value:?} in {path}")]
    BadTimestamp { value: String, path: PathBuf },
}

pub type Result<T, E = CacheError> = std::result::Result<T, E>;

/// The in-memory working set of the mirror: per-partition record maps keyed
/// by CVE id, loaded from disk on open and rewritten on a successful run.
///
/// The store is single-owner; nothing here is shared across tasks.
#[derive(Debug)]
pub struct CacheStore {
    dir: PathBuf,
    manifest: CacheManifest,
    partitions: BTreeMap<PartitionKey, BTreeMap<String, CveRecord>>,
    now: DateTime<Utc>,
}

impl CacheStore {
    /// Open (or initialize) the cache at `dir`.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        Self::open_at(dir, Utc::now())
    }

    /// Open with an explicit clock; the modified window is measured from it.
    pub fn open_at(dir: impl Into<PathBuf>, now: DateTime<Utc>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|source| CacheError::Io {
            path: dir.clone(),
            source,
        })?;

        let manifest = CacheManifest::load(&dir)?.unwrap_or_default();
        let mut store = Self {
            dir,
            manifest,
            partitions: BTreeMap::new(),
            now,
        };
        store.load_partitions()?;
        store.rebuild_modified();
        Ok(store)
    }

    fn load_partitions(&mut self) -> Result<()> {
        for year in FLOOR_YEAR..=self.now.year() {
            let key = PartitionKey::Year(year);
            let path = self.partition_path(&key);
            let file = match File::open(&path) {
                Ok(file) => file,
                Err(error) if error.kind() == io::ErrorKind::NotFound => continue,
                Err(source) => return Err(CacheError::Io { path, source }),
            };

            // A present-but-undecodable partition means the snapshot can no
            // longer be trusted; refuse to continue rather than resilver it.
            let envelope: CveApiEnvelope =
                serde_json::from_reader(BufReader::new(GzDecoder::new(file))).map_err(|error| {
                    CacheError::Corrupt {
                        path: path.clone(),
                        reason: error.to_string(),
                    }
                })?;
            let records = envelope.into_records().map_err(|error| CacheError::Corrupt {
                path: path.clone(),
                reason: error.to_string(),
            })?;

            debug!(year, records = records.len(), "Loaded partition");
            let bucket = self.partitions.entry(key).or_default();
            for record in records {
                bucket.insert(record.id.clone(), record);
            }
        }
        Ok(())
    }

    /// "modified" is never read from disk; it is rederived from whatever
    /// currently satisfies the window.
    fn rebuild_modified(&mut self) {
        let recent: Vec<CveRecord> = self
            .partitions
            .iter()
            .filter(|(key, _)| matches!(key, PartitionKey::Year(_)))
            .flat_map(|(_, bucket)| bucket.values())
            .filter(|record| in_modified_window(record.last_modified, self.now))
            .cloned()
            .collect();

        let bucket = self.partitions.entry(PartitionKey::Modified).or_default();
        bucket.clear();
        for record in recent {
            bucket.insert(record.id.clone(), record);
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn prefix(&self) -> &str {
        &self.manifest.prefix
    }

    /// Latest server-reported update across successful runs.
    pub fn last_modified(&self) -> Option<DateTime<Utc>> {
        self.manifest.last_modified
    }

    /// Records currently held for one partition.
    pub fn partition(&self, key: &PartitionKey) -> Option<&BTreeMap<String, CveRecord>> {
        self.partitions.get(key)
    }

    /// Total records across year partitions (the modified view not counted).
    pub fn record_count(&self) -> usize {
        self.partitions
            .iter()
            .filter(|(key, _)| matches!(key, PartitionKey::Year(_)))
            .map(|(_, bucket)| bucket.len())
            .sum()
    }

    /// Merge incoming records; within a run, later arrivals win.
    pub fn merge(&mut self, records: impl IntoIterator<Item = CveRecord>) -> usize {
        let mut merged = 0;
        for record in records {
            let key = PartitionKey::for_published(record.published);
            if in_modified_window(record.last_modified, self.now) {
                self.partitions
                    .entry(PartitionKey::Modified)
                    .or_default()
                    .insert(record.id.clone(), record.clone());
            }
            self.partitions
                .entry(key)
                .or_default()
                .insert(record.id.clone(), record);
            merged += 1;
        }
        merged
    }

    /// Raise the manifest's cache-wide timestamp; it never moves backwards.
    pub fn advance_last_modified(&mut self, candidate: DateTime<Utc>) {
        match self.manifest.last_modified {
            Some(current) if current >= candidate => {}
            _ => self.manifest.last_modified = Some(candidate),
        }
    }

    /// Write every held partition (payload + sidecar, atomically substituted)
    /// and record their timestamps in the manifest. Returns how many were
    /// written.
    pub fn write_partitions(
        &mut self,
        session_last_updated: Option<DateTime<Utc>>,
    ) -> Result<usize> {
        let keys: Vec<PartitionKey> = self.partitions.keys().copied().collect();
        for key in &keys {
            let meta = self.write_partition(key, session_last_updated)?;
            self.manifest
                .partition_modified
                .insert(key.to_string(), meta.last_modified);
        }
        Ok(keys.len())
    }

    /// Persist `cache.properties`.
    pub fn persist_manifest(&self) -> Result<()> {
        self.manifest.store(&self.dir)
    }

    pub fn partition_path(&self, key: &PartitionKey) -> PathBuf {
        self.dir
            .join(format!("{}{}.json.gz", self.manifest.prefix, key))
    }

    pub fn meta_path(&self, key: &PartitionKey) -> PathBuf {
        self.dir.join(format!("{}{}.meta", self.manifest.prefix, key))
    }

    fn write_partition(
        &self,
        key: &PartitionKey,
        session_last_updated: Option<DateTime<Utc>>,
    ) -> Result<PartitionMeta> {
        let empty = BTreeMap::new();
        let records = self.partitions.get(key).unwrap_or(&empty);

        let timestamp = records
            .values()
            .map(|record| record.last_modified)
            .max()
            .or(session_last_updated)
            .unwrap_or(self.now);

        let path = self.partition_path(key);
        let meta_path = self.meta_path(key);
        let tmp = tmp_path(&path);
        let meta_tmp = tmp_path(&meta_path);

        // Both temp files are made durable before either rename, so an error
        // return leaves the prior payload/meta pair untouched.
        let staged = self
            .write_payload(&tmp, records, timestamp)
            .and_then(|(size, gz_size, sha256)| {
                let meta = PartitionMeta {
                    last_modified: timestamp,
                    size,
                    gz_size,
                    sha256,
                };
                write_durable(&meta_tmp, meta.to_text().as_bytes())?;
                Ok(meta)
            })
            .and_then(|meta| {
                fs::rename(&tmp, &path).map_err(|source| CacheError::Io {
                    path: path.clone(),
                    source,
                })?;
                Ok(meta)
            });

        let meta = match staged {
            Ok(meta) => meta,
            Err(error) => {
                let _ = fs::remove_file(&tmp);
                let _ = fs::remove_file(&meta_tmp);
                return Err(error);
            }
        };

        fs::rename(&meta_tmp, &meta_path).map_err(|source| CacheError::Io {
            path: meta_path.clone(),
            source,
        })?;

        info!(
            partition = %key,
            records = records.len(),
            gz_size = meta.gz_size,
            "Wrote partition",
        );
        Ok(meta)
    }

    /// Stream the envelope through gzip into `tmp`, measuring the uncompressed
    /// size and the compressed size + digest in one pass.
    fn write_payload(
        &self,
        tmp: &Path,
        records: &BTreeMap<String, CveRecord>,
        timestamp: DateTime<Utc>,
    ) -> Result<(u64, u64, String)> {
        let io_error = |source: io::Error| CacheError::Io {
            path: tmp.to_path_buf(),
            source,
        };

        let file = File::create(tmp).map_err(io_error)?;
        let digest = DigestWriter::new(file);
        let encoder = GzEncoder::new(digest, Compression::default());
        let mut counting = CountingWriter::new(encoder);

        let envelope = PartitionEnvelope {
            results_per_page: records.len(),
            start_index: 0,
            total_results: records.len(),
            format: ENVELOPE_FORMAT,
            version: ENVELOPE_VERSION,
            timestamp: format_timestamp(&timestamp),
            vulnerabilities: records
                .values()
                .map(|record| VulnerabilityRef { cve: &record.body })
                .collect(),
        };
        serde_json::to_writer(&mut counting, &envelope)
            .map_err(|error| io_error(io::Error::other(error)))?;

        let size = counting.written();
        let encoder = counting.into_inner();
        let digest = encoder.finish().map_err(io_error)?;
        let (file, gz_size, sha256) = digest.finish();
        file.sync_all().map_err(io_error)?;

        Ok((size, gz_size, sha256))
    }
}

/// The envelope a partition file holds; field-for-field the API page shape.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PartitionEnvelope<'a> {
    results_per_page: usize,
    start_index: usize,
    total_results: usize,
    format: &'static str,
    version: &'static str,
    timestamp: String,
    vulnerabilities: Vec<VulnerabilityRef<'a>>,
}

#[derive(Serialize)]
struct VulnerabilityRef<'a> {
    cve: &'a serde_json::Value,
}

/// `yyyy-MM-ddTHH:mm:ssX`, the timestamp spelling used across cache files.
pub(crate) fn format_timestamp(timestamp: &DateTime<Utc>) -> String {
    timestamp.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Write `bytes` to `path` via a sibling temp file and an atomic rename.
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let tmp = tmp_path(path);
    if let Err(error) = write_durable(&tmp, bytes) {
        let _ = fs::remove_file(&tmp);
        return Err(error);
    }

    fs::rename(&tmp, path).map_err(|source| CacheError::Io {
        path: path.to_path_buf(),
        source,
    })
}

/// Write `bytes` to `path` and fsync before returning.
fn write_durable(path: &Path, bytes: &[u8]) -> Result<()> {
    let io_error = |source: io::Error| CacheError::Io {
        path: path.to_path_buf(),
        source,
    };

    let mut file = File::create(path).map_err(io_error)?;
    file.write_all(bytes).map_err(io_error)?;
    file.sync_all().map_err(io_error)
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".tmp");
    PathBuf::from(name)
}

/// Counts bytes passing through to the inner writer.
struct CountingWriter<W: Write> {
    inner: W,
    written: u64,
}

impl<W: Write> CountingWriter<W> {
    fn new(inner: W) -> Self {
        Self { inner, written: 0 }
    }

    fn written(&self) -> u64 {
        self.written
    }

    fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: Write> Write for CountingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Counts and SHA-256-hashes bytes passing through to the inner writer.
struct DigestWriter<W: Write> {
    inner: W,
    hasher: Sha256,
    written: u64,
}

impl<W: Write> DigestWriter<W> {
    fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
            written: 0,
        }
    }

    fn finish(self) -> (W, u64, String) {
        let digest = self.hasher.finalize();
        (self.inner, self.written, meta::hex_digest(&digest))
    }
}

impl<W: Write> Write for DigestWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}
