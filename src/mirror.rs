//! Top-level mirror flow: load the cache, fetch the delta (or everything),
//! merge, and persist.

use std::path::PathBuf;

use chrono::{DateTime, Duration, Utc};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::cache::{CacheError, CacheStore};
use crate::nvd::{CveIterator, Filter, NvdClientConfig};

/// Longest span the incremental filter may cover; a cache older than this
/// can only be brought current by a full fetch.
pub const DELTA_WINDOW_DAYS: i64 = 120;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    #[error("Fetch failed: {0}")]
    Fetch(#[from] crate::client::error::Error),

    #[error("Cache failed: {0}")]
    Cache(#[from] CacheError),
}

impl Error {
    /// Process exit status for this failure; success exits 0.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Fetch(crate::client::error::Error::Upstream { .. }) => 2,
            _ => 1,
        }
    }
}

/// Configuration for one mirror run.
#[derive(Debug, Clone)]
pub struct MirrorConfig {
    pub cache_dir: PathBuf,
    pub nvd: NvdClientConfig,
}

impl MirrorConfig {
    /// Cache at `cache_dir`, NVD access configured from the environment.
    pub fn new(cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            cache_dir: cache_dir.into(),
            nvd: NvdClientConfig::from_env(),
        }
    }
}

/// What a successful run accomplished.
#[derive(Debug, Clone)]
pub struct MirrorSummary {
    pub records_merged: usize,
    pub partitions_written: usize,
    /// The server's total for the query, once known.
    pub total_available: Option<u32>,
    /// The manifest timestamp after the run.
    pub last_modified: Option<DateTime<Utc>>,
}

/// One-shot orchestrator owning the iterator and the store for the run.
#[derive(Debug)]
pub struct Mirror {
    config: MirrorConfig,
}

impl Mirror {
    pub fn new(config: MirrorConfig) -> Self {
        Self { config }
    }

    /// Execute the mirror run.
    ///
    /// On any terminal fetch failure nothing is written; the on-disk snapshot
    /// stays at its prior state.
    pub async fn run(&self) -> Result<MirrorSummary, Error> {
        self.run_at(Utc::now()).await
    }

    /// Run against an explicit clock (drives the incremental-window decision
    /// and the modified partition).
    pub async fn run_at(&self, now: DateTime<Utc>) -> Result<MirrorSummary, Error> {
        let mut store = CacheStore::open_at(&self.config.cache_dir, now)?;

        let mut nvd = self.config.nvd.clone();
        match store.last_modified() {
            Some(last_modified) => match delta_window(last_modified, now) {
                Some((start, end)) => {
                    info!(%start, %end, "Incremental fetch");
                    nvd.filters.push(Filter::LastModRange { start, end });
                }
                None => warn!(
                    %last_modified,
                    "Cache is older than the delta window, falling back to a full fetch",
                ),
            },
            None => debug!("No prior snapshot, full fetch"),
        }

        let mut iterator = CveIterator::new(nvd)?;
        let mut records_merged = 0;
        while let Some(batch) = iterator.next_batch().await? {
            records_merged += store.merge(batch.records);
        }

        if let Some(last_updated) = iterator.last_updated() {
            store.advance_last_modified(last_updated);
        }
        let partitions_written = store.write_partitions(iterator.last_updated())?;
        store.persist_manifest()?;

        info!(
            records_merged,
            partitions_written,
            total_available = iterator.total_results(),
            "Mirror run complete",
        );

        Ok(MirrorSummary {
            records_merged,
            partitions_written,
            total_available: iterator.total_results(),
            last_modified: store.last_modified(),
        })
    }
}

/// The incremental range `[last_modified, last_modified + 120d]` capped at
/// `now`, or `None` when the snapshot is too old for delta semantics.
pub(crate) fn delta_window(
    last_modified: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
    if now - last_modified > Duration::days(DELTA_WINDOW_DAYS) {
        return None;
    }
    let end = (last_modified + Duration::days(DELTA_WINDOW_DAYS)).min(now);
    Some((last_modified, end))
}
