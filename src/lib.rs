//! A rate-limited mirror client for the NVD CVE API, with GitHub Security
//! Advisories as a secondary source.
//!
//! The crate pulls the CVE corpus through a paged fetch pipeline — one
//! priming request to learn the total, then a rate-bounded fan-out across a
//! worker pool — and persists it as a year-partitioned, gzip-compressed cache
//! with integrity sidecars and incremental-update semantics.
//!
//! ```no_run
//! use vulnmirror::mirror::{Mirror, MirrorConfig};
//!
//! # async fn run() -> Result<(), vulnmirror::mirror::Error> {
//! let summary = Mirror::new(MirrorConfig::new("./cache")).run().await?;
//! println!("merged {} records", summary.records_merged);
//! # Ok(())
//! # }
//! ```
//!
//! The pieces compose from the bottom up: a [`meter::RateMeter`] grants
//! tickets over a rolling window, [`client::RateLimitedClient`] workers space
//! their sends and queue on it, a [`client::ClientPool`] round-robins across
//! the workers, and [`nvd::CveIterator`] / [`ghsa::AdvisoryIterator`] drive
//! pools through paged queries. [`cache::CacheStore`] holds the on-disk
//! snapshot and [`mirror::Mirror`] ties a whole run together. Runs that skip
//! the cache stream through [`output::CveJsonWriter`] instead.

#![warn(missing_debug_implementations, rust_2018_idioms)]

mod build_info;

pub mod backoff;
pub mod cache;
pub mod client;
pub mod config;
pub mod ghsa;
pub mod meter;
pub mod mirror;
pub mod nvd;
pub mod output;

pub use build_info::VERSION;
