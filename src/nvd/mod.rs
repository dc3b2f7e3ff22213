//! Paged retrieval of the CVE corpus.
//!
//! The iterator issues one priming request to learn the total result count,
//! fans the remaining pages out across the worker pool, and yields batches in
//! whatever order pages complete. Consumers that need a deterministic order
//! sort afterwards; the cache store does so when it writes partitions.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::stream::{FuturesUnordered, StreamExt};
use reqwest::{StatusCode, Url};
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, info, warn};

use crate::backoff::BackoffConfig;
use crate::client::error::{ConfigError, Error, Result};
use crate::client::{ClientPool, PoolBuilder, DEFAULT_REQUEST_TIMEOUT};
use crate::config;

mod envelope;
pub mod filter;

pub use envelope::{CveApiEnvelope, CveRecord, VulnerabilityEntry};
pub use filter::Filter;

pub(crate) use envelope::parse_timestamp;

/// The CVE API 2.0 endpoint.
pub const DEFAULT_ENDPOINT: &str = "https://services.nvd.nist.gov/rest/json/cves/2.0";

/// Header carrying the API key.
pub const API_KEY_HEADER: &str = "apiKey";

/// Largest page the service will serve.
pub const MAX_RESULTS_PER_PAGE: u32 = 2000;

/// Default inter-request gap per worker when a key is configured.
pub const DEFAULT_KEYED_DELAY: Duration = Duration::from_millis(600);

/// Default inter-request gap per worker on the public tier.
pub const DEFAULT_KEYLESS_DELAY: Duration = Duration::from_millis(6500);

/// Configuration for [`CveIterator`].
#[derive(Debug, Clone)]
pub struct NvdClientConfig {
    /// Sent as the `apiKey` header when present; also selects the rate tier.
    pub api_key: Option<String>,
    pub endpoint: String,
    /// Minimum gap between sends on one worker. `None` picks the tier default.
    pub delay: Option<Duration>,
    /// Parallel request workers. Forced to 1 without an API key.
    pub thread_count: usize,
    /// Upper bound on pages fetched, 0 meaning unlimited.
    pub max_page_count: usize,
    /// Clamped to `[1, 2000]`.
    pub results_per_page: u32,
    /// Retry budget for 429/503 responses.
    pub max_retry_count: usize,
    pub backoff: BackoffConfig,
    pub timeout: Duration,
    pub filters: Vec<Filter>,
}

impl Default for NvdClientConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            endpoint: DEFAULT_ENDPOINT.to_string(),
            delay: None,
            thread_count: 1,
            max_page_count: 0,
            results_per_page: MAX_RESULTS_PER_PAGE,
            max_retry_count: 0,
            backoff: BackoffConfig::default(),
            timeout: DEFAULT_REQUEST_TIMEOUT,
            filters: Vec::new(),
        }
    }
}

impl NvdClientConfig {
    /// Defaults, with the API key picked up from `NVD_API_KEY`.
    pub fn from_env() -> Self {
        Self {
            api_key: config::nvd_api_key(),
            ..Default::default()
        }
    }

    /// The inter-request gap this configuration resolves to.
    pub fn effective_delay(&self) -> Duration {
        self.delay.unwrap_or(if self.api_key.is_some() {
            DEFAULT_KEYED_DELAY
        } else {
            DEFAULT_KEYLESS_DELAY
        })
    }

    fn validate(&self) -> Result<(), ConfigError> {
        for filter in &self.filters {
            filter.validate()?;
        }
        Ok(())
    }
}

/// The unit a page fetch yields to the consumer.
#[derive(Debug)]
pub struct PageBatch {
    pub records: Vec<CveRecord>,
    /// The server's total result count for the whole query.
    pub total_available: u32,
    /// Snapshot timestamp the server reported with this page.
    pub server_timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Fresh,
    Priming,
    Streaming,
    Drained,
    Terminated,
    Closed,
}

#[derive(Debug)]
struct FetchedPage {
    status: StatusCode,
    /// `None` when the page came back non-2xx.
    envelope: Option<CveApiEnvelope>,
}

type PageTask = JoinHandle<Result<FetchedPage>>;

/// Lazy, finite sequence of [`PageBatch`]es for one CVE query.
///
/// Batches arrive in completion order. The first error (non-success status,
/// undecodable body, transport failure) ends the sequence; pages already in
/// flight keep running until [`CveIterator::close`] or drop cancels them.
pub struct CveIterator {
    endpoint: Url,
    api_key: Option<String>,
    results_per_page: u32,
    max_page_count: usize,
    filters: Vec<Filter>,
    pool: Arc<ClientPool>,
    state: State,
    in_flight: FuturesUnordered<PageTask>,
    aborts: Vec<AbortHandle>,
    total_results: Option<u32>,
    last_updated: Option<DateTime<Utc>>,
    last_status: Option<StatusCode>,
}

impl CveIterator {
    pub fn new(config: NvdClientConfig) -> Result<Self> {
        config.validate()?;

        let endpoint = Url::parse(&config.endpoint).map_err(|error| ConfigError::InvalidEndpoint {
            url: config.endpoint.clone(),
            reason: error.to_string(),
        })?;

        let results_per_page = config.results_per_page.clamp(1, MAX_RESULTS_PER_PAGE);
        if results_per_page != config.results_per_page {
            debug!(
                requested = config.results_per_page,
                clamped = results_per_page,
                "Clamping resultsPerPage",
            );
        }

        let pool = PoolBuilder::new(config.api_key.is_some())
            .thread_count(config.thread_count)
            .delay(config.effective_delay())
            .max_retry_count(config.max_retry_count)
            .backoff_config(config.backoff.clone())
            .timeout(config.timeout)
            .build()?;

        Ok(Self {
            endpoint,
            api_key: config.api_key,
            results_per_page,
            max_page_count: config.max_page_count,
            filters: config.filters,
            pool: Arc::new(pool),
            state: State::Fresh,
            in_flight: FuturesUnordered::new(),
            aborts: Vec::new(),
            total_results: None,
            last_updated: None,
            last_status: None,
        })
    }

    /// Total matching records, known once the priming request completed.
    pub fn total_results(&self) -> Option<u32> {
        self.total_results
    }

    /// Latest server-reported snapshot time across fetched pages.
    pub fn last_updated(&self) -> Option<DateTime<Utc>> {
        self.last_updated
    }

    /// Status of the most recently decoded response.
    pub fn last_status_code(&self) -> Option<StatusCode> {
        self.last_status
    }

    /// Whether another `next_batch` call can still produce records.
    pub fn has_next(&self) -> bool {
        match self.state {
            State::Fresh | State::Priming => true,
            State::Streaming => !self.in_flight.is_empty(),
            State::Drained | State::Terminated | State::Closed => false,
        }
    }

    /// Deliver the next completed page.
    ///
    /// Returns `Ok(None)` once every page has been delivered (or after the
    /// iterator terminated or was closed). The first failure is returned as
    /// `Err` and ends the sequence.
    pub async fn next_batch(&mut self) -> Result<Option<PageBatch>> {
        match self.state {
            State::Fresh | State::Priming => {
                self.state = State::Priming;
                match self.prime().await {
                    Ok(batch) => {
                        self.state = if self.in_flight.is_empty() {
                            State::Drained
                        } else {
                            State::Streaming
                        };
                        Ok(Some(batch))
                    }
                    Err(error) => {
                        self.state = State::Terminated;
                        Err(error)
                    }
                }
            }
            State::Streaming => self.drain_one().await,
            State::Drained | State::Terminated | State::Closed => Ok(None),
        }
    }

    /// Cancel outstanding page requests and end the sequence.
    pub fn close(&mut self) {
        if self.state == State::Closed {
            return;
        }
        for abort in self.aborts.drain(..) {
            abort.abort();
        }
        self.in_flight.clear();
        self.state = State::Closed;
    }

    /// Discovery request: page at index 0, blocking until it completes, then
    /// fan-out for everything past it.
    async fn prime(&mut self) -> Result<PageBatch> {
        let response = self.pool.execute(self.request(0)).await?;
        let status = response.status();
        self.last_status = Some(status);
        if !status.is_success() {
            warn!(status = status.as_u16(), "Priming request failed");
            return Err(Error::Upstream { status });
        }

        let envelope = decode_envelope(response).await?;
        let total_results = envelope.total_results;
        self.total_results = Some(total_results);

        let server_timestamp = envelope.server_timestamp();
        self.bump_last_updated(server_timestamp);

        self.fan_out(total_results);

        Ok(PageBatch {
            records: envelope.into_records()?,
            total_available: total_results,
            server_timestamp,
        })
    }

    fn fan_out(&mut self, total_results: u32) {
        let starts = page_starts(self.results_per_page, total_results, self.max_page_count);
        info!(
            total_results,
            pages = starts.len() + 1,
            workers = self.pool.worker_count(),
            "Fanning out page requests",
        );

        for start_index in starts {
            let pool = Arc::clone(&self.pool);
            let request = self.request(start_index);
            let handle = tokio::spawn(async move {
                let response = pool.execute(request).await?;
                let status = response.status();
                if !status.is_success() {
                    return Ok(FetchedPage {
                        status,
                        envelope: None,
                    });
                }
                let envelope = decode_envelope(response).await?;
                Ok(FetchedPage {
                    status,
                    envelope: Some(envelope),
                })
            });
            self.aborts.push(handle.abort_handle());
            self.in_flight.push(handle);
        }
    }

    async fn drain_one(&mut self) -> Result<Option<PageBatch>> {
        let Some(joined) = self.in_flight.next().await else {
            debug!("All pages delivered");
            self.state = State::Drained;
            return Ok(None);
        };

        let outcome = match joined {
            Ok(outcome) => outcome,
            Err(join_error) => {
                self.state = State::Terminated;
                warn!(%join_error, "Page task did not complete");
                return Err(Error::Interrupted);
            }
        };

        let fetched = match outcome {
            Ok(fetched) => fetched,
            Err(error) => {
                self.state = State::Terminated;
                return Err(error);
            }
        };

        self.last_status = Some(fetched.status);
        let Some(envelope) = fetched.envelope else {
            warn!(
                status = fetched.status.as_u16(),
                "Upstream reported a non-success page, stopping",
            );
            self.state = State::Terminated;
            return Err(Error::Upstream {
                status: fetched.status,
            });
        };

        let total_available = envelope.total_results;
        let server_timestamp = envelope.server_timestamp();
        self.bump_last_updated(server_timestamp);

        let records = match envelope.into_records() {
            Ok(records) => records,
            Err(error) => {
                self.state = State::Terminated;
                return Err(error);
            }
        };

        Ok(Some(PageBatch {
            records,
            total_available,
            server_timestamp,
        }))
    }

    fn bump_last_updated(&mut self, candidate: Option<DateTime<Utc>>) {
        if let Some(candidate) = candidate {
            self.last_updated = Some(match self.last_updated {
                Some(current) => current.max(candidate),
                None => candidate,
            });
        }
    }

    fn request(&self, start_index: u32) -> reqwest::RequestBuilder {
        let mut url = self.endpoint.clone();
        for filter in &self.filters {
            filter.append_to(&mut url);
        }
        url.query_pairs_mut()
            .append_pair("resultsPerPage", &self.results_per_page.to_string())
            .append_pair("startIndex", &start_index.to_string());

        let builder = self.pool.http().get(url);
        match &self.api_key {
            Some(key) => builder.header(API_KEY_HEADER, key),
            None => builder,
        }
    }
}

impl Drop for CveIterator {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for CveIterator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CveIterator")
            .field("state", &self.state)
            .field("total_results", &self.total_results)
            .field("in_flight", &self.in_flight.len())
            .finish_non_exhaustive()
    }
}

/// Start indices of the fan-out pages, after the one at index 0.
fn page_starts(results_per_page: u32, total_results: u32, max_page_count: usize) -> Vec<u32> {
    let mut starts: Vec<u32> = (results_per_page..total_results)
        .step_by(results_per_page as usize)
        .collect();
    if max_page_count > 0 && starts.len() > max_page_count - 1 {
        warn!(
            dropped = starts.len() - (max_page_count - 1),
            "Page budget truncates the fetch",
        );
        starts.truncate(max_page_count - 1);
    }
    starts
}

async fn decode_envelope(response: reqwest::Response) -> Result<CveApiEnvelope> {
    response
        .json::<CveApiEnvelope>()
        .await
        .map_err(|error| Error::Decode {
            context: "CVE API",
            reason: error.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_starts_cover_the_tail() {
        assert_eq!(page_starts(2000, 6001, 0), vec![2000, 4000, 6000]);
        assert_eq!(page_starts(2000, 6000, 0), vec![2000, 4000]);
        assert_eq!(page_starts(2000, 1999, 0), Vec::<u32>::new());
        assert_eq!(page_starts(1, 4, 0), vec![1, 2, 3]);
    }

    #[test]
    fn page_budget_counts_the_priming_page() {
        assert_eq!(page_starts(10, 100, 3), vec![10, 20]);
        assert_eq!(page_starts(10, 100, 1), Vec::<u32>::new());
    }

    #[test]
    fn delay_defaults_follow_the_key() {
        let keyless = NvdClientConfig::default();
        assert_eq!(keyless.effective_delay(), DEFAULT_KEYLESS_DELAY);

        let keyed = NvdClientConfig {
            api_key: Some("key".to_string()),
            ..Default::default()
        };
        assert_eq!(keyed.effective_delay(), DEFAULT_KEYED_DELAY);

        let explicit = NvdClientConfig {
            delay: Some(Duration::from_millis(50)),
            ..Default::default()
        };
        assert_eq!(explicit.effective_delay(), Duration::from_millis(50));
    }

    #[test]
    fn request_url_carries_filters_and_paging() {
        let iterator = CveIterator::new(NvdClientConfig {
            endpoint: "https://services.example/rest/json/cves/2.0".to_string(),
            results_per_page: 100,
            filters: vec![Filter::HasKev, Filter::CweId("CWE-89".to_string())],
            ..Default::default()
        })
        .unwrap();

        let request = iterator.request(200).build().unwrap();
        assert_eq!(
            request.url().as_str(),
            "https://services.example/rest/json/cves/2.0?hasKev&cweId=CWE-89&resultsPerPage=100&startIndex=200"
        );
    }

    #[test]
    fn results_per_page_is_clamped() {
        let iterator = CveIterator::new(NvdClientConfig {
            results_per_page: 50_000,
            ..Default::default()
        })
        .unwrap();
        assert_eq!(iterator.results_per_page, MAX_RESULTS_PER_PAGE);

        let iterator = CveIterator::new(NvdClientConfig {
            results_per_page: 0,
            ..Default::default()
        })
        .unwrap();
        assert_eq!(iterator.results_per_page, 1);
    }

    #[test]
    fn oversized_range_filter_fails_construction() {
        use chrono::TimeZone;

        let start = Utc.with_ymd_and_hms(2023, 1, 1, 0, 0, 0).unwrap();
        let config = NvdClientConfig {
            filters: vec![Filter::LastModRange {
                start,
                end: start + chrono::Duration::days(200),
            }],
            ..Default::default()
        };

        assert!(matches!(
            CveIterator::new(config),
            Err(Error::Config(ConfigError::ModifiedRangeTooWide { .. }))
        ));
    }
}
