//! Rate-limited HTTP execution: request workers, the round-robin pool and the
//! shared meter behind them.

use std::sync::Arc;
use std::time::Duration;

use tracing::warn;

use crate::backoff::BackoffConfig;
use crate::build_info::DEFAULT_USER_AGENT;
use crate::meter::RateMeter;

pub mod error;
mod pool;
mod worker;

pub use pool::ClientPool;
pub use worker::RateLimitedClient;

use error::ConfigError;

/// Default wall-clock budget for a single request.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Builder for [`ClientPool`].
///
/// Without an API key the worker count is forced to 1: the public rate tier
/// leaves nothing for parallel workers to do but queue on the meter.
#[derive(Debug)]
pub struct PoolBuilder {
    keyed: bool,
    thread_count: usize,
    delay: Duration,
    max_retry_count: usize,
    backoff_config: BackoffConfig,
    timeout: Duration,
    meter_override: Option<(usize, Duration)>,
}

impl PoolBuilder {
    /// Create a new [`PoolBuilder`]. `keyed` states whether requests will
    /// carry an API key, which selects the rate tier and permits parallelism.
    pub fn new(keyed: bool) -> Self {
        Self {
            keyed,
            thread_count: 1,
            delay: Duration::ZERO,
            max_retry_count: 0,
            backoff_config: BackoffConfig::default(),
            timeout: DEFAULT_REQUEST_TIMEOUT,
            meter_override: None,
        }
    }

    /// Number of parallel workers to run. Ignored without an API key.
    pub fn thread_count(mut self, thread_count: usize) -> Self {
        self.thread_count = thread_count;
        self
    }

    /// Minimum gap between consecutive sends on the same worker.
    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Retry budget for 429/503 responses.
    pub fn max_retry_count(mut self, max_retry_count: usize) -> Self {
        self.max_retry_count = max_retry_count;
        self
    }

    /// Set up backoff configuration for retried requests.
    pub fn backoff_config(mut self, backoff_config: BackoffConfig) -> Self {
        self.backoff_config = backoff_config;
        self
    }

    /// Per-request timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Replace the tier-derived meter parameters.
    pub fn meter(mut self, quantity: usize, window: Duration) -> Self {
        self.meter_override = Some((quantity, window));
        self
    }

    /// Build the [`ClientPool`].
    pub fn build(self) -> Result<ClientPool, ConfigError> {
        let thread_count = if self.keyed {
            self.thread_count.max(1)
        } else {
            if self.thread_count > 1 {
                warn!(
                    requested = self.thread_count,
                    "No API key, forcing a single request worker",
                );
            }
            1
        };

        let meter = Arc::new(match self.meter_override {
            Some((quantity, window)) => RateMeter::new(quantity, window),
            None if self.keyed => RateMeter::keyed_tier(),
            None => RateMeter::public_tier(),
        });

        let http = reqwest::Client::builder()
            .timeout(self.timeout)
            .user_agent(DEFAULT_USER_AGENT)
            .build()
            .map_err(ConfigError::HttpClient)?;

        let workers = (0..thread_count)
            .map(|_| {
                RateLimitedClient::new(
                    http.clone(),
                    Arc::clone(&meter),
                    self.delay,
                    self.max_retry_count,
                    self.backoff_config.clone(),
                )
            })
            .collect();

        Ok(ClientPool::new(workers, meter))
    }
}
