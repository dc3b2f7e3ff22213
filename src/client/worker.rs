use std::sync::Arc;
use std::time::Duration;

use reqwest::StatusCode;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::backoff::{Backoff, BackoffConfig};
use crate::client::error::{Error, Result};
use crate::meter::RateMeter;

/// Statuses the worker retries on its own before handing the response back.
fn is_transient(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status == StatusCode::SERVICE_UNAVAILABLE
}

/// A single request worker.
///
/// Executions on one worker are serialized: each send waits out the minimum
/// inter-request gap since this worker's previous send, then holds a meter
/// ticket for the duration of the wire call. Parallelism comes from running
/// several workers, never from one.
///
/// Non-2xx responses are results, not errors; only transport failures surface
/// as [`Error`]. 429 and 503 are retried within the configured budget, and a
/// budget of zero hands them straight back.
#[derive(Debug)]
pub struct RateLimitedClient {
    http: reqwest::Client,
    meter: Arc<RateMeter>,
    delay: Duration,
    max_retry_count: usize,
    backoff_config: BackoffConfig,
    /// Completion instant of the most recent send. The lock doubles as this
    /// worker's execution queue.
    last_request: Mutex<Option<Instant>>,
}

impl RateLimitedClient {
    pub(crate) fn new(
        http: reqwest::Client,
        meter: Arc<RateMeter>,
        delay: Duration,
        max_retry_count: usize,
        backoff_config: BackoffConfig,
    ) -> Self {
        Self {
            http,
            meter,
            delay,
            max_retry_count,
            backoff_config,
            last_request: Mutex::new(None),
        }
    }

    pub(crate) fn http(&self) -> &reqwest::Client {
        &self.http
    }

    /// Issue `request`, retrying transient statuses within the retry budget.
    pub async fn execute(&self, request: reqwest::RequestBuilder) -> Result<reqwest::Response> {
        let mut backoff = Backoff::new(&self.backoff_config);

        for attempt in 0..self.max_retry_count {
            // A non-cloneable request carries a streaming body and cannot be
            // retried; fall through to the single authoritative attempt.
            let Some(this_try) = request.try_clone() else {
                break;
            };

            let response = self.send_gated(this_try).await?;
            let status = response.status();
            if !is_transient(status) {
                return Ok(response);
            }

            let delay = backoff.next();
            warn!(
                status = status.as_u16(),
                attempt,
                delay_ms = delay.as_millis() as u64,
                "Transient upstream status, backing off",
            );
            tokio::time::sleep(delay).await;
        }

        self.send_gated(request).await
    }

    /// One wire attempt: delay gap, meter ticket, send, record completion.
    async fn send_gated(&self, request: reqwest::RequestBuilder) -> Result<reqwest::Response> {
        let mut last_request = self.last_request.lock().await;

        if !self.delay.is_zero() {
            if let Some(last) = *last_request {
                let next_allowed = last + self.delay;
                if next_allowed > Instant::now() {
                    tokio::time::sleep_until(next_allowed).await;
                }
            }
        }

        let ticket = self.meter.acquire().await;
        debug!("Issuing request");
        let result = request.send().await;
        *last_request = Some(Instant::now());
        ticket.close();

        result.map_err(Error::Request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_statuses() {
        assert!(is_transient(StatusCode::TOO_MANY_REQUESTS));
        assert!(is_transient(StatusCode::SERVICE_UNAVAILABLE));
        assert!(!is_transient(StatusCode::OK));
        assert!(!is_transient(StatusCode::NOT_FOUND));
        assert!(!is_transient(StatusCode::INTERNAL_SERVER_ERROR));
    }
}
