use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::client::error::Result;
use crate::client::worker::RateLimitedClient;
use crate::meter::RateMeter;

/// Round-robins requests over a fixed set of workers sharing one meter.
///
/// The pool owns its workers; callers obtain parallelism by submitting from
/// several tasks at once, each submission landing on the next worker in turn.
/// Cancelling a submission (dropping its future) cancels the in-flight
/// request; the ticket it held recycles by expiry.
#[derive(Debug)]
pub struct ClientPool {
    workers: Vec<RateLimitedClient>,
    meter: Arc<RateMeter>,
    cursor: AtomicUsize,
}

impl ClientPool {
    pub(crate) fn new(workers: Vec<RateLimitedClient>, meter: Arc<RateMeter>) -> Self {
        assert!(!workers.is_empty(), "pool requires at least one worker");

        Self {
            workers,
            meter,
            cursor: AtomicUsize::new(0),
        }
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    pub fn meter(&self) -> &RateMeter {
        &self.meter
    }

    /// The HTTP handle shared by this pool's workers, for building requests
    /// that will be submitted through [`ClientPool::execute`].
    pub fn http(&self) -> &reqwest::Client {
        self.workers[0].http()
    }

    /// Execute `request` on the next worker in round-robin order.
    pub async fn execute(&self, request: reqwest::RequestBuilder) -> Result<reqwest::Response> {
        let slot = self.cursor.fetch_add(1, Ordering::Relaxed) % self.workers.len();
        self.workers[slot].execute(request).await
    }
}
