//! Sliding-window rate meter shared by all request workers.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

/// Requests permitted per window against the NVD API without an API key.
pub const PUBLIC_RATE_QUANTITY: usize = 5;

/// Requests permitted per window with an API key.
pub const KEYED_RATE_QUANTITY: usize = 50;

/// The rolling window both rate tiers are measured over.
pub const RATE_WINDOW: Duration = Duration::from_millis(32_500);

/// Grants a bounded number of tickets over a rolling time window.
///
/// A ticket issued at `t` occupies one of `quantity` slots until `t + window`
/// passes, at which point the slot recycles on its own. Capacity is freed by
/// the clock alone, so a worker that dies mid-request cannot strand a slot.
/// [`RateMeter::acquire`] suspends while the meter is full; waiters are
/// served in arrival order.
#[derive(Debug)]
pub struct RateMeter {
    quantity: usize,
    window: Duration,
    /// Expiry instants of outstanding tickets, ascending.
    issued: Mutex<VecDeque<Instant>>,
}

impl RateMeter {
    /// Create a meter granting `quantity` tickets per rolling `window`.
    ///
    /// # Panics
    ///
    /// Panics if `quantity` is zero or `window` is zero; such a meter could
    /// never grant a ticket.
    pub fn new(quantity: usize, window: Duration) -> Self {
        assert!(quantity > 0, "rate meter quantity must be positive");
        assert!(!window.is_zero(), "rate meter window must be positive");

        Self {
            quantity,
            window,
            issued: Mutex::new(VecDeque::new()),
        }
    }

    /// Meter calibrated to the keyless NVD rate tier.
    pub fn public_tier() -> Self {
        Self::new(PUBLIC_RATE_QUANTITY, RATE_WINDOW)
    }

    /// Meter calibrated to the API-key NVD rate tier.
    pub fn keyed_tier() -> Self {
        Self::new(KEYED_RATE_QUANTITY, RATE_WINDOW)
    }

    pub fn quantity(&self) -> usize {
        self.quantity
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Obtain a ticket, suspending until a slot is free.
    ///
    /// The queue lock is held while waiting, so concurrent callers line up on
    /// it and are granted tickets in arrival order.
    pub async fn acquire(&self) -> RateTicket {
        let mut issued = self.issued.lock().await;

        loop {
            let now = Instant::now();
            while issued.front().is_some_and(|&expiry| expiry <= now) {
                issued.pop_front();
            }

            if issued.len() < self.quantity {
                let expires_at = now + self.window;
                issued.push_back(expires_at);
                return RateTicket { expires_at };
            }

            // Full: the earliest outstanding ticket frees the next slot.
            if let Some(&earliest) = issued.front() {
                tokio::time::sleep_until(earliest).await;
            }
        }
    }
}

/// Proof of a granted meter slot.
///
/// The slot recycles when `expires_at` passes regardless of what the holder
/// does, so dropping a ticket early does not return capacity and neither does
/// [`RateTicket::close`]; close is retained for callers that want the return
/// of the ticket to be explicit in the source.
#[derive(Debug)]
pub struct RateTicket {
    expires_at: Instant,
}

impl RateTicket {
    /// When this ticket's slot becomes grantable again.
    pub fn expires_at(&self) -> Instant {
        self.expires_at
    }

    /// Return the ticket. Consuming `self` makes a double close unrepresentable.
    pub fn close(self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn grants_up_to_quantity_without_waiting() {
        let meter = RateMeter::new(3, Duration::from_secs(1));
        let start = Instant::now();

        let _t1 = meter.acquire().await;
        let _t2 = meter.acquire().await;
        let _t3 = meter.acquire().await;

        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn blocks_until_the_window_slides() {
        let meter = RateMeter::new(2, Duration::from_secs(1));
        let start = Instant::now();

        let _t1 = meter.acquire().await;
        let _t2 = meter.acquire().await;
        let _t3 = meter.acquire().await;

        assert_eq!(start.elapsed(), Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn ten_acquires_through_two_slots_take_four_windows() {
        let meter = RateMeter::new(2, Duration::from_secs(1));
        let start = Instant::now();

        for _ in 0..10 {
            meter.acquire().await.close();
        }

        assert!(start.elapsed() >= Duration::from_secs(4));
    }

    #[tokio::test(start_paused = true)]
    async fn issuance_trace_respects_the_window_bound() {
        let quantity = 3;
        let window = Duration::from_millis(500);
        let meter = RateMeter::new(quantity, window);

        let mut issued_at = Vec::new();
        for _ in 0..12 {
            let _ticket = meter.acquire().await;
            issued_at.push(Instant::now());
        }

        for (i, &start) in issued_at.iter().enumerate() {
            let in_window = issued_at[i..]
                .iter()
                .take_while(|&&t| t - start < window)
                .count();
            assert!(
                in_window <= quantity,
                "{in_window} tickets issued within one window"
            );
        }
    }

    #[tokio::test(start_paused = true)]
    async fn close_does_not_return_capacity_early() {
        let meter = RateMeter::new(1, Duration::from_secs(1));
        let start = Instant::now();

        meter.acquire().await.close();
        let _t2 = meter.acquire().await;

        // Even though the first ticket was closed immediately, the second
        // grant still waits out the window.
        assert_eq!(start.elapsed(), Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_waiters_all_get_served() {
        use std::sync::Arc;

        let meter = Arc::new(RateMeter::new(1, Duration::from_millis(100)));
        let start = Instant::now();

        let tasks: Vec<_> = (0..4)
            .map(|_| {
                let meter = Arc::clone(&meter);
                tokio::spawn(async move {
                    meter.acquire().await.close();
                })
            })
            .collect();

        for task in tasks {
            task.await.unwrap();
        }

        assert!(start.elapsed() >= Duration::from_millis(300));
    }
}
