
use std::time::{Duration, Instant};

use futures::future::join_all;
use vulnmirror::client::PoolBuilder;

use crate::test_helpers::{maybe_start_logging, start_stub, StubReply};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn ten_requests_are_bounded_by_a_two_slot_meter() {
    maybe_start_logging();

    let window = Duration::from_millis(300);
    let server = start_stub(|_| StubReply::json(200, "{}".to_string())).await;

    let pool = PoolBuilder::new(true)
        .thread_count(2)
        .meter(2, window)
        .build()
        .unwrap();

    let started = Instant::now();
    let outcomes = join_all(
        (0..10).map(|_| pool.execute(pool.http().get(server.endpoint()))),
    )
    .await;
    let elapsed = started.elapsed();

    for outcome in outcomes {
        assert_eq!(outcome.unwrap().status().as_u16(), 200);
    }
    assert_eq!(server.request_count(), 10);

    // 10 sends through 2 slots per window: at least 4 full windows pass
    // before the last send is granted.
    assert!(
        elapsed >= window * 4 - Duration::from_millis(50),
        "completed too fast: {elapsed:?}"
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn one_worker_spaces_consecutive_sends() {
    maybe_start_logging();

    let delay = Duration::from_millis(150);
    let server = start_stub(|_| StubReply::json(200, "{}".to_string())).await;

    let pool = PoolBuilder::new(true)
        .thread_count(1)
        .delay(delay)
        .meter(100, Duration::from_secs(60))
        .build()
        .unwrap();

    let started = Instant::now();
    for _ in 0..3 {
        pool.execute(pool.http().get(server.endpoint()))
            .await
            .unwrap();
    }
    let elapsed = started.elapsed();

    assert!(
        elapsed >= delay * 2 - Duration::from_millis(20),
        "completed too fast: {elapsed:?}"
    );

    // The stub's arrival times show the same spacing.
    let requests = server.requests();
    assert_eq!(requests.len(), 3);
    for pair in requests.windows(2) {
        let gap = pair[1].received_at - pair[0].received_at;
        assert!(gap >= delay - Duration::from_millis(20), "gap {gap:?}");
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn round_robin_spreads_across_workers() {
    maybe_start_logging();

    // Two workers with a long per-worker delay: if both requests landed on
    // one worker the pair would take one full delay; spread across two they
    // complete together.
    let delay = Duration::from_millis(400);
    let server = start_stub(|_| StubReply::json(200, "{}".to_string())).await;

    let pool = PoolBuilder::new(true)
        .thread_count(2)
        .delay(delay)
        .meter(100, Duration::from_secs(60))
        .build()
        .unwrap();

    // Warm both workers so the delay applies to the measured pair.
    let warmup = join_all(
        (0..2).map(|_| pool.execute(pool.http().get(server.endpoint()))),
    )
    .await;
    for outcome in warmup {
        outcome.unwrap();
    }

    let started = Instant::now();
    let pair = join_all(
        (0..2).map(|_| pool.execute(pool.http().get(server.endpoint()))),
    )
    .await;
    let elapsed = started.elapsed();

    for outcome in pair {
        outcome.unwrap();
    }

    // Both waited out their own worker's delay concurrently.
    assert!(elapsed < delay * 2, "pair was serialized: {elapsed:?}");
    assert!(
        elapsed >= delay - Duration::from_millis(20),
        "delay was not honored: {elapsed:?}"
    );
}
