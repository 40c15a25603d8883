//! Poll fallback: cadence, sequential ticks, sharing and cancellation.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use reportdesk_core::config::PollConfig;
use reportdesk_core::error::{BackendError, BackendResult};
use reportdesk_core::poll::{PollFallback, ResourceId};
use reportdesk_core::types::ComplaintId;
use tokio::time::sleep;

fn resource() -> ResourceId {
    ResourceId::Complaint(ComplaintId::from("c-1"))
}

/// Fetch that counts calls and returns the call number.
fn counting_fetch(
    calls: &Arc<AtomicUsize>,
) -> impl Fn() -> futures::future::Ready<BackendResult<usize>> + Send + Sync + 'static {
    let calls = Arc::clone(calls);
    move || futures::future::ready(Ok(calls.fetch_add(1, Ordering::SeqCst) + 1))
}

#[tokio::test(start_paused = true)]
async fn fetches_immediately_then_every_interval() {
    let polls = PollFallback::new(PollConfig::default());
    let calls = Arc::new(AtomicUsize::new(0));
    let delivered = Arc::new(AtomicUsize::new(0));
    let sink = Arc::clone(&delivered);

    let _handle = polls.start_polling(
        resource(),
        Duration::from_secs(3),
        counting_fetch(&calls),
        move |n| sink.store(n, Ordering::SeqCst),
    );

    sleep(Duration::from_millis(9_500)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 4, "ticks at 0s, 3s, 6s, 9s");
    assert_eq!(delivered.load(Ordering::SeqCst), 4);
}

#[tokio::test(start_paused = true)]
async fn slow_fetch_delays_the_next_tick_instead_of_overlapping() {
    let polls = PollFallback::new(PollConfig::default());
    let calls = Arc::new(AtomicUsize::new(0));
    let in_flight = Arc::new(AtomicUsize::new(0));
    let max_in_flight = Arc::new(AtomicUsize::new(0));

    let fetch = {
        let (calls, in_flight, max_in_flight) =
            (Arc::clone(&calls), Arc::clone(&in_flight), Arc::clone(&max_in_flight));
        move || {
            let (calls, in_flight, max_in_flight) =
                (Arc::clone(&calls), Arc::clone(&in_flight), Arc::clone(&max_in_flight));
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                max_in_flight.fetch_max(now, Ordering::SeqCst);
                sleep(Duration::from_secs(2)).await;
                in_flight.fetch_sub(1, Ordering::SeqCst);
                Ok::<_, BackendError>(())
            }
        }
    };
    let _handle = polls.start_polling(resource(), Duration::from_secs(3), fetch, |_| {});

    sleep(Duration::from_millis(11_000)).await;
    // Fetches start at 0s, 5s, 10s.
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(max_in_flight.load(Ordering::SeqCst), 1, "ticks never overlap");
}

#[tokio::test(start_paused = true)]
async fn failing_and_hanging_fetches_do_not_stop_the_loop() {
    let config = PollConfig {
        fetch_timeout_ms: 1000,
        ..PollConfig::default()
    };
    let polls = PollFallback::new(config);
    let calls = Arc::new(AtomicUsize::new(0));
    let delivered = Arc::new(AtomicUsize::new(0));

    let fetch = {
        let calls = Arc::clone(&calls);
        move || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                match n % 3 {
                    0 => Err(BackendError::Unavailable("down".into())),
                    1 => {
                        sleep(Duration::from_secs(60)).await;
                        Ok(())
                    }
                    _ => Ok(()),
                }
            }
        }
    };
    let sink = Arc::clone(&delivered);
    let _handle = polls.start_polling(resource(), Duration::from_secs(1), fetch, move |()| {
        sink.fetch_add(1, Ordering::SeqCst);
    });

    sleep(Duration::from_secs(10)).await;
    assert!(calls.load(Ordering::SeqCst) >= 5, "loop keeps going after errors and timeouts");
    assert!(delivered.load(Ordering::SeqCst) >= 1);
}

#[tokio::test(start_paused = true)]
async fn subscribers_share_one_loop_until_the_last_cancels() {
    let polls = PollFallback::new(PollConfig::default());
    let first_calls = Arc::new(AtomicUsize::new(0));
    let second_calls = Arc::new(AtomicUsize::new(0));

    let first = polls.start_polling(
        resource(),
        Duration::from_secs(1),
        counting_fetch(&first_calls),
        |_| {},
    );
    let second = polls.start_polling(
        resource(),
        Duration::from_secs(1),
        counting_fetch(&second_calls),
        |_| {},
    );
    assert_eq!(polls.active(), 1);

    sleep(Duration::from_millis(2_500)).await;
    assert_eq!(second_calls.load(Ordering::SeqCst), 0, "the joining fetch is never used");

    first.cancel();
    assert!(polls.is_polling(&resource()));

    drop(second);
    assert!(!polls.is_polling(&resource()));
    let stopped_at = first_calls.load(Ordering::SeqCst);
    sleep(Duration::from_secs(5)).await;
    assert_eq!(first_calls.load(Ordering::SeqCst), stopped_at, "no ticks after cancel");
}

#[tokio::test(start_paused = true)]
async fn forced_refetch_skips_the_wait() {
    let polls = PollFallback::new(PollConfig::default());
    let calls = Arc::new(AtomicUsize::new(0));
    let _handle = polls.start_polling(
        resource(),
        Duration::from_secs(60),
        counting_fetch(&calls),
        |_| {},
    );

    sleep(Duration::from_secs(1)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    assert!(polls.force_refetch(&resource()));
    sleep(Duration::from_millis(10)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    assert!(!polls.force_refetch(&ResourceId::Complaint(ComplaintId::from("c-404"))));
}

#[tokio::test(start_paused = true)]
async fn cancel_all_stops_every_loop() {
    let polls = PollFallback::new(PollConfig::default());
    let calls = Arc::new(AtomicUsize::new(0));
    let a = polls.start_polling(resource(), Duration::from_secs(1), counting_fetch(&calls), |_| {});
    let b = polls.start_polling(
        ResourceId::Complaint(ComplaintId::from("c-2")),
        Duration::from_secs(1),
        counting_fetch(&calls),
        |_| {},
    );
    sleep(Duration::from_millis(10)).await;

    polls.cancel_all();
    assert_eq!(polls.active(), 0);
    let stopped_at = calls.load(Ordering::SeqCst);
    sleep(Duration::from_secs(5)).await;
    assert_eq!(calls.load(Ordering::SeqCst), stopped_at);
    drop((a, b));
}
