//! Push transport: dispatch, handler registry, reconnect backoff.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use reportdesk_core::backend::{PushEvent, Topic};
use reportdesk_core::config::TransportConfig;
use reportdesk_core::sim::SimConnector;
use reportdesk_core::token::AccessToken;
use reportdesk_core::transport::{ChannelTransport, PushHandler, TransportStatus};
use reportdesk_core::types::{ComplaintId, ComplaintStatus};
use tokio::time::{sleep, Instant};

fn status_event(version: u64) -> PushEvent {
    PushEvent::StatusChanged {
        complaint_id: ComplaintId::from("c-1"),
        status: ComplaintStatus::Resolved,
        version: Some(version),
    }
}

fn counter() -> (Arc<AtomicUsize>, PushHandler) {
    let count = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&count);
    let handler: PushHandler = Arc::new(move |_: &PushEvent| {
        seen.fetch_add(1, Ordering::SeqCst);
    });
    (count, handler)
}

async fn wait_for_status(transport: &ChannelTransport, wanted: TransportStatus) {
    let mut status = transport.watch_status();
    status.wait_for(|s| *s == wanted).await.expect("transport dropped");
}

fn start(connector: &Arc<SimConnector>, config: &TransportConfig) -> ChannelTransport {
    ChannelTransport::start(connector.clone(), AccessToken::new("t-1"), config)
}

#[tokio::test(start_paused = true)]
async fn events_reach_registered_handlers() {
    let connector = Arc::new(SimConnector::new());
    let transport = start(&connector, &TransportConfig::default());
    wait_for_status(&transport, TransportStatus::Live).await;
    assert!(transport.is_live());

    let (status_count, status_handler) = counter();
    let (message_count, message_handler) = counter();
    transport.on(Topic::StatusChanged, transport.next_handler_id(), status_handler);
    transport.on(Topic::MessageNew, transport.next_handler_id(), message_handler);

    assert!(connector.push(status_event(1)));
    sleep(Duration::from_millis(10)).await;

    assert_eq!(status_count.load(Ordering::SeqCst), 1);
    assert_eq!(message_count.load(Ordering::SeqCst), 0, "dispatch is by topic");
}

#[tokio::test(start_paused = true)]
async fn registering_the_same_handler_twice_delivers_once() {
    let connector = Arc::new(SimConnector::new());
    let transport = start(&connector, &TransportConfig::default());
    wait_for_status(&transport, TransportStatus::Live).await;

    let (first, first_handler) = counter();
    let (second, second_handler) = counter();
    let id = transport.next_handler_id();
    transport.on(Topic::StatusChanged, id, first_handler);
    transport.on(Topic::StatusChanged, id, second_handler);
    assert_eq!(transport.handler_count(Topic::StatusChanged), 1);

    connector.push(status_event(1));
    sleep(Duration::from_millis(10)).await;
    assert_eq!(first.load(Ordering::SeqCst), 0, "replaced handler is not called");
    assert_eq!(second.load(Ordering::SeqCst), 1);

    transport.off(Topic::StatusChanged, id);
    connector.push(status_event(2));
    sleep(Duration::from_millis(10)).await;
    assert_eq!(second.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn dropping_the_guard_unregisters_every_topic() {
    let connector = Arc::new(SimConnector::new());
    let transport = start(&connector, &TransportConfig::default());

    let (_, handler) = counter();
    let guard = transport.register(&Topic::ALL, handler);
    for topic in Topic::ALL {
        assert_eq!(transport.handler_count(topic), 1);
    }
    drop(guard);
    for topic in Topic::ALL {
        assert_eq!(transport.handler_count(topic), 0);
    }
}

#[tokio::test(start_paused = true)]
async fn dropped_connection_reconnects_after_backoff_and_keeps_handlers() {
    let connector = Arc::new(SimConnector::new());
    let config = TransportConfig::default();
    let transport = start(&connector, &config);
    wait_for_status(&transport, TransportStatus::Live).await;

    let (count, handler) = counter();
    transport.on(Topic::StatusChanged, transport.next_handler_id(), handler);

    let dropped_at = Instant::now();
    connector.drop_connection();
    wait_for_status(&transport, TransportStatus::Reconnecting { attempt: 1 }).await;
    wait_for_status(&transport, TransportStatus::Live).await;
    assert!(dropped_at.elapsed() >= config.backoff_base());
    assert_eq!(connector.connects(), 2);

    connector.push(status_event(3));
    sleep(Duration::from_millis(10)).await;
    assert_eq!(count.load(Ordering::SeqCst), 1, "handlers survive a reconnect");
}

#[tokio::test(start_paused = true)]
async fn exhausted_retries_leave_the_transport_down_until_reinitialized() {
    let connector = Arc::new(SimConnector::new());
    connector.fail_connects(100);
    let config = TransportConfig {
        max_reconnect_attempts: 3,
        backoff_base_ms: 1000,
        backoff_max_ms: 30_000,
        ..TransportConfig::default()
    };
    let started = Instant::now();
    let transport = start(&connector, &config);

    wait_for_status(&transport, TransportStatus::Down).await;
    // 1s + 2s + 4s of backoff between the four attempts.
    assert!(started.elapsed() >= Duration::from_secs(7));
    assert_eq!(connector.connects(), 0);

    sleep(Duration::from_secs(120)).await;
    assert_eq!(transport.status(), TransportStatus::Down, "no retries once down");

    connector.fail_connects(0);
    transport.reinitialize(AccessToken::new("t-2"));
    wait_for_status(&transport, TransportStatus::Live).await;
    assert_eq!(connector.tokens().last().map(|t| t.expose().to_owned()), Some("t-2".to_owned()));
}

#[tokio::test(start_paused = true)]
async fn failed_liveness_ping_triggers_reconnect() {
    let connector = Arc::new(SimConnector::new());
    let config = TransportConfig::default();
    let transport = start(&connector, &config);
    wait_for_status(&transport, TransportStatus::Live).await;

    connector.set_healthy(false);
    wait_for_status(&transport, TransportStatus::Reconnecting { attempt: 1 }).await;
    connector.set_healthy(true);
    wait_for_status(&transport, TransportStatus::Live).await;
    assert_eq!(connector.connects(), 2);
}

#[tokio::test(start_paused = true)]
async fn shutdown_reports_down_and_clears_handlers() {
    let connector = Arc::new(SimConnector::new());
    let transport = start(&connector, &TransportConfig::default());
    wait_for_status(&transport, TransportStatus::Live).await;
    let (_, handler) = counter();
    transport.on(Topic::MessageNew, transport.next_handler_id(), handler);

    transport.shutdown();
    assert_eq!(transport.status(), TransportStatus::Down);
    assert_eq!(transport.handler_count(Topic::MessageNew), 0);
    sleep(Duration::from_millis(10)).await;
    assert!(!connector.is_connected());
}
