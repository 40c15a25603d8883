//! End-to-end session behaviour against the in-memory backend.

use std::sync::Arc;
use std::time::Duration;

use reportdesk_core::backend::{Backend, ComplaintSnapshot, PushEvent};
use reportdesk_core::config::SyncConfig;
use reportdesk_core::error::{BackendError, MutationError, Rejection, SessionError};
use reportdesk_core::guard::CloseConfirmation;
use reportdesk_core::ledger::MutationKind;
use reportdesk_core::session::DeskSession;
use reportdesk_core::sim::{SimBackend, SimConnector};
use reportdesk_core::token::{AccessToken, TokenGrant};
use reportdesk_core::transport::TransportStatus;
use reportdesk_core::types::{
    now_secs, ActorContext, Assignee, ComplaintId, ComplaintStatus, DeliveryState, ThreadId,
};
use tokio::time::sleep;

struct Harness {
    sim: Arc<SimBackend>,
    connector: Arc<SimConnector>,
    session: DeskSession,
}

fn cid() -> ComplaintId {
    ComplaintId::from("c-1")
}

fn start_with(ttl_secs: i64, config: SyncConfig) -> Harness {
    let sim = Arc::new(SimBackend::new());
    let connector = Arc::new(SimConnector::new());
    sim.link(Arc::clone(&connector));
    sim.seed_complaint(ComplaintSnapshot {
        id: cid(),
        status: ComplaintStatus::InProgress,
        assignee: Some(Assignee::new("off-1", "Officer One")),
        version: Some(1),
    });
    sim.seed_complaint(ComplaintSnapshot {
        id: ComplaintId::from("c-2"),
        status: ComplaintStatus::Opened,
        assignee: None,
        version: Some(1),
    });
    let grant = TokenGrant::new(AccessToken::new("initial"), now_secs() + ttl_secs);
    let session = DeskSession::start(config, grant, sim.clone(), sim.clone(), connector.clone());
    Harness {
        sim,
        connector,
        session,
    }
}

fn start() -> Harness {
    start_with(3600, SyncConfig::default())
}

async fn wait_live(session: &DeskSession) {
    let mut status = session.watch_transport();
    status.wait_for(|s| *s == TransportStatus::Live).await.expect("transport dropped");
}

#[tokio::test(start_paused = true)]
async fn subscription_loads_through_polling() {
    let h = start();
    let mut sub = h.session.subscribe(&cid()).unwrap();

    let view = sub.wait_for(|v| v.complaint.is_some()).await.unwrap();
    let complaint = view.complaint.unwrap();
    assert_eq!(complaint.status, ComplaintStatus::InProgress);
    assert_eq!(complaint.assignee_id(), Some("off-1"));
    assert_eq!(complaint.updated_at, Some(1));
}

#[tokio::test(start_paused = true)]
async fn resolve_round_trip() {
    let h = start();
    wait_live(&h.session).await;
    let mut sub = h.session.subscribe(&cid()).unwrap();
    sub.wait_for(|v| v.complaint.is_some()).await;

    h.session
        .propose_status_change(
            &cid(),
            ComplaintStatus::Resolved,
            &ActorContext::officer("off-1"),
            None,
        )
        .await
        .expect("assigned officer may resolve");

    let view = sub.current();
    let complaint = view.complaint.unwrap();
    assert_eq!(complaint.status, ComplaintStatus::Resolved);
    assert_eq!(complaint.updated_at, Some(2));
    assert!(!view.pending_status);
    assert_eq!(view.correction, None);
    assert_eq!(h.session.reconciler().pending_mutations(), 0);
    assert_eq!(h.sim.complaint(&cid()).unwrap().status, ComplaintStatus::Resolved);
}

#[tokio::test(start_paused = true)]
async fn guard_refusals_never_reach_the_backend() {
    let h = start();
    let mut sub = h.session.subscribe(&cid()).unwrap();
    sub.wait_for(|v| v.complaint.is_some()).await;

    let err = h
        .session
        .propose_status_change(
            &cid(),
            ComplaintStatus::Resolved,
            &ActorContext::officer("off-2"),
            None,
        )
        .await
        .unwrap_err();
    assert_eq!(err, MutationError::Rejected(Rejection::NotPermitted));

    let err = h
        .session
        .propose_status_change(
            &cid(),
            ComplaintStatus::Closed,
            &ActorContext::officer("off-1"),
            None,
        )
        .await
        .unwrap_err();
    assert_eq!(err, MutationError::Rejected(Rejection::ConfirmationRequired));

    let err = h
        .session
        .propose_status_change(&cid(), ComplaintStatus::Opened, &ActorContext::admin("root"), None)
        .await
        .unwrap_err();
    assert_eq!(err, MutationError::Rejected(Rejection::CannotSetOpened));

    assert_eq!(sub.current().complaint.unwrap().status, ComplaintStatus::InProgress);
    assert_eq!(h.sim.complaint(&cid()).unwrap().version, Some(1));
}

#[tokio::test(start_paused = true)]
async fn close_with_confirmation_is_accepted() {
    let h = start();
    let mut sub = h.session.subscribe(&cid()).unwrap();
    sub.wait_for(|v| v.complaint.is_some()).await;

    h.session
        .propose_status_change(
            &cid(),
            ComplaintStatus::Closed,
            &ActorContext::admin("root"),
            Some(CloseConfirmation::confirm(&cid())),
        )
        .await
        .unwrap();
    assert_eq!(sub.current().complaint.unwrap().status, ComplaintStatus::Closed);
}

#[tokio::test(start_paused = true)]
async fn backend_refusal_rolls_back() {
    let h = start();
    let mut sub = h.session.subscribe(&cid()).unwrap();
    sub.wait_for(|v| v.complaint.is_some()).await;
    h.sim.reject_mutations(true);

    let err = h
        .session
        .propose_status_change(
            &cid(),
            ComplaintStatus::Resolved,
            &ActorContext::officer("off-1"),
            None,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, MutationError::Backend(BackendError::Rejected { status: 409, .. })));

    let view = sub.current();
    assert_eq!(view.complaint.unwrap().status, ComplaintStatus::InProgress);
    assert!(!view.pending_status);
    assert_eq!(h.session.reconciler().pending_mutations(), 0);
}

#[tokio::test(start_paused = true)]
async fn transient_failure_holds_the_overlay_until_the_timeout() {
    let h = start();
    let mut sub = h.session.subscribe(&cid()).unwrap();
    sub.wait_for(|v| v.complaint.is_some()).await;
    h.sim.fail_mutations(true);

    let err = h
        .session
        .propose_status_change(
            &cid(),
            ComplaintStatus::Resolved,
            &ActorContext::officer("off-1"),
            None,
        )
        .await
        .unwrap_err();
    assert!(
        matches!(err, MutationError::Unconfirmed { source: BackendError::Unavailable(_), .. }),
        "got {err:?}"
    );
    let view = sub.current();
    assert!(view.pending_status);
    assert_eq!(view.complaint.unwrap().status, ComplaintStatus::Resolved);

    let view = sub.wait_for(|v| !v.pending_status).await.unwrap();
    assert_eq!(view.complaint.unwrap().status, ComplaintStatus::InProgress);
    assert_eq!(h.session.reconciler().pending_mutations(), 0);
}

#[tokio::test(start_paused = true)]
async fn overlapping_mutation_of_the_same_kind_is_refused() {
    let h = start();
    let mut sub = h.session.subscribe(&cid()).unwrap();
    sub.wait_for(|v| v.complaint.is_some()).await;
    h.sim.set_mutation_delay(Duration::from_secs(2));

    let first = {
        let session = h.session.clone();
        tokio::spawn(async move {
            session
                .propose_status_change(
                    &cid(),
                    ComplaintStatus::Resolved,
                    &ActorContext::officer("off-1"),
                    None,
                )
                .await
        })
    };
    sleep(Duration::from_millis(10)).await;

    let err = h
        .session
        .propose_status_change(
            &cid(),
            ComplaintStatus::Resolved,
            &ActorContext::admin("root"),
            None,
        )
        .await
        .unwrap_err();
    assert!(
        matches!(err, MutationError::MutationInFlight { kind: MutationKind::StatusChange, .. }),
        "got {err:?}"
    );

    first.await.unwrap().expect("first mutation completes");
    assert_eq!(sub.current().complaint.unwrap().status, ComplaintStatus::Resolved);
}

#[tokio::test(start_paused = true)]
async fn push_events_update_subscribed_views() {
    let h = start();
    wait_live(&h.session).await;
    let mut sub = h.session.subscribe(&cid()).unwrap();
    sub.wait_for(|v| v.complaint.is_some()).await;

    h.connector.push(PushEvent::StatusChanged {
        complaint_id: cid(),
        status: ComplaintStatus::Closed,
        version: Some(5),
    });
    let view = sub
        .wait_for(|v| v.complaint.as_ref().is_some_and(|c| c.updated_at == Some(5)))
        .await
        .unwrap();
    assert_eq!(view.complaint.unwrap().status, ComplaintStatus::Closed);
}

#[tokio::test(start_paused = true)]
async fn admin_assigns_and_revokes() {
    let h = start();
    let c2 = ComplaintId::from("c-2");
    let mut sub = h.session.subscribe(&c2).unwrap();
    sub.wait_for(|v| v.complaint.is_some()).await;
    let officer = Assignee::new("off-3", "Officer Three");

    let err = h
        .session
        .assign(&c2, officer.clone(), &ActorContext::officer("off-3"))
        .await
        .unwrap_err();
    assert_eq!(err, MutationError::Rejected(Rejection::NotPermitted));
    let err = h.session.revoke(&c2, &ActorContext::admin("root")).await.unwrap_err();
    assert_eq!(err, MutationError::Rejected(Rejection::NothingToRevoke));

    h.session.assign(&c2, officer, &ActorContext::admin("root")).await.unwrap();
    let complaint = sub.current().complaint.unwrap();
    assert_eq!(complaint.status, ComplaintStatus::InProgress, "backend moves it to in-progress");
    assert_eq!(complaint.assignee_id(), Some("off-3"));

    h.session.revoke(&c2, &ActorContext::admin("root")).await.unwrap();
    let complaint = sub.current().complaint.unwrap();
    assert_eq!(complaint.status, ComplaintStatus::Opened);
    assert_eq!(complaint.assignee, None);
}

#[tokio::test(start_paused = true)]
async fn assignment_made_elsewhere_lands_in_full() {
    let h = start();
    wait_live(&h.session).await;
    let c2 = ComplaintId::from("c-2");
    let mut sub = h.session.subscribe(&c2).unwrap();
    sub.wait_for(|v| v.complaint.is_some()).await;

    // Another admin's assignment: one version bump, two push events.
    h.sim.assign(&c2, &Assignee::new("off-1", "Officer One")).await.unwrap();
    sleep(Duration::from_secs(30)).await;

    let server = h.sim.complaint(&c2).unwrap();
    let complaint = sub.current().complaint.unwrap();
    assert_eq!(complaint.status, server.status);
    assert_eq!(complaint.status, ComplaintStatus::InProgress);
    assert_eq!(complaint.assignee_id(), Some("off-1"));
    assert_eq!(complaint.updated_at, server.version);

    h.session
        .propose_status_change(
            &c2,
            ComplaintStatus::Resolved,
            &ActorContext::officer("off-1"),
            None,
        )
        .await
        .expect("the new assignee may resolve");
}

#[tokio::test(start_paused = true)]
async fn sent_message_is_confirmed_exactly_once() {
    let h = start();
    wait_live(&h.session).await;
    let thread = ThreadId::new("c-1", "room-1");
    let mut sub = h.session.subscribe_thread(&thread).unwrap();

    let pending = h
        .session
        .send_message(&thread, &ActorContext::officer("off-1"), "on my way", Vec::new())
        .unwrap();
    assert_eq!(sub.current().messages[0].delivery, DeliveryState::Pending);

    sub.wait_for(|v| v.messages.iter().all(|m| m.delivery == DeliveryState::Confirmed))
        .await
        .unwrap();
    // Let the next poll tick observe the same message too.
    sleep(Duration::from_secs(4)).await;

    let messages = sub.current().messages;
    assert_eq!(messages.len(), 1, "push echo, send response and poll must collapse to one message");
    assert_eq!(messages[0].server_id(), Some("m-1"));
    assert_eq!(messages[0].local_id, Some(pending.local_id));
    assert_eq!(h.sim.send_calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn refused_message_is_marked_failed() {
    let h = start();
    let thread = ThreadId::new("c-1", "room-1");
    let mut sub = h.session.subscribe_thread(&thread).unwrap();
    h.sim.reject_mutations(true);

    h.session
        .send_message(&thread, &ActorContext::officer("off-1"), "hello?", Vec::new())
        .unwrap();
    let view = sub
        .wait_for(|v| v.messages.first().is_some_and(|m| m.delivery == DeliveryState::Failed))
        .await
        .unwrap();
    assert_eq!(view.messages.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn forced_logout_tears_everything_down() {
    let h = start_with(5, SyncConfig::default());
    let mut sub = h.session.subscribe(&cid()).unwrap();
    sub.wait_for(|v| v.complaint.is_some()).await;

    sleep(Duration::from_secs(6)).await;
    assert!(h.session.is_ended());
    assert_eq!(h.session.transport_status(), TransportStatus::Down);
    assert!(!sub.changed().await, "views are closed on teardown");

    let err = h
        .session
        .propose_status_change(
            &cid(),
            ComplaintStatus::Resolved,
            &ActorContext::officer("off-1"),
            None,
        )
        .await
        .unwrap_err();
    assert_eq!(err, MutationError::SessionEnded);
    assert_eq!(h.session.subscribe(&cid()).err(), Some(SessionError::Expired));
}

#[tokio::test(start_paused = true)]
async fn refresh_reconnects_with_the_new_token() {
    let h = start();
    wait_live(&h.session).await;

    let grant = h.session.refresh_session().await.unwrap();
    sleep(Duration::from_millis(10)).await;
    wait_live(&h.session).await;

    assert_eq!(h.connector.connects(), 2);
    assert_eq!(h.connector.tokens().last(), Some(&grant.token));
    assert!(!h.session.session_state().is_expiring_soon);
}

#[tokio::test(start_paused = true)]
async fn teardown_is_idempotent_and_stops_polling() {
    let h = start();
    let mut sub = h.session.subscribe(&cid()).unwrap();
    sub.wait_for(|v| v.complaint.is_some()).await;

    h.session.teardown();
    h.session.teardown();
    assert!(h.session.is_ended());
    assert!(h.session.complaint(&cid()).is_none());
    assert!(h
        .session
        .send_message(&ThreadId::new("c-1", "r"), &ActorContext::officer("off-1"), "x", Vec::new())
        .is_err());
}

#[tokio::test(start_paused = true)]
async fn teardown_cancels_sends_still_in_flight() {
    let h = start();
    let thread = ThreadId::new("c-1", "room-1");
    let _sub = h.session.subscribe_thread(&thread).unwrap();
    h.sim.set_mutation_delay(Duration::from_secs(2));

    h.session
        .send_message(&thread, &ActorContext::officer("off-1"), "late", Vec::new())
        .unwrap();
    h.session.teardown();
    sleep(Duration::from_secs(5)).await;

    assert!(h.sim.fetch_thread(&thread).await.unwrap().is_empty());
}
