//! Session facade wiring the clock, transport, polling and reconciler.
//!
//! A [`DeskSession`] is what a dashboard holds for one logged-in staff
//! member. It owns every background task of the session and tears them all
//! down together, either on [`DeskSession::teardown`] or on forced logout.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

use crate::backend::{Backend, ComplaintSnapshot, PushConnector, PushEvent, Topic, TokenRefresher};
use crate::clock::{SessionClock, SessionEvent, SessionState};
use crate::config::SyncConfig;
use crate::error::{BackendResult, MutationError, MutationResult, SessionError, SessionResult};
use crate::guard::{
    check_assign, check_revoke, check_status_change, CloseConfirmation, StatusCommand,
};
use crate::ledger::{EntityKey, MutationHandle, MutationKind, OptimisticValue};
use crate::poll::{PollFallback, ResourceId};
use crate::reconcile::{
    ComplaintFact, ComplaintView, EventReconciler, Fact, FactSource, MessageFact, PendingMessage,
    RefetchRequest, ThreadView, ViewSubscription,
};
use crate::token::TokenGrant;
use crate::transport::{ChannelTransport, HandlerGuard, TransportStatus};
use crate::types::{
    ActorContext, Assignee, Attachment, Complaint, ComplaintId, ComplaintStatus, ThreadId,
};

struct SessionInner {
    backend: Arc<dyn Backend>,
    clock: SessionClock,
    transport: ChannelTransport,
    polls: PollFallback,
    reconciler: EventReconciler,
    router: Mutex<Option<HandlerGuard>>,
    tasks: Mutex<Vec<AbortHandle>>,
    ended: AtomicBool,
}

impl SessionInner {
    fn teardown(&self) {
        if self.ended.swap(true, Ordering::SeqCst) {
            return;
        }
        self.router.lock().take();
        self.transport.shutdown();
        self.polls.cancel_all();
        self.clock.shutdown();
        self.reconciler.clear();
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        info!("desk session torn down");
    }
}

#[derive(Clone)]
pub struct DeskSession {
    inner: Arc<SessionInner>,
}

impl DeskSession {
    /// Starts a session with `grant` as the initial lease. Must be called
    /// inside a tokio runtime.
    pub fn start(
        config: SyncConfig,
        grant: TokenGrant,
        backend: Arc<dyn Backend>,
        refresher: Arc<dyn TokenRefresher>,
        connector: Arc<dyn PushConnector>,
    ) -> Self {
        let token = grant.token.clone();
        let clock = SessionClock::start(grant, refresher, &config.session);
        let transport = ChannelTransport::start(connector, token, &config.transport);
        let (reconciler, refetch_rx) = EventReconciler::new(&config);

        let router = {
            let reconciler = reconciler.clone();
            transport.register(
                &Topic::ALL,
                Arc::new(move |event: &PushEvent| {
                    let outcome = reconciler.apply(Fact::from(event.clone()));
                    debug!(topic = %event.topic(), ?outcome, "push event reconciled");
                }),
            )
        };

        let inner = Arc::new(SessionInner {
            backend,
            clock,
            transport,
            polls: PollFallback::new(config.poll.clone()),
            reconciler,
            router: Mutex::new(Some(router)),
            tasks: Mutex::new(Vec::new()),
            ended: AtomicBool::new(false),
        });

        let refetch = tokio::spawn(run_refetches(Arc::downgrade(&inner), refetch_rx));
        let logout = tokio::spawn(watch_logout(Arc::downgrade(&inner), inner.clock.events()));
        inner.tasks.lock().extend([refetch.abort_handle(), logout.abort_handle()]);

        info!("desk session started");
        Self { inner }
    }

    fn ensure_live(&self) -> MutationResult<()> {
        if self.is_ended() {
            return Err(MutationError::SessionEnded);
        }
        Ok(())
    }

    pub fn is_ended(&self) -> bool {
        self.inner.ended.load(Ordering::SeqCst)
    }

    /// Subscribes to one complaint and starts polling it at the dashboard
    /// interval. Dropping the subscription stops the polling.
    ///
    /// # Errors
    ///
    /// `Expired` once the session has ended.
    pub fn subscribe(&self, id: &ComplaintId) -> SessionResult<ViewSubscription<ComplaintView>> {
        if self.is_ended() {
            return Err(SessionError::Expired);
        }
        let inner = &self.inner;
        let mut subscription = inner.reconciler.subscribe_complaint(id);

        let backend = Arc::clone(&inner.backend);
        let reconciler = inner.reconciler.clone();
        let target = id.clone();
        let poll = inner.polls.start_polling(
            ResourceId::Complaint(id.clone()),
            inner.polls.config().dashboard_interval(),
            move || {
                let backend = Arc::clone(&backend);
                let id = target.clone();
                async move { backend.fetch_complaint(&id).await }
            },
            move |snapshot: ComplaintSnapshot| {
                let fact = ComplaintFact::snapshot(snapshot, FactSource::Poll);
                reconciler.apply_complaint_fact(fact);
            },
        );
        subscription.attach(poll);
        Ok(subscription)
    }

    /// Subscribes to one chat thread and starts polling it at the chat
    /// interval.
    ///
    /// # Errors
    ///
    /// `Expired` once the session has ended.
    pub fn subscribe_thread(
        &self,
        thread: &ThreadId,
    ) -> SessionResult<ViewSubscription<ThreadView>> {
        if self.is_ended() {
            return Err(SessionError::Expired);
        }
        let inner = &self.inner;
        let mut subscription = inner.reconciler.subscribe_thread(thread);

        let backend = Arc::clone(&inner.backend);
        let reconciler = inner.reconciler.clone();
        let target = thread.clone();
        let poll = inner.polls.start_polling(
            ResourceId::Thread(thread.clone()),
            inner.polls.config().chat_interval(),
            move || {
                let backend = Arc::clone(&backend);
                let thread = target.clone();
                async move { backend.fetch_thread(&thread).await }
            },
            move |messages: Vec<_>| {
                for message in messages {
                    reconciler.apply_message_fact(MessageFact {
                        message,
                        source: FactSource::Poll,
                    });
                }
            },
        );
        subscription.attach(poll);
        Ok(subscription)
    }

    /// Resolves or closes a complaint.
    ///
    /// The change is checked against the transition table, shown
    /// optimistically, then submitted. A backend refusal rolls the view back.
    /// A transient failure leaves the optimistic value up until a later fact
    /// confirms or contradicts it, or the ledger timeout forces a refetch; the
    /// caller gets `Unconfirmed` for it.
    ///
    /// # Errors
    ///
    /// - `Rejected` when the transition table refuses the change.
    /// - `MutationInFlight` while an earlier status change is unresolved.
    /// - `NotLoaded` before the complaint's first snapshot.
    /// - `Backend` when the backend refused it; the view was rolled back.
    /// - `Unconfirmed` when the submit failed in transit; the view still
    ///   shows the optimistic value.
    /// - `SessionEnded` after teardown.
    pub async fn propose_status_change(
        &self,
        id: &ComplaintId,
        target: ComplaintStatus,
        actor: &ActorContext,
        confirmation: Option<CloseConfirmation>,
    ) -> MutationResult<MutationHandle> {
        self.ensure_live()?;
        self.ensure_idle(id, MutationKind::StatusChange)?;
        let current = self.loaded(id)?;
        let command = check_status_change(&current, target, actor, confirmation.as_ref())?;
        let handle = self
            .inner
            .reconciler
            .apply_optimistic(id, OptimisticValue::Status(command.target()))?;
        info!(
            complaint = %id,
            from = %current.status,
            to = %command.target(),
            actor = %actor.user_id,
            "status change submitted"
        );

        let backend = &self.inner.backend;
        let response = match command {
            StatusCommand::Resolve => backend.resolve(id).await,
            StatusCommand::Close => backend.close(id).await,
        };
        self.settle(id, handle, response)
    }

    /// Assigns or reassigns `officer`. Admin only.
    ///
    /// # Errors
    ///
    /// As [`Self::propose_status_change`], with the assignment rules of
    /// [`crate::guard::check_assign`].
    pub async fn assign(
        &self,
        id: &ComplaintId,
        officer: Assignee,
        actor: &ActorContext,
    ) -> MutationResult<MutationHandle> {
        self.ensure_live()?;
        self.ensure_idle(id, MutationKind::AssignmentChange)?;
        let current = self.loaded(id)?;
        check_assign(&current, &officer, actor)?;
        let handle = self
            .inner
            .reconciler
            .apply_optimistic(id, OptimisticValue::Assignee(Some(officer.clone())))?;
        info!(
            complaint = %id,
            officer = %officer.id,
            actor = %actor.user_id,
            "assignment submitted"
        );

        let response = self.inner.backend.assign(id, &officer).await;
        self.settle(id, handle, response)
    }

    /// Removes the current assignee. Admin only.
    ///
    /// # Errors
    ///
    /// As [`Self::propose_status_change`], with the rules of
    /// [`crate::guard::check_revoke`].
    pub async fn revoke(
        &self,
        id: &ComplaintId,
        actor: &ActorContext,
    ) -> MutationResult<MutationHandle> {
        self.ensure_live()?;
        self.ensure_idle(id, MutationKind::AssignmentChange)?;
        let current = self.loaded(id)?;
        check_revoke(&current, actor)?;
        let handle = self.inner.reconciler.apply_optimistic(id, OptimisticValue::Assignee(None))?;
        info!(complaint = %id, actor = %actor.user_id, "revoke submitted");

        let response = self.inner.backend.revoke(id).await;
        self.settle(id, handle, response)
    }

    /// Refuses up front while a mutation of `kind` is unresolved, so the
    /// guard never judges a second change against an optimistic value.
    fn ensure_idle(&self, id: &ComplaintId, kind: MutationKind) -> MutationResult<()> {
        let entity = EntityKey::Complaint(id.clone());
        match self.inner.reconciler.unresolved(&entity, kind) {
            Some(_) => Err(MutationError::MutationInFlight { entity, kind }),
            None => Ok(()),
        }
    }

    fn loaded(&self, id: &ComplaintId) -> MutationResult<Complaint> {
        self.inner.reconciler.complaint(id).ok_or_else(|| MutationError::not_loaded(id))
    }

    fn settle(
        &self,
        id: &ComplaintId,
        handle: MutationHandle,
        response: BackendResult<ComplaintSnapshot>,
    ) -> MutationResult<MutationHandle> {
        match response {
            Ok(snapshot) => {
                let fact = ComplaintFact::snapshot(snapshot, FactSource::MutationResponse);
                let outcome = self.inner.reconciler.apply_complaint_fact(fact);
                debug!(complaint = %id, ?outcome, "mutation response reconciled");
                Ok(handle)
            }
            Err(err) if err.is_rejection() => {
                self.inner.reconciler.rollback(handle);
                warn!(complaint = %id, error = %err, "mutation refused; rolled back");
                Err(MutationError::Backend(err))
            }
            Err(err) => {
                warn!(
                    complaint = %id,
                    error = %err,
                    "mutation outcome unknown; awaiting confirmation"
                );
                Err(MutationError::Unconfirmed {
                    handle,
                    source: err,
                })
            }
        }
    }

    /// Appends a Pending message to the thread and sends it in the
    /// background. The message becomes Confirmed when the backend answers
    /// and Failed if it refuses.
    ///
    /// # Errors
    ///
    /// `NotLoaded` if the thread is not subscribed; `SessionEnded` after
    /// teardown.
    pub fn send_message(
        &self,
        thread: &ThreadId,
        actor: &ActorContext,
        content: &str,
        attachments: Vec<Attachment>,
    ) -> MutationResult<PendingMessage> {
        self.ensure_live()?;
        let pending =
            self.inner.reconciler.begin_send(thread, &actor.user_id, content, attachments)?;

        let backend = Arc::clone(&self.inner.backend);
        let reconciler = self.inner.reconciler.clone();
        let send = pending.clone();
        let task = tokio::spawn(async move {
            match backend.send_message(&send.thread, &send.draft).await {
                Ok(message) => {
                    let outcome = reconciler.confirm_send(send.local_id, message);
                    debug!(
                        thread = %send.thread,
                        local_id = %send.local_id,
                        ?outcome,
                        "message confirmed"
                    );
                }
                Err(err) => {
                    warn!(
                        thread = %send.thread,
                        local_id = %send.local_id,
                        error = %err,
                        "message send failed"
                    );
                    reconciler.fail_send(send.local_id);
                }
            }
        });
        let mut tasks = self.inner.tasks.lock();
        if self.is_ended() {
            task.abort();
        } else {
            tasks.retain(|t| !t.is_finished());
            tasks.push(task.abort_handle());
        }
        Ok(pending)
    }

    /// Refreshes the session lease and reconnects the push channel with the
    /// new token.
    ///
    /// # Errors
    ///
    /// `RefreshFailed` (retryable) or `Expired`.
    pub async fn refresh_session(&self) -> SessionResult<TokenGrant> {
        if self.is_ended() {
            return Err(SessionError::Expired);
        }
        let grant = self.inner.clock.refresh().await?;
        if !self.is_ended() {
            self.inner.transport.reinitialize(grant.token.clone());
        }
        Ok(grant)
    }

    pub fn session_state(&self) -> SessionState {
        self.inner.clock.state()
    }

    pub fn watch_session_state(&self) -> watch::Receiver<SessionState> {
        self.inner.clock.watch_state()
    }

    pub fn session_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.clock.events()
    }

    pub fn transport_status(&self) -> TransportStatus {
        self.inner.transport.status()
    }

    pub fn watch_transport(&self) -> watch::Receiver<TransportStatus> {
        self.inner.transport.watch_status()
    }

    pub fn complaint(&self, id: &ComplaintId) -> Option<Complaint> {
        self.inner.reconciler.complaint(id)
    }

    pub fn thread(&self, thread: &ThreadId) -> Option<ThreadView> {
        self.inner.reconciler.thread(thread)
    }

    pub fn reconciler(&self) -> &EventReconciler {
        &self.inner.reconciler
    }

    /// Stops every timer, poll loop and connection and discards all view
    /// state. Idempotent.
    pub fn teardown(&self) {
        self.inner.teardown();
    }
}

async fn run_refetches(
    session: Weak<SessionInner>,
    mut requests: mpsc::UnboundedReceiver<RefetchRequest>,
) {
    while let Some(request) = requests.recv().await {
        let Some(session) = session.upgrade() else { break };
        let resource = match request {
            RefetchRequest::Complaint(id) => ResourceId::Complaint(id),
            RefetchRequest::Thread(thread) => ResourceId::Thread(thread),
        };
        if session.polls.force_refetch(&resource) {
            debug!(%resource, "forced refetch after unconfirmed mutation");
        }
    }
}

async fn watch_logout(session: Weak<SessionInner>, mut events: broadcast::Receiver<SessionEvent>) {
    loop {
        match events.recv().await {
            Ok(SessionEvent::ForcedLogout) => {
                if let Some(session) = session.upgrade() {
                    warn!("forced logout; tearing down session");
                    session.teardown();
                }
                break;
            }
            Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
