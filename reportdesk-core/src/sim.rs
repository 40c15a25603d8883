//! In-memory backend and push channel.
//!
//! Used by the `reportdesk` replay harness and the integration tests. The
//! simulator applies the same server-side rules as the real backend (assign
//! moves a complaint to `InProgress`, revoke back to `Opened`, every change
//! bumps the version) and can be told to delay, refuse or fail calls.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::sleep;

use crate::backend::{
    Backend, ComplaintSnapshot, LivenessCheck, MessageDraft, PushConnection, PushConnector,
    PushEvent, ServerMessage, TokenRefresher,
};
use crate::error::{BackendError, BackendResult, TransportError};
use crate::token::{AccessToken, TokenGrant};
use crate::types::{now_millis, now_secs, Assignee, ComplaintId, ComplaintStatus, ThreadId};

#[derive(Default)]
struct World {
    complaints: HashMap<ComplaintId, ComplaintSnapshot>,
    threads: HashMap<ThreadId, Vec<ServerMessage>>,
    next_message: u64,
}

/// In-memory [`Backend`] and [`TokenRefresher`].
#[derive(Default)]
pub struct SimBackend {
    world: Mutex<World>,
    push: Mutex<Option<Arc<SimConnector>>>,
    mutation_delay: Mutex<Duration>,
    reject_mutations: AtomicBool,
    fail_mutations: AtomicBool,
    refresh_delay: Mutex<Duration>,
    refresh_fails: AtomicBool,
    refresh_ttl_secs: Mutex<i64>,
    refresh_calls: AtomicUsize,
    send_calls: AtomicUsize,
}

impl SimBackend {
    pub fn new() -> Self {
        Self {
            refresh_ttl_secs: Mutex::new(3600),
            ..Self::default()
        }
    }

    /// Echoes every mutation as a push event on `connector`.
    pub fn link(&self, connector: Arc<SimConnector>) {
        *self.push.lock() = Some(connector);
    }

    pub fn seed_complaint(&self, snapshot: ComplaintSnapshot) {
        self.world.lock().complaints.insert(snapshot.id.clone(), snapshot);
    }

    pub fn seed_message(&self, message: ServerMessage) {
        self.world.lock().threads.entry(message.thread.clone()).or_default().push(message);
    }

    pub fn complaint(&self, id: &ComplaintId) -> Option<ComplaintSnapshot> {
        self.world.lock().complaints.get(id).cloned()
    }

    pub fn set_mutation_delay(&self, delay: Duration) {
        *self.mutation_delay.lock() = delay;
    }

    /// Mutations answer 409.
    pub fn reject_mutations(&self, reject: bool) {
        self.reject_mutations.store(reject, Ordering::SeqCst);
    }

    /// Mutations answer 503 without applying.
    pub fn fail_mutations(&self, fail: bool) {
        self.fail_mutations.store(fail, Ordering::SeqCst);
    }

    pub fn set_refresh_delay(&self, delay: Duration) {
        *self.refresh_delay.lock() = delay;
    }

    pub fn fail_refresh(&self, fail: bool) {
        self.refresh_fails.store(fail, Ordering::SeqCst);
    }

    pub fn set_refresh_ttl(&self, secs: i64) {
        *self.refresh_ttl_secs.lock() = secs;
    }

    pub fn refresh_calls(&self) -> usize {
        self.refresh_calls.load(Ordering::SeqCst)
    }

    pub fn send_calls(&self) -> usize {
        self.send_calls.load(Ordering::SeqCst)
    }

    async fn gate(&self) -> BackendResult<()> {
        let delay = *self.mutation_delay.lock();
        if !delay.is_zero() {
            sleep(delay).await;
        }
        if self.fail_mutations.load(Ordering::SeqCst) {
            return Err(BackendError::Unavailable("simulated outage".into()));
        }
        if self.reject_mutations.load(Ordering::SeqCst) {
            return Err(BackendError::Rejected {
                status: 409,
                reason: "simulated refusal".into(),
            });
        }
        Ok(())
    }

    fn mutate(
        &self,
        id: &ComplaintId,
        change: impl FnOnce(&mut ComplaintSnapshot),
    ) -> BackendResult<ComplaintSnapshot> {
        let (snapshot, status, assignee) = {
            let mut world = self.world.lock();
            let stored = world
                .complaints
                .get_mut(id)
                .ok_or_else(|| BackendError::NotFound(id.to_string()))?;
            let (status, assignee) = (stored.status, stored.assignee.clone());
            change(&mut *stored);
            stored.version = Some(stored.version.unwrap_or(0) + 1);
            (stored.clone(), status, assignee)
        };
        if let Some(push) = self.push.lock().clone() {
            if snapshot.assignee != assignee {
                push.push(PushEvent::AssignmentChanged {
                    complaint_id: snapshot.id.clone(),
                    assignee: snapshot.assignee.clone(),
                    version: snapshot.version,
                });
            }
            if snapshot.status != status {
                push.push(PushEvent::StatusChanged {
                    complaint_id: snapshot.id.clone(),
                    status: snapshot.status,
                    version: snapshot.version,
                });
            }
        }
        Ok(snapshot)
    }
}

#[async_trait]
impl Backend for SimBackend {
    async fn fetch_complaint(&self, id: &ComplaintId) -> BackendResult<ComplaintSnapshot> {
        self.complaint(id).ok_or_else(|| BackendError::NotFound(id.to_string()))
    }

    async fn fetch_thread(&self, thread: &ThreadId) -> BackendResult<Vec<ServerMessage>> {
        Ok(self.world.lock().threads.get(thread).cloned().unwrap_or_default())
    }

    async fn assign(
        &self,
        id: &ComplaintId,
        officer: &Assignee,
    ) -> BackendResult<ComplaintSnapshot> {
        self.gate().await?;
        self.mutate(id, |c| {
            c.assignee = Some(officer.clone());
            c.status = ComplaintStatus::InProgress;
        })
    }

    async fn revoke(&self, id: &ComplaintId) -> BackendResult<ComplaintSnapshot> {
        self.gate().await?;
        self.mutate(id, |c| {
            c.assignee = None;
            c.status = ComplaintStatus::Opened;
        })
    }

    async fn resolve(&self, id: &ComplaintId) -> BackendResult<ComplaintSnapshot> {
        self.gate().await?;
        self.mutate(id, |c| c.status = ComplaintStatus::Resolved)
    }

    async fn close(&self, id: &ComplaintId) -> BackendResult<ComplaintSnapshot> {
        self.gate().await?;
        self.mutate(id, |c| c.status = ComplaintStatus::Closed)
    }

    async fn send_message(
        &self,
        thread: &ThreadId,
        draft: &MessageDraft,
    ) -> BackendResult<ServerMessage> {
        self.send_calls.fetch_add(1, Ordering::SeqCst);
        self.gate().await?;
        let message = {
            let mut world = self.world.lock();
            world.next_message += 1;
            let message = ServerMessage {
                id: Some(format!("m-{}", world.next_message)),
                thread: thread.clone(),
                sender_id: draft.sender_id.clone(),
                content: draft.content.clone(),
                attachments: draft.attachments.clone(),
                created_at: Some(now_millis()),
            };
            world.threads.entry(thread.clone()).or_default().push(message.clone());
            message
        };
        if let Some(push) = self.push.lock().clone() {
            push.push(PushEvent::MessageNew {
                message: message.clone(),
            });
        }
        Ok(message)
    }
}

#[async_trait]
impl TokenRefresher for SimBackend {
    async fn refresh(&self) -> BackendResult<TokenGrant> {
        let call = self.refresh_calls.fetch_add(1, Ordering::SeqCst) + 1;
        let delay = *self.refresh_delay.lock();
        if !delay.is_zero() {
            sleep(delay).await;
        }
        if self.refresh_fails.load(Ordering::SeqCst) {
            return Err(BackendError::Unavailable("simulated refresh failure".into()));
        }
        let ttl = *self.refresh_ttl_secs.lock();
        Ok(TokenGrant::new(AccessToken::new(format!("sim-token-{call}")), now_secs() + ttl))
    }
}

struct SimLiveness {
    healthy: Arc<AtomicBool>,
}

#[async_trait]
impl LivenessCheck for SimLiveness {
    async fn ping(&self) -> Result<(), TransportError> {
        if self.healthy.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(TransportError::PingFailed("simulated dead connection".into()))
        }
    }
}

/// In-memory [`PushConnector`]. Events pushed while no connection is open
/// are lost, as on a real socket.
#[derive(Default)]
pub struct SimConnector {
    live: Mutex<Option<mpsc::UnboundedSender<PushEvent>>>,
    failures_left: AtomicU32,
    healthy: Arc<AtomicBool>,
    connects: AtomicUsize,
    tokens: Mutex<Vec<AccessToken>>,
}

impl SimConnector {
    pub fn new() -> Self {
        let connector = Self::default();
        connector.healthy.store(true, Ordering::SeqCst);
        connector
    }

    /// Delivers `event` on the open connection. Returns `false` if none.
    pub fn push(&self, event: PushEvent) -> bool {
        match self.live.lock().as_ref() {
            Some(tx) => tx.send(event).is_ok(),
            None => false,
        }
    }

    /// The next `n` connect attempts fail.
    pub fn fail_connects(&self, n: u32) {
        self.failures_left.store(n, Ordering::SeqCst);
    }

    /// Makes the liveness ping of every connection fail (or recover).
    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    /// Closes the open connection from the server side.
    pub fn drop_connection(&self) {
        self.live.lock().take();
    }

    pub fn is_connected(&self) -> bool {
        self.live.lock().as_ref().is_some_and(|tx| !tx.is_closed())
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    /// Tokens presented on each successful connect, in order.
    pub fn tokens(&self) -> Vec<AccessToken> {
        self.tokens.lock().clone()
    }
}

#[async_trait]
impl PushConnector for SimConnector {
    async fn connect(&self, token: &AccessToken) -> Result<PushConnection, TransportError> {
        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(TransportError::ConnectFailed("simulated refusal".into()));
        }
        let (tx, events) = mpsc::unbounded_channel();
        *self.live.lock() = Some(tx);
        self.connects.fetch_add(1, Ordering::SeqCst);
        self.tokens.lock().push(token.clone());
        Ok(PushConnection {
            events,
            liveness: Box::new(SimLiveness {
                healthy: Arc::clone(&self.healthy),
            }),
        })
    }
}
