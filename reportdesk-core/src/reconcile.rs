//! Event reconciliation engine.
//!
//! Push events, poll results, mutation responses and local optimistic writes
//! all land here and are merged into one view per entity. The merge rule is
//! "last writer by version wins":
//!
//! 1. Every fact carries a freshness key: the server version for complaints;
//!    the server id plus `created_at` for messages.
//! 2. A complaint fact is applied only if its version is strictly newer than
//!    the one already applied to the same field. Status and assignee carry
//!    separate keys, since one server mutation may push both at one version.
//!    A snapshot updates each field whose key it beats. Equal or older facts
//!    are duplicates.
//! 3. An applied complaint fact settles any unresolved ledger entry it speaks
//!    to. Equal value: `ConfirmedMatch`, nothing visible changes. Different
//!    value: `ConfirmedDivergent`, the view snaps to the server value and a
//!    [`Correction`] is published.
//! 4. A message fact is matched against local Pending/Failed messages by
//!    server id, else by (sender, content, time window). A match rebinds the
//!    local message to the server id; no match appends. Transcripts are
//!    ordered by `(created_at, seq)`, never by arrival.
//! 5. Facts for entities nobody is subscribed to are dropped, not buffered.
//!
//! A fact without a usable key is applied only if nothing has ever been
//! applied for that entity; otherwise it is dropped.
//!
//! All view state sits behind one mutex and every apply runs start to finish
//! under it with no `.await`, so facts for one entity are applied strictly in
//! arrival order.

use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::backend::{ComplaintSnapshot, MessageDraft, PushEvent, ServerMessage};
use crate::config::SyncConfig;
use crate::error::{MutationError, MutationResult};
use crate::ledger::{
    EntityKey, MutationHandle, MutationKind, OptimisticMutationLedger, OptimisticValue, Resolution,
};
use crate::types::{
    now_millis, Assignee, Attachment, Complaint, ComplaintId, ComplaintStatus, DeliveryState,
    Message, MessageId, ThreadId, Version,
};

/// Where a fact came from. Informational only: every source goes through the
/// same merge rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FactSource {
    Push,
    Poll,
    MutationResponse,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ComplaintChange {
    /// Full authoritative state (poll, mutation response).
    Snapshot {
        status: ComplaintStatus,
        assignee: Option<Assignee>,
    },
    Status(ComplaintStatus),
    Assignment(Option<Assignee>),
}

impl ComplaintChange {
    fn status(&self) -> Option<ComplaintStatus> {
        match self {
            ComplaintChange::Snapshot { status, .. } | ComplaintChange::Status(status) => {
                Some(*status)
            }
            ComplaintChange::Assignment(_) => None,
        }
    }

    fn assignee(&self) -> Option<&Option<Assignee>> {
        match self {
            ComplaintChange::Snapshot { assignee, .. } | ComplaintChange::Assignment(assignee) => {
                Some(assignee)
            }
            ComplaintChange::Status(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComplaintFact {
    pub id: ComplaintId,
    pub version: Option<Version>,
    pub change: ComplaintChange,
    pub source: FactSource,
}

impl ComplaintFact {
    pub fn snapshot(snapshot: ComplaintSnapshot, source: FactSource) -> Self {
        Self {
            id: snapshot.id,
            version: snapshot.version,
            change: ComplaintChange::Snapshot {
                status: snapshot.status,
                assignee: snapshot.assignee,
            },
            source,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageFact {
    pub message: ServerMessage,
    pub source: FactSource,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fact {
    Complaint(ComplaintFact),
    Message(MessageFact),
}

impl From<PushEvent> for Fact {
    fn from(event: PushEvent) -> Self {
        match event {
            PushEvent::StatusChanged {
                complaint_id,
                status,
                version,
            } => {
                Fact::Complaint(ComplaintFact {
                    id: complaint_id,
                    version,
                    change: ComplaintChange::Status(status),
                    source: FactSource::Push,
                })
            }
            PushEvent::AssignmentChanged {
                complaint_id,
                assignee,
                version,
            } => {
                Fact::Complaint(ComplaintFact {
                    id: complaint_id,
                    version,
                    change: ComplaintChange::Assignment(assignee),
                    source: FactSource::Push,
                })
            }
            PushEvent::MessageNew { message } | PushEvent::MessageDelivered { message } => {
                Fact::Message(MessageFact {
                    message,
                    source: FactSource::Push,
                })
            }
        }
    }
}

/// What happened to a submitted fact.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied,
    /// Freshness key not strictly newer than the applied one.
    Duplicate,
    /// No usable freshness key and the entity already has applied state.
    Malformed,
    /// Nobody is subscribed to the entity.
    Unsubscribed,
    /// A partial fact arrived before any full snapshot of the entity.
    MissingBase,
}

/// A user-visible notice that the server overrode an optimistic value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Correction {
    Status {
        optimistic: ComplaintStatus,
        confirmed: ComplaintStatus,
    },
    Assignee {
        optimistic: Option<Assignee>,
        confirmed: Option<Assignee>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComplaintView {
    pub id: ComplaintId,
    /// `None` until the first snapshot arrives.
    pub complaint: Option<Complaint>,
    pub pending_status: bool,
    pub pending_assignment: bool,
    /// Most recent server correction; cleared by the next local mutation.
    pub correction: Option<Correction>,
    /// Bumped on every publish.
    pub revision: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadView {
    pub thread: ThreadId,
    /// Ordered by `(created_at, seq)`.
    pub messages: Vec<Message>,
    pub revision: u64,
}

/// Emitted when a ledger entry times out and the entity must be refetched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefetchRequest {
    Complaint(ComplaintId),
    Thread(ThreadId),
}

/// Handle for a locally-sent message that is waiting for the server.
#[derive(Debug, Clone)]
pub struct PendingMessage {
    pub thread: ThreadId,
    pub local_id: Uuid,
    pub handle: MutationHandle,
    pub draft: MessageDraft,
}

/// A live view of one entity: the current snapshot plus future updates.
///
/// Dropping the subscription releases the view and everything attached to it
/// (poll timers, push handlers).
pub struct ViewSubscription<V> {
    rx: watch::Receiver<V>,
    guards: Vec<Box<dyn Any + Send + Sync>>,
    release: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl<V: Clone> ViewSubscription<V> {
    pub fn current(&self) -> V {
        self.rx.borrow().clone()
    }

    /// Waits for the next published view. Returns `false` once the view has
    /// been torn down.
    pub async fn changed(&mut self) -> bool {
        self.rx.changed().await.is_ok()
    }

    /// Waits until the view satisfies `f`, returning that view.
    pub async fn wait_for(&mut self, f: impl FnMut(&V) -> bool) -> Option<V> {
        self.rx.wait_for(f).await.ok().map(|v| v.clone())
    }

    /// Ties `guard` to this subscription's lifetime.
    pub fn attach<G: Any + Send + Sync>(&mut self, guard: G) {
        self.guards.push(Box::new(guard));
    }
}

impl<V> Drop for ViewSubscription<V> {
    fn drop(&mut self) {
        self.guards.clear();
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AppliedKey {
    Never,
    /// A keyless fact was applied fail-open.
    Unversioned,
    At(Version),
}

impl AppliedKey {
    fn version(self) -> Option<Version> {
        match self {
            AppliedKey::At(v) => Some(v),
            _ => None,
        }
    }
}

/// Freshness comparison: the key to record if `incoming` may be applied.
fn admit(applied: AppliedKey, incoming: Option<Version>) -> Result<AppliedKey, ApplyOutcome> {
    match (applied, incoming) {
        (AppliedKey::Never, Some(v)) | (AppliedKey::Unversioned, Some(v)) => Ok(AppliedKey::At(v)),
        (AppliedKey::Never, None) => Ok(AppliedKey::Unversioned),
        (AppliedKey::At(current), Some(v)) if v > current => Ok(AppliedKey::At(v)),
        (AppliedKey::At(_), Some(_)) => Err(ApplyOutcome::Duplicate),
        (_, None) => Err(ApplyOutcome::Malformed),
    }
}

#[derive(Debug, Clone)]
struct ConfirmedComplaint {
    status: ComplaintStatus,
    assignee: Option<Assignee>,
}

struct ComplaintEntry {
    subscribers: usize,
    status_key: AppliedKey,
    assignee_key: AppliedKey,
    confirmed: Option<ConfirmedComplaint>,
    correction: Option<Correction>,
    revision: u64,
    tx: watch::Sender<ComplaintView>,
}

impl ComplaintEntry {
    fn new(id: &ComplaintId) -> Self {
        let (tx, _) = watch::channel(ComplaintView {
            id: id.clone(),
            complaint: None,
            pending_status: false,
            pending_assignment: false,
            correction: None,
            revision: 0,
        });
        Self {
            subscribers: 0,
            status_key: AppliedKey::Never,
            assignee_key: AppliedKey::Never,
            confirmed: None,
            correction: None,
            revision: 0,
            tx,
        }
    }

    fn updated_at(&self) -> Option<Version> {
        self.status_key.version().max(self.assignee_key.version())
    }

    /// Confirmed state overlaid with unresolved optimistic values.
    fn view(&self, id: &ComplaintId, ledger: &OptimisticMutationLedger) -> ComplaintView {
        let status_overlay = ledger.status_overlay(id);
        let assignee_overlay = ledger.assignee_overlay(id);
        let complaint = self.confirmed.as_ref().map(|c| Complaint {
            id: id.clone(),
            status: status_overlay.unwrap_or(c.status),
            assignee: assignee_overlay
                .clone()
                .unwrap_or_else(|| c.assignee.clone()),
            updated_at: self.updated_at(),
        });
        ComplaintView {
            id: id.clone(),
            complaint,
            pending_status: status_overlay.is_some(),
            pending_assignment: assignee_overlay.is_some(),
            correction: self.correction.clone(),
            revision: self.revision,
        }
    }

    fn publish(&mut self, id: &ComplaintId, ledger: &OptimisticMutationLedger) {
        self.revision += 1;
        let view = self.view(id, ledger);
        self.tx.send_replace(view);
    }

    /// Publishes only if something a consumer can see differs from the
    /// current view. Returns whether it published.
    fn publish_if_changed(&mut self, id: &ComplaintId, ledger: &OptimisticMutationLedger) -> bool {
        let view = self.view(id, ledger);
        let unchanged = {
            let current = self.tx.borrow();
            current.complaint == view.complaint
                && current.pending_status == view.pending_status
                && current.pending_assignment == view.pending_assignment
                && current.correction == view.correction
        };
        if unchanged {
            return false;
        }
        self.publish(id, ledger);
        true
    }
}

struct ThreadEntry {
    subscribers: usize,
    /// Whether any server fact has been applied to this thread.
    ever_applied: bool,
    messages: Vec<Message>,
    revision: u64,
    tx: watch::Sender<ThreadView>,
}

impl ThreadEntry {
    fn new(thread: &ThreadId) -> Self {
        let (tx, _) = watch::channel(ThreadView {
            thread: thread.clone(),
            messages: Vec::new(),
            revision: 0,
        });
        Self {
            subscribers: 0,
            ever_applied: false,
            messages: Vec::new(),
            revision: 0,
            tx,
        }
    }

    fn publish(&mut self, thread: &ThreadId) {
        self.messages.sort_by_key(|m| (m.created_at, m.seq));
        self.revision += 1;
        self.tx.send_replace(ThreadView {
            thread: thread.clone(),
            messages: self.messages.clone(),
            revision: self.revision,
        });
    }

    fn position_local(&self, local: Uuid) -> Option<usize> {
        self.messages.iter().position(|m| m.local_id == Some(local))
    }

    /// Closest unconfirmed local message that is the same logical message as
    /// (`sender`, `content`, `created_at`).
    fn heuristic_match(
        &self,
        sender: &str,
        content: &str,
        created_at: i64,
        window_ms: i64,
    ) -> Option<usize> {
        self.messages
            .iter()
            .enumerate()
            .filter(|(_, m)| {
                matches!(m.id, MessageId::Local(_))
                    && m.delivery != DeliveryState::Confirmed
                    && m.sender_id == sender
                    && m.content == content
                    && (m.created_at - created_at).abs() <= window_ms
            })
            .min_by_key(|(_, m)| ((m.created_at - created_at).abs(), m.seq))
            .map(|(i, _)| i)
    }
}

fn rebind(message: &mut Message, server_id: String, created_at: Option<i64>) {
    message.id = MessageId::Server(server_id);
    if let Some(created_at) = created_at {
        message.created_at = created_at;
    }
    message.delivery = DeliveryState::Confirmed;
}

#[derive(Default)]
struct State {
    complaints: HashMap<ComplaintId, ComplaintEntry>,
    threads: HashMap<ThreadId, ThreadEntry>,
    ledger: OptimisticMutationLedger,
    /// Thread of every locally-sent message still tracked by the ledger.
    sends: HashMap<Uuid, ThreadId>,
    next_seq: u64,
}

impl State {
    fn next_seq(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }

    /// Settles the unresolved `kind` entry for `id` against a confirmed value.
    fn settle(
        ledger: &mut OptimisticMutationLedger,
        entry: &mut ComplaintEntry,
        id: &ComplaintId,
        confirmed: OptimisticValue,
    ) {
        let key = EntityKey::Complaint(id.clone());
        let Some(pending) = ledger.unresolved(&key, confirmed.kind()) else {
            return;
        };
        let handle = pending.handle;
        if pending.optimistic == confirmed {
            ledger.resolve(handle, Resolution::ConfirmedMatch);
            debug!(complaint = %id, kind = %confirmed.kind(), "optimistic mutation confirmed");
            return;
        }

        let optimistic = pending.optimistic.clone();
        ledger.resolve(handle, Resolution::ConfirmedDivergent);
        entry.correction = match (optimistic, confirmed) {
            (OptimisticValue::Status(optimistic), OptimisticValue::Status(confirmed)) => {
                Some(Correction::Status {
                    optimistic,
                    confirmed,
                })
            }
            (OptimisticValue::Assignee(optimistic), OptimisticValue::Assignee(confirmed)) => {
                Some(Correction::Assignee {
                    optimistic,
                    confirmed,
                })
            }
            _ => None,
        };
        info!(complaint = %id, correction = ?entry.correction, "server overrode optimistic value");
    }

    fn apply_complaint(&mut self, fact: ComplaintFact) -> ApplyOutcome {
        let State {
            complaints,
            ledger,
            ..
        } = self;
        let Some(entry) = complaints.get_mut(&fact.id) else {
            debug!(
                complaint = %fact.id,
                source = ?fact.source,
                "dropping fact for unsubscribed complaint"
            );
            return ApplyOutcome::Unsubscribed;
        };
        if entry.confirmed.is_none() && !matches!(fact.change, ComplaintChange::Snapshot { .. }) {
            debug!(
                complaint = %fact.id,
                source = ?fact.source,
                "partial fact before first snapshot"
            );
            return ApplyOutcome::MissingBase;
        }

        // Each field is judged against its own key only.
        let status = fact
            .change
            .status()
            .map(|status| (status, admit(entry.status_key, fact.version)));
        let assignee = fact
            .change
            .assignee()
            .map(|assignee| (assignee, admit(entry.assignee_key, fact.version)));
        let admitted_status = match status {
            Some((status, Ok(key))) => Some((status, key)),
            _ => None,
        };
        let admitted_assignee = match assignee {
            Some((assignee, Ok(key))) => Some((assignee.clone(), key)),
            _ => None,
        };
        if admitted_status.is_none() && admitted_assignee.is_none() {
            let outcome = [status.map(|(_, r)| r), assignee.map(|(_, r)| r)]
                .into_iter()
                .flatten()
                .find_map(Result::err)
                .unwrap_or(ApplyOutcome::Duplicate);
            debug!(
                complaint = %fact.id,
                source = ?fact.source,
                version = ?fact.version,
                applied = ?entry.updated_at(),
                ?outcome,
                "dropping complaint fact"
            );
            return outcome;
        }

        let base = entry.confirmed.get_or_insert_with(|| ConfirmedComplaint {
            status: ComplaintStatus::Opened,
            assignee: None,
        });
        if let Some((status, key)) = admitted_status {
            base.status = status;
            entry.status_key = key;
        }
        if let Some((assignee, key)) = &admitted_assignee {
            base.assignee = assignee.clone();
            entry.assignee_key = *key;
        }

        if let Some((status, _)) = admitted_status {
            Self::settle(ledger, entry, &fact.id, OptimisticValue::Status(status));
        }
        if let Some((assignee, _)) = admitted_assignee {
            Self::settle(ledger, entry, &fact.id, OptimisticValue::Assignee(assignee));
        }

        if entry.publish_if_changed(&fact.id, ledger) {
            ApplyOutcome::Applied
        } else {
            debug!(
                complaint = %fact.id,
                source = ?fact.source,
                version = ?fact.version,
                "complaint fact carried nothing new"
            );
            ApplyOutcome::Duplicate
        }
    }

    fn apply_message(&mut self, fact: MessageFact, window_ms: i64) -> ApplyOutcome {
        let seq = self.next_seq();
        let State {
            threads,
            ledger,
            sends,
            ..
        } = self;
        let incoming = fact.message;
        let Some(entry) = threads.get_mut(&incoming.thread) else {
            debug!(
                thread = %incoming.thread,
                source = ?fact.source,
                "dropping fact for unsubscribed thread"
            );
            return ApplyOutcome::Unsubscribed;
        };

        match (incoming.id, incoming.created_at) {
            (Some(server_id), Some(created_at)) => {
                if let Some(i) =
                    entry.messages.iter().position(|m| m.server_id() == Some(server_id.as_str()))
                {
                    if entry.messages[i].delivery == DeliveryState::Confirmed {
                        return ApplyOutcome::Duplicate;
                    }
                    entry.messages[i].delivery = DeliveryState::Confirmed;
                } else if let Some(i) = entry.heuristic_match(
                    &incoming.sender_id,
                    &incoming.content,
                    created_at,
                    window_ms,
                ) {
                    let message = &mut entry.messages[i];
                    if let Some(local) = message.local_id {
                        let key = EntityKey::Message(local);
                        if let Some(handle) =
                            ledger.unresolved(&key, MutationKind::MessageSend).map(|p| p.handle)
                        {
                            ledger.resolve(handle, Resolution::ConfirmedMatch);
                        }
                        sends.remove(&local);
                    }
                    debug!(
                        thread = %incoming.thread,
                        server_id = %server_id,
                        "matched pending message"
                    );
                    rebind(message, server_id, Some(created_at));
                } else {
                    entry.messages.push(Message {
                        id: MessageId::Server(server_id),
                        local_id: None,
                        sender_id: incoming.sender_id,
                        content: incoming.content,
                        attachments: incoming.attachments,
                        created_at,
                        seq,
                        delivery: DeliveryState::Confirmed,
                    });
                }
            }
            (server_id, created_at) => {
                if entry.ever_applied {
                    debug!(
                        thread = %incoming.thread,
                        "dropping message fact without freshness key"
                    );
                    return ApplyOutcome::Malformed;
                }
                entry.messages.push(Message {
                    id: match server_id {
                        Some(id) => MessageId::Server(id),
                        None => MessageId::Local(Uuid::new_v4()),
                    },
                    local_id: None,
                    sender_id: incoming.sender_id,
                    content: incoming.content,
                    attachments: incoming.attachments,
                    created_at: created_at.unwrap_or_else(now_millis),
                    seq,
                    delivery: DeliveryState::Confirmed,
                });
            }
        }

        entry.ever_applied = true;
        entry.publish(&incoming.thread);
        ApplyOutcome::Applied
    }

    /// Removes an entry as `resolution` and republishes whatever it touched.
    fn resolve_and_publish(
        &mut self,
        handle: MutationHandle,
        resolution: Resolution,
    ) -> Option<RefetchRequest> {
        let pending = self.ledger.resolve(handle, resolution)?;
        match pending.entity {
            EntityKey::Complaint(id) => {
                if let Some(entry) = self.complaints.get_mut(&id) {
                    entry.publish(&id, &self.ledger);
                }
                Some(RefetchRequest::Complaint(id))
            }
            EntityKey::Message(local) => {
                let thread = self.sends.remove(&local)?;
                if let Some(entry) = self.threads.get_mut(&thread) {
                    if let Some(i) = entry.position_local(local) {
                        if entry.messages[i].delivery == DeliveryState::Pending {
                            entry.messages[i].delivery = DeliveryState::Failed;
                        }
                    }
                    entry.publish(&thread);
                }
                Some(RefetchRequest::Thread(thread))
            }
        }
    }
}

struct Shared {
    state: Mutex<State>,
    dedupe_window_ms: i64,
    resolution_timeout: Duration,
    refetch_tx: mpsc::UnboundedSender<RefetchRequest>,
}

/// The single owner of per-entity view state.
///
/// Cheap to clone; clones share state. Methods that arm ledger timeouts
/// (`apply_optimistic`, `begin_send`) must be called inside a tokio runtime.
#[derive(Clone)]
pub struct EventReconciler {
    shared: Arc<Shared>,
}

impl EventReconciler {
    /// Creates a reconciler. The receiver yields an entity each time an
    /// optimistic mutation times out and the entity needs a forced refetch.
    pub fn new(config: &SyncConfig) -> (Self, mpsc::UnboundedReceiver<RefetchRequest>) {
        let (refetch_tx, refetch_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            state: Mutex::new(State::default()),
            dedupe_window_ms: config.reconcile.message_dedupe_window_ms,
            resolution_timeout: config.ledger.resolution_timeout(),
            refetch_tx,
        });
        (Self { shared }, refetch_rx)
    }

    pub fn subscribe_complaint(&self, id: &ComplaintId) -> ViewSubscription<ComplaintView> {
        let rx = {
            let mut state = self.shared.state.lock();
            let entry = state
                .complaints
                .entry(id.clone())
                .or_insert_with(|| ComplaintEntry::new(id));
            entry.subscribers += 1;
            entry.tx.subscribe()
        };
        let weak = Arc::downgrade(&self.shared);
        let id = id.clone();
        ViewSubscription {
            rx,
            guards: Vec::new(),
            release: Some(Box::new(move || release_complaint(&weak, &id))),
        }
    }

    pub fn subscribe_thread(&self, thread: &ThreadId) -> ViewSubscription<ThreadView> {
        let rx = {
            let mut state = self.shared.state.lock();
            let entry =
                state.threads.entry(thread.clone()).or_insert_with(|| ThreadEntry::new(thread));
            entry.subscribers += 1;
            entry.tx.subscribe()
        };
        let weak = Arc::downgrade(&self.shared);
        let thread = thread.clone();
        ViewSubscription {
            rx,
            guards: Vec::new(),
            release: Some(Box::new(move || release_thread(&weak, &thread))),
        }
    }

    pub fn is_subscribed_complaint(&self, id: &ComplaintId) -> bool {
        self.shared.state.lock().complaints.contains_key(id)
    }

    pub fn is_subscribed_thread(&self, thread: &ThreadId) -> bool {
        self.shared.state.lock().threads.contains_key(thread)
    }

    pub fn apply(&self, fact: Fact) -> ApplyOutcome {
        match fact {
            Fact::Complaint(fact) => self.apply_complaint_fact(fact),
            Fact::Message(fact) => self.apply_message_fact(fact),
        }
    }

    pub fn apply_complaint_fact(&self, fact: ComplaintFact) -> ApplyOutcome {
        self.shared.state.lock().apply_complaint(fact)
    }

    pub fn apply_message_fact(&self, fact: MessageFact) -> ApplyOutcome {
        self.shared.state.lock().apply_message(fact, self.shared.dedupe_window_ms)
    }

    /// Applies a locally-originated status or assignment change to the view
    /// and records it in the ledger.
    ///
    /// # Errors
    ///
    /// `NotLoaded` if the complaint has no confirmed state yet;
    /// `MutationInFlight` if the same kind of change is still unresolved.
    pub fn apply_optimistic(
        &self,
        id: &ComplaintId,
        value: OptimisticValue,
    ) -> MutationResult<MutationHandle> {
        let mut state = self.shared.state.lock();
        let State {
            complaints,
            ledger,
            ..
        } = &mut *state;
        let entry = complaints
            .get_mut(id)
            .filter(|e| e.confirmed.is_some())
            .ok_or_else(|| MutationError::not_loaded(id))?;

        let handle = ledger.apply(EntityKey::Complaint(id.clone()), value)?;
        ledger.arm_timeout(handle, self.spawn_timeout(handle));
        entry.correction = None;
        entry.publish(id, ledger);
        Ok(handle)
    }

    /// Appends a Pending message to `thread` and records the send in the
    /// ledger.
    ///
    /// # Errors
    ///
    /// `NotLoaded` if nobody is subscribed to `thread`.
    pub fn begin_send(
        &self,
        thread: &ThreadId,
        sender_id: &str,
        content: &str,
        attachments: Vec<Attachment>,
    ) -> MutationResult<PendingMessage> {
        let mut state = self.shared.state.lock();
        if !state.threads.contains_key(thread) {
            return Err(MutationError::NotLoaded(format!("thread {thread}")));
        }
        let local_id = Uuid::new_v4();
        let handle =
            state.ledger.apply(EntityKey::Message(local_id), OptimisticValue::Message(local_id))?;
        let timer = self.spawn_timeout(handle);
        state.ledger.arm_timeout(handle, timer);
        state.sends.insert(local_id, thread.clone());

        let seq = state.next_seq();
        let draft = MessageDraft {
            sender_id: sender_id.to_owned(),
            content: content.to_owned(),
            attachments,
        };
        if let Some(entry) = state.threads.get_mut(thread) {
            entry.messages.push(Message {
                id: MessageId::Local(local_id),
                local_id: Some(local_id),
                sender_id: draft.sender_id.clone(),
                content: draft.content.clone(),
                attachments: draft.attachments.clone(),
                created_at: now_millis(),
                seq,
                delivery: DeliveryState::Pending,
            });
            entry.publish(thread);
        }
        Ok(PendingMessage {
            thread: thread.clone(),
            local_id,
            handle,
            draft,
        })
    }

    /// Binds a Pending message to the message the send endpoint returned.
    pub fn confirm_send(&self, local_id: Uuid, confirmed: ServerMessage) -> ApplyOutcome {
        let mut state = self.shared.state.lock();
        let key = EntityKey::Message(local_id);
        if let Some(handle) =
            state.ledger.unresolved(&key, MutationKind::MessageSend).map(|p| p.handle)
        {
            state.ledger.resolve(handle, Resolution::ConfirmedMatch);
        }
        state.sends.remove(&local_id);

        let Some(entry) = state.threads.get_mut(&confirmed.thread) else {
            return ApplyOutcome::Unsubscribed;
        };
        let local_idx = entry.position_local(local_id);
        match confirmed.id {
            Some(server_id) => {
                let already = entry.messages.iter().position(|m| {
                    m.server_id() == Some(server_id.as_str()) && m.local_id != Some(local_id)
                });
                match (already, local_idx) {
                    // Poll or push delivered it first without matching the
                    // local entry; keep the server copy only.
                    (Some(i), local) => {
                        entry.messages[i].delivery = DeliveryState::Confirmed;
                        if let Some(l) = local {
                            entry.messages.remove(l);
                        }
                    }
                    (None, Some(l)) => {
                        rebind(&mut entry.messages[l], server_id, confirmed.created_at)
                    }
                    (None, None) => return ApplyOutcome::Unsubscribed,
                }
            }
            None => match local_idx {
                Some(l) => entry.messages[l].delivery = DeliveryState::Confirmed,
                None => return ApplyOutcome::Unsubscribed,
            },
        }
        entry.ever_applied = true;
        entry.publish(&confirmed.thread);
        ApplyOutcome::Applied
    }

    /// Marks a send the backend refused or never answered as Failed.
    pub fn fail_send(&self, local_id: Uuid) {
        let mut state = self.shared.state.lock();
        let key = EntityKey::Message(local_id);
        let handle = state.ledger.unresolved(&key, MutationKind::MessageSend).map(|p| p.handle);
        match handle {
            Some(handle) => {
                state.resolve_and_publish(handle, Resolution::Rejected);
            }
            None => {
                let State { threads, .. } = &mut *state;
                for (thread, entry) in threads.iter_mut() {
                    if let Some(i) = entry.position_local(local_id) {
                        if entry.messages[i].delivery == DeliveryState::Pending {
                            entry.messages[i].delivery = DeliveryState::Failed;
                            entry.publish(thread);
                        }
                        break;
                    }
                }
            }
        }
    }

    /// Undoes an optimistic mutation the backend refused. The view returns
    /// to the last confirmed value.
    pub fn rollback(&self, handle: MutationHandle) -> bool {
        self.shared.state.lock().resolve_and_publish(handle, Resolution::Rejected).is_some()
    }

    /// Forces an unresolved entry to `ConfirmedDivergent`, snaps the view to
    /// the confirmed value, and requests a refetch of the entity.
    pub fn force_resolve(&self, handle: MutationHandle) -> Option<RefetchRequest> {
        force_resolve(&self.shared, handle)
    }

    /// The complaint as consumers currently see it.
    pub fn complaint(&self, id: &ComplaintId) -> Option<Complaint> {
        let state = self.shared.state.lock();
        state.complaints.get(id).and_then(|e| e.tx.borrow().complaint.clone())
    }

    pub fn thread(&self, thread: &ThreadId) -> Option<ThreadView> {
        let state = self.shared.state.lock();
        state.threads.get(thread).map(|e| e.tx.borrow().clone())
    }

    pub fn unresolved(&self, entity: &EntityKey, kind: MutationKind) -> Option<MutationHandle> {
        self.shared.state.lock().ledger.unresolved(entity, kind).map(|p| p.handle)
    }

    pub fn pending_mutations(&self) -> usize {
        self.shared.state.lock().ledger.len()
    }

    /// Drops every view and ledger entry and cancels every ledger timer.
    pub fn clear(&self) {
        let mut state = self.shared.state.lock();
        state.ledger.clear();
        state.sends.clear();
        state.complaints.clear();
        state.threads.clear();
    }

    fn spawn_timeout(&self, handle: MutationHandle) -> tokio::task::AbortHandle {
        let weak = Arc::downgrade(&self.shared);
        let timeout = self.shared.resolution_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(shared) = weak.upgrade() {
                if force_resolve(&shared, handle).is_some() {
                    warn!(?handle, ?timeout, "optimistic mutation unconfirmed; forcing refetch");
                }
            }
        })
        .abort_handle()
    }
}

fn force_resolve(shared: &Arc<Shared>, handle: MutationHandle) -> Option<RefetchRequest> {
    let request =
        shared.state.lock().resolve_and_publish(handle, Resolution::ConfirmedDivergent)?;
    let _ = shared.refetch_tx.send(request.clone());
    Some(request)
}

fn release_complaint(weak: &Weak<Shared>, id: &ComplaintId) {
    let Some(shared) = weak.upgrade() else { return };
    let mut state = shared.state.lock();
    if let Some(entry) = state.complaints.get_mut(id) {
        entry.subscribers = entry.subscribers.saturating_sub(1);
        if entry.subscribers == 0 {
            state.complaints.remove(id);
        }
    }
}

fn release_thread(weak: &Weak<Shared>, thread: &ThreadId) {
    let Some(shared) = weak.upgrade() else { return };
    let mut state = shared.state.lock();
    if let Some(entry) = state.threads.get_mut(thread) {
        entry.subscribers = entry.subscribers.saturating_sub(1);
        if entry.subscribers == 0 {
            state.threads.remove(thread);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn freshness_is_strictly_increasing() {
        assert_eq!(admit(AppliedKey::Never, Some(3)), Ok(AppliedKey::At(3)));
        assert_eq!(admit(AppliedKey::At(3), Some(4)), Ok(AppliedKey::At(4)));
        assert_eq!(admit(AppliedKey::At(3), Some(3)), Err(ApplyOutcome::Duplicate));
        assert_eq!(admit(AppliedKey::At(3), Some(2)), Err(ApplyOutcome::Duplicate));
    }

    #[test]
    fn keyless_fact_only_applies_first() {
        assert_eq!(admit(AppliedKey::Never, None), Ok(AppliedKey::Unversioned));
        assert_eq!(admit(AppliedKey::Unversioned, None), Err(ApplyOutcome::Malformed));
        assert_eq!(admit(AppliedKey::At(1), None), Err(ApplyOutcome::Malformed));
        assert_eq!(admit(AppliedKey::Unversioned, Some(1)), Ok(AppliedKey::At(1)));
    }
}
