//! Optimistic mutation ledger.
//!
//! Tracks every locally-applied mutation that the server has not yet
//! confirmed. The ledger holds entries only; the visible effect of an entry
//! (the optimistic overlay) is computed by [`crate::reconcile::EventReconciler`],
//! which owns the ledger and consults it on every applied fact.
//!
//! Policy: at most one `Unresolved` entry per `(entity, kind)`. A second
//! mutation of the same kind on the same entity is refused with
//! [`MutationError::MutationInFlight`] until the first resolves. The ledger
//! never queues and never overwrites a slot.

use std::collections::HashMap;
use std::fmt;

use tokio::task::AbortHandle;
use tokio::time::Instant;
use uuid::Uuid;

use crate::error::{MutationError, MutationResult};
use crate::types::{Assignee, ComplaintId, ComplaintStatus};

/// The entity a ledger entry mutates.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EntityKey {
    Complaint(ComplaintId),
    /// A locally-sent message, keyed by its temporary id.
    Message(Uuid),
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntityKey::Complaint(id) => write!(f, "complaint {id}"),
            EntityKey::Message(id) => write!(f, "message local:{id}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MutationKind {
    StatusChange,
    AssignmentChange,
    MessageSend,
}

impl fmt::Display for MutationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            MutationKind::StatusChange => "status change",
            MutationKind::AssignmentChange => "assignment change",
            MutationKind::MessageSend => "message send",
        })
    }
}

/// The value the local view shows while an entry is unresolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OptimisticValue {
    Status(ComplaintStatus),
    Assignee(Option<Assignee>),
    /// The message itself lives in the thread view under this local id.
    Message(Uuid),
}

impl OptimisticValue {
    pub fn kind(&self) -> MutationKind {
        match self {
            OptimisticValue::Status(_) => MutationKind::StatusChange,
            OptimisticValue::Assignee(_) => MutationKind::AssignmentChange,
            OptimisticValue::Message(_) => MutationKind::MessageSend,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    Unresolved,
    /// The server confirmed the optimistic value.
    ConfirmedMatch,
    /// The server confirmed something else, or never confirmed in time.
    ConfirmedDivergent,
    /// The backend refused the mutation.
    Rejected,
}

/// Identifies one ledger entry; used to force-resolve or roll it back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MutationHandle(u64);

#[derive(Debug)]
pub struct PendingMutation {
    pub handle: MutationHandle,
    pub entity: EntityKey,
    pub kind: MutationKind,
    pub optimistic: OptimisticValue,
    pub submitted_at: Instant,
    pub resolution: Resolution,
    timer: Option<AbortHandle>,
}

impl PendingMutation {
    fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

#[derive(Debug, Default)]
pub struct OptimisticMutationLedger {
    entries: HashMap<(EntityKey, MutationKind), PendingMutation>,
    by_handle: HashMap<MutationHandle, (EntityKey, MutationKind)>,
    next_handle: u64,
}

impl OptimisticMutationLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts an `Unresolved` entry for `entity` and returns its handle.
    ///
    /// # Errors
    ///
    /// Returns `MutationInFlight` if an unresolved entry of the same kind
    /// already exists for `entity`. The existing entry is left untouched.
    pub fn apply(
        &mut self,
        entity: EntityKey,
        value: OptimisticValue,
    ) -> MutationResult<MutationHandle> {
        let kind = value.kind();
        let slot = (entity, kind);
        if self.entries.contains_key(&slot) {
            return Err(MutationError::MutationInFlight {
                entity: slot.0,
                kind,
            });
        }

        self.next_handle += 1;
        let handle = MutationHandle(self.next_handle);
        self.by_handle.insert(handle, slot.clone());
        self.entries.insert(
            slot.clone(),
            PendingMutation {
                handle,
                entity: slot.0,
                kind,
                optimistic: value,
                submitted_at: Instant::now(),
                resolution: Resolution::Unresolved,
                timer: None,
            },
        );
        Ok(handle)
    }

    /// Attaches the resolution-timeout task to an entry so resolving the
    /// entry cancels it. Aborts `timer` at once if the entry is already gone.
    pub fn arm_timeout(&mut self, handle: MutationHandle, timer: AbortHandle) {
        match self.get_mut(handle) {
            Some(entry) => {
                entry.cancel_timer();
                entry.timer = Some(timer);
            }
            None => timer.abort(),
        }
    }

    pub fn unresolved(&self, entity: &EntityKey, kind: MutationKind) -> Option<&PendingMutation> {
        self.entries.get(&(entity.clone(), kind))
    }

    pub fn get(&self, handle: MutationHandle) -> Option<&PendingMutation> {
        self.by_handle.get(&handle).and_then(|slot| self.entries.get(slot))
    }

    fn get_mut(&mut self, handle: MutationHandle) -> Option<&mut PendingMutation> {
        let slot = self.by_handle.get(&handle)?;
        self.entries.get_mut(slot)
    }

    /// Marks the entry with `resolution`, removes it, and cancels its timer.
    ///
    /// Returns the removed entry, or `None` if it was already resolved.
    pub fn resolve(
        &mut self,
        handle: MutationHandle,
        resolution: Resolution,
    ) -> Option<PendingMutation> {
        let slot = self.by_handle.remove(&handle)?;
        let mut entry = self.entries.remove(&slot)?;
        entry.cancel_timer();
        entry.resolution = resolution;
        Some(entry)
    }

    /// Optimistic status for `id`, if a status change is unresolved.
    pub fn status_overlay(&self, id: &ComplaintId) -> Option<ComplaintStatus> {
        match self.unresolved(&EntityKey::Complaint(id.clone()), MutationKind::StatusChange) {
            Some(PendingMutation {
                optimistic: OptimisticValue::Status(s),
                ..
            }) => Some(*s),
            _ => None,
        }
    }

    /// Optimistic assignee for `id`, if an assignment change is unresolved.
    pub fn assignee_overlay(&self, id: &ComplaintId) -> Option<Option<Assignee>> {
        match self.unresolved(&EntityKey::Complaint(id.clone()), MutationKind::AssignmentChange) {
            Some(PendingMutation {
                optimistic: OptimisticValue::Assignee(a),
                ..
            }) => Some(a.clone()),
            _ => None,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drops every entry and cancels every timer. Used on session teardown.
    pub fn clear(&mut self) {
        for (_, mut entry) in self.entries.drain() {
            entry.cancel_timer();
        }
        self.by_handle.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn complaint(id: &str) -> EntityKey {
        EntityKey::Complaint(ComplaintId::from(id))
    }

    #[test]
    fn second_mutation_of_same_kind_is_refused() {
        let mut ledger = OptimisticMutationLedger::new();
        let first = ledger
            .apply(complaint("c-1"), OptimisticValue::Status(ComplaintStatus::Resolved))
            .unwrap();

        let err = ledger
            .apply(complaint("c-1"), OptimisticValue::Status(ComplaintStatus::Closed))
            .unwrap_err();
        assert_eq!(
            err,
            MutationError::MutationInFlight {
                entity: complaint("c-1"),
                kind: MutationKind::StatusChange
            }
        );
        // The original slot is untouched.
        assert_eq!(
            ledger.status_overlay(&ComplaintId::from("c-1")),
            Some(ComplaintStatus::Resolved)
        );
        assert_eq!(ledger.get(first).map(|e| e.resolution), Some(Resolution::Unresolved));
    }

    #[test]
    fn different_kinds_and_entities_coexist() {
        let mut ledger = OptimisticMutationLedger::new();
        ledger.apply(complaint("c-1"), OptimisticValue::Status(ComplaintStatus::Resolved)).unwrap();
        ledger.apply(complaint("c-1"), OptimisticValue::Assignee(None)).unwrap();
        ledger.apply(complaint("c-2"), OptimisticValue::Status(ComplaintStatus::Resolved)).unwrap();
        assert_eq!(ledger.len(), 3);
    }

    #[test]
    fn resolve_frees_the_slot_once() {
        let mut ledger = OptimisticMutationLedger::new();
        let handle = ledger
            .apply(complaint("c-1"), OptimisticValue::Status(ComplaintStatus::Resolved))
            .unwrap();

        let entry = ledger.resolve(handle, Resolution::ConfirmedMatch).unwrap();
        assert_eq!(entry.resolution, Resolution::ConfirmedMatch);
        assert!(ledger.resolve(handle, Resolution::Rejected).is_none());
        assert!(ledger.is_empty());

        ledger.apply(complaint("c-1"), OptimisticValue::Status(ComplaintStatus::Closed)).unwrap();
    }
}
