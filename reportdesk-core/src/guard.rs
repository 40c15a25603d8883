//! Complaint status state machine and its transition guards.
//!
//! ```text
//! Opened ──(backend, on assign)──▶ InProgress ──▶ Resolved
//!    ▲                                  │
//!    └──────(backend, on revoke)────────┴───────▶ Closed   (needs confirmation)
//! ```
//!
//! Only `InProgress` may move to a terminal state, and only when an officer is
//! assigned and the actor is that officer or an admin. `Opened` and
//! `InProgress` are never set directly by a user; the backend sets them as a
//! side effect of revoke and assign.
//!
//! These checks are the sole authority on what a user may do. Disabled
//! buttons in the dashboard are cosmetic and are never relied on.

use crate::error::Rejection;
use crate::types::{ActorContext, Assignee, Complaint, ComplaintId, ComplaintStatus};

/// Explicit second-step confirmation required to close a complaint.
///
/// Minted for exactly one complaint; presenting it for another complaint is
/// the same as presenting none.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseConfirmation {
    complaint: ComplaintId,
}

impl CloseConfirmation {
    /// Records that the user confirmed closing `complaint`.
    pub fn confirm(complaint: &ComplaintId) -> Self {
        Self {
            complaint: complaint.clone(),
        }
    }

    pub fn complaint(&self) -> &ComplaintId {
        &self.complaint
    }
}

/// The backend call a permitted status change maps to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusCommand {
    Resolve,
    Close,
}

impl StatusCommand {
    pub fn target(self) -> ComplaintStatus {
        match self {
            StatusCommand::Resolve => ComplaintStatus::Resolved,
            StatusCommand::Close => ComplaintStatus::Closed,
        }
    }
}

/// Validates a user-requested status change against the transition table.
///
/// `current` is the complaint as the actor sees it. Returns the backend
/// command to issue when the change is permitted.
///
/// # Errors
///
/// Returns the [`Rejection`] for the first violated row of the table.
pub fn check_status_change(
    current: &Complaint,
    target: ComplaintStatus,
    actor: &ActorContext,
    confirmation: Option<&CloseConfirmation>,
) -> Result<StatusCommand, Rejection> {
    let command = match target {
        ComplaintStatus::Opened => return Err(Rejection::CannotSetOpened),
        ComplaintStatus::InProgress => return Err(Rejection::CannotSetInProgress),
        ComplaintStatus::Resolved => StatusCommand::Resolve,
        ComplaintStatus::Closed => StatusCommand::Close,
    };

    if current.status != ComplaintStatus::InProgress {
        return Err(Rejection::OnlyInProgressMayTerminate);
    }

    let assignee = current.assignee.as_ref().ok_or(Rejection::AssignOfficerFirst)?;
    if !actor.is_elevated() && assignee.id != actor.user_id {
        return Err(Rejection::NotPermitted);
    }

    if command == StatusCommand::Close {
        match confirmation {
            Some(c) if c.complaint == current.id => {}
            _ => return Err(Rejection::ConfirmationRequired),
        }
    }

    Ok(command)
}

/// Validates assigning (or reassigning) `officer` to `current`.
///
/// # Errors
///
/// `NotPermitted` for non-admins, `AlreadyTerminal` once resolved or closed,
/// `AlreadyAssigned` when `officer` already holds the complaint.
pub fn check_assign(
    current: &Complaint,
    officer: &Assignee,
    actor: &ActorContext,
) -> Result<(), Rejection> {
    if !actor.is_elevated() {
        return Err(Rejection::NotPermitted);
    }
    if current.status.is_terminal() {
        return Err(Rejection::AlreadyTerminal);
    }
    if current.assignee_id() == Some(officer.id.as_str()) {
        return Err(Rejection::AlreadyAssigned);
    }
    Ok(())
}

/// Validates revoking the current assignment.
///
/// # Errors
///
/// `NotPermitted` for non-admins, `AlreadyTerminal` once resolved or closed,
/// `NothingToRevoke` when nobody is assigned.
pub fn check_revoke(current: &Complaint, actor: &ActorContext) -> Result<(), Rejection> {
    if !actor.is_elevated() {
        return Err(Rejection::NotPermitted);
    }
    if current.status.is_terminal() {
        return Err(Rejection::AlreadyTerminal);
    }
    if current.assignee.is_none() {
        return Err(Rejection::NothingToRevoke);
    }
    Ok(())
}
