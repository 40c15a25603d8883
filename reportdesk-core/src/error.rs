//! Error types for the reconciliation core.
//!
//! One enum per concern. Nothing in this crate panics on a backend, transport
//! or session failure; every fallible entry point returns one of these.

use thiserror::Error;

use crate::ledger::{EntityKey, MutationHandle, MutationKind};
use crate::types::ComplaintId;

/// Failure reported by the REST backend collaborator.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    /// 4xx: the backend refused the request.
    #[error("rejected by backend ({status}): {reason}")]
    Rejected { status: u16, reason: String },

    #[error("unauthorized")]
    Unauthorized,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("backend unavailable: {0}")]
    Unavailable(String),

    #[error("backend request timed out")]
    Timeout,
}

impl BackendError {
    /// True when the backend definitively refused the mutation, so local
    /// optimistic state must be rolled back rather than left for a later fact.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            BackendError::Rejected { .. } | BackendError::Unauthorized | BackendError::NotFound(_)
        )
    }
}

pub type BackendResult<T> = Result<T, BackendError>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// Retryable. The prior expiry timer is untouched.
    #[error("token refresh failed: {0}")]
    RefreshFailed(BackendError),

    #[error("session expired")]
    Expired,
}

pub type SessionResult<T> = Result<T, SessionError>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("connect failed: {0}")]
    ConnectFailed(String),

    #[error("connect timed out")]
    ConnectTimeout,

    #[error("liveness ping failed: {0}")]
    PingFailed(String),

    #[error("liveness ping timed out")]
    PingTimeout,

    #[error("connection closed by peer")]
    Closed,

    #[error("transport permanently down after {attempts} attempts")]
    PermanentlyDown { attempts: u32 },
}

/// Why [`crate::guard`] refused a status or assignment change.
///
/// Display strings are what the dashboard shows to the user.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    #[error("cannot set Opened manually")]
    CannotSetOpened,

    #[error("cannot set In Progress manually; assign an officer instead")]
    CannotSetInProgress,

    #[error("assign an officer first")]
    AssignOfficerFirst,

    #[error("not permitted")]
    NotPermitted,

    #[error("closing a complaint requires confirmation")]
    ConfirmationRequired,

    #[error("only an in-progress complaint may be resolved or closed")]
    OnlyInProgressMayTerminate,

    #[error("complaint is already resolved or closed")]
    AlreadyTerminal,

    #[error("complaint has no assignee to revoke")]
    NothingToRevoke,

    #[error("complaint is already assigned to that officer")]
    AlreadyAssigned,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MutationError {
    #[error(transparent)]
    Rejected(#[from] Rejection),

    /// Ledger policy: one unresolved mutation per (entity, kind); later ones
    /// are refused, never queued or overwritten.
    #[error("a {kind} mutation is already in flight for {entity}")]
    MutationInFlight {
        entity: EntityKey,
        kind: MutationKind,
    },

    #[error("{0} is not loaded; subscribe before mutating")]
    NotLoaded(String),

    /// The backend refused the mutation; optimistic state was rolled back.
    #[error("backend refused the mutation: {0}")]
    Backend(BackendError),

    /// The submit failed in transit and its outcome is unknown. The
    /// optimistic value stays up until a fact settles it or the ledger
    /// timeout forces a refetch.
    #[error("mutation outcome unknown: {source}")]
    Unconfirmed {
        handle: MutationHandle,
        source: BackendError,
    },

    #[error("session has ended")]
    SessionEnded,
}

impl MutationError {
    pub fn not_loaded(id: &ComplaintId) -> Self {
        MutationError::NotLoaded(format!("complaint {id}"))
    }
}

pub type MutationResult<T> = Result<T, MutationError>;

#[derive(Error, Debug)]
pub enum TokenError {
    #[error("token is not a JWT (expected three dot-separated segments)")]
    Malformed,

    #[error("token payload is not valid base64url: {0}")]
    Encoding(#[from] base64::DecodeError),

    #[error("token claims are not valid JSON: {0}")]
    Claims(#[from] serde_json::Error),

    #[error("token has no `exp` claim")]
    MissingExpiry,
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("config parse error: {0}")]
    Parse(#[from] toml::de::Error),
}
