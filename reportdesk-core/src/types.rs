use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Server-assigned, per-entity monotonic freshness marker (`updatedAt` / version).
pub type Version = u64;

/// Returns the current Unix timestamp in milliseconds.
pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

/// Returns the current Unix timestamp in seconds.
pub fn now_secs() -> i64 {
    now_millis() / 1000
}

/// Server-assigned complaint ("report") identifier. Immutable for the
/// lifetime of the complaint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ComplaintId(pub String);

impl ComplaintId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ComplaintId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ComplaintId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

/// Lifecycle status of a complaint.
///
/// `Opened → InProgress → {Resolved, Closed}`. Both end states are terminal in
/// this system; see [`crate::guard`] for the full transition table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComplaintStatus {
    Opened,
    InProgress,
    Resolved,
    Closed,
}

impl ComplaintStatus {
    /// True for `Resolved` and `Closed`.
    pub fn is_terminal(self) -> bool {
        matches!(self, ComplaintStatus::Resolved | ComplaintStatus::Closed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ComplaintStatus::Opened => "opened",
            ComplaintStatus::InProgress => "in_progress",
            ComplaintStatus::Resolved => "resolved",
            ComplaintStatus::Closed => "closed",
        }
    }
}

impl fmt::Display for ComplaintStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The officer a complaint is assigned to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Assignee {
    pub id: String,
    pub name: String,
}

impl Assignee {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
        }
    }
}

/// A complaint as rendered to consumers: the server-confirmed state with any
/// unresolved optimistic mutations layered on top.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Complaint {
    pub id: ComplaintId,
    pub status: ComplaintStatus,
    pub assignee: Option<Assignee>,
    /// Freshness key of the last applied server fact, `None` if the only
    /// applied fact carried no version.
    pub updated_at: Option<Version>,
}

impl Complaint {
    pub fn assignee_id(&self) -> Option<&str> {
        self.assignee.as_ref().map(|a| a.id.as_str())
    }
}

/// Identity of a chat thread: one chatroom attached to one report.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ThreadId {
    pub report_id: ComplaintId,
    pub chatroom_id: String,
}

impl ThreadId {
    pub fn new(report_id: impl Into<String>, chatroom_id: impl Into<String>) -> Self {
        Self {
            report_id: ComplaintId(report_id.into()),
            chatroom_id: chatroom_id.into(),
        }
    }
}

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.report_id, self.chatroom_id)
    }
}

/// A file attached to a chat message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub file_name: String,
    #[serde(default)]
    pub content_type: Option<String>,
    /// Download URL; absent while the message is still local.
    #[serde(default)]
    pub url: Option<String>,
}

/// Identity of a message in a thread.
///
/// Locally-sent messages start with a `Local` id and are rebound to the
/// `Server` id once the backend confirms them.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MessageId {
    Local(Uuid),
    Server(String),
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageId::Local(id) => write!(f, "local:{id}"),
            MessageId::Server(id) => f.write_str(id),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryState {
    Pending,
    Confirmed,
    Failed,
}

/// One entry of a [`ThreadId`]'s transcript.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub id: MessageId,
    /// Temporary id this message was sent under, kept after rebinding so the
    /// sender can still correlate its handle.
    pub local_id: Option<Uuid>,
    pub sender_id: String,
    pub content: String,
    pub attachments: Vec<Attachment>,
    /// Unix milliseconds.
    pub created_at: i64,
    /// Local insertion counter; breaks `created_at` ties.
    pub seq: u64,
    pub delivery: DeliveryState,
}

impl Message {
    pub fn server_id(&self) -> Option<&str> {
        match &self.id {
            MessageId::Server(id) => Some(id),
            MessageId::Local(_) => None,
        }
    }
}

/// Privilege level of the acting staff member.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// An officer who handles complaints assigned to them.
    Officer,
    /// Dashboard administrator; may act on any complaint.
    Admin,
}

/// Who is performing a mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActorContext {
    pub user_id: String,
    pub role: Role,
}

impl ActorContext {
    pub fn officer(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            role: Role::Officer,
        }
    }

    pub fn admin(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            role: Role::Admin,
        }
    }

    pub fn is_elevated(&self) -> bool {
        self.role == Role::Admin
    }
}
