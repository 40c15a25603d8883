//! Interfaces to the backend collaborator.
//!
//! The backend is assumed correct and authoritative. This module only fixes
//! the shape of what the core consumes from it: poll fetches, mutation
//! endpoints, the auth refresh endpoint, and the push channel.

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::{BackendResult, TransportError};
use crate::token::{AccessToken, TokenGrant};
use crate::types::{Assignee, Attachment, ComplaintId, ComplaintStatus, ThreadId, Version};

/// Full authoritative complaint state as returned by a poll fetch or a
/// mutation endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComplaintSnapshot {
    pub id: ComplaintId,
    pub status: ComplaintStatus,
    #[serde(default)]
    pub assignee: Option<Assignee>,
    #[serde(default)]
    pub version: Option<Version>,
}

/// A chat message as the backend reports it.
///
/// `id` and `created_at` are optional on the wire; a message missing either
/// has no usable freshness key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerMessage {
    #[serde(default)]
    pub id: Option<String>,
    pub thread: ThreadId,
    pub sender_id: String,
    pub content: String,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    /// Unix milliseconds.
    #[serde(default)]
    pub created_at: Option<i64>,
}

/// Body of a send-message request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MessageDraft {
    pub sender_id: String,
    pub content: String,
    pub attachments: Vec<Attachment>,
}

/// Push channel topics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    StatusChanged,
    AssignmentChanged,
    MessageNew,
    MessageDelivered,
}

impl Topic {
    pub const ALL: [Topic; 4] = [
        Topic::StatusChanged,
        Topic::AssignmentChanged,
        Topic::MessageNew,
        Topic::MessageDelivered,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Topic::StatusChanged => "status-changed",
            Topic::AssignmentChanged => "assignment-changed",
            Topic::MessageNew => "message-new",
            Topic::MessageDelivered => "message-delivered",
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A topic-addressed event delivered over the push channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "topic", rename_all = "kebab-case")]
pub enum PushEvent {
    StatusChanged {
        complaint_id: ComplaintId,
        status: ComplaintStatus,
        #[serde(default)]
        version: Option<Version>,
    },
    AssignmentChanged {
        complaint_id: ComplaintId,
        #[serde(default)]
        assignee: Option<Assignee>,
        #[serde(default)]
        version: Option<Version>,
    },
    MessageNew {
        message: ServerMessage,
    },
    MessageDelivered {
        message: ServerMessage,
    },
}

impl PushEvent {
    pub fn topic(&self) -> Topic {
        match self {
            PushEvent::StatusChanged { .. } => Topic::StatusChanged,
            PushEvent::AssignmentChanged { .. } => Topic::AssignmentChanged,
            PushEvent::MessageNew { .. } => Topic::MessageNew,
            PushEvent::MessageDelivered { .. } => Topic::MessageDelivered,
        }
    }
}

/// REST endpoints consumed by the core.
///
/// Mutation endpoints return the server-confirmed post-mutation state.
#[async_trait]
pub trait Backend: Send + Sync {
    async fn fetch_complaint(&self, id: &ComplaintId) -> BackendResult<ComplaintSnapshot>;

    async fn fetch_thread(&self, thread: &ThreadId) -> BackendResult<Vec<ServerMessage>>;

    /// Assign or reassign. The backend moves the complaint to `InProgress`.
    async fn assign(
        &self,
        id: &ComplaintId,
        officer: &Assignee,
    ) -> BackendResult<ComplaintSnapshot>;

    /// Remove the assignee. The backend moves the complaint back to `Opened`.
    async fn revoke(&self, id: &ComplaintId) -> BackendResult<ComplaintSnapshot>;

    async fn resolve(&self, id: &ComplaintId) -> BackendResult<ComplaintSnapshot>;

    async fn close(&self, id: &ComplaintId) -> BackendResult<ComplaintSnapshot>;

    async fn send_message(
        &self,
        thread: &ThreadId,
        draft: &MessageDraft,
    ) -> BackendResult<ServerMessage>;
}

/// The auth refresh endpoint.
#[async_trait]
pub trait TokenRefresher: Send + Sync {
    async fn refresh(&self) -> BackendResult<TokenGrant>;
}

/// Round-trip check on an open push connection.
#[async_trait]
pub trait LivenessCheck: Send + Sync {
    async fn ping(&self) -> Result<(), TransportError>;
}

/// An open push connection: an event stream plus its liveness check.
///
/// The stream ending (`recv()` returning `None`) is a disconnect.
pub struct PushConnection {
    pub events: mpsc::UnboundedReceiver<PushEvent>,
    pub liveness: Box<dyn LivenessCheck>,
}

/// Opens push connections for [`crate::transport::ChannelTransport`].
#[async_trait]
pub trait PushConnector: Send + Sync {
    async fn connect(&self, token: &AccessToken) -> Result<PushConnection, TransportError>;
}
