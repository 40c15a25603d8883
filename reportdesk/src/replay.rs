//! Replay scripts.
//!
//! A script is a JSON-lines file; each line is one [`Step`] tagged by `op`.
//! Blank lines and lines starting with `#` are skipped.
//!
//! ```text
//! {"op":"seed","complaint":{"id":"c-1","status":"opened","version":1}}
//! {"op":"watch","complaint_id":"c-1"}
//! {"op":"assign","complaint_id":"c-1","officer":{"id":"off-1","name":"Ana"},"actor":{"id":"root","role":"admin"}}
//! {"op":"push","event":{"topic":"status-changed","complaint_id":"c-1","status":"resolved","version":9}}
//! ```

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use reportdesk_core::backend::{ComplaintSnapshot, PushEvent, ServerMessage};
use reportdesk_core::error::{MutationError, TokenError};
use reportdesk_core::guard::CloseConfirmation;
use reportdesk_core::session::DeskSession;
use reportdesk_core::sim::{SimBackend, SimConnector};
use reportdesk_core::token::{AccessToken, TokenGrant};
use reportdesk_core::types::{
    now_secs, ActorContext, Assignee, ComplaintId, ComplaintStatus, Role, ThreadId,
};
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::event::{forward_view, DeskEvent};

#[derive(Error, Debug)]
pub enum ReplayError {
    #[error("cannot read script: {0}")]
    Io(#[from] std::io::Error),

    #[error("script line {line}: {source}")]
    Parse {
        line: usize,
        source: serde_json::Error,
    },

    #[error("invalid session token: {0}")]
    Token(#[from] TokenError),
}

#[derive(Debug, Clone, Deserialize)]
pub struct Actor {
    pub id: String,
    pub role: Role,
}

impl From<&Actor> for ActorContext {
    fn from(actor: &Actor) -> Self {
        ActorContext {
            user_id: actor.id.clone(),
            role: actor.role,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "op", rename_all = "kebab-case")]
pub enum Step {
    /// Puts a complaint into the simulated backend.
    Seed { complaint: ComplaintSnapshot },
    SeedMessage { message: ServerMessage },
    Watch { complaint_id: ComplaintId },
    WatchThread { thread: ThreadId },
    /// Delivers a raw event on the push channel.
    Push { event: PushEvent },
    Wait { ms: u64 },
    Assign {
        complaint_id: ComplaintId,
        officer: Assignee,
        actor: Actor,
    },
    Revoke {
        complaint_id: ComplaintId,
        actor: Actor,
    },
    Resolve {
        complaint_id: ComplaintId,
        actor: Actor,
    },
    Close {
        complaint_id: ComplaintId,
        actor: Actor,
        #[serde(default)]
        confirmed: bool,
    },
    Send {
        thread: ThreadId,
        actor: Actor,
        content: String,
    },
    DropConnection,
    RejectMutations { reject: bool },
}

pub fn parse_script(raw: &str) -> Result<Vec<Step>, ReplayError> {
    raw.lines()
        .enumerate()
        .filter(|(_, line)| {
            let line = line.trim();
            !line.is_empty() && !line.starts_with('#')
        })
        .map(|(n, line)| {
            serde_json::from_str(line).map_err(|source| ReplayError::Parse {
                line: n + 1,
                source,
            })
        })
        .collect()
}

pub fn load_script(path: &Path) -> Result<Vec<Step>, ReplayError> {
    parse_script(&std::fs::read_to_string(path)?)
}

/// The lease the replay session starts with: the JWT in `raw` when one is
/// given, else a one-hour token for the simulated backend.
pub fn session_grant(raw: Option<&str>) -> Result<TokenGrant, ReplayError> {
    match raw {
        Some(jwt) => Ok(TokenGrant::from_jwt(jwt.trim())?),
        None => Ok(TokenGrant::new(AccessToken::new("replay"), now_secs() + 3600)),
    }
}

/// Runs `steps` in order against `session`, then sends `ReplayDone`.
pub async fn run(
    session: DeskSession,
    sim: Arc<SimBackend>,
    connector: Arc<SimConnector>,
    steps: Vec<Step>,
    tx: mpsc::UnboundedSender<DeskEvent>,
) {
    for (n, step) in steps.into_iter().enumerate() {
        if session.is_ended() {
            warn!(step = n + 1, "session ended; abandoning replay");
            break;
        }
        match step {
            Step::Seed { complaint } => sim.seed_complaint(complaint),
            Step::SeedMessage { message } => sim.seed_message(message),
            Step::Watch { complaint_id } => match session.subscribe(&complaint_id) {
                Ok(sub) => forward_view(sub, tx.clone(), DeskEvent::Complaint),
                Err(err) => warn!(complaint = %complaint_id, error = %err, "cannot watch"),
            },
            Step::WatchThread { thread } => match session.subscribe_thread(&thread) {
                Ok(sub) => forward_view(sub, tx.clone(), DeskEvent::Thread),
                Err(err) => warn!(%thread, error = %err, "cannot watch thread"),
            },
            Step::Push { event } => {
                if !connector.push(event) {
                    warn!(step = n + 1, "push channel not connected; event lost");
                }
            }
            Step::Wait { ms } => tokio::time::sleep(Duration::from_millis(ms)).await,
            Step::Assign {
                complaint_id,
                officer,
                actor,
            } => {
                let actor = ActorContext::from(&actor);
                let result = session.assign(&complaint_id, officer, &actor).await;
                report(n, "assign", result.map(|_| ()));
            }
            Step::Revoke {
                complaint_id,
                actor,
            } => {
                let result = session.revoke(&complaint_id, &ActorContext::from(&actor)).await;
                report(n, "revoke", result.map(|_| ()));
            }
            Step::Resolve {
                complaint_id,
                actor,
            } => {
                let result = session
                    .propose_status_change(
                        &complaint_id,
                        ComplaintStatus::Resolved,
                        &ActorContext::from(&actor),
                        None,
                    )
                    .await;
                report(n, "resolve", result.map(|_| ()));
            }
            Step::Close {
                complaint_id,
                actor,
                confirmed,
            } => {
                let confirmation = confirmed.then(|| CloseConfirmation::confirm(&complaint_id));
                let result = session
                    .propose_status_change(
                        &complaint_id,
                        ComplaintStatus::Closed,
                        &ActorContext::from(&actor),
                        confirmation,
                    )
                    .await;
                report(n, "close", result.map(|_| ()));
            }
            Step::Send {
                thread,
                actor,
                content,
            } => {
                let actor = ActorContext::from(&actor);
                let result = session.send_message(&thread, &actor, &content, Vec::new());
                report(n, "send", result.map(|_| ()));
            }
            Step::DropConnection => connector.drop_connection(),
            Step::RejectMutations { reject } => sim.reject_mutations(reject),
        }
    }
    let _ = tx.send(DeskEvent::ReplayDone);
}

fn report(n: usize, op: &str, result: Result<(), MutationError>) {
    match result {
        Ok(()) => info!(step = n + 1, op, "accepted"),
        Err(MutationError::Unconfirmed { source, .. }) => {
            info!(step = n + 1, op, error = %source, "submitted; awaiting confirmation")
        }
        Err(err) => warn!(step = n + 1, op, error = %err, "refused"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_steps_and_skips_comments() {
        let raw = r#"
# seed then watch
{"op":"seed","complaint":{"id":"c-1","status":"in_progress","assignee":{"id":"off-1","name":"Ana"},"version":3}}
{"op":"watch","complaint_id":"c-1"}

{"op":"push","event":{"topic":"status-changed","complaint_id":"c-1","status":"resolved","version":4}}
{"op":"close","complaint_id":"c-1","actor":{"id":"off-1","role":"officer"},"confirmed":true}
{"op":"drop-connection"}
"#;
        let steps = parse_script(raw).unwrap();
        assert_eq!(steps.len(), 5, "comments and blank lines are skipped");
        assert!(matches!(&steps[0], Step::Seed { complaint } if complaint.version == Some(3)));
        assert!(matches!(
            &steps[2],
            Step::Push { event: PushEvent::StatusChanged { version: Some(4), .. } }
        ));
        assert!(matches!(&steps[3], Step::Close { confirmed: true, .. }));
        assert!(matches!(steps[4], Step::DropConnection));
    }

    #[test]
    fn reports_the_offending_line() {
        let raw = "{\"op\":\"wait\",\"ms\":10}\n{\"op\":\"teleport\"}\n";
        match parse_script(raw) {
            Err(ReplayError::Parse { line, .. }) => assert_eq!(line, 2),
            other => panic!("expected parse error, got {other:?}"),
        }
    }

    #[test]
    fn session_grant_reads_the_jwt_expiry() {
        let jwt = "eyJhbGciOiJub25lIn0.eyJzdWIiOiJhZG1pbi0xIiwiZXhwIjo0MTAyNDQ0ODAwfQ.sig";
        let grant = session_grant(Some(jwt)).unwrap();
        assert_eq!(grant.expires_at, 4_102_444_800);
        assert_eq!(grant.token.expose(), jwt);

        assert!(matches!(session_grant(Some("opaque")), Err(ReplayError::Token(_))));
        assert!(session_grant(None).unwrap().expires_at > now_secs());
    }

    #[test]
    fn loads_script_from_disk() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("script.jsonl");
        std::fs::write(&path, "{\"op\":\"wait\",\"ms\":250}\n").unwrap();
        let steps = load_script(&path).unwrap();
        assert!(matches!(steps[..], [Step::Wait { ms: 250 }]));
    }
}
