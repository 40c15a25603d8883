//! reportdesk: replay harness for the dashboard reconciliation core.
//!
//! Drives a [`DeskSession`] against the in-memory backend and push channel
//! from a JSON-lines script, and logs every view the dashboard would render.
//!
//! ```text
//! RUST_LOG=reportdesk=info,reportdesk_core=debug reportdesk script.jsonl
//! ```
//!
//! `REPORTDESK_TOKEN` may hold a JWT to start the session with; its `exp`
//! claim drives the expiry warning and the forced logout.
//!
//! # Startup sequence
//!
//! 1. Logging, then config from `$XDG_CONFIG_HOME/reportdesk/config.toml`.
//! 2. Load the script and the initial token; either one being malformed
//!    aborts before anything starts.
//! 3. `register_sigterm()` returns the flag polled in the 50 ms heartbeat arm.
//! 4. Start the session and the event forwarders, then the replay task.
//!
//! The loop exits on SIGTERM, on forced logout, or once the replay has
//! finished and no event has arrived for [`SETTLE`]. The session is torn
//! down at the single exit point after the loop.

mod event;
mod replay;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use reportdesk_core::clock::SessionEvent;
use reportdesk_core::config::{config_path, load_or_default};
use reportdesk_core::session::DeskSession;
use reportdesk_core::sim::{SimBackend, SimConnector};
use signal_hook::consts::SIGTERM;
use tokio::time::Instant;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::event::{DeskEvent, EventHandler};

/// Quiet period after the last step before the harness exits.
const SETTLE: Duration = Duration::from_secs(1);

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
}

/// Returns a flag set when SIGTERM arrives.
fn register_sigterm() -> std::io::Result<Arc<AtomicBool>> {
    let term = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register(SIGTERM, Arc::clone(&term))?;
    Ok(term)
}

#[tokio::main]
async fn main() -> Result<(), replay::ReplayError> {
    init_logging();
    let config = load_or_default(&config_path());

    let Some(script) = std::env::args_os().nth(1).map(PathBuf::from) else {
        eprintln!("usage: reportdesk <script.jsonl>");
        std::process::exit(2);
    };
    let steps = replay::load_script(&script)?;
    info!(path = %script.display(), steps = steps.len(), "replay script loaded");
    let grant = replay::session_grant(std::env::var("REPORTDESK_TOKEN").ok().as_deref())?;

    let term_flag = register_sigterm()?;

    let sim = Arc::new(SimBackend::new());
    let connector = Arc::new(SimConnector::new());
    sim.link(Arc::clone(&connector));
    let session = DeskSession::start(config, grant, sim.clone(), sim.clone(), connector.clone());

    let handler = EventHandler::new();
    event::spawn_session_watchers(&session, handler.tx.clone());
    tokio::spawn(replay::run(session.clone(), sim, connector, steps, handler.tx.clone()));
    let mut rx = handler.rx;

    let mut replay_done = false;
    let mut last_event = Instant::now();
    'event_loop: loop {
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_millis(50)) => {
                if term_flag.load(Ordering::Relaxed) {
                    info!("SIGTERM received");
                    break 'event_loop;
                }
                if replay_done && last_event.elapsed() >= SETTLE {
                    break 'event_loop;
                }
            }
            maybe_event = rx.recv() => {
                last_event = Instant::now();
                match maybe_event {
                    Some(DeskEvent::Complaint(view)) => match &view.complaint {
                        Some(c) => info!(
                            complaint = %c.id,
                            status = %c.status,
                            assignee = c.assignee_id().unwrap_or("-"),
                            version = ?c.updated_at,
                            pending_status = view.pending_status,
                            pending_assignment = view.pending_assignment,
                            correction = ?view.correction,
                            "complaint view"
                        ),
                        None => info!(complaint = %view.id, "complaint view (not loaded)"),
                    },
                    Some(DeskEvent::Thread(view)) => {
                        info!(thread = %view.thread, messages = view.messages.len(), "thread view");
                        for m in &view.messages {
                            info!(
                                thread = %view.thread,
                                id = %m.id,
                                sender = %m.sender_id,
                                delivery = ?m.delivery,
                                "  {}",
                                m.content
                            );
                        }
                    }
                    Some(DeskEvent::Transport(status)) => info!(?status, "push transport"),
                    Some(DeskEvent::Session(SessionEvent::ForcedLogout)) => {
                        warn!("forced logout");
                        break 'event_loop;
                    }
                    Some(DeskEvent::Session(event)) => info!(?event, "session"),
                    Some(DeskEvent::ReplayDone) => replay_done = true,
                    None => break 'event_loop,
                }
                if term_flag.load(Ordering::Relaxed) {
                    break 'event_loop;
                }
            }
        }
    }

    session.teardown();
    Ok(())
}
