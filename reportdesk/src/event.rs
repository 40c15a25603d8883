//! Event bus for the replay harness.
//!
//! View changes, session lifecycle notifications and transport status
//! changes are normalised into one `DeskEvent` enum and sent over a tokio
//! unbounded MPSC channel. The main loop receives from this channel and logs
//! what the dashboard would render.

use reportdesk_core::clock::SessionEvent;
use reportdesk_core::reconcile::{ComplaintView, ThreadView, ViewSubscription};
use reportdesk_core::session::DeskSession;
use reportdesk_core::transport::TransportStatus;
use tokio::sync::{broadcast, mpsc};

#[derive(Debug)]
#[non_exhaustive]
pub enum DeskEvent {
    Complaint(ComplaintView),
    Thread(ThreadView),
    Session(SessionEvent),
    Transport(TransportStatus),
    /// The replay script has run to its last step.
    ReplayDone,
}

/// Holds the sender and receiver ends of the event channel.
///
/// `tx` is cloned into every forwarding task; `rx` is owned by the main loop.
pub struct EventHandler {
    pub tx: mpsc::UnboundedSender<DeskEvent>,
    pub rx: mpsc::UnboundedReceiver<DeskEvent>,
}

impl EventHandler {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self { tx, rx }
    }
}

impl Default for EventHandler {
    fn default() -> Self {
        Self::new()
    }
}

/// Forwards every published view of `subscription` until the view is torn
/// down or the main loop goes away. The task owns the subscription.
pub fn forward_view<V>(
    mut subscription: ViewSubscription<V>,
    tx: mpsc::UnboundedSender<DeskEvent>,
    wrap: fn(V) -> DeskEvent,
) where
    V: Clone + Send + Sync + 'static,
{
    tokio::spawn(async move {
        while subscription.changed().await {
            if tx.send(wrap(subscription.current())).is_err() {
                break;
            }
        }
    });
}

/// Spawns the forwarders for session lifecycle and transport status.
pub fn spawn_session_watchers(session: &DeskSession, tx: mpsc::UnboundedSender<DeskEvent>) {
    let mut events = session.session_events();
    let session_tx = tx.clone();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => {
                    if session_tx.send(DeskEvent::Session(event)).is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    let mut status = session.watch_transport();
    tokio::spawn(async move {
        while status.changed().await.is_ok() {
            let current = *status.borrow_and_update();
            if tx.send(DeskEvent::Transport(current)).is_err() {
                break;
            }
        }
    });
}
