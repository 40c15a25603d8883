//! Push channel transport.
//!
//! One supervisor task per session owns the push connection. It connects
//! with the current access token, dispatches every event to the handlers
//! registered for its topic, pings the connection on a fixed interval, and
//! reconnects with capped exponential backoff when the connection drops.
//! After `max_reconnect_attempts` consecutive failures the transport reports
//! [`TransportStatus::Down`] and stays down until [`ChannelTransport::reinitialize`].
//!
//! Handlers are keyed by `(topic, HandlerId)`. Registering the same id twice
//! replaces the earlier handler, so an event is never delivered twice to one
//! consumer. The registry outlives individual connections.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;
use tokio::task::AbortHandle;
use tokio::time::{interval_at, sleep, timeout, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::backend::{PushConnection, PushConnector, PushEvent, Topic};
use crate::config::TransportConfig;
use crate::error::TransportError;
use crate::token::AccessToken;

pub type PushHandler = Arc<dyn Fn(&PushEvent) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportStatus {
    Connecting,
    Live,
    /// Waiting to retry; `attempt` counts consecutive failures.
    Reconnecting { attempt: u32 },
    /// Retries exhausted or transport shut down. Polling is the only source.
    Down,
}

/// Capped exponential backoff: `base * 2^(attempt - 1)`, at most `max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub max: Duration,
    pub max_attempts: u32,
}

impl BackoffPolicy {
    pub fn from_config(config: &TransportConfig) -> Self {
        Self {
            base: config.backoff_base(),
            max: config.backoff_max(),
            max_attempts: config.max_reconnect_attempts,
        }
    }

    /// Delay before reconnect attempt `attempt` (1-based), or `None` once the
    /// attempts are exhausted.
    pub fn delay(&self, attempt: u32) -> Option<Duration> {
        if attempt == 0 || attempt > self.max_attempts {
            return None;
        }
        let factor = 1u32.checked_shl(attempt - 1).unwrap_or(u32::MAX);
        Some(self.base.saturating_mul(factor).min(self.max))
    }
}

struct TransportShared {
    handlers: RwLock<HashMap<Topic, Vec<(HandlerId, PushHandler)>>>,
    status_tx: watch::Sender<TransportStatus>,
    next_handler: Mutex<u64>,
}

impl TransportShared {
    fn set_status(&self, status: TransportStatus) {
        self.status_tx.send_if_modified(|current| {
            if *current == status {
                return false;
            }
            *current = status;
            true
        });
    }

    fn dispatch(&self, event: &PushEvent) {
        let topic = event.topic();
        let handlers: Vec<PushHandler> = self
            .handlers
            .read()
            .get(&topic)
            .map(|hs| hs.iter().map(|(_, h)| Arc::clone(h)).collect())
            .unwrap_or_default();
        debug!(%topic, handlers = handlers.len(), "dispatching push event");
        for handler in handlers {
            handler(event);
        }
    }

    fn off(&self, topic: Topic, id: HandlerId) {
        let mut handlers = self.handlers.write();
        if let Some(list) = handlers.get_mut(&topic) {
            list.retain(|(hid, _)| *hid != id);
            if list.is_empty() {
                handlers.remove(&topic);
            }
        }
    }
}

/// Unregisters its handlers when dropped.
pub struct HandlerGuard {
    transport: Weak<TransportShared>,
    registrations: Vec<(Topic, HandlerId)>,
}

impl Drop for HandlerGuard {
    fn drop(&mut self) {
        if let Some(shared) = self.transport.upgrade() {
            for (topic, id) in self.registrations.drain(..) {
                shared.off(topic, id);
            }
        }
    }
}

pub struct ChannelTransport {
    shared: Arc<TransportShared>,
    connector: Arc<dyn PushConnector>,
    config: TransportConfig,
    supervisor: Mutex<Option<AbortHandle>>,
}

impl ChannelTransport {
    /// Starts the supervisor task with `token`. Must be called inside a
    /// tokio runtime.
    pub fn start(
        connector: Arc<dyn PushConnector>,
        token: AccessToken,
        config: &TransportConfig,
    ) -> Self {
        let (status_tx, _) = watch::channel(TransportStatus::Connecting);
        let transport = Self {
            shared: Arc::new(TransportShared {
                handlers: RwLock::new(HashMap::new()),
                status_tx,
                next_handler: Mutex::new(0),
            }),
            connector,
            config: config.clone(),
            supervisor: Mutex::new(None),
        };
        transport.reinitialize(token);
        transport
    }

    /// Drops the current connection (if any) and reconnects from scratch with
    /// `token`, resetting the attempt counter. Registered handlers are kept.
    pub fn reinitialize(&self, token: AccessToken) {
        let mut supervisor = self.supervisor.lock();
        if let Some(task) = supervisor.take() {
            task.abort();
        }
        self.shared.set_status(TransportStatus::Connecting);
        let task = tokio::spawn(supervise(
            Arc::clone(&self.shared),
            Arc::clone(&self.connector),
            token,
            self.config.clone(),
        ));
        *supervisor = Some(task.abort_handle());
    }

    pub fn next_handler_id(&self) -> HandlerId {
        let mut next = self.shared.next_handler.lock();
        *next += 1;
        HandlerId(*next)
    }

    /// Registers `handler` for `topic` under `id`, replacing any handler
    /// already registered under the same `(topic, id)`.
    pub fn on(&self, topic: Topic, id: HandlerId, handler: PushHandler) {
        let mut handlers = self.shared.handlers.write();
        let list = handlers.entry(topic).or_default();
        match list.iter_mut().find(|(hid, _)| *hid == id) {
            Some(slot) => slot.1 = handler,
            None => list.push((id, handler)),
        }
    }

    pub fn off(&self, topic: Topic, id: HandlerId) {
        self.shared.off(topic, id);
    }

    /// Registers one handler for several topics and returns a guard that
    /// unregisters it.
    pub fn register(&self, topics: &[Topic], handler: PushHandler) -> HandlerGuard {
        let id = self.next_handler_id();
        for topic in topics {
            self.on(*topic, id, Arc::clone(&handler));
        }
        HandlerGuard {
            transport: Arc::downgrade(&self.shared),
            registrations: topics.iter().map(|t| (*t, id)).collect(),
        }
    }

    pub fn handler_count(&self, topic: Topic) -> usize {
        self.shared.handlers.read().get(&topic).map_or(0, Vec::len)
    }

    pub fn status(&self) -> TransportStatus {
        *self.shared.status_tx.borrow()
    }

    pub fn watch_status(&self) -> watch::Receiver<TransportStatus> {
        self.shared.status_tx.subscribe()
    }

    pub fn is_live(&self) -> bool {
        self.status() == TransportStatus::Live
    }

    /// Stops the supervisor and closes the connection. Handlers are cleared.
    pub fn shutdown(&self) {
        if let Some(task) = self.supervisor.lock().take() {
            task.abort();
        }
        self.shared.handlers.write().clear();
        self.shared.set_status(TransportStatus::Down);
        info!("push transport shut down");
    }
}

async fn supervise(
    shared: Arc<TransportShared>,
    connector: Arc<dyn PushConnector>,
    token: AccessToken,
    config: TransportConfig,
) {
    let backoff = BackoffPolicy::from_config(&config);
    let mut attempt = 0u32;
    loop {
        if attempt > 0 {
            let Some(delay) = backoff.delay(attempt) else {
                error!(
                    attempts = attempt - 1,
                    error = %TransportError::PermanentlyDown { attempts: attempt - 1 },
                    "giving up on push channel; falling back to polling"
                );
                shared.set_status(TransportStatus::Down);
                return;
            };
            shared.set_status(TransportStatus::Reconnecting { attempt });
            debug!(attempt, delay_ms = delay.as_millis() as u64, "waiting before reconnect");
            sleep(delay).await;
        }

        let connected = match timeout(config.connect_timeout(), connector.connect(&token)).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::ConnectTimeout),
        };
        match connected {
            Ok(connection) => {
                info!(attempt, "push channel live");
                attempt = 0;
                shared.set_status(TransportStatus::Live);
                let reason = run_connection(&shared, connection, &config).await;
                warn!(error = %reason, "push channel lost");
                attempt = 1;
            }
            Err(err) => {
                attempt += 1;
                warn!(attempt, error = %err, "push connect failed");
            }
        }
    }
}

/// Pumps one live connection until it fails. Returns why it ended.
async fn run_connection(
    shared: &TransportShared,
    connection: PushConnection,
    config: &TransportConfig,
) -> TransportError {
    let PushConnection {
        mut events,
        liveness,
    } = connection;
    let period = config.ping_interval();
    let mut ping_tick = interval_at(Instant::now() + period, period);
    ping_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(event) => shared.dispatch(&event),
                None => return TransportError::Closed,
            },
            _ = ping_tick.tick() => {
                match timeout(config.ping_timeout(), liveness.ping()).await {
                    Ok(Ok(())) => debug!("liveness ping ok"),
                    Ok(Err(err)) => return err,
                    Err(_) => return TransportError::PingTimeout,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_up_to_cap_then_gives_up() {
        let policy = BackoffPolicy {
            base: Duration::from_secs(1),
            max: Duration::from_secs(10),
            max_attempts: 5,
        };
        let delays: Vec<_> = (1..=6).map(|n| policy.delay(n)).collect();
        assert_eq!(
            delays,
            vec![
                Some(Duration::from_secs(1)),
                Some(Duration::from_secs(2)),
                Some(Duration::from_secs(4)),
                Some(Duration::from_secs(8)),
                Some(Duration::from_secs(10)),
                None,
            ]
        );
        assert_eq!(policy.delay(0), None);
    }

    #[test]
    fn backoff_survives_large_attempt_counts() {
        let policy = BackoffPolicy {
            base: Duration::from_millis(500),
            max: Duration::from_secs(30),
            max_attempts: 100,
        };
        assert_eq!(policy.delay(64), Some(Duration::from_secs(30)));
    }
}
