//! Session lease clock.
//!
//! Owns the active access token, its expiry deadline, and the single timer
//! that forces a logout when the deadline passes. Refresh is single-flight:
//! concurrent callers share one request to the refresh endpoint and all see
//! its result.
//!
//! A successful refresh installs the new lease, replaces the expiry timer and
//! clears the "expiring soon" flag in one critical section, so observers
//! never see the new lease with the old timer. A failed refresh leaves the
//! old timer running.

use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use tokio::sync::{broadcast, watch};
use tokio::task::AbortHandle;
use tokio::time::{interval, sleep_until, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::backend::TokenRefresher;
use crate::config::SessionConfig;
use crate::error::{BackendError, BackendResult, SessionError, SessionResult};
use crate::token::{AccessToken, TokenGrant};
use crate::types::now_secs;

/// Lifecycle notifications emitted by the clock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// Remaining time dropped to the warning threshold.
    ExpiringSoon { remaining: Duration },
    Refreshed { expires_at: i64 },
    /// The lease expired without a successful refresh. Emitted once.
    ForcedLogout,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SessionState {
    pub remaining_ms: u64,
    pub is_expiring_soon: bool,
}

type RefreshFuture = Shared<BoxFuture<'static, SessionResult<TokenGrant>>>;

struct Lease {
    token: AccessToken,
    expires_at: i64,
    deadline: Instant,
}

impl Lease {
    fn new(grant: TokenGrant) -> Self {
        let secs = (grant.expires_at - now_secs()).max(0) as u64;
        Self {
            token: grant.token,
            expires_at: grant.expires_at,
            deadline: Instant::now() + Duration::from_secs(secs),
        }
    }

    fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }
}

struct Inner {
    lease: Option<Lease>,
    /// Bumped every time the expiry timer is replaced; a timer that fires
    /// with a stale generation does nothing.
    generation: u64,
    expiry_timer: Option<AbortHandle>,
    ticker: Option<AbortHandle>,
    in_flight: Option<RefreshFuture>,
    expiring_soon: bool,
    /// Set by forced logout or shutdown.
    ended: bool,
}

impl Inner {
    fn state(&self) -> SessionState {
        SessionState {
            remaining_ms: self
                .lease
                .as_ref()
                .map(|l| l.remaining().as_millis() as u64)
                .unwrap_or(0),
            is_expiring_soon: self.expiring_soon,
        }
    }
}

struct ClockShared {
    inner: Mutex<Inner>,
    refresher: Arc<dyn TokenRefresher>,
    warn_threshold: Duration,
    state_tx: watch::Sender<SessionState>,
    events: broadcast::Sender<SessionEvent>,
}

impl ClockShared {
    /// Replaces the expiry timer with one for the current lease.
    fn arm_expiry(self: &Arc<Self>, inner: &mut Inner) {
        if let Some(timer) = inner.expiry_timer.take() {
            timer.abort();
        }
        let Some(deadline) = inner.lease.as_ref().map(|l| l.deadline) else {
            return;
        };
        inner.generation += 1;
        let generation = inner.generation;
        let weak = Arc::downgrade(self);
        let task = tokio::spawn(async move {
            sleep_until(deadline).await;
            if let Some(shared) = weak.upgrade() {
                shared.expire(generation);
            }
        });
        inner.expiry_timer = Some(task.abort_handle());
    }

    fn expire(&self, generation: u64) {
        let mut inner = self.inner.lock();
        if inner.ended || inner.generation != generation {
            return;
        }
        inner.ended = true;
        inner.lease = None;
        inner.expiry_timer = None;
        if let Some(ticker) = inner.ticker.take() {
            ticker.abort();
        }
        drop(inner);

        warn!("session lease expired; forcing logout");
        self.state_tx.send_replace(SessionState::default());
        let _ = self.events.send(SessionEvent::ForcedLogout);
    }

    fn finish_refresh(
        self: &Arc<Self>,
        result: BackendResult<TokenGrant>,
    ) -> SessionResult<TokenGrant> {
        let mut inner = self.inner.lock();
        inner.in_flight = None;
        if inner.ended {
            return Err(SessionError::Expired);
        }
        match result {
            Ok(grant) => {
                inner.lease = Some(Lease::new(grant.clone()));
                self.arm_expiry(&mut inner);
                inner.expiring_soon = false;
                let state = inner.state();
                drop(inner);

                info!(expires_at = grant.expires_at, "session refreshed");
                self.state_tx.send_replace(state);
                let _ = self.events.send(SessionEvent::Refreshed {
                    expires_at: grant.expires_at,
                });
                Ok(grant)
            }
            Err(err) => {
                warn!(error = %err, "token refresh failed; current expiry stands");
                Err(SessionError::RefreshFailed(err))
            }
        }
    }

    /// Returns `false` once the clock has ended.
    fn on_tick(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.ended {
            return false;
        }
        let remaining = inner.lease.as_ref().map(Lease::remaining).unwrap_or_default();
        let crossed = remaining <= self.warn_threshold && !inner.expiring_soon;
        if crossed {
            inner.expiring_soon = true;
        }
        let state = inner.state();
        drop(inner);

        self.state_tx.send_replace(state);
        if crossed {
            info!(remaining_secs = remaining.as_secs(), "session expiring soon");
            let _ = self.events.send(SessionEvent::ExpiringSoon { remaining });
        }
        true
    }
}

fn spawn_ticker(weak: Weak<ClockShared>, period: Duration) -> AbortHandle {
    tokio::spawn(async move {
        let mut tick = interval(period);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tick.tick().await;
            let Some(shared) = weak.upgrade() else { break };
            if !shared.on_tick() {
                break;
            }
        }
        debug!("session ticker stopped");
    })
    .abort_handle()
}

/// The session lease and its timers. Clones share the same lease.
#[derive(Clone)]
pub struct SessionClock {
    shared: Arc<ClockShared>,
}

impl SessionClock {
    /// Installs `grant` as the active lease and starts the expiry timer and
    /// the remaining-time ticker. Must be called inside a tokio runtime.
    pub fn start(
        grant: TokenGrant,
        refresher: Arc<dyn TokenRefresher>,
        config: &SessionConfig,
    ) -> Self {
        let (state_tx, _) = watch::channel(SessionState::default());
        let (events, _) = broadcast::channel(16);
        let shared = Arc::new(ClockShared {
            inner: Mutex::new(Inner {
                lease: Some(Lease::new(grant)),
                generation: 0,
                expiry_timer: None,
                ticker: None,
                in_flight: None,
                expiring_soon: false,
                ended: false,
            }),
            refresher,
            warn_threshold: config.warn_threshold(),
            state_tx,
            events,
        });
        {
            let mut inner = shared.inner.lock();
            shared.arm_expiry(&mut inner);
            inner.ticker = Some(spawn_ticker(Arc::downgrade(&shared), config.tick()));
            shared.state_tx.send_replace(inner.state());
        }
        Self { shared }
    }

    /// Refreshes the lease, joining an in-flight refresh if there is one.
    ///
    /// The refresh runs in its own task, so it completes and installs its
    /// result even if every caller stops waiting.
    ///
    /// # Errors
    ///
    /// `RefreshFailed` if the endpoint failed (retryable; the current expiry
    /// is unchanged), `Expired` if the session already ended.
    pub async fn refresh(&self) -> SessionResult<TokenGrant> {
        let fut = {
            let mut inner = self.shared.inner.lock();
            if inner.ended {
                return Err(SessionError::Expired);
            }
            match &inner.in_flight {
                Some(fut) => {
                    debug!("joining in-flight token refresh");
                    fut.clone()
                }
                None => {
                    let shared = Arc::clone(&self.shared);
                    let task = tokio::spawn(async move {
                        let result = shared.refresher.refresh().await;
                        shared.finish_refresh(result)
                    });
                    let fut = async move {
                        task.await.unwrap_or_else(|e| {
                            Err(SessionError::RefreshFailed(BackendError::Unavailable(
                                e.to_string(),
                            )))
                        })
                    }
                    .boxed()
                    .shared();
                    inner.in_flight = Some(fut.clone());
                    fut
                }
            }
        };
        fut.await
    }

    pub fn is_refreshing(&self) -> bool {
        self.shared.inner.lock().in_flight.is_some()
    }

    /// The current access token, `None` once the session has ended.
    pub fn token(&self) -> Option<AccessToken> {
        self.shared.inner.lock().lease.as_ref().map(|l| l.token.clone())
    }

    pub fn expires_at(&self) -> Option<i64> {
        self.shared.inner.lock().lease.as_ref().map(|l| l.expires_at)
    }

    pub fn remaining(&self) -> Duration {
        self.shared.inner.lock().lease.as_ref().map(Lease::remaining).unwrap_or_default()
    }

    pub fn is_expiring_soon(&self) -> bool {
        self.shared.inner.lock().expiring_soon
    }

    pub fn state(&self) -> SessionState {
        self.shared.inner.lock().state()
    }

    /// Receives the state published on every tick and refresh.
    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.shared.state_tx.subscribe()
    }

    pub fn events(&self) -> broadcast::Receiver<SessionEvent> {
        self.shared.events.subscribe()
    }

    pub fn has_ended(&self) -> bool {
        self.shared.inner.lock().ended
    }

    /// Stops every timer without emitting a logout. Later refreshes fail
    /// with `Expired`.
    pub fn shutdown(&self) {
        let mut inner = self.shared.inner.lock();
        inner.ended = true;
        inner.lease = None;
        inner.in_flight = None;
        for timer in [inner.expiry_timer.take(), inner.ticker.take()].into_iter().flatten() {
            timer.abort();
        }
    }
}

impl std::fmt::Debug for SessionClock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.shared.inner.lock();
        f.debug_struct("SessionClock")
            .field("state", &inner.state())
            .field("ended", &inner.ended)
            .field("refreshing", &inner.in_flight.is_some())
            .finish()
    }
}
