//! Interval polling, the source of truth when the push channel is down.
//!
//! One loop per resource, shared by every subscriber of that resource. A
//! loop fetches, delivers, then sleeps for the interval, so two ticks for one
//! resource never overlap: a slow fetch pushes the next tick back instead of
//! running concurrently with it. Polling runs whether or not the push
//! channel is live; the reconciler discards whatever it already has.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::AbortHandle;
use tokio::time::{sleep, timeout};
use tracing::{debug, warn};

use crate::config::PollConfig;
use crate::error::BackendResult;
use crate::types::{ComplaintId, ThreadId};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ResourceId {
    Complaint(ComplaintId),
    Thread(ThreadId),
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceId::Complaint(id) => write!(f, "complaint {id}"),
            ResourceId::Thread(thread) => write!(f, "thread {thread}"),
        }
    }
}

struct Slot {
    refs: usize,
    wake: Arc<Notify>,
    task: AbortHandle,
}

type Registry = Mutex<HashMap<ResourceId, Slot>>;

pub struct PollFallback {
    registry: Arc<Registry>,
    config: PollConfig,
}

impl PollFallback {
    pub fn new(config: PollConfig) -> Self {
        Self {
            registry: Arc::new(Mutex::new(HashMap::new())),
            config,
        }
    }

    pub fn config(&self) -> &PollConfig {
        &self.config
    }

    /// Starts polling `resource` every `interval`, or joins the loop already
    /// polling it. A joining caller's `fetch` and `deliver` are ignored.
    ///
    /// The first fetch runs immediately. Must be called inside a tokio
    /// runtime.
    pub fn start_polling<T, F, Fut, D>(
        &self,
        resource: ResourceId,
        interval: Duration,
        fetch: F,
        deliver: D,
    ) -> PollHandle
    where
        T: Send + 'static,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = BackendResult<T>> + Send + 'static,
        D: Fn(T) + Send + Sync + 'static,
    {
        let mut registry = self.registry.lock();
        if let Some(slot) = registry.get_mut(&resource) {
            slot.refs += 1;
            debug!(%resource, refs = slot.refs, "joining existing poll loop");
        } else {
            let wake = Arc::new(Notify::new());
            let fetch_timeout = self.config.fetch_timeout();
            let task = tokio::spawn(poll_loop(
                resource.clone(),
                interval,
                fetch_timeout,
                Arc::clone(&wake),
                fetch,
                deliver,
            ));
            debug!(%resource, interval_ms = interval.as_millis() as u64, "poll loop started");
            let slot = Slot {
                refs: 1,
                wake,
                task: task.abort_handle(),
            };
            registry.insert(resource.clone(), slot);
        }
        PollHandle {
            registry: Arc::downgrade(&self.registry),
            resource,
            released: false,
        }
    }

    /// Cuts the current wait short so `resource` is fetched now, or right
    /// after an in-progress fetch completes. Returns `false` if nothing is
    /// polling it.
    pub fn force_refetch(&self, resource: &ResourceId) -> bool {
        match self.registry.lock().get(resource) {
            Some(slot) => {
                slot.wake.notify_one();
                true
            }
            None => false,
        }
    }

    pub fn is_polling(&self, resource: &ResourceId) -> bool {
        self.registry.lock().contains_key(resource)
    }

    pub fn active(&self) -> usize {
        self.registry.lock().len()
    }

    pub fn cancel_all(&self) {
        for (resource, slot) in self.registry.lock().drain() {
            slot.task.abort();
            debug!(%resource, "poll loop cancelled");
        }
    }
}

async fn poll_loop<T, F, Fut, D>(
    resource: ResourceId,
    interval: Duration,
    fetch_timeout: Duration,
    wake: Arc<Notify>,
    fetch: F,
    deliver: D,
) where
    F: Fn() -> Fut,
    Fut: Future<Output = BackendResult<T>>,
    D: Fn(T),
{
    loop {
        match timeout(fetch_timeout, fetch()).await {
            Ok(Ok(value)) => deliver(value),
            Ok(Err(err)) => warn!(%resource, error = %err, "poll fetch failed"),
            Err(_) => warn!(
                %resource,
                timeout_ms = fetch_timeout.as_millis() as u64,
                "poll fetch timed out"
            ),
        }
        tokio::select! {
            _ = sleep(interval) => {}
            _ = wake.notified() => debug!(%resource, "forced refetch"),
        }
    }
}

/// One subscriber's share of a poll loop. The loop stops when the last
/// handle is cancelled or dropped.
pub struct PollHandle {
    registry: Weak<Registry>,
    resource: ResourceId,
    released: bool,
}

impl PollHandle {
    pub fn resource(&self) -> &ResourceId {
        &self.resource
    }

    pub fn cancel(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if std::mem::replace(&mut self.released, true) {
            return;
        }
        let Some(registry) = self.registry.upgrade() else { return };
        let mut registry = registry.lock();
        let Some(slot) = registry.get_mut(&self.resource) else { return };
        slot.refs -= 1;
        if slot.refs == 0 {
            slot.task.abort();
            registry.remove(&self.resource);
            debug!(resource = %self.resource, "poll loop stopped");
        }
    }
}

impl Drop for PollHandle {
    fn drop(&mut self) {
        self.release();
    }
}
