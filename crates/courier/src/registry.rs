//! Correlation registry: pending responses keyed by request id.
//!
//! A caller that sends a request over a transport registers the request id
//! here and awaits the returned [`PendingResponse`]. When the reply comes back
//! through whatever inbound channel the deployment uses, that channel calls
//! [`CorrelationRegistry::complete`] and the waiter wakes up.
//!
//! Each slot is fulfilled exactly once: by a response, by a failure, by
//! cancellation, or by its own expiry timer. A fulfilled slot is removed
//! immediately, so a second `complete` for the same id is a logged no-op.
//!
//! ```ignore
//! let registry = CorrelationRegistry::new(RegistryConfig::default());
//! let pending = registry.register(&envelope.id, Duration::from_secs(5))?;
//! transport.send(envelope).await?;
//! let response = pending.wait().await?;
//! ```

use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::oneshot;
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::envelope::ResponseEnvelope;
use crate::error::{CourierError, Result};

/// Registry sizing and timing.
///
/// # Defaults
///
/// - `default_timeout`: 60 seconds
/// - `max_size`: 10 000 pending slots
/// - `sweep_interval`: 30 seconds
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    pub default_timeout: Duration,
    pub max_size: usize,
    pub sweep_interval: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_secs(60),
            max_size: 10_000,
            sweep_interval: Duration::from_secs(30),
        }
    }
}

impl RegistryConfig {
    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    pub fn with_max_size(mut self, max_size: usize) -> Self {
        self.max_size = max_size.max(1);
        self
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }
}

type Outcome = Result<ResponseEnvelope>;

/// Stand-in deadline for timeouts too large to add to `Instant::now()`.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

fn deadline_after(timeout: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(timeout).unwrap_or_else(|| now + FAR_FUTURE)
}

struct PendingSlot {
    sender: oneshot::Sender<Outcome>,
    timeout: Duration,
    expires_at: Instant,
    /// Distinguishes this slot from a later one registered under the same id.
    token: u64,
    timer: Option<AbortHandle>,
}

impl PendingSlot {
    fn fulfil(self, outcome: Outcome) {
        if let Some(timer) = &self.timer {
            timer.abort();
        }
        // The waiter may have given up already; nothing to do then.
        let _ = self.sender.send(outcome);
    }
}

struct RegistryInner {
    config: RegistryConfig,
    slots: DashMap<String, PendingSlot>,
    /// Slots counted against `max_size`, claimed before insertion.
    reserved: AtomicUsize,
    next_token: AtomicU64,
}

impl RegistryInner {
    fn try_reserve(&self) -> bool {
        let capacity = self.config.max_size;
        self.reserved
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < capacity).then_some(n + 1)
            })
            .is_ok()
    }

    fn release(&self) {
        self.reserved.fetch_sub(1, Ordering::AcqRel);
    }

    fn take(&self, id: &str) -> Option<PendingSlot> {
        let (_, slot) = self.slots.remove(id)?;
        self.release();
        Some(slot)
    }

    /// Timer callback: only expires the slot the timer was armed for.
    fn expire(&self, id: &str, token: u64) {
        let Some((id, slot)) = self.slots.remove_if(id, |_, slot| slot.token == token) else {
            return;
        };
        self.release();
        debug!(%id, "pending request timed out");
        let timeout = slot.timeout;
        slot.fulfil(Err(CourierError::Timeout { id, timeout }));
    }

    /// Remove expired slots and slots whose waiter has gone away.
    fn sweep(&self) -> usize {
        let now = Instant::now();
        let stale: Vec<String> = self
            .slots
            .iter()
            .filter(|slot| slot.expires_at <= now || slot.sender.is_closed())
            .map(|slot| slot.key().clone())
            .collect();

        let mut removed = 0;
        for id in stale {
            let Some((id, slot)) = self
                .slots
                .remove_if(&id, |_, slot| slot.expires_at <= now || slot.sender.is_closed())
            else {
                continue;
            };
            self.release();
            removed += 1;
            if slot.sender.is_closed() {
                slot.fulfil(Err(CourierError::Cancelled { id }));
            } else {
                let timeout = slot.timeout;
                slot.fulfil(Err(CourierError::Timeout { id, timeout }));
            }
        }
        removed
    }
}

/// Handle to one pending request, returned by [`CorrelationRegistry::register`].
#[derive(Debug)]
#[must_use = "a pending response does nothing unless awaited"]
pub struct PendingResponse {
    id: String,
    receiver: oneshot::Receiver<Outcome>,
}

impl PendingResponse {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Wait for the response, a timeout, or cancellation.
    pub async fn wait(self) -> Result<ResponseEnvelope> {
        match self.receiver.await {
            Ok(outcome) => outcome,
            // Slot dropped without being fulfilled (registry cleared or dropped).
            Err(_) => Err(CourierError::Cancelled { id: self.id }),
        }
    }
}

/// Concurrent map of pending request slots.
///
/// Cloning is cheap; clones share the same slots.
#[derive(Clone)]
pub struct CorrelationRegistry {
    inner: Arc<RegistryInner>,
    sweeper: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl CorrelationRegistry {
    pub fn new(config: RegistryConfig) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                config,
                slots: DashMap::new(),
                reserved: AtomicUsize::new(0),
                next_token: AtomicU64::new(1),
            }),
            sweeper: Arc::new(Mutex::new(None)),
        }
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.inner.config
    }

    /// Register with the configured default timeout.
    pub fn register_default(&self, id: impl Into<String>) -> Result<PendingResponse> {
        self.register(id, self.inner.config.default_timeout)
    }

    /// Create a pending slot for `id` that expires after `timeout`.
    ///
    /// Fails with [`CourierError::CapacityExceeded`] when the registry is full
    /// and a sweep frees nothing, and with [`CourierError::AlreadyRegistered`]
    /// while a slot for `id` is still live. Must be called from within a tokio
    /// runtime because the expiry timer is a spawned task.
    pub fn register(&self, id: impl Into<String>, timeout: Duration) -> Result<PendingResponse> {
        let id = id.into();
        let capacity = self.inner.config.max_size;

        if !self.inner.try_reserve() {
            let reclaimed = self.inner.sweep();
            debug!(reclaimed, "registry at capacity, swept stale slots");
            if !self.inner.try_reserve() {
                warn!(%id, capacity, "correlation registry is full");
                return Err(CourierError::CapacityExceeded { capacity });
            }
        }

        let token = self.inner.next_token.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = oneshot::channel();

        match self.inner.slots.entry(id.clone()) {
            Entry::Occupied(_) => {
                self.inner.release();
                return Err(CourierError::AlreadyRegistered { id });
            }
            Entry::Vacant(vacant) => {
                let expires_at = deadline_after(timeout);
                let mut slot = vacant.insert(PendingSlot {
                    sender,
                    timeout,
                    expires_at,
                    token,
                    timer: None,
                });
                slot.timer = Some(self.arm_timer(id.clone(), token, expires_at));
            }
        }

        Ok(PendingResponse { id, receiver })
    }

    fn arm_timer(&self, id: String, token: u64, expires_at: Instant) -> AbortHandle {
        let weak: Weak<RegistryInner> = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            tokio::time::sleep_until(expires_at).await;
            if let Some(inner) = weak.upgrade() {
                inner.expire(&id, token);
            }
        })
        .abort_handle()
    }

    /// Deliver `response` to the waiter registered under `response.id`.
    ///
    /// Unknown, expired and already-completed ids are logged and ignored.
    pub fn complete(&self, response: ResponseEnvelope) {
        match self.inner.take(&response.id) {
            Some(slot) => slot.fulfil(Ok(response)),
            None => warn!(id = %response.id, "no pending request for response"),
        }
    }

    /// Fail the waiter registered under `id`.
    pub fn complete_exceptionally(&self, id: &str, error: CourierError) {
        match self.inner.take(id) {
            Some(slot) => slot.fulfil(Err(error)),
            None => warn!(%id, error = %error, "no pending request for failure"),
        }
    }

    /// Cancel the waiter registered under `id`. Returns whether a slot existed.
    pub fn cancel(&self, id: &str) -> bool {
        match self.inner.take(id) {
            Some(slot) => {
                slot.fulfil(Err(CourierError::Cancelled { id: id.to_string() }));
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, id: &str) -> bool {
        self.inner.slots.contains_key(id)
    }

    /// Run one sweep now. Returns the number of slots removed.
    pub fn sweep(&self) -> usize {
        self.inner.sweep()
    }

    pub fn len(&self) -> usize {
        self.inner.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.slots.is_empty()
    }

    /// Below 90% of capacity.
    pub fn is_healthy(&self) -> bool {
        (self.len() as f64) < self.inner.config.max_size as f64 * 0.9
    }

    /// Cancel every pending request.
    pub fn clear(&self) {
        let ids: Vec<String> = self.inner.slots.iter().map(|s| s.key().clone()).collect();
        for id in ids {
            self.cancel(&id);
        }
    }

    /// Spawn the periodic sweep. Calling it again replaces the running sweep.
    pub fn start_sweeper(&self) {
        let period = self.inner.config.sweep_interval;
        let weak = Arc::downgrade(&self.inner);

        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            loop {
                interval.tick().await;
                let Some(inner) = weak.upgrade() else { break };
                let removed = inner.sweep();
                if removed > 0 {
                    debug!(removed, "swept stale pending requests");
                }
            }
        });

        let mut slot = self.sweeper.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(previous) = slot.replace(handle) {
            previous.abort();
        }
    }

    /// Stop the sweep and cancel everything still pending.
    pub fn shutdown(&self) {
        if let Some(handle) = self.sweeper.lock().unwrap_or_else(|p| p.into_inner()).take() {
            handle.abort();
        }
        let pending = self.len();
        self.clear();
        info!(pending, "correlation registry shut down");
    }
}

impl Default for CorrelationRegistry {
    fn default() -> Self {
        Self::new(RegistryConfig::default())
    }
}

impl fmt::Debug for CorrelationRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CorrelationRegistry")
            .field("pending", &self.len())
            .field("max_size", &self.inner.config.max_size)
            .finish()
    }
}
