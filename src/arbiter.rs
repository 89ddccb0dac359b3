//! Exclusive arbitration of the shared accelerator
//!
//! One token guards one accelerator context. Holding a [`ResourceLease`] means
//! the lease's model has been moved onto the accelerator and nobody else may
//! use it. Waiters are served in arrival order (tokio's semaphore is fair).
//!
//! Deactivation is tied to the lease's lifetime: [`ResourceLease::release`]
//! deactivates explicitly, and dropping an unreleased lease (error paths, task
//! cancellation, panics) deactivates on the blocking pool. In both cases the
//! token is only handed to the next waiter once `to_host` has returned.
//!
//! Blocking calls on the accelerator cannot be interrupted, so the lease
//! always lives inside the task that awaits them. A timed-out activation or an
//! abandoned [`ExclusiveResourceArbiter::run_exclusive`] caller leaves the
//! lease with its blocking call, and the token moves on only after that call
//! and the deactivation following it have returned.
//!
//! A lease force-released by the ceiling watchdog no longer owns the
//! accelerator. Releasing it afterwards skips `to_host`, since the model may
//! already belong to the next holder.

use crate::config::ArbiterConfig;
use crate::error::{Result, ServiceError};
use crate::segmentation::Segmenter;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

struct ActiveLease {
    id: u64,
    model: String,
}

struct ArbiterShared {
    token: Arc<Semaphore>,
    active: Mutex<Option<ActiveLease>>,
    next_lease_id: AtomicU64,
    granted: AtomicU64,
    faults: AtomicU64,
}

#[derive(Debug)]
struct LeaseProgress {
    last_touch: Mutex<Instant>,
    faulted: AtomicBool,
}

impl LeaseProgress {
    fn new() -> Self {
        Self {
            last_touch: Mutex::new(Instant::now()),
            faulted: AtomicBool::new(false),
        }
    }

    fn last_touch(&self) -> Instant {
        *self.last_touch.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Single-token guard for the accelerator context
#[derive(Clone)]
pub struct ExclusiveResourceArbiter {
    shared: Arc<ArbiterShared>,
    activation_timeout: Option<Duration>,
    lease_ceiling: Option<Duration>,
}

impl std::fmt::Debug for ExclusiveResourceArbiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExclusiveResourceArbiter")
            .field("held", &self.is_held())
            .field("activation_timeout", &self.activation_timeout)
            .field("lease_ceiling", &self.lease_ceiling)
            .finish_non_exhaustive()
    }
}

impl ExclusiveResourceArbiter {
    #[must_use]
    pub fn new(config: &ArbiterConfig) -> Self {
        Self {
            shared: Arc::new(ArbiterShared {
                token: Arc::new(Semaphore::new(1)),
                active: Mutex::new(None),
                next_lease_id: AtomicU64::new(1),
                granted: AtomicU64::new(0),
                faults: AtomicU64::new(0),
            }),
            activation_timeout: config.activation_timeout,
            lease_ceiling: config.lease_ceiling,
        }
    }

    /// Wait for the token, then activate `model` on the accelerator
    ///
    /// # Errors
    /// - `Cancelled` if `cancel` fires while waiting
    /// - `ResourceFault` if activation fails (the token is returned)
    /// - `Timeout` if activation exceeds the configured bound
    pub async fn acquire(
        &self,
        model: Arc<dyn Segmenter>,
        cancel: &CancellationToken,
    ) -> Result<ResourceLease> {
        let wait_start = Instant::now();
        let permit = tokio::select! {
            biased;
            () = cancel.cancelled() => {
                return Err(ServiceError::cancelled(format!(
                    "abandoned while waiting for the accelerator ({})",
                    model.name()
                )));
            }
            permit = Arc::clone(&self.shared.token).acquire_owned() => {
                permit.map_err(|_| ServiceError::resource_fault("accelerator arbiter closed"))?
            }
        };

        let id = self.shared.next_lease_id.fetch_add(1, Ordering::Relaxed);
        let model_name = model.name().to_string();
        let lease = ResourceLease {
            id,
            model,
            permit: Some(permit),
            shared: Arc::clone(&self.shared),
            progress: Arc::new(LeaseProgress::new()),
            watchdog: None,
            acquired_at: Instant::now(),
            released: false,
        };

        // The activation task owns the lease: if this future is dropped or
        // times out, the lease is dropped (and deactivated) only once the
        // blocking activation has returned
        let activation = tokio::spawn(activate(lease));
        let joined = match self.activation_timeout {
            Some(limit) => match tokio::time::timeout(limit, activation).await {
                Ok(joined) => joined,
                Err(_) => {
                    warn!(
                        lease_id = id,
                        model = %model_name,
                        "Activation still running after {limit:?}; token stays held until it is undone"
                    );
                    return Err(ServiceError::timeout(format!(
                        "activating {model_name} took longer than {limit:?}"
                    )));
                },
            },
            None => activation.await,
        };
        let mut lease = joined
            .map_err(|e| ServiceError::resource_fault(format!("activation task failed: {e}")))??;

        {
            let mut active = self
                .shared
                .active
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            *active = Some(ActiveLease {
                id,
                model: lease.model.name().to_string(),
            });
        }
        *lease
            .progress
            .last_touch
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Instant::now();

        if let Some(ceiling) = self.lease_ceiling {
            lease.watchdog = Some(spawn_watchdog(
                Arc::clone(&self.shared),
                id,
                Arc::clone(&lease.progress),
                ceiling,
            ));
        }

        self.shared.granted.fetch_add(1, Ordering::Relaxed);
        debug!(
            lease_id = id,
            model = %lease.model.name(),
            waited_ms = wait_start.elapsed().as_millis() as u64,
            "Accelerator lease granted"
        );
        Ok(lease)
    }

    /// Run blocking work with `model` under an exclusive lease
    ///
    /// The lease is acquired (when the model needs the accelerator), the
    /// closure runs on the blocking pool, and the lease is released whatever
    /// the closure returned. Work errors take precedence over release errors.
    /// Dropping the returned future does not free the token before the
    /// closure has finished.
    pub async fn run_exclusive<F, R>(
        &self,
        model: Arc<dyn Segmenter>,
        cancel: &CancellationToken,
        work: F,
    ) -> Result<R>
    where
        F: FnOnce(&dyn Segmenter) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        if !model.needs_resource() {
            if cancel.is_cancelled() {
                return Err(ServiceError::cancelled("request abandoned before inference"));
            }
            return tokio::task::spawn_blocking(move || work(model.as_ref()))
                .await
                .map_err(|e| ServiceError::internal(format!("inference task failed: {e}")))?;
        }

        let lease = self.acquire(model, cancel).await?;
        // Detached from this future: the lease is released only after the
        // blocking work returned, even when the caller is dropped mid-inference
        let exclusive = tokio::spawn(async move {
            let worker_model = Arc::clone(lease.model());
            let outcome = tokio::task::spawn_blocking(move || work(worker_model.as_ref()))
                .await
                .map_err(|e| ServiceError::internal(format!("inference task failed: {e}")))
                .and_then(|r| r);
            let released = lease.release().await;
            (outcome, released)
        });
        let (outcome, released) = exclusive
            .await
            .map_err(|e| ServiceError::internal(format!("exclusive task failed: {e}")))?;

        let value = outcome?;
        released?;
        Ok(value)
    }

    /// Whether some lease currently holds the token
    #[must_use]
    pub fn is_held(&self) -> bool {
        self.shared.token.available_permits() == 0
    }

    /// Model name of the current lease holder, if any
    #[must_use]
    pub fn active_model(&self) -> Option<String> {
        self.shared
            .active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|a| a.model.clone())
    }

    /// Leases force-released by the watchdog
    #[must_use]
    pub fn faults(&self) -> u64 {
        self.shared.faults.load(Ordering::Relaxed)
    }

    /// Leases successfully granted since construction
    #[must_use]
    pub fn leases_granted(&self) -> u64 {
        self.shared.granted.load(Ordering::Relaxed)
    }
}

fn spawn_watchdog(
    shared: Arc<ArbiterShared>,
    lease_id: u64,
    progress: Arc<LeaseProgress>,
    ceiling: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::time::sleep_until(progress.last_touch() + ceiling).await;

            let mut active = shared.active.lock().unwrap_or_else(PoisonError::into_inner);
            let Some(current) = active.as_ref().filter(|a| a.id == lease_id) else {
                return;
            };
            let idle = progress.last_touch().elapsed();
            if idle < ceiling {
                continue;
            }

            error!(
                lease_id,
                model = %current.model,
                idle_ms = idle.as_millis() as u64,
                "Accelerator lease made no progress within its ceiling; force-releasing"
            );
            progress.faulted.store(true, Ordering::SeqCst);
            *active = None;
            shared.faults.fetch_add(1, Ordering::Relaxed);
            // The stale holder forgets its own permit when it finally lets go
            shared.token.add_permits(1);
            return;
        }
    })
}

/// Move the lease's model onto the accelerator, giving the token back on failure
async fn activate(lease: ResourceLease) -> Result<ResourceLease> {
    let model = Arc::clone(&lease.model);
    let activated = tokio::task::spawn_blocking(move || model.to_resource())
        .await
        .map_err(|e| ServiceError::resource_fault(format!("activation task failed: {e}")))
        .and_then(|r| {
            r.map_err(|e| {
                ServiceError::resource_fault(format!(
                    "failed to move {} onto the accelerator: {e}",
                    lease.model.name()
                ))
            })
        });

    match activated {
        Ok(()) => Ok(lease),
        Err(e) => {
            let id = lease.id;
            error!(lease_id = id, model = %lease.model.name(), error = %e, "Accelerator activation failed");
            // A partial activation must not outlive the token
            if let Err(cleanup) = lease.release().await {
                warn!(lease_id = id, error = %cleanup, "Deactivation after failed activation also failed");
            }
            Err(e)
        },
    }
}

/// Exclusive occupancy of the accelerator by one model
///
/// Not `Clone`; dropping it deactivates the model and frees the token.
pub struct ResourceLease {
    id: u64,
    model: Arc<dyn Segmenter>,
    permit: Option<OwnedSemaphorePermit>,
    shared: Arc<ArbiterShared>,
    progress: Arc<LeaseProgress>,
    watchdog: Option<JoinHandle<()>>,
    acquired_at: Instant,
    released: bool,
}

impl std::fmt::Debug for ResourceLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceLease")
            .field("id", &self.id)
            .field("model", &self.model.name())
            .field("held_for", &self.held_for())
            .finish_non_exhaustive()
    }
}

impl ResourceLease {
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[must_use]
    pub fn model(&self) -> &Arc<dyn Segmenter> {
        &self.model
    }

    #[must_use]
    pub fn held_for(&self) -> Duration {
        self.acquired_at.elapsed()
    }

    /// Record forward progress, resetting the ceiling watchdog
    pub fn touch(&self) {
        *self
            .progress
            .last_touch
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Instant::now();
    }

    /// Fail if the watchdog has force-released this lease
    pub fn checkpoint(&self) -> Result<()> {
        if self.progress.faulted.load(Ordering::SeqCst) {
            return Err(ServiceError::resource_fault(format!(
                "lease {} on {} was force-released after stalling",
                self.id,
                self.model.name()
            )));
        }
        Ok(())
    }

    /// Deactivate the model and hand the token to the next waiter
    ///
    /// The token is returned even when deactivation fails; that failure is
    /// reported as a `ResourceFault`.
    pub async fn release(mut self) -> Result<()> {
        let held_ms = self.held_for().as_millis() as u64;
        let id = self.id;
        let Some(permit) = self.take_token() else {
            warn!(lease_id = id, held_ms, "Released a force-released lease; model left to the current holder");
            return Ok(());
        };
        let model = Arc::clone(&self.model);

        let outcome = tokio::task::spawn_blocking(move || {
            let result = model.to_host();
            drop(permit);
            result
        })
        .await
        .map_err(|e| ServiceError::resource_fault(format!("deactivation task failed: {e}")))?;

        debug!(lease_id = id, held_ms, "Accelerator lease released");
        outcome.map_err(|e| {
            ServiceError::resource_fault(format!("failed to move model off the accelerator: {e}"))
        })
    }

    /// Detach from the arbiter; returns the permit unless it was force-released
    fn take_token(&mut self) -> Option<OwnedSemaphorePermit> {
        self.released = true;
        if let Some(watchdog) = self.watchdog.take() {
            watchdog.abort();
        }

        let mut active = self
            .shared
            .active
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if active.as_ref().is_some_and(|a| a.id == self.id) {
            *active = None;
        }

        let permit = self.permit.take();
        if self.progress.faulted.load(Ordering::SeqCst) {
            // Replaced by the watchdog's add_permits
            if let Some(permit) = permit {
                permit.forget();
            }
            None
        } else {
            permit
        }
    }
}

impl Drop for ResourceLease {
    fn drop(&mut self) {
        if self.released {
            return;
        }

        let id = self.id;
        let Some(permit) = self.take_token() else {
            debug!(lease_id = id, "Dropped a force-released lease");
            return;
        };
        let model = Arc::clone(&self.model);
        let deactivate = move || {
            if let Err(e) = model.to_host() {
                warn!(lease_id = id, error = %e, "Deactivation of dropped lease failed");
            }
            drop(permit);
        };

        warn!(lease_id = id, "Accelerator lease dropped without release; deactivating");
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(deactivate);
            },
            Err(_) => deactivate(),
        }
    }
}
