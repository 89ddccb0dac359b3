//! Per-client admission control
//!
//! Counts requests per (client, calendar day), blocks clients that cross the
//! abuse threshold, and sweeps counters that belong to neither today nor
//! yesterday. All state lives behind one lock so a sweep can never interleave
//! with a counter update.

use crate::config::AdmissionConfig;
use crate::error::{Result, ServiceError};
use chrono::{Duration as ChronoDuration, Local, NaiveDate};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Source of the current calendar day
pub trait Clock: Send + Sync {
    fn today(&self) -> NaiveDate;
}

/// Local wall-clock calendar day
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn today(&self) -> NaiveDate {
        Local::now().date_naive()
    }
}

/// Result of counting one request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionDecision {
    /// Request may proceed
    Ok,
    /// This request pushed the client over the abuse threshold
    BlockedNow,
    /// Client is over today's limit
    LimitExceeded,
}

#[derive(Debug, Default)]
struct AdmissionState {
    counters: HashMap<(String, NaiveDate), u64>,
    blocked: HashSet<String>,
}

/// Daily counters plus the abuse blocklist
pub struct AdmissionGate {
    daily_limit: u64,
    abuse_threshold: u64,
    clock: Arc<dyn Clock>,
    state: RwLock<AdmissionState>,
}

impl std::fmt::Debug for AdmissionGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdmissionGate")
            .field("daily_limit", &self.daily_limit)
            .field("abuse_threshold", &self.abuse_threshold)
            .finish_non_exhaustive()
    }
}

impl AdmissionGate {
    #[must_use]
    pub fn new(config: &AdmissionConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    #[must_use]
    pub fn with_clock(config: &AdmissionConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            daily_limit: config.daily_limit,
            abuse_threshold: config.abuse_threshold,
            clock,
            state: RwLock::new(AdmissionState::default()),
        }
    }

    #[must_use]
    pub fn daily_limit(&self) -> u64 {
        self.daily_limit
    }

    #[must_use]
    pub fn abuse_threshold(&self) -> u64 {
        self.abuse_threshold
    }

    #[must_use]
    pub fn is_blocked(&self, client: &str) -> bool {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .blocked
            .contains(client)
    }

    /// Count one request from `client` and classify it
    ///
    /// The abuse check runs before the daily-limit check, so a single call
    /// that crosses both reports `BlockedNow`.
    pub fn record_and_check(&self, client: &str) -> AdmissionDecision {
        let today = self.clock.today();
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);

        let count = state
            .counters
            .entry((client.to_string(), today))
            .or_insert(0);
        *count += 1;
        let count = *count;

        if count > self.abuse_threshold {
            if state.blocked.insert(client.to_string()) {
                warn!(
                    client = %client,
                    count,
                    threshold = self.abuse_threshold,
                    "Client exceeded abuse threshold and is now blocked"
                );
            }
            AdmissionDecision::BlockedNow
        } else if count > self.daily_limit {
            debug!(client = %client, count, limit = self.daily_limit, "Daily limit exceeded");
            AdmissionDecision::LimitExceeded
        } else {
            AdmissionDecision::Ok
        }
    }

    /// Admit or reject a request, translating the decision into an error
    ///
    /// Requests from already blocked clients are refused without touching the
    /// counters.
    pub fn admit(&self, client: &str) -> Result<()> {
        if self.is_blocked(client) {
            return Err(ServiceError::blocked(self.abuse_threshold));
        }

        match self.record_and_check(client) {
            AdmissionDecision::Ok => Ok(()),
            AdmissionDecision::BlockedNow => Err(ServiceError::blocked(self.abuse_threshold)),
            AdmissionDecision::LimitExceeded => {
                Err(ServiceError::daily_limit_exceeded(self.daily_limit))
            },
        }
    }

    /// Remove every counter whose day is neither today nor yesterday
    ///
    /// Returns the number of counters removed.
    pub fn sweep(&self) -> usize {
        let today = self.clock.today();
        let yesterday = today - ChronoDuration::days(1);
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);

        let before = state.counters.len();
        state
            .counters
            .retain(|(_, day), _| *day == today || *day == yesterday);
        let removed = before - state.counters.len();

        if removed > 0 {
            info!(removed, remaining = state.counters.len(), "Swept stale admission counters");
        }
        removed
    }

    /// Administrative unblock; returns whether the client was blocked
    pub fn unblock(&self, client: &str) -> bool {
        let removed = self
            .state
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .blocked
            .remove(client);
        if removed {
            info!(client = %client, "Client unblocked");
        }
        removed
    }

    /// Today's request count for `client`
    #[must_use]
    pub fn count(&self, client: &str) -> u64 {
        let today = self.clock.today();
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .counters
            .get(&(client.to_string(), today))
            .copied()
            .unwrap_or(0)
    }

    #[must_use]
    pub fn blocked_clients(&self) -> Vec<String> {
        let mut clients: Vec<String> = self
            .state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .blocked
            .iter()
            .cloned()
            .collect();
        clients.sort();
        clients
    }

    /// Number of (client, day) counters currently held
    #[must_use]
    pub fn tracked_counters(&self) -> usize {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .counters
            .len()
    }

    /// Run [`AdmissionGate::sweep`] every `interval` until `cancel` fires
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let gate = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately
            ticker.tick().await;
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        gate.sweep();
                    }
                }
            }
            debug!("Admission sweeper stopped");
        })
    }
}
