//! Job status table for out-of-band progress polling
//!
//! Every video job has exactly one writer: the [`JobWriter`] handed out by
//! [`JobStatusTable::create`]. Pollers only ever read. The writer enforces the
//! job state machine, so a finished job can never be overwritten and progress
//! never goes backwards.
//!
//! Every accepted transition is also broadcast to [`JobStatusTable::subscribe`]
//! receivers, in the order it was applied. Slow receivers lag and lose the
//! oldest events; the table itself always holds the latest state.

use crate::error::{Result, ServiceError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::broadcast;
use tracing::{debug, warn};
use uuid::Uuid;

/// Opaque unique job identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for JobId {
    type Err = ServiceError;

    fn from_str(s: &str) -> Result<Self> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|_| ServiceError::JobNotFound(s.to_string()))
    }
}

/// Lifecycle of one video job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Extracting,
    Processing {
        /// Percentage of frames transformed, 0-100
        progress: u8,
    },
    Encoding,
    Completed {
        /// Location of the output artifact
        output: PathBuf,
    },
    Failed {
        reason: String,
    },
}

impl JobState {
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed { .. } | Self::Failed { .. })
    }

    /// Short stage label for display
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Extracting => "extracting",
            Self::Processing { .. } => "processing",
            Self::Encoding => "encoding",
            Self::Completed { .. } => "completed",
            Self::Failed { .. } => "failed",
        }
    }

    /// Frame progress, when the job is transforming frames
    #[must_use]
    pub fn progress(&self) -> Option<u8> {
        match self {
            Self::Processing { progress } => Some(*progress),
            _ => None,
        }
    }

    fn rank(&self) -> u8 {
        match self {
            Self::Queued => 0,
            Self::Extracting => 1,
            Self::Processing { .. } => 2,
            Self::Encoding => 3,
            Self::Completed { .. } | Self::Failed { .. } => 4,
        }
    }

    /// Whether moving from `self` to `next` respects the job state machine
    fn can_transition_to(&self, next: &JobState) -> bool {
        if self.is_terminal() {
            return false;
        }
        match (self, next) {
            (_, Self::Failed { .. }) => true,
            (Self::Encoding, Self::Completed { .. }) => true,
            (_, Self::Completed { .. }) => false,
            (Self::Processing { progress: current }, Self::Processing { progress: next }) => {
                next >= current && *next <= 100
            },
            (_, Self::Processing { progress }) => *progress <= 100 && next.rank() > self.rank(),
            _ => next.rank() > self.rank(),
        }
    }
}

/// Stored job state plus bookkeeping timestamps
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRecord {
    pub state: JobState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Buffered transitions per subscriber before it starts lagging
const EVENT_CAPACITY: usize = 256;

/// One applied state transition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobEvent {
    pub id: JobId,
    pub state: JobState,
}

/// Mapping from job id to its latest state
#[derive(Debug)]
pub struct JobStatusTable {
    jobs: RwLock<HashMap<JobId, JobRecord>>,
    events: broadcast::Sender<JobEvent>,
}

impl Default for JobStatusTable {
    fn default() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            jobs: RwLock::new(HashMap::new()),
            events,
        }
    }
}

impl JobStatusTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Receive every transition applied from now on, across all jobs
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.events.subscribe()
    }

    /// Allocate a job in state `Queued` and return its sole writer
    pub fn create(self: &Arc<Self>) -> (JobId, JobWriter) {
        let id = JobId::new();
        let now = Utc::now();
        {
            let mut jobs = self.jobs.write().unwrap_or_else(PoisonError::into_inner);
            jobs.insert(
                id,
                JobRecord {
                    state: JobState::Queued,
                    created_at: now,
                    updated_at: now,
                },
            );
            self.publish(id, JobState::Queued);
        }
        debug!(job_id = %id, "Job created");

        let writer = JobWriter {
            table: Arc::clone(self),
            id,
            finished: false,
        };
        (id, writer)
    }

    /// Latest state of `id`
    pub fn get(&self, id: JobId) -> Result<JobState> {
        self.record(id).map(|record| record.state)
    }

    /// Latest state of `id` with timestamps
    pub fn record(&self, id: JobId) -> Result<JobRecord> {
        self.jobs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned()
            .ok_or_else(|| ServiceError::JobNotFound(id.to_string()))
    }

    /// Forget a job, typically after its artifact expired
    pub fn remove(&self, id: JobId) -> Option<JobRecord> {
        let removed = self
            .jobs
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
        if removed.is_some() {
            debug!(job_id = %id, "Job removed");
        }
        removed
    }

    /// Forget failed jobs whose last update is older than `cutoff`
    pub fn prune_failed_before(&self, cutoff: DateTime<Utc>) -> usize {
        let mut jobs = self.jobs.write().unwrap_or_else(PoisonError::into_inner);
        let before = jobs.len();
        jobs.retain(|_, record| {
            !(matches!(record.state, JobState::Failed { .. }) && record.updated_at < cutoff)
        });
        before - jobs.len()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.jobs.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn ids(&self) -> Vec<JobId> {
        self.jobs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .copied()
            .collect()
    }

    fn apply(&self, id: JobId, next: JobState) -> Result<()> {
        let mut jobs = self.jobs.write().unwrap_or_else(PoisonError::into_inner);
        let record = jobs
            .get_mut(&id)
            .ok_or_else(|| ServiceError::JobNotFound(id.to_string()))?;

        if !record.state.can_transition_to(&next) {
            return Err(ServiceError::internal(format!(
                "illegal job transition {} -> {} for {id}",
                record.state.label(),
                next.label()
            )));
        }

        record.state = next;
        record.updated_at = Utc::now();
        // Published under the write lock so subscribers see table order
        self.publish(id, record.state.clone());
        Ok(())
    }

    fn publish(&self, id: JobId, state: JobState) {
        // No receivers is the common case
        let _ = self.events.send(JobEvent { id, state });
    }
}

/// Exclusive write access to one job's state
///
/// Dropping a writer before the job reached a terminal state marks the job
/// failed, so pollers never wait on a job nobody is running.
#[derive(Debug)]
pub struct JobWriter {
    table: Arc<JobStatusTable>,
    id: JobId,
    finished: bool,
}

impl JobWriter {
    #[must_use]
    pub fn id(&self) -> JobId {
        self.id
    }

    /// Publish a new state for this job
    pub fn update(&mut self, state: JobState) -> Result<()> {
        let terminal = state.is_terminal();
        self.table.apply(self.id, state)?;
        if terminal {
            self.finished = true;
        }
        Ok(())
    }

    /// Mark the job failed with `reason`
    pub fn fail<S: Into<String>>(&mut self, reason: S) -> Result<()> {
        self.update(JobState::Failed {
            reason: reason.into(),
        })
    }

    /// Withdraw a job that was never started, removing it from the table
    pub fn discard(mut self) {
        self.finished = true;
        self.table.remove(self.id);
    }
}

impl Drop for JobWriter {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        let reason = "job abandoned before completion".to_string();
        if self.table.apply(self.id, JobState::Failed { reason }).is_ok() {
            warn!(job_id = %self.id, "Job writer dropped before a terminal state");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> Arc<JobStatusTable> {
        Arc::new(JobStatusTable::new())
    }

    #[test]
    fn test_create_starts_queued() {
        let table = table();
        let (id, writer) = table.create();
        assert_eq!(writer.id(), id);
        assert_eq!(table.get(id).unwrap(), JobState::Queued);
        assert_eq!(table.len(), 1);
        assert_ne!(table.create().0, id);
    }

    #[test]
    fn test_happy_path_transitions() {
        let table = table();
        let (id, mut writer) = table.create();

        writer.update(JobState::Extracting).unwrap();
        for progress in [33, 67, 100] {
            writer.update(JobState::Processing { progress }).unwrap();
            assert_eq!(table.get(id).unwrap().progress(), Some(progress));
        }
        writer.update(JobState::Encoding).unwrap();
        writer
            .update(JobState::Completed {
                output: PathBuf::from("/out/x.webm"),
            })
            .unwrap();

        let record = table.record(id).unwrap();
        assert!(record.state.is_terminal());
        assert!(record.updated_at >= record.created_at);
    }

    #[test]
    fn test_illegal_transitions_rejected() {
        let table = table();
        let (_, mut writer) = table.create();

        // Completed only from encoding
        assert!(writer
            .update(JobState::Completed {
                output: PathBuf::from("x")
            })
            .is_err());

        writer.update(JobState::Processing { progress: 50 }).unwrap();
        assert!(writer.update(JobState::Processing { progress: 40 }).is_err());
        assert!(writer.update(JobState::Extracting).is_err());
        assert!(writer.update(JobState::Processing { progress: 101 }).is_err());

        writer.fail("boom").unwrap();
        // Terminal states are never overwritten
        assert!(writer.update(JobState::Encoding).is_err());
        assert!(writer.fail("again").is_err());
        assert_eq!(
            table.get(writer.id()).unwrap(),
            JobState::Failed {
                reason: "boom".into()
            }
        );
    }

    #[test]
    fn test_subscribers_see_applied_transitions_in_order() {
        let table = table();
        let mut events = table.subscribe();
        let (id, mut writer) = table.create();
        let (other, _other_writer) = table.create();

        writer.update(JobState::Extracting).unwrap();
        writer.update(JobState::Processing { progress: 60 }).unwrap();
        assert!(writer.update(JobState::Processing { progress: 10 }).is_err());
        writer.fail("boom").unwrap();

        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            seen.push(event);
        }
        let of = |job: JobId| -> Vec<JobState> {
            seen.iter().filter(|e| e.id == job).map(|e| e.state.clone()).collect()
        };
        assert_eq!(
            of(id),
            vec![
                JobState::Queued,
                JobState::Extracting,
                JobState::Processing { progress: 60 },
                JobState::Failed {
                    reason: "boom".into()
                },
            ]
        );
        assert_eq!(of(other), vec![JobState::Queued]);
    }

    #[test]
    fn test_dropped_writer_fails_job() {
        let table = table();
        let (id, writer) = table.create();
        drop(writer);
        assert!(matches!(table.get(id).unwrap(), JobState::Failed { .. }));

        let (withdrawn, writer) = table.create();
        writer.discard();
        assert!(table.get(withdrawn).is_err());
    }

    #[test]
    fn test_remove_and_not_found() {
        let table = table();
        let (id, mut writer) = table.create();
        writer.fail("x").unwrap();

        assert!(table.remove(id).is_some());
        assert!(table.remove(id).is_none());
        assert!(matches!(table.get(id), Err(ServiceError::JobNotFound(_))));
        assert!(table.is_empty());
    }

    #[test]
    fn test_prune_failed_keeps_live_jobs() {
        let table = table();
        let (failed, mut writer) = table.create();
        writer.fail("x").unwrap();
        let (queued, _live) = table.create();

        assert_eq!(table.prune_failed_before(Utc::now() - chrono::Duration::hours(1)), 0);
        assert_eq!(table.prune_failed_before(Utc::now() + chrono::Duration::seconds(1)), 1);
        assert!(table.get(failed).is_err());
        assert_eq!(table.get(queued).unwrap(), JobState::Queued);
    }

    #[test]
    fn test_job_id_parsing_and_serialization() {
        let id = JobId::new();
        assert_eq!(id.to_string().parse::<JobId>().unwrap(), id);
        assert!("not-a-job".parse::<JobId>().is_err());

        let json = serde_json::to_value(JobState::Processing { progress: 67 }).unwrap();
        assert_eq!(json, serde_json::json!({"status": "processing", "progress": 67}));
    }
}
