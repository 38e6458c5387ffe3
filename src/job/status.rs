//! # Job Status
//!
//! Read-only view of a running job for UI and CLI layers.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::HarvesterError;
use crate::step::StepProgress;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Pending,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl JobState {
    pub fn is_finished(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }
}

#[derive(Debug, Clone)]
struct JobStatusRecord {
    state: JobState,
    current_step: Option<String>,
    steps_completed: usize,
    error_kind: Option<String>,
    error_message: Option<String>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
}

/// Point-in-time copy of a job's status
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobStatusSnapshot {
    pub job_id: Uuid,
    pub job_name: String,
    pub state: JobState,
    pub current_step: Option<String>,
    pub steps_completed: usize,
    pub items_read: u64,
    pub items_published: u64,
    pub items_written: u64,
    pub items_failed: u64,
    pub error_kind: Option<String>,
    pub error_message: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Shared handle onto a job's live status
#[derive(Debug, Clone)]
pub struct JobStatusHandle {
    job_id: Uuid,
    job_name: Arc<str>,
    record: Arc<RwLock<JobStatusRecord>>,
    progress: StepProgress,
}

impl JobStatusHandle {
    pub(crate) fn new(job_id: Uuid, job_name: &str) -> Self {
        Self {
            job_id,
            job_name: Arc::from(job_name),
            record: Arc::new(RwLock::new(JobStatusRecord {
                state: JobState::Pending,
                current_step: None,
                steps_completed: 0,
                error_kind: None,
                error_message: None,
                started_at: None,
                finished_at: None,
            })),
            progress: StepProgress::new(),
        }
    }

    pub fn job_id(&self) -> Uuid {
        self.job_id
    }

    pub fn state(&self) -> JobState {
        self.record.read().state
    }

    pub fn current_step(&self) -> Option<String> {
        self.record.read().current_step.clone()
    }

    pub fn progress(&self) -> &StepProgress {
        &self.progress
    }

    pub fn snapshot(&self) -> JobStatusSnapshot {
        let record = self.record.read();
        JobStatusSnapshot {
            job_id: self.job_id,
            job_name: self.job_name.to_string(),
            state: record.state,
            current_step: record.current_step.clone(),
            steps_completed: record.steps_completed,
            items_read: self.progress.items_read(),
            items_published: self.progress.items_published(),
            items_written: self.progress.items_written(),
            items_failed: self.progress.items_failed(),
            error_kind: record.error_kind.clone(),
            error_message: record.error_message.clone(),
            started_at: record.started_at,
            finished_at: record.finished_at,
        }
    }

    /// Reset for a new run and hand out the counters steps report into
    pub(crate) fn start(&self) -> StepProgress {
        self.progress.reset();
        let mut record = self.record.write();
        record.state = JobState::Running;
        record.current_step = None;
        record.steps_completed = 0;
        record.error_kind = None;
        record.error_message = None;
        record.started_at = Some(Utc::now());
        record.finished_at = None;
        self.progress.clone()
    }

    pub(crate) fn enter_step(&self, step_name: &str) {
        self.record.write().current_step = Some(step_name.to_string());
    }

    pub(crate) fn complete_step(&self) {
        self.record.write().steps_completed += 1;
    }

    pub(crate) fn succeed(&self) {
        let mut record = self.record.write();
        record.state = JobState::Succeeded;
        record.current_step = None;
        record.finished_at = Some(Utc::now());
    }

    pub(crate) fn fail(&self, error: &HarvesterError) {
        let mut record = self.record.write();
        record.state = match error {
            HarvesterError::Cancelled { .. } => JobState::Cancelled,
            _ => JobState::Failed,
        };
        record.error_kind = Some(error.kind().to_string());
        record.error_message = Some(error.to_string());
        record.finished_at = Some(Utc::now());
    }
}
