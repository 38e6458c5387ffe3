//! # Steps
//!
//! Lifecycle contract shared by every unit of work a job runs.
//!
//! ```text
//! Created ──prepare──► Prepared ──execute──► Executing ──finalize──► Finalized
//!    │                    │                      │                      │
//!    └────────────────────┴─────── Failed ◄──────┘          prepare (next run)
//! ```
//!
//! - [`StreamStep`]: coordinator side, reads items and publishes them to the bus
//! - [`AsyncStep`]: node side, consumes items from the bus and writes them

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::cancellation::CancellationFlag;
use crate::context::RunContext;
use crate::error::{HarvesterError, HarvesterResult};

pub mod async_step;
pub mod completion;
pub mod stream;

pub use async_step::{AsyncStep, FailureRecord};
pub use completion::CompletionCounter;
pub use stream::StreamStep;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepState {
    Created,
    Prepared,
    Executing,
    Finalized,
    Failed,
}

impl StepState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finalized | Self::Failed)
    }
}

impl std::fmt::Display for StepState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Created => "created",
            Self::Prepared => "prepared",
            Self::Executing => "executing",
            Self::Finalized => "finalized",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Unit of work run by a job
#[async_trait]
pub trait Step: Send {
    fn name(&self) -> &str;

    fn state(&self) -> StepState;

    /// Validate parameters and acquire resources
    async fn prepare(&mut self, context: &StepContext) -> HarvesterResult<()>;

    /// Do the work; may wait on remote progress
    async fn execute(&mut self) -> HarvesterResult<()>;

    /// Release resources; runs on every exit path, no-op if never prepared
    async fn finalize(&mut self) -> HarvesterResult<()>;
}

/// Shared item counters a job exposes through its status handle
#[derive(Debug, Clone, Default)]
pub struct StepProgress {
    counters: Arc<ProgressCounters>,
}

#[derive(Debug, Default)]
struct ProgressCounters {
    read: AtomicU64,
    published: AtomicU64,
    written: AtomicU64,
    failed: AtomicU64,
}

impl StepProgress {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_read(&self) {
        self.counters.read.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_published(&self) {
        self.counters.published.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_written(&self) {
        self.counters.written.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failed(&self) {
        self.counters.failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Zero every counter, for a new run
    pub fn reset(&self) {
        self.counters.read.store(0, Ordering::Relaxed);
        self.counters.published.store(0, Ordering::Relaxed);
        self.counters.written.store(0, Ordering::Relaxed);
        self.counters.failed.store(0, Ordering::Relaxed);
    }

    pub fn items_read(&self) -> u64 {
        self.counters.read.load(Ordering::Relaxed)
    }

    pub fn items_published(&self) -> u64 {
        self.counters.published.load(Ordering::Relaxed)
    }

    pub fn items_written(&self) -> u64 {
        self.counters.written.load(Ordering::Relaxed)
    }

    pub fn items_failed(&self) -> u64 {
        self.counters.failed.load(Ordering::Relaxed)
    }
}

/// What a step receives at prepare time
#[derive(Debug, Clone)]
pub struct StepContext {
    pub run_context: Arc<RunContext>,
    pub cancellation: CancellationFlag,
    pub progress: StepProgress,
    pub job_id: Option<String>,
}

impl StepContext {
    pub fn new(run_context: Arc<RunContext>) -> Self {
        Self {
            run_context,
            cancellation: CancellationFlag::new(),
            progress: StepProgress::new(),
            job_id: None,
        }
    }

    pub fn with_cancellation(mut self, cancellation: CancellationFlag) -> Self {
        self.cancellation = cancellation;
        self
    }

    pub fn with_progress(mut self, progress: StepProgress) -> Self {
        self.progress = progress;
        self
    }

    pub fn with_job_id(mut self, job_id: impl Into<String>) -> Self {
        self.job_id = Some(job_id.into());
        self
    }
}

/// State-transition guard used by step implementations
#[derive(Debug, Clone)]
pub struct StepLifecycle {
    step_name: String,
    state: StepState,
}

impl StepLifecycle {
    pub fn new(step_name: impl Into<String>) -> Self {
        Self {
            step_name: step_name.into(),
            state: StepState::Created,
        }
    }

    pub fn state(&self) -> StepState {
        self.state
    }

    /// Whether finalize has anything to release
    pub fn was_prepared(&self) -> bool {
        !matches!(self.state, StepState::Created | StepState::Finalized)
    }

    pub fn begin_prepare(&self) -> HarvesterResult<()> {
        match self.state {
            StepState::Created | StepState::Finalized => Ok(()),
            other => Err(HarvesterError::illegal_state(format!(
                "step '{}' cannot be prepared while {other}; finalize it first",
                self.step_name
            ))),
        }
    }

    pub fn mark_prepared(&mut self) {
        self.state = StepState::Prepared;
    }

    pub fn begin_execute(&mut self) -> HarvesterResult<()> {
        match self.state {
            StepState::Prepared => {
                self.state = StepState::Executing;
                Ok(())
            }
            other => Err(HarvesterError::illegal_state(format!(
                "step '{}' cannot execute while {other}; prepare it first",
                self.step_name
            ))),
        }
    }

    pub fn mark_failed(&mut self) {
        self.state = StepState::Failed;
    }

    /// Record the end of finalize; a failed step stays failed
    pub fn mark_finalized(&mut self) {
        if self.state != StepState::Failed {
            self.state = StepState::Finalized;
        }
    }

    /// Pass `result` through, moving to `Failed` on error
    pub fn track<T>(&mut self, result: HarvesterResult<T>) -> HarvesterResult<T> {
        if result.is_err() {
            self.mark_failed();
        }
        result
    }
}
