//! # Job
//!
//! Ordered list of steps run against one shared run context.
//!
//! Steps run one after another. The first failure stops the job and is
//! returned unchanged; every step that got prepared is finalized, whatever
//! happened. Cancellation is cooperative: [`Job::cancel`] raises a flag that
//! steps observe at their next suspension point.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::cancellation::CancellationFlag;
use crate::context::RunContext;
use crate::error::{HarvesterError, HarvesterResult};
use crate::logging::{log_error, log_job_operation, log_step_operation};
use crate::step::{Step, StepContext};

pub mod status;

pub use status::{JobState, JobStatusHandle, JobStatusSnapshot};

/// Summary of a successful run
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobReport {
    pub job_id: Uuid,
    pub steps_completed: usize,
    pub items_read: u64,
    pub items_published: u64,
    pub items_written: u64,
    pub elapsed: Duration,
}

pub struct Job {
    job_id: Uuid,
    name: String,
    steps: Vec<Box<dyn Step>>,
    cancellation: CancellationFlag,
    status: JobStatusHandle,
}

impl std::fmt::Debug for Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Job")
            .field("job_id", &self.job_id)
            .field("name", &self.name)
            .field("steps", &self.step_names())
            .field("state", &self.status.state())
            .finish()
    }
}

impl Job {
    pub fn new(name: impl Into<String>) -> Self {
        let job_id = Uuid::new_v4();
        let name = name.into();
        Self {
            status: JobStatusHandle::new(job_id, &name),
            job_id,
            name,
            steps: Vec::new(),
            cancellation: CancellationFlag::new(),
        }
    }

    /// Append a step; steps run in the order they were added
    pub fn add_step(&mut self, step: impl Step + 'static) -> &mut Self {
        self.steps.push(Box::new(step));
        self
    }

    pub fn with_step(mut self, step: impl Step + 'static) -> Self {
        self.add_step(step);
        self
    }

    pub fn job_id(&self) -> Uuid {
        self.job_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn step_names(&self) -> Vec<&str> {
        self.steps.iter().map(|step| step.name()).collect()
    }

    /// Live status shared with UI/CLI layers
    pub fn status(&self) -> JobStatusHandle {
        self.status.clone()
    }

    /// Flag that cancels this job when raised from another task
    ///
    /// Cancellation is permanent for this job instance.
    pub fn canceller(&self) -> CancellationFlag {
        self.cancellation.clone()
    }

    pub fn cancel(&self) {
        info!(job_id = %self.job_id, "🛑 Cancellation requested");
        self.cancellation.cancel();
    }

    /// Run every step in order against `run_context`
    pub async fn do_job(&mut self, run_context: RunContext) -> HarvesterResult<JobReport> {
        let started = Instant::now();
        let job_id = self.job_id.to_string();
        let progress = self.status.start();
        log_job_operation("do_job", &job_id, &self.name, "started", None);

        let step_context = StepContext::new(Arc::new(run_context))
            .with_cancellation(self.cancellation.clone())
            .with_progress(progress.clone())
            .with_job_id(job_id.clone());

        let mut steps_completed = 0;
        for step in self.steps.iter_mut() {
            let outcome = if self.cancellation.is_cancelled() {
                Err(HarvesterError::cancelled(format!(
                    "job cancelled before step '{}'",
                    step.name()
                )))
            } else {
                self.status.enter_step(step.name());
                run_step(step.as_mut(), &step_context).await
            };

            if let Err(error) = outcome {
                self.status.fail(&error);
                log_error("job", "do_job", &error.to_string(), Some(step.name()));
                log_job_operation("do_job", &job_id, &self.name, error.kind(), Some(step.name()));
                return Err(error);
            }
            self.status.complete_step();
            steps_completed += 1;
        }

        self.status.succeed();
        let report = JobReport {
            job_id: self.job_id,
            steps_completed,
            items_read: progress.items_read(),
            items_published: progress.items_published(),
            items_written: progress.items_written(),
            elapsed: started.elapsed(),
        };
        log_job_operation("do_job", &job_id, &self.name, "succeeded", None);
        Ok(report)
    }
}

/// Prepare, execute and finalize one step; finalize runs on every path
async fn run_step(step: &mut dyn Step, context: &StepContext) -> HarvesterResult<()> {
    let job_id = context.job_id.as_deref();

    log_step_operation("prepare", job_id, step.name(), "started", None);
    if let Err(error) = step.prepare(context).await {
        if let Err(finalize_error) = step.finalize().await {
            warn!(step = step.name(), error = %finalize_error, "Finalize after failed prepare also failed");
        }
        return Err(error);
    }

    log_step_operation("execute", job_id, step.name(), "started", None);
    let executed = step.execute().await;
    let finalized = step.finalize().await;
    log_step_operation("finalize", job_id, step.name(), &step.state().to_string(), None);

    match (executed, finalized) {
        (Err(error), Err(finalize_error)) => {
            warn!(step = step.name(), error = %finalize_error, "Finalize after failed execute also failed");
            Err(error)
        }
        (Err(error), Ok(())) => Err(error),
        (Ok(()), Err(finalize_error)) => Err(finalize_error),
        (Ok(()), Ok(())) => Ok(()),
    }
}
