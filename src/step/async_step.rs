//! # Async Step
//!
//! Node-side step fed by a [`MessageBusConsumer`](crate::messaging::MessageBusConsumer).
//!
//! Items arrive through [`ItemHandler::ingest`], possibly from several
//! dispatch tasks at once. Each item is optionally transformed, written, and
//! counted. `execute` waits until the expected number of items has been
//! written or the completion timeout elapses.
//!
//! An `AsyncStep` is a cheap handle: clones share the same state, so one
//! clone can be registered with a consumer while another is driven as a step.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::cancellation::CancellationFlag;
use crate::config::NodeConfig;
use crate::context::{RunContext, SharedParameter};
use crate::error::{HarvesterError, HarvesterResult};
use crate::messaging::ItemHandler;
use crate::pipeline::{Item, ItemProcessor, ItemWriter, ProcessingStage};
use crate::step::completion::CompletionCounter;
use crate::step::{Step, StepContext, StepLifecycle, StepProgress, StepState};

/// Failures kept per run; older ones are only counted
const MAX_RECORDED_FAILURES: usize = 1000;

/// A node-side item failure
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailureRecord {
    pub kind: String,
    pub message: String,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Clone)]
struct ActiveRun {
    run_context: Arc<RunContext>,
    counter: Arc<CompletionCounter>,
    cancellation: CancellationFlag,
    progress: StepProgress,
}

struct AsyncStepInner<I, O> {
    name: String,
    lifecycle: Mutex<StepLifecycle>,
    stage: RwLock<ProcessingStage<I, O>>,
    stage_initialized: AtomicBool,
    writer: RwLock<Option<Arc<dyn ItemWriter<O>>>>,
    writer_open: AtomicBool,
    expected_count: RwLock<Option<u64>>,
    completion_timeout: RwLock<Duration>,
    run: RwLock<Option<ActiveRun>>,
    processing_failures: AtomicU64,
    write_failures: AtomicU64,
    failures: Mutex<VecDeque<FailureRecord>>,
}

/// Consumes bus items, writes them and signals completion
pub struct AsyncStep<I: Item, O: Item = I> {
    inner: Arc<AsyncStepInner<I, O>>,
}

impl<I: Item, O: Item> Clone for AsyncStep<I, O> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<I: Item, O: Item> std::fmt::Debug for AsyncStep<I, O> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncStep")
            .field("name", &self.inner.name)
            .field("state", &self.state())
            .field("expected_count", &*self.inner.expected_count.read())
            .finish()
    }
}

impl<T: Item> AsyncStep<T, T> {
    /// An async step that writes items as received
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_stage(name, ProcessingStage::passthrough())
    }
}

impl<I: Item, O: Item> AsyncStep<I, O> {
    /// An async step that transforms each item before writing it
    pub fn with_processor(
        name: impl Into<String>,
        processor: impl ItemProcessor<I, O> + 'static,
    ) -> Self {
        Self::with_stage(name, ProcessingStage::processor(processor))
    }

    fn with_stage(name: impl Into<String>, stage: ProcessingStage<I, O>) -> Self {
        let name = name.into();
        Self {
            inner: Arc::new(AsyncStepInner {
                lifecycle: Mutex::new(StepLifecycle::new(name.clone())),
                name,
                stage: RwLock::new(stage),
                stage_initialized: AtomicBool::new(false),
                writer: RwLock::new(None),
                writer_open: AtomicBool::new(false),
                expected_count: RwLock::new(None),
                completion_timeout: RwLock::new(NodeConfig::default().completion_timeout()),
                run: RwLock::new(None),
                processing_failures: AtomicU64::new(0),
                write_failures: AtomicU64::new(0),
                failures: Mutex::new(VecDeque::new()),
            }),
        }
    }

    pub fn set_writer(&self, writer: Arc<dyn ItemWriter<O>>) {
        *self.inner.writer.write() = Some(writer);
    }

    pub fn set_processor(&self, processor: impl ItemProcessor<I, O> + 'static) {
        *self.inner.stage.write() = ProcessingStage::processor(processor);
    }

    /// Fix the expected item count, overriding `ExpectedRecordCount`
    pub fn set_expected_count(&self, expected: u64) {
        *self.inner.expected_count.write() = Some(expected);
    }

    pub fn set_completion_timeout(&self, timeout: Duration) {
        *self.inner.completion_timeout.write() = timeout;
    }

    pub fn apply_config(&self, config: &NodeConfig) {
        self.set_completion_timeout(config.completion_timeout());
    }

    pub fn processing_failures(&self) -> u64 {
        self.inner.processing_failures.load(Ordering::SeqCst)
    }

    pub fn write_failures(&self) -> u64 {
        self.inner.write_failures.load(Ordering::SeqCst)
    }

    /// Most recent failures of the current or last run
    pub fn failures(&self) -> Vec<FailureRecord> {
        self.inner.failures.lock().iter().cloned().collect()
    }

    /// Items written in the active run, if one is active
    pub fn written_count(&self) -> Option<u64> {
        self.inner.run.read().as_ref().map(|run| run.counter.count())
    }

    fn active_run(&self) -> HarvesterResult<ActiveRun> {
        self.inner.run.read().clone().ok_or_else(|| {
            HarvesterError::illegal_state(format!(
                "async step '{}' has no active run; prepare it first",
                self.inner.name
            ))
        })
    }

    fn current_writer(&self) -> HarvesterResult<Arc<dyn ItemWriter<O>>> {
        self.inner.writer.read().clone().ok_or_else(|| {
            HarvesterError::configuration(self.inner.name.clone(), "no item writer set")
        })
    }

    fn track<T>(&self, result: HarvesterResult<T>) -> HarvesterResult<T> {
        self.inner.lifecycle.lock().track(result)
    }

    fn resolve_expected(&self, run_context: &RunContext) -> HarvesterResult<u64> {
        let explicit = *self.inner.expected_count.read();
        match explicit {
            Some(expected) => Ok(expected),
            None => run_context.require_u64(SharedParameter::ExpectedRecordCount, &self.inner.name),
        }
    }

    fn record_failure(&self, run: &ActiveRun, error: &HarvesterError) {
        match error {
            HarvesterError::Write { .. } => self.inner.write_failures.fetch_add(1, Ordering::SeqCst),
            _ => self.inner.processing_failures.fetch_add(1, Ordering::SeqCst),
        };
        run.progress.record_failed();

        let mut failures = self.inner.failures.lock();
        if failures.len() >= MAX_RECORDED_FAILURES {
            failures.pop_front();
        }
        failures.push_back(FailureRecord {
            kind: error.kind().to_string(),
            message: error.to_string(),
            occurred_at: Utc::now(),
        });
    }

    fn reset_run_statistics(&self) {
        self.inner.processing_failures.store(0, Ordering::SeqCst);
        self.inner.write_failures.store(0, Ordering::SeqCst);
        self.inner.failures.lock().clear();
    }

    async fn open_resources(&self, run_context: &RunContext) -> HarvesterResult<u64> {
        let writer = self.current_writer()?;
        let expected = self.resolve_expected(run_context)?;

        writer.open(run_context).await?;
        self.inner.writer_open.store(true, Ordering::SeqCst);

        self.inner.stage.write().init(run_context)?;
        self.inner.stage_initialized.store(true, Ordering::SeqCst);
        Ok(expected)
    }
}

#[async_trait]
impl<I: Item, O: Item> ItemHandler<I> for AsyncStep<I, O> {
    fn handler_name(&self) -> &str {
        &self.inner.name
    }

    async fn ingest(&self, item: I) -> HarvesterResult<()> {
        let run = self.active_run()?;

        let processed = self.inner.stage.read().apply(item, &run.run_context);
        let output = match processed {
            Ok(output) => output,
            Err(error) => {
                self.record_failure(&run, &error);
                return Err(error);
            }
        };

        let writer = self.current_writer()?;
        if let Err(error) = writer.write(output).await {
            let error = match error {
                HarvesterError::Write { .. } => error,
                other => HarvesterError::write(other.to_string()),
            };
            self.record_failure(&run, &error);
            return Err(error);
        }

        run.progress.record_written();
        let written = run.counter.increment();
        if written == run.counter.expected() {
            info!(step = %self.inner.name, written = written, "🎯 Expected item count reached");
        }
        Ok(())
    }
}

#[async_trait]
impl<I: Item, O: Item> Step for AsyncStep<I, O> {
    fn name(&self) -> &str {
        &self.inner.name
    }

    fn state(&self) -> StepState {
        self.inner.lifecycle.lock().state()
    }

    #[instrument(skip_all, name = "async_step.prepare")]
    async fn prepare(&mut self, context: &StepContext) -> HarvesterResult<()> {
        self.inner.lifecycle.lock().begin_prepare()?;

        let opened = self.open_resources(&context.run_context).await;
        let expected = self.track(opened)?;

        self.reset_run_statistics();
        *self.inner.run.write() = Some(ActiveRun {
            run_context: Arc::clone(&context.run_context),
            counter: Arc::new(CompletionCounter::new(expected)),
            cancellation: context.cancellation.clone(),
            progress: context.progress.clone(),
        });
        self.inner.lifecycle.lock().mark_prepared();

        debug!(step = %self.inner.name, expected = expected, "Async step prepared");
        Ok(())
    }

    #[instrument(skip_all, name = "async_step.execute")]
    async fn execute(&mut self) -> HarvesterResult<()> {
        self.inner.lifecycle.lock().begin_execute()?;
        let run = self.active_run();
        let run = self.track(run)?;
        let timeout = *self.inner.completion_timeout.read();

        info!(
            step = %self.inner.name,
            expected = run.counter.expected(),
            timeout_ms = timeout.as_millis() as u64,
            "⏳ Waiting for expected items"
        );
        let outcome = run.counter.wait(timeout, &run.cancellation).await;
        match self.track(outcome) {
            Ok(written) => {
                info!(
                    step = %self.inner.name,
                    written = written,
                    processing_failures = self.processing_failures(),
                    write_failures = self.write_failures(),
                    "✅ Async step completed"
                );
                Ok(())
            }
            Err(error) => {
                warn!(
                    step = %self.inner.name,
                    error_kind = error.kind(),
                    error = %error,
                    "❌ Async step did not complete"
                );
                Err(error)
            }
        }
    }

    async fn finalize(&mut self) -> HarvesterResult<()> {
        if !self.inner.lifecycle.lock().was_prepared() {
            return Ok(());
        }

        // dropping the run discards the completion counter
        let run = self.inner.run.write().take();

        let mut result = Ok(());
        if self.inner.writer_open.swap(false, Ordering::SeqCst) {
            let writer = self.inner.writer.read().clone();
            if let Some(writer) = writer {
                result = writer.close().await;
            }
        }
        if self.inner.stage_initialized.swap(false, Ordering::SeqCst) {
            self.inner.stage.write().destroy();
        }

        self.inner.lifecycle.lock().mark_finalized();
        debug!(
            step = %self.inner.name,
            written = run.map(|r| r.counter.count()).unwrap_or(0),
            state = %self.state(),
            "Async step finalized"
        );
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{CollectingWriter, FnProcessor};

    fn step_context(expected: Option<u64>) -> StepContext {
        let mut builder = RunContext::builder();
        if let Some(expected) = expected {
            builder = builder.with(SharedParameter::ExpectedRecordCount, expected);
        }
        StepContext::new(Arc::new(builder.build()))
    }

    #[tokio::test]
    async fn test_ingest_before_prepare_is_illegal() {
        let step = AsyncStep::<u32>::new("writer");
        step.set_writer(Arc::new(CollectingWriter::<u32>::new()));
        let err = step.ingest(1).await.unwrap_err();
        assert!(matches!(err, HarvesterError::IllegalState { .. }));
    }

    #[tokio::test]
    async fn test_expected_count_is_required() {
        let mut step = AsyncStep::<u32>::new("writer");
        step.set_writer(Arc::new(CollectingWriter::<u32>::new()));
        let err = step.prepare(&step_context(None)).await.unwrap_err();
        assert!(matches!(err, HarvesterError::Configuration { .. }));
        assert_eq!(step.state(), StepState::Failed);
    }

    #[tokio::test]
    async fn test_missing_writer_is_configuration_error() {
        let mut step = AsyncStep::<u32>::new("writer");
        step.set_expected_count(1);
        let err = step.prepare(&step_context(None)).await.unwrap_err();
        assert!(matches!(err, HarvesterError::Configuration { .. }));
    }

    #[tokio::test]
    async fn test_completes_when_expected_items_are_written() {
        let writer = Arc::new(CollectingWriter::<u32>::new());
        let mut step = AsyncStep::<u32>::new("writer");
        step.set_writer(writer.clone());

        step.prepare(&step_context(Some(2))).await.unwrap();
        assert!(writer.is_opened());
        step.ingest(10).await.unwrap();
        step.ingest(20).await.unwrap();
        assert_eq!(step.written_count(), Some(2));

        step.execute().await.unwrap();
        step.finalize().await.unwrap();
        assert_eq!(step.state(), StepState::Finalized);
        assert!(writer.is_closed());
        assert_eq!(writer.content(), vec![10, 20]);
        assert_eq!(step.written_count(), None);
    }

    #[tokio::test]
    async fn test_failures_are_recorded_and_not_counted() {
        let writer = Arc::new(CollectingWriter::new().failing_when(|v: &String| v == "w3"));
        let mut step = AsyncStep::with_processor(
            "writer",
            FnProcessor::new(|value: u32, _: &RunContext| {
                if value == 2 {
                    Err(HarvesterError::processing("cannot map 2"))
                } else {
                    Ok(format!("w{value}"))
                }
            }),
        );
        step.set_writer(writer.clone());
        step.set_expected_count(3);
        step.set_completion_timeout(Duration::from_millis(50));

        let ctx = step_context(None);
        step.prepare(&ctx).await.unwrap();
        for value in 1..=4_u32 {
            let _ = step.ingest(value).await;
        }

        let err = step.execute().await.unwrap_err();
        assert_eq!(
            err,
            HarvesterError::IncompleteRun {
                expected: 3,
                observed: 2
            }
        );
        assert_eq!(step.processing_failures(), 1);
        assert_eq!(step.write_failures(), 1);
        assert_eq!(step.failures().len(), 2);
        assert_eq!(ctx.progress.items_failed(), 2);
        assert_eq!(writer.content(), vec!["w1".to_string(), "w4".to_string()]);

        step.finalize().await.unwrap();
        assert_eq!(step.state(), StepState::Failed);
    }

    #[tokio::test]
    async fn test_failure_log_keeps_most_recent_records() {
        let mut step = AsyncStep::with_processor(
            "writer",
            FnProcessor::new(|value: u32, _: &RunContext| -> HarvesterResult<u32> {
                Err(HarvesterError::processing(format!("rejected #{value}")))
            }),
        );
        step.set_writer(Arc::new(CollectingWriter::<u32>::new()));
        step.set_expected_count(1);
        step.prepare(&step_context(None)).await.unwrap();

        let total = MAX_RECORDED_FAILURES as u32 + 5;
        for value in 1..=total {
            assert!(step.ingest(value).await.is_err());
        }

        let failures = step.failures();
        assert_eq!(failures.len(), MAX_RECORDED_FAILURES);
        assert!(failures[0].message.ends_with("rejected #6"));
        assert!(failures[MAX_RECORDED_FAILURES - 1]
            .message
            .ends_with(&format!("rejected #{total}")));
        assert_eq!(step.processing_failures(), u64::from(total));
        step.finalize().await.unwrap();
    }

    #[tokio::test]
    async fn test_clones_share_state() {
        let writer = Arc::new(CollectingWriter::<u32>::new());
        let mut step = AsyncStep::<u32>::new("writer");
        step.set_writer(writer.clone());
        step.set_expected_count(1);
        let handler = step.clone();

        step.prepare(&step_context(None)).await.unwrap();
        handler.ingest(7).await.unwrap();
        step.execute().await.unwrap();
        step.finalize().await.unwrap();
        assert_eq!(writer.content(), vec![7]);
    }
}
