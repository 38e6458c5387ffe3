//! # Stream Step
//!
//! Coordinator-side step: pulls items from a reader, optionally transforms
//! them and publishes each one to the bus with the step's destination tags.
//! The first read, processing or publish failure aborts the step.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, instrument, warn};

use crate::cancellation::CancellationFlag;
use crate::config::StreamConfig;
use crate::context::RunContext;
use crate::error::{HarvesterError, HarvesterResult};
use crate::messaging::{DestinationTag, MessageBusWriter, TagSet};
use crate::pipeline::{Item, ItemProcessor, ItemReader, ProcessingStage};
use crate::step::{Step, StepContext, StepLifecycle, StepProgress, StepState};

struct ActiveStream {
    run_context: Arc<RunContext>,
    cancellation: CancellationFlag,
    progress: StepProgress,
}

/// Reads items and publishes them to the message bus
pub struct StreamStep<I: Item, O: Item = I> {
    name: String,
    lifecycle: StepLifecycle,
    reader: Option<Box<dyn ItemReader<I>>>,
    reader_open: bool,
    stage: ProcessingStage<I, O>,
    writer: Option<MessageBusWriter>,
    destinations: TagSet,
    progress_log_interval: u64,
    active: Option<ActiveStream>,
}

impl<T: Item> StreamStep<T, T> {
    /// A stream step that publishes items as read
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_stage(name, ProcessingStage::passthrough())
    }
}

impl<I: Item, O: Item> StreamStep<I, O> {
    /// A stream step that transforms each item before publishing it
    pub fn with_processor(
        name: impl Into<String>,
        processor: impl ItemProcessor<I, O> + 'static,
    ) -> Self {
        Self::with_stage(name, ProcessingStage::processor(processor))
    }

    fn with_stage(name: impl Into<String>, stage: ProcessingStage<I, O>) -> Self {
        let name = name.into();
        Self {
            lifecycle: StepLifecycle::new(name.clone()),
            name,
            reader: None,
            reader_open: false,
            stage,
            writer: None,
            destinations: TagSet::new(),
            progress_log_interval: StreamConfig::default().progress_log_interval,
            active: None,
        }
    }

    pub fn set_reader(&mut self, reader: impl ItemReader<I> + 'static) {
        self.reader = Some(Box::new(reader));
    }

    pub fn set_writer(&mut self, writer: MessageBusWriter) {
        self.writer = Some(writer);
    }

    pub fn set_processor(&mut self, processor: impl ItemProcessor<I, O> + 'static) {
        self.stage = ProcessingStage::processor(processor);
    }

    /// Add a destination tag; every published item carries all of them
    pub fn add_destination(&mut self, tag: impl Into<DestinationTag>) {
        self.destinations.insert(tag);
    }

    pub fn apply_config(&mut self, config: &StreamConfig) {
        self.progress_log_interval = config.progress_log_interval.max(1);
    }

    pub fn destinations(&self) -> &TagSet {
        &self.destinations
    }

    pub fn progress_log_interval(&self) -> u64 {
        self.progress_log_interval
    }

    fn validate(&self) -> HarvesterResult<()> {
        if self.destinations.is_empty() {
            return Err(HarvesterError::configuration(
                self.name.clone(),
                "stream step needs at least one destination tag",
            ));
        }
        if self.reader.is_none() {
            return Err(HarvesterError::configuration(self.name.clone(), "no reader set"));
        }
        if self.writer.is_none() {
            return Err(HarvesterError::configuration(
                self.name.clone(),
                "no message bus writer set",
            ));
        }
        Ok(())
    }

    async fn open_resources(&mut self, run_context: &RunContext) -> HarvesterResult<()> {
        let reader = self
            .reader
            .as_mut()
            .ok_or_else(|| HarvesterError::configuration(self.name.clone(), "no reader set"))?;
        reader.open(run_context).await?;
        self.reader_open = true;
        self.stage.init(run_context)
    }

    async fn stream_items(&mut self) -> HarvesterResult<u64> {
        let active = self
            .active
            .as_ref()
            .ok_or_else(|| HarvesterError::illegal_state("stream step has no active run"))?;
        let reader = self
            .reader
            .as_mut()
            .ok_or_else(|| HarvesterError::configuration(self.name.clone(), "no reader set"))?;
        let writer = self.writer.as_ref().ok_or_else(|| {
            HarvesterError::configuration(self.name.clone(), "no message bus writer set")
        })?;

        let mut published = 0_u64;
        loop {
            if active.cancellation.is_cancelled() {
                return Err(HarvesterError::cancelled(format!(
                    "stream step '{}' cancelled after {published} items",
                    self.name
                )));
            }

            let item = match reader.read_next().await {
                Ok(Some(item)) => item,
                Ok(None) => break,
                Err(e @ HarvesterError::Read { .. }) => return Err(e),
                Err(other) => return Err(HarvesterError::read(other.to_string())),
            };
            active.progress.record_read();

            let output = self.stage.apply(item, &active.run_context)?;
            writer.publish(&output, &self.destinations).await?;
            active.progress.record_published();
            published += 1;

            if published % self.progress_log_interval == 0 {
                info!(step = %self.name, published = published, "📤 Stream progress");
            }
        }
        Ok(published)
    }
}

#[async_trait]
impl<I: Item, O: Item> Step for StreamStep<I, O> {
    fn name(&self) -> &str {
        &self.name
    }

    fn state(&self) -> StepState {
        self.lifecycle.state()
    }

    #[instrument(skip_all, name = "stream_step.prepare")]
    async fn prepare(&mut self, context: &StepContext) -> HarvesterResult<()> {
        self.lifecycle.begin_prepare()?;
        if let Err(e) = self.validate() {
            self.lifecycle.mark_failed();
            return Err(e);
        }

        let opened = self.open_resources(&context.run_context).await;
        self.lifecycle.track(opened)?;

        self.active = Some(ActiveStream {
            run_context: Arc::clone(&context.run_context),
            cancellation: context.cancellation.clone(),
            progress: context.progress.clone(),
        });
        self.lifecycle.mark_prepared();
        debug!(step = %self.name, destinations = %self.destinations, "Stream step prepared");
        Ok(())
    }

    #[instrument(skip_all, name = "stream_step.execute")]
    async fn execute(&mut self) -> HarvesterResult<()> {
        self.lifecycle.begin_execute()?;
        let outcome = self.stream_items().await;
        match self.lifecycle.track(outcome) {
            Ok(published) => {
                info!(step = %self.name, published = published, "✅ Stream step finished");
                Ok(())
            }
            Err(e) => {
                warn!(step = %self.name, error_kind = e.kind(), error = %e, "❌ Stream step aborted");
                Err(e)
            }
        }
    }

    async fn finalize(&mut self) -> HarvesterResult<()> {
        if !self.lifecycle.was_prepared() {
            return Ok(());
        }

        let mut result = Ok(());
        if self.reader_open {
            if let Some(reader) = self.reader.as_mut() {
                result = reader.close().await;
            }
            self.reader_open = false;
        }
        if self.active.take().is_some() {
            self.stage.destroy();
        }
        self.lifecycle.mark_finalized();
        debug!(step = %self.name, state = %self.lifecycle.state(), "Stream step finalized");
        result
    }
}
