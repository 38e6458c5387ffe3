//! # Processing Node
//!
//! Wires one [`MessageBusConsumer`] to the async steps that handle its items.
//!
//! ```text
//! register(step, tags)* ─► start(run_context) ─► await_completion() ─► shutdown()
//!                          prepare steps          execute steps          close consumer
//!                          open consumer          finalize steps
//!                               ▲                       │
//!                               └───── next run ────────┘
//! ```
//!
//! The consumer stays open between runs and keeps its registrations, so the
//! same node can serve any number of runs, including after `shutdown`.

use std::sync::Arc;

use tracing::{error, info, warn};
use uuid::Uuid;

use crate::cancellation::CancellationFlag;
use crate::config::HarvesterConfig;
use crate::context::RunContext;
use crate::error::{HarvesterError, HarvesterResult};
use crate::messaging::{
    ConsumerStats, DestinationTag, MessageBroker, MessageBusConsumer, RegistrationId,
};
use crate::pipeline::Item;
use crate::step::{AsyncStep, Step, StepContext, StepProgress};

pub struct ProcessingNode {
    node_id: Uuid,
    consumer: MessageBusConsumer,
    steps: Vec<Box<dyn Step>>,
    cancellation: CancellationFlag,
    progress: StepProgress,
    config: Option<HarvesterConfig>,
    started: bool,
}

impl std::fmt::Debug for ProcessingNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessingNode")
            .field("node_id", &self.node_id)
            .field("consumer", &self.consumer)
            .field("steps", &self.steps.len())
            .field("started", &self.started)
            .finish()
    }
}

impl ProcessingNode {
    pub fn new(consumer: MessageBusConsumer) -> Self {
        Self {
            node_id: Uuid::new_v4(),
            consumer,
            steps: Vec::new(),
            cancellation: CancellationFlag::new(),
            progress: StepProgress::new(),
            config: None,
            started: false,
        }
    }

    /// Build the node's consumer from configuration; registered steps get
    /// the configured completion timeout
    pub fn from_config(broker: Arc<dyn MessageBroker>, config: &HarvesterConfig) -> Self {
        let consumer = MessageBusConsumer::from_config(broker, &config.broker, &config.consumer);
        let mut node = Self::new(consumer);
        node.config = Some(config.clone());
        node
    }

    pub fn node_id(&self) -> Uuid {
        self.node_id
    }

    pub fn consumer(&self) -> &MessageBusConsumer {
        &self.consumer
    }

    pub fn progress(&self) -> &StepProgress {
        &self.progress
    }

    pub fn cancel(&self) {
        self.cancellation.cancel();
    }

    /// Register `step` as the handler for items tagged with any of `tags`
    pub async fn register<I, O, T>(
        &mut self,
        step: AsyncStep<I, O>,
        tags: T,
    ) -> HarvesterResult<RegistrationId>
    where
        I: Item,
        O: Item,
        T: IntoIterator,
        T::Item: Into<DestinationTag>,
    {
        if self.started {
            return Err(HarvesterError::illegal_state(
                "steps must be registered before the node starts",
            ));
        }
        if let Some(config) = &self.config {
            step.apply_config(&config.node);
        }

        let registration_id = self
            .consumer
            .register_handler::<I, _, _>(Arc::new(step.clone()), tags)
            .await?;
        self.steps.push(Box::new(step));
        Ok(registration_id)
    }

    /// Prepare every step with `run_context`, then start receiving
    pub async fn start(&mut self, run_context: RunContext) -> HarvesterResult<()> {
        if self.started {
            return Err(HarvesterError::illegal_state("processing node already started"));
        }

        let step_context = StepContext::new(Arc::new(run_context))
            .with_cancellation(self.cancellation.clone())
            .with_progress(self.progress.clone());

        for index in 0..self.steps.len() {
            if let Err(e) = self.steps[index].prepare(&step_context).await {
                error!(
                    node_id = %self.node_id,
                    step = self.steps[index].name(),
                    error = %e,
                    "❌ Failed to prepare node step"
                );
                self.finalize_steps().await;
                return Err(e);
            }
        }

        if !self.consumer.is_open() {
            if let Err(e) = self.consumer.open().await {
                self.finalize_steps().await;
                return Err(e);
            }
        }
        self.started = true;
        info!(
            node_id = %self.node_id,
            steps = self.steps.len(),
            "🚀 Processing node started"
        );
        Ok(())
    }

    /// Wait for every step's expected items, then finalize all steps
    ///
    /// Returns the first step failure; later steps are still awaited.
    pub async fn await_completion(&mut self) -> HarvesterResult<()> {
        if !self.started {
            return Err(HarvesterError::illegal_state("processing node is not started"));
        }

        let mut first_error = None;
        for step in self.steps.iter_mut() {
            if let Err(e) = step.execute().await {
                warn!(step = step.name(), error = %e, "Node step did not complete");
                first_error.get_or_insert(e);
            }
        }
        if let Some(e) = self.finalize_steps().await {
            first_error.get_or_insert(e);
        }
        self.started = false;

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Stop receiving and finalize any prepared step; registrations are kept
    pub async fn shutdown(&mut self) -> HarvesterResult<()> {
        self.consumer.close().await?;
        self.finalize_steps().await;
        self.started = false;
        info!(node_id = %self.node_id, "🛑 Processing node shut down");
        Ok(())
    }

    pub fn stats(&self) -> ConsumerStats {
        self.consumer.stats()
    }

    async fn finalize_steps(&mut self) -> Option<HarvesterError> {
        let mut first_error = None;
        for step in self.steps.iter_mut() {
            if let Err(e) = step.finalize().await {
                warn!(step = step.name(), error = %e, "Failed to finalize node step");
                first_error.get_or_insert(e);
            }
        }
        first_error
    }
}
