//! # Item Pipeline Contracts
//!
//! Reader, processor and writer contracts used by steps, plus the
//! [`ProcessingStage`] that sits between reading and writing.
//!
//! Readers are driven by exactly one stream step and may take `&mut self`.
//! Writers are shared by concurrent handler invocations on a node, so they
//! take `&self` and use interior mutability.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::context::RunContext;
use crate::error::{HarvesterError, HarvesterResult};

pub mod processors;
pub mod readers;
pub mod writers;

pub use processors::FnProcessor;
pub use readers::{DelimitedFileReader, IterItemReader};
pub use writers::{CollectingWriter, JsonLinesWriter};

/// Anything that can travel over the bus
pub trait Item: Serialize + DeserializeOwned + Send + Sync + 'static {}

impl<T> Item for T where T: Serialize + DeserializeOwned + Send + Sync + 'static {}

/// Source of items on the coordinator side
#[async_trait]
pub trait ItemReader<T: Send>: Send {
    /// Acquire the underlying source; called once per run before any read
    async fn open(&mut self, _context: &RunContext) -> HarvesterResult<()> {
        Ok(())
    }

    /// Next item, or `None` once the source is exhausted
    async fn read_next(&mut self) -> HarvesterResult<Option<T>>;

    async fn close(&mut self) -> HarvesterResult<()> {
        Ok(())
    }
}

/// Item-to-item transformation
///
/// `process` must not depend on call order; it may be invoked concurrently
/// for different items on a node.
pub trait ItemProcessor<I, O>: Send + Sync {
    fn init(&mut self, _context: &RunContext) -> HarvesterResult<()> {
        Ok(())
    }

    fn process(&self, item: I, context: &RunContext) -> HarvesterResult<O>;

    fn destroy(&mut self) {}
}

/// Sink for items
#[async_trait]
pub trait ItemWriter<T: Send + 'static>: Send + Sync {
    async fn open(&self, _context: &RunContext) -> HarvesterResult<()> {
        Ok(())
    }

    async fn write(&self, item: T) -> HarvesterResult<()>;

    async fn close(&self) -> HarvesterResult<()> {
        Ok(())
    }
}

/// What a step does to an item between receiving and emitting it
pub enum ProcessingStage<I, O> {
    /// Forward unchanged; only constructible when input and output types agree
    Passthrough(fn(I) -> O),
    Process(Box<dyn ItemProcessor<I, O>>),
}

impl<T> ProcessingStage<T, T> {
    pub fn passthrough() -> Self {
        Self::Passthrough(std::convert::identity)
    }
}

impl<I, O> ProcessingStage<I, O> {
    pub fn processor(processor: impl ItemProcessor<I, O> + 'static) -> Self {
        Self::Process(Box::new(processor))
    }

    pub fn is_passthrough(&self) -> bool {
        matches!(self, Self::Passthrough(_))
    }

    pub fn init(&mut self, context: &RunContext) -> HarvesterResult<()> {
        match self {
            Self::Passthrough(_) => Ok(()),
            Self::Process(processor) => processor.init(context),
        }
    }

    /// Apply the stage; any failure surfaces as a processing error
    pub fn apply(&self, item: I, context: &RunContext) -> HarvesterResult<O> {
        match self {
            Self::Passthrough(forward) => Ok(forward(item)),
            Self::Process(processor) => processor.process(item, context).map_err(|e| match e {
                HarvesterError::Processing { .. } => e,
                other => HarvesterError::processing(other.to_string()),
            }),
        }
    }

    pub fn destroy(&mut self) {
        if let Self::Process(processor) = self {
            processor.destroy();
        }
    }
}

impl<I, O> std::fmt::Debug for ProcessingStage<I, O> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Passthrough(_) => write!(f, "ProcessingStage::Passthrough"),
            Self::Process(_) => write!(f, "ProcessingStage::Process(<dyn ItemProcessor>)"),
        }
    }
}
