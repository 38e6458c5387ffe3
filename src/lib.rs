#![allow(clippy::missing_errors_doc)] // Allow public functions without # Errors sections
#![allow(clippy::must_use_candidate)] // Allow methods without must_use when context is clear

//! # Harvester Core
//!
//! Distributed step-execution engine for bulk record harvesting.
//!
//! ## Overview
//!
//! A coordinator runs a [`Job`](job::Job): an ordered list of steps sharing a
//! [`RunContext`](context::RunContext). A [`StreamStep`](step::StreamStep)
//! reads records from a source and publishes each one to a message bus,
//! addressed by destination tags. Processing nodes run a
//! [`MessageBusConsumer`](messaging::MessageBusConsumer) that hands every
//! item to the [`AsyncStep`](step::AsyncStep)s whose tags match. Each async
//! step transforms and writes its items and reports completion once it has
//! written the number of items the run expects.
//!
//! ## Module Organization
//!
//! - [`context`] - Per-run shared parameters
//! - [`messaging`] - Envelopes, broker abstraction, bus writer and consumer
//! - [`pipeline`] - Reader, processor and writer contracts and implementations
//! - [`step`] - Step lifecycle, stream step, async step, completion counter
//! - [`job`] - Sequential step runner and status surface
//! - [`node`] - Consumer plus async steps on a processing node
//! - [`config`] - Layered configuration
//! - [`error`] - Structured error handling
//! - [`logging`] - Structured logging setup
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use harvester_core::context::{RunContext, SharedParameter};
//! use harvester_core::job::Job;
//! use harvester_core::messaging::{InMemoryBroker, MessageBusWriter};
//! use harvester_core::pipeline::DelimitedFileReader;
//! use harvester_core::step::StreamStep;
//!
//! # #[derive(serde::Serialize, serde::Deserialize)]
//! # struct Occurrence { id: String }
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let broker = Arc::new(InMemoryBroker::new());
//! let writer = MessageBusWriter::connect(broker, "harvester.items").await?;
//!
//! let mut stream = StreamStep::<Occurrence>::new("occurrence_stream");
//! stream.set_reader(DelimitedFileReader::new());
//! stream.set_writer(writer);
//! stream.add_destination("raw_occurrence");
//!
//! let context = RunContext::builder()
//!     .with(SharedParameter::DwcaPath, "/data/dwca-vascan")
//!     .build();
//! let report = Job::new("harvest").with_step(stream).do_job(context).await?;
//! println!("published {} records", report.items_published);
//! # Ok(())
//! # }
//! ```

pub mod cancellation;
pub mod config;
pub mod context;
pub mod error;
pub mod job;
pub mod logging;
pub mod messaging;
pub mod node;
pub mod pipeline;
pub mod step;

pub use cancellation::CancellationFlag;
pub use config::{ConfigManager, HarvesterConfig};
pub use context::{RunContext, SharedParameter};
pub use error::{HarvesterError, HarvesterResult};
pub use job::{Job, JobReport, JobState, JobStatusHandle};
pub use messaging::{
    Envelope, InMemoryBroker, ItemHandler, MessageBroker, MessageBusConsumer, MessageBusWriter,
    TagSet,
};
pub use node::ProcessingNode;
pub use step::{AsyncStep, Step, StepContext, StepState, StreamStep};
