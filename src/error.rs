//! # Harvester Error Types
//!
//! Error taxonomy for the step-execution engine.
//!
//! Coordinator-path failures (`Read`, `Publish`, and processing on the stream
//! step) abort the running step. Node-side failures (`Decode`, `Processing`,
//! `Write`) are isolated to the handler that produced them and are recorded in
//! delivery statistics instead of stopping the stream.

use thiserror::Error;

use crate::messaging::MessagingError;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum HarvesterError {
    /// Missing run-context parameter, missing collaborator or unregistered destination
    #[error("Configuration error: {component}: {message}")]
    Configuration { component: String, message: String },

    #[error("Read error: {message}")]
    Read { message: String },

    #[error("Write error: {message}")]
    Write { message: String },

    #[error("Processing error: {message}")]
    Processing { message: String },

    #[error("Publish error: {message}")]
    Publish { message: String },

    #[error("Decode error for handler '{handler}': {message}")]
    Decode { handler: String, message: String },

    /// Lifecycle misuse, e.g. executing a step that was never prepared
    #[error("Illegal state: {message}")]
    IllegalState { message: String },

    #[error("Incomplete run: observed {observed} of {expected} expected items")]
    IncompleteRun { expected: u64, observed: u64 },

    #[error("Cancelled: {message}")]
    Cancelled { message: String },

    #[error("Messaging error: {0}")]
    Messaging(String),
}

impl HarvesterError {
    pub fn configuration(component: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Configuration {
            component: component.into(),
            message: message.into(),
        }
    }

    pub fn read(message: impl Into<String>) -> Self {
        Self::Read {
            message: message.into(),
        }
    }

    pub fn write(message: impl Into<String>) -> Self {
        Self::Write {
            message: message.into(),
        }
    }

    pub fn processing(message: impl Into<String>) -> Self {
        Self::Processing {
            message: message.into(),
        }
    }

    pub fn publish(message: impl Into<String>) -> Self {
        Self::Publish {
            message: message.into(),
        }
    }

    pub fn decode(handler: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Decode {
            handler: handler.into(),
            message: message.into(),
        }
    }

    pub fn illegal_state(message: impl Into<String>) -> Self {
        Self::IllegalState {
            message: message.into(),
        }
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::Cancelled {
            message: message.into(),
        }
    }

    /// Short machine-friendly name of the error kind, used in logs and job status
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Configuration { .. } => "configuration",
            Self::Read { .. } => "read",
            Self::Write { .. } => "write",
            Self::Processing { .. } => "processing",
            Self::Publish { .. } => "publish",
            Self::Decode { .. } => "decode",
            Self::IllegalState { .. } => "illegal_state",
            Self::IncompleteRun { .. } => "incomplete_run",
            Self::Cancelled { .. } => "cancelled",
            Self::Messaging(_) => "messaging",
        }
    }

    /// Whether the error is fatal for the whole run rather than for one item
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Configuration { .. }
                | Self::IllegalState { .. }
                | Self::IncompleteRun { .. }
                | Self::Cancelled { .. }
        )
    }
}

impl From<MessagingError> for HarvesterError {
    fn from(error: MessagingError) -> Self {
        HarvesterError::Messaging(error.to_string())
    }
}

impl From<crate::config::ConfigurationError> for HarvesterError {
    fn from(error: crate::config::ConfigurationError) -> Self {
        HarvesterError::configuration("config", error.to_string())
    }
}

pub type HarvesterResult<T> = Result<T, HarvesterError>;
