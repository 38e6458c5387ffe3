//! # Run Context
//!
//! Per-invocation parameters shared by every step of one job run.
//!
//! A `RunContext` is assembled once by the coordinator through
//! [`RunContextBuilder`], then frozen and handed to steps behind an `Arc`.
//! Probing a key that was never set is not an error; only steps that
//! *require* a parameter turn its absence into a configuration error.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{HarvesterError, HarvesterResult};

/// Named parameters a run may declare
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SharedParameter {
    /// Location of the Darwin Core archive (file or unpacked directory)
    DwcaPath,
    /// Extension inside the archive to read, e.g. "description"
    DwcaExtensionType,
    /// Identifier of the harvested resource
    ResourceId,
    /// Source file identifier used to tag harvested records
    SourceFileId,
    /// Free-form extraction mode selector
    ExtractionMode,
    /// Number of items a node-side step should expect for this run
    ExpectedRecordCount,
}

impl SharedParameter {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DwcaPath => "dwca_path",
            Self::DwcaExtensionType => "dwca_extension_type",
            Self::ResourceId => "resource_id",
            Self::SourceFileId => "source_file_id",
            Self::ExtractionMode => "extraction_mode",
            Self::ExpectedRecordCount => "expected_record_count",
        }
    }
}

impl std::fmt::Display for SharedParameter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Immutable parameter map for one job invocation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunContext {
    run_id: Uuid,
    parameters: BTreeMap<SharedParameter, Value>,
}

impl Default for RunContext {
    fn default() -> Self {
        Self::empty()
    }
}

impl RunContext {
    pub fn builder() -> RunContextBuilder {
        RunContextBuilder::default()
    }

    /// A context without parameters
    pub fn empty() -> Self {
        Self {
            run_id: Uuid::new_v4(),
            parameters: BTreeMap::new(),
        }
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn get(&self, key: SharedParameter) -> Option<&Value> {
        self.parameters.get(&key)
    }

    pub fn get_str(&self, key: SharedParameter) -> Option<&str> {
        self.get(key).and_then(Value::as_str)
    }

    /// Numeric lookup that also accepts numbers given as strings
    pub fn get_u64(&self, key: SharedParameter) -> Option<u64> {
        match self.get(key)? {
            Value::Number(n) => n.as_u64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn contains(&self, key: SharedParameter) -> bool {
        self.parameters.contains_key(&key)
    }

    /// Fetch a parameter that `component` cannot run without
    pub fn require(&self, key: SharedParameter, component: &str) -> HarvesterResult<&Value> {
        self.get(key).ok_or_else(|| {
            HarvesterError::configuration(
                component,
                format!("required run parameter '{key}' is missing"),
            )
        })
    }

    pub fn require_str(&self, key: SharedParameter, component: &str) -> HarvesterResult<&str> {
        self.require(key, component)?.as_str().ok_or_else(|| {
            HarvesterError::configuration(component, format!("run parameter '{key}' must be a string"))
        })
    }

    pub fn require_u64(&self, key: SharedParameter, component: &str) -> HarvesterResult<u64> {
        self.require(key, component)?;
        self.get_u64(key).ok_or_else(|| {
            HarvesterError::configuration(
                component,
                format!("run parameter '{key}' must be a non-negative integer"),
            )
        })
    }

    /// Parameters in key declaration order
    pub fn iter(&self) -> impl Iterator<Item = (&SharedParameter, &Value)> {
        self.parameters.iter()
    }

    pub fn len(&self) -> usize {
        self.parameters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parameters.is_empty()
    }
}

/// Builder used by the coordinator before any step runs
#[derive(Debug, Default)]
pub struct RunContextBuilder {
    run_id: Option<Uuid>,
    parameters: BTreeMap<SharedParameter, Value>,
}

impl RunContextBuilder {
    pub fn run_id(mut self, run_id: Uuid) -> Self {
        self.run_id = Some(run_id);
        self
    }

    /// Set a parameter, replacing any earlier value for the same key
    pub fn with(mut self, key: SharedParameter, value: impl Into<Value>) -> Self {
        self.parameters.insert(key, value.into());
        self
    }

    pub fn build(self) -> RunContext {
        RunContext {
            run_id: self.run_id.unwrap_or_else(Uuid::new_v4),
            parameters: self.parameters,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_and_lookup() {
        let context = RunContext::builder()
            .with(SharedParameter::DwcaPath, "src/test/resources/dwca-vascan-checklist")
            .with(SharedParameter::ExpectedRecordCount, 2)
            .build();

        assert_eq!(
            context.get_str(SharedParameter::DwcaPath),
            Some("src/test/resources/dwca-vascan-checklist")
        );
        assert_eq!(context.get_u64(SharedParameter::ExpectedRecordCount), Some(2));
        assert!(!context.contains(SharedParameter::ResourceId));
        assert_eq!(context.get(SharedParameter::ResourceId), None);
    }

    #[test]
    fn test_require_missing_parameter_is_configuration_error() {
        let context = RunContext::empty();
        let err = context
            .require(SharedParameter::DwcaPath, "dwca_reader")
            .unwrap_err();
        assert!(matches!(err, HarvesterError::Configuration { .. }));
        assert!(err.to_string().contains("dwca_path"));
    }

    #[test]
    fn test_numeric_strings_are_accepted() {
        let context = RunContext::builder()
            .with(SharedParameter::ExpectedRecordCount, " 12 ")
            .with(SharedParameter::ResourceId, "abc")
            .build();
        assert_eq!(
            context
                .require_u64(SharedParameter::ExpectedRecordCount, "node")
                .unwrap(),
            12
        );
        assert!(context.require_u64(SharedParameter::ResourceId, "node").is_err());
    }

    #[test]
    fn test_iteration_follows_declaration_order() {
        let context = RunContext::builder()
            .with(SharedParameter::ExpectedRecordCount, 3)
            .with(SharedParameter::DwcaPath, "/tmp/archive")
            .with(SharedParameter::ResourceId, 42)
            .build();

        let keys: Vec<SharedParameter> = context.iter().map(|(k, _)| *k).collect();
        assert_eq!(
            keys,
            vec![
                SharedParameter::DwcaPath,
                SharedParameter::ResourceId,
                SharedParameter::ExpectedRecordCount
            ]
        );
    }
}
