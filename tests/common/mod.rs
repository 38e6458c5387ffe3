//! Shared fixtures for the integration suites.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use harvester_core::messaging::ItemHandler;
use harvester_core::HarvesterResult;

pub const DESTINATION: &str = "harvester.items";

/// Darwin Core occurrence row as the delimited reader decodes it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Occurrence {
    pub id: String,
    #[serde(rename = "scientificname")]
    pub scientific_name: String,
    #[serde(rename = "countrycode", default)]
    pub country_code: Option<String>,
}

impl Occurrence {
    pub fn new(id: &str, scientific_name: &str, country_code: Option<&str>) -> Self {
        Self {
            id: id.to_string(),
            scientific_name: scientific_name.to_string(),
            country_code: country_code.map(str::to_string),
        }
    }
}

/// Handler that keeps every item it receives, in arrival order
pub struct RecordingHandler<T> {
    name: String,
    received: Mutex<Vec<T>>,
}

impl<T: Clone + Send + 'static> RecordingHandler<T> {
    pub fn new(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            received: Mutex::new(Vec::new()),
        })
    }

    pub fn received(&self) -> Vec<T> {
        self.received.lock().clone()
    }

    pub fn count(&self) -> usize {
        self.received.lock().len()
    }
}

#[async_trait]
impl<T: Clone + Send + Sync + 'static> ItemHandler<T> for RecordingHandler<T> {
    fn handler_name(&self) -> &str {
        &self.name
    }

    async fn ingest(&self, item: T) -> HarvesterResult<()> {
        self.received.lock().push(item);
        Ok(())
    }
}

/// Poll `condition` until it holds or two seconds pass
pub async fn eventually(condition: impl Fn() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}
