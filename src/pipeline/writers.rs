//! # Item Writers
//!
//! Writers are shared between concurrent handler invocations, so all state
//! sits behind locks.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncWriteExt, BufWriter};
use tracing::debug;

use crate::context::RunContext;
use crate::error::{HarvesterError, HarvesterResult};
use crate::pipeline::ItemWriter;

type FailurePredicate<T> = Box<dyn Fn(&T) -> bool + Send + Sync>;

/// Keeps every written item in memory
///
/// `failing_when` makes the writer reject matching items with a write error,
/// which is how node-side failure handling is exercised.
pub struct CollectingWriter<T> {
    items: Mutex<Vec<T>>,
    fail_when: Option<FailurePredicate<T>>,
    opened: AtomicBool,
    closed: AtomicBool,
}

impl<T> Default for CollectingWriter<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> CollectingWriter<T> {
    pub fn new() -> Self {
        Self {
            items: Mutex::new(Vec::new()),
            fail_when: None,
            opened: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    pub fn failing_when(mut self, predicate: impl Fn(&T) -> bool + Send + Sync + 'static) -> Self {
        self.fail_when = Some(Box::new(predicate));
        self
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }

    pub fn is_opened(&self) -> bool {
        self.opened.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl<T: Clone> CollectingWriter<T> {
    /// Items written so far, in write order
    pub fn content(&self) -> Vec<T> {
        self.items.lock().clone()
    }
}

#[async_trait]
impl<T> ItemWriter<T> for CollectingWriter<T>
where
    T: Send + 'static,
{
    async fn open(&self, _context: &RunContext) -> HarvesterResult<()> {
        self.opened.store(true, Ordering::SeqCst);
        self.closed.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn write(&self, item: T) -> HarvesterResult<()> {
        if let Some(predicate) = &self.fail_when {
            if predicate(&item) {
                return Err(HarvesterError::write("item rejected by collecting writer"));
            }
        }
        self.items.lock().push(item);
        Ok(())
    }

    async fn close(&self) -> HarvesterResult<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Appends one JSON document per line to a file
pub struct JsonLinesWriter {
    path: PathBuf,
    file: tokio::sync::Mutex<Option<BufWriter<File>>>,
}

impl JsonLinesWriter {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            file: tokio::sync::Mutex::new(None),
        }
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }

    pub fn shared(path: impl Into<PathBuf>) -> Arc<Self> {
        Arc::new(Self::new(path))
    }
}

#[async_trait]
impl<T> ItemWriter<T> for JsonLinesWriter
where
    T: Serialize + Send + 'static,
{
    async fn open(&self, _context: &RunContext) -> HarvesterResult<()> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|e| {
                HarvesterError::write(format!("cannot open {}: {e}", self.path.display()))
            })?;
        *self.file.lock().await = Some(BufWriter::new(file));
        debug!(path = %self.path.display(), "Opened JSON lines output");
        Ok(())
    }

    async fn write(&self, item: T) -> HarvesterResult<()> {
        let mut line = serde_json::to_vec(&item)
            .map_err(|e| HarvesterError::write(format!("cannot serialize item: {e}")))?;
        line.push(b'\n');

        let mut guard = self.file.lock().await;
        let file = guard
            .as_mut()
            .ok_or_else(|| HarvesterError::illegal_state("JSON lines writer is not open"))?;
        file.write_all(&line)
            .await
            .map_err(|e| HarvesterError::write(format!("{}: {e}", self.path.display())))
    }

    async fn close(&self) -> HarvesterResult<()> {
        if let Some(mut file) = self.file.lock().await.take() {
            file.flush()
                .await
                .map_err(|e| HarvesterError::write(format!("{}: {e}", self.path.display())))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_collecting_writer_keeps_order_and_rejects_on_demand() {
        let writer = CollectingWriter::new().failing_when(|value: &u32| *value == 2);
        ItemWriter::<u32>::open(&writer, &RunContext::empty()).await.unwrap();

        writer.write(1).await.unwrap();
        let err = writer.write(2).await.unwrap_err();
        assert!(matches!(err, HarvesterError::Write { .. }));
        writer.write(3).await.unwrap();

        ItemWriter::<u32>::close(&writer).await.unwrap();
        assert_eq!(writer.content(), vec![1, 3]);
        assert!(writer.is_opened());
        assert!(writer.is_closed());
    }

    #[tokio::test]
    async fn test_json_lines_writer_appends_documents() {
        let dir = tempfile::tempdir().unwrap();
        let writer = JsonLinesWriter::new(dir.path().join("out.jsonl"));

        ItemWriter::<serde_json::Value>::open(&writer, &RunContext::empty())
            .await
            .unwrap();
        writer.write(serde_json::json!({"id": "1"})).await.unwrap();
        writer.write(serde_json::json!({"id": "2"})).await.unwrap();
        ItemWriter::<serde_json::Value>::close(&writer).await.unwrap();

        let content = std::fs::read_to_string(writer.path()).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines, vec![r#"{"id":"1"}"#, r#"{"id":"2"}"#]);
    }

    #[tokio::test]
    async fn test_json_lines_write_before_open_fails() {
        let dir = tempfile::tempdir().unwrap();
        let writer = JsonLinesWriter::new(dir.path().join("out.jsonl"));
        let err = ItemWriter::<u32>::write(&writer, 1).await.unwrap_err();
        assert!(matches!(err, HarvesterError::IllegalState { .. }));
    }
}
