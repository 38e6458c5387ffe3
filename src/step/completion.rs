//! # Completion Counter
//!
//! Counts successful writes of one async-step run against an expected total
//! and resolves a one-shot signal the moment the total is reached.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::cancellation::CancellationFlag;
use crate::error::{HarvesterError, HarvesterResult};

#[derive(Debug)]
pub struct CompletionCounter {
    expected: u64,
    count: AtomicU64,
    signal: Mutex<Option<oneshot::Sender<u64>>>,
    waiter: Mutex<Option<oneshot::Receiver<u64>>>,
}

impl CompletionCounter {
    /// An expected total of zero is resolved on creation
    pub fn new(expected: u64) -> Self {
        let (signal, waiter) = oneshot::channel();
        let counter = Self {
            expected,
            count: AtomicU64::new(0),
            signal: Mutex::new(Some(signal)),
            waiter: Mutex::new(Some(waiter)),
        };
        if expected == 0 {
            counter.resolve(0);
        }
        counter
    }

    pub fn expected(&self) -> u64 {
        self.expected
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::SeqCst)
    }

    pub fn is_resolved(&self) -> bool {
        self.signal.lock().is_none()
    }

    /// Record one successful write, returning the new count
    ///
    /// Exactly one caller observes the count equal to the expected total, and
    /// only that caller fires the signal.
    pub fn increment(&self) -> u64 {
        let current = self.count.fetch_add(1, Ordering::SeqCst) + 1;
        if current == self.expected {
            self.resolve(current);
        } else if current > self.expected {
            debug!(
                expected = self.expected,
                observed = current,
                "Completion counter exceeded expected total"
            );
        }
        current
    }

    fn resolve(&self, observed: u64) {
        if let Some(signal) = self.signal.lock().take() {
            // the waiter may be gone after a timeout
            let _ = signal.send(observed);
        }
    }

    /// Wait for the expected total, a timeout, or cancellation
    ///
    /// Only one caller may wait; a second call is an illegal-state error.
    pub async fn wait(
        &self,
        timeout: Duration,
        cancellation: &CancellationFlag,
    ) -> HarvesterResult<u64> {
        let waiter = self
            .waiter
            .lock()
            .take()
            .ok_or_else(|| HarvesterError::illegal_state("completion signal already awaited"))?;

        tokio::select! {
            outcome = tokio::time::timeout(timeout, waiter) => match outcome {
                Ok(Ok(observed)) => Ok(observed),
                Ok(Err(_)) => Err(HarvesterError::illegal_state("completion signal dropped")),
                Err(_) => {
                    let observed = self.count();
                    warn!(
                        expected = self.expected,
                        observed = observed,
                        timeout_ms = timeout.as_millis() as u64,
                        "⏰ Completion wait timed out"
                    );
                    Err(HarvesterError::IncompleteRun {
                        expected: self.expected,
                        observed,
                    })
                }
            },
            _ = cancellation.cancelled() => Err(HarvesterError::cancelled(format!(
                "cancelled after {} of {} items",
                self.count(),
                self.expected
            ))),
        }
    }
}
