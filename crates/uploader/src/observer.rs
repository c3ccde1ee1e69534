//! Upload outcome callbacks.
//!
//! The uploader reports every batch exactly once: `on_success` when all of
//! its partition groups were accepted, `on_error` when it was given up.
//! `on_complete` fires once after the pipeline has drained.

use crate::wire::WireEvent;
use decision_core::error::DecisionError;
use decision_core::types::EventEnvelope;
use parking_lot::Mutex;
use std::sync::Arc;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// The transport rejected the batch permanently.
    Fatal,
    /// Every allowed attempt failed transiently.
    RetriesExhausted,
    /// Shutdown cancelled delivery before the batch went through.
    Cancelled,
    /// A single event could not be serialized and never reached a batch.
    Serialization,
}

/// A batch (or single event) the uploader gave up on. Carries the lost
/// content so the caller can inspect or re-submit it.
#[derive(Debug, Clone)]
pub struct UploadFailure {
    pub batch_id: Option<Uuid>,
    pub event_count: usize,
    pub attempts: u32,
    pub kind: FailureKind,
    pub error: Arc<DecisionError>,
    /// Serialized events of the abandoned batch, in submission order.
    /// Empty for serialization failures.
    pub events: Arc<[WireEvent]>,
    /// The envelope that could not be serialized.
    pub envelope: Option<Arc<EventEnvelope>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchSummary {
    pub batch_id: Uuid,
    pub event_count: usize,
    pub byte_size: usize,
    pub partitions: usize,
    pub attempts: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UploadStats {
    pub batches_delivered: u64,
    pub batches_failed: u64,
    pub events_delivered: u64,
    pub events_failed: u64,
    pub events_dropped: u64,
    pub retries: u64,
}

pub trait UploadObserver: Send + Sync {
    fn on_error(&self, _failure: &UploadFailure) {}
    fn on_success(&self, _summary: &BatchSummary) {}
    fn on_complete(&self, _stats: &UploadStats) {}
}

/// Observer that ignores everything.
pub struct NoOpObserver;

impl UploadObserver for NoOpObserver {}

/// Records every callback, for tests and diagnostics.
#[derive(Default)]
pub struct CaptureObserver {
    failures: Mutex<Vec<UploadFailure>>,
    successes: Mutex<Vec<BatchSummary>>,
    completions: Mutex<Vec<UploadStats>>,
}

impl CaptureObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failures(&self) -> Vec<UploadFailure> {
        self.failures.lock().clone()
    }

    pub fn successes(&self) -> Vec<BatchSummary> {
        self.successes.lock().clone()
    }

    pub fn completions(&self) -> Vec<UploadStats> {
        self.completions.lock().clone()
    }
}

impl UploadObserver for CaptureObserver {
    fn on_error(&self, failure: &UploadFailure) {
        self.failures.lock().push(failure.clone());
    }

    fn on_success(&self, summary: &BatchSummary) {
        self.successes.lock().push(summary.clone());
    }

    fn on_complete(&self, stats: &UploadStats) {
        self.completions.lock().push(*stats);
    }
}
