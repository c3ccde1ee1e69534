//! Count/size/time bounded batching.
//!
//! [`EventBatcher`] is a synchronous buffer: every call returns the batches it
//! sealed, and the async driver sleeps until [`EventBatcher::deadline`] to
//! fire the time trigger. A batch never exceeds `max_buffer_size_bytes`
//! unless it holds a single item.

use decision_core::error::{DecisionError, DecisionResult};
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchLimits {
    pub max_event_count: usize,
    pub max_buffer_size_bytes: usize,
    pub max_duration: Duration,
}

impl From<&decision_core::config::BatchingConfig> for BatchLimits {
    fn from(config: &decision_core::config::BatchingConfig) -> Self {
        Self {
            max_event_count: config.max_event_count.max(1),
            max_buffer_size_bytes: config.max_buffer_size_bytes.max(1),
            max_duration: config.max_duration(),
        }
    }
}

/// A sealed, ordered group of items delivered in one upload.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch<T> {
    pub id: Uuid,
    pub items: Vec<T>,
    pub byte_size: usize,
}

impl<T> Batch<T> {
    fn new(items: Vec<T>, byte_size: usize) -> Self {
        Self {
            id: Uuid::new_v4(),
            items,
            byte_size,
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

type SizeFn<T> = Box<dyn Fn(&T) -> usize + Send + Sync>;

pub struct EventBatcher<T> {
    limits: BatchLimits,
    size_of: SizeFn<T>,
    open: Vec<T>,
    open_bytes: usize,
    opened_at: Option<Instant>,
    closed: bool,
}

impl<T> EventBatcher<T> {
    pub fn new(limits: BatchLimits, size_of: impl Fn(&T) -> usize + Send + Sync + 'static) -> Self {
        Self {
            limits,
            size_of: Box::new(size_of),
            open: Vec::new(),
            open_bytes: 0,
            opened_at: None,
            closed: false,
        }
    }

    pub fn append(&mut self, item: T) -> DecisionResult<Vec<Batch<T>>> {
        self.append_at(item, Instant::now())
    }

    /// Append `item` as of `now`, returning every batch sealed by it.
    pub fn append_at(&mut self, item: T, now: Instant) -> DecisionResult<Vec<Batch<T>>> {
        if self.closed {
            return Err(DecisionError::BatcherClosed);
        }

        let mut sealed = Vec::new();
        sealed.extend(self.take_expired(now));

        let size = (self.size_of)(&item);
        if size > self.limits.max_buffer_size_bytes {
            sealed.extend(self.seal());
            sealed.push(Batch::new(vec![item], size));
            return Ok(sealed);
        }
        if self.open_bytes + size > self.limits.max_buffer_size_bytes {
            sealed.extend(self.seal());
        }

        if self.open.is_empty() {
            self.opened_at = Some(now);
        }
        self.open.push(item);
        self.open_bytes += size;

        if self.open.len() >= self.limits.max_event_count
            || self.open_bytes >= self.limits.max_buffer_size_bytes
        {
            sealed.extend(self.seal());
        }
        Ok(sealed)
    }

    /// Seal the open batch, if any.
    pub fn flush(&mut self) -> Option<Batch<T>> {
        self.seal()
    }

    /// Flush and reject further appends.
    pub fn close(&mut self) -> Option<Batch<T>> {
        self.closed = true;
        self.seal()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// When the open batch hits its time limit.
    pub fn deadline(&self) -> Option<Instant> {
        self.opened_at.map(|t| t + self.limits.max_duration)
    }

    pub fn take_expired(&mut self, now: Instant) -> Option<Batch<T>> {
        match self.deadline() {
            Some(deadline) if deadline <= now => self.seal(),
            _ => None,
        }
    }

    pub fn pending(&self) -> usize {
        self.open.len()
    }

    fn seal(&mut self) -> Option<Batch<T>> {
        self.opened_at = None;
        if self.open.is_empty() {
            return None;
        }
        let items = std::mem::take(&mut self.open);
        let bytes = std::mem::replace(&mut self.open_bytes, 0);
        Some(Batch::new(items, bytes))
    }
}

impl<T> fmt::Debug for EventBatcher<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBatcher")
            .field("limits", &self.limits)
            .field("pending", &self.open.len())
            .field("pending_bytes", &self.open_bytes)
            .field("closed", &self.closed)
            .finish()
    }
}
