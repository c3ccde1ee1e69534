//! Hot-swappable pool of model workers.
//!
//! Model workers are not thread-safe, so every concurrent `predict` borrows
//! its own worker. The active [`ModelHandle`] is published through an
//! `ArcSwapOption` and read without locking; a caller captures it once and
//! keeps it for the whole prediction, so a concurrent swap never mixes
//! versions within one call. Workers carry the generation of the handle that
//! created them and are discarded instead of reused once that handle is
//! replaced.

use crate::handle::ModelHandle;
use arc_swap::ArcSwapOption;
use decision_core::error::{DecisionError, DecisionResult};
use decision_core::inference::{ModelEngine, ModelWorker};
use decision_core::types::{Action, ExplorerState};
use parking_lot::{Condvar, Mutex};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PredictorState {
    Uninitialized,
    Loaded,
    Disposed,
}

/// Result of one prediction.
#[derive(Debug, Clone, PartialEq)]
pub struct Prediction {
    pub action: Action,
    pub model_version: String,
    pub explorer_state: ExplorerState,
}

struct IdleWorker {
    generation: u64,
    worker: Box<dyn ModelWorker>,
}

#[derive(Default)]
struct Slots {
    idle: Vec<IdleWorker>,
    checked_out: usize,
}

pub struct PooledPredictor {
    engine: Arc<dyn ModelEngine>,
    active: ArcSwapOption<ModelHandle>,
    slots: Mutex<Slots>,
    available: Condvar,
    max_workers: usize,
    generation: AtomicU64,
    disposed: AtomicBool,
    update_lock: Mutex<()>,
}

impl PooledPredictor {
    pub fn new(engine: Arc<dyn ModelEngine>, max_workers: usize) -> Self {
        let max_workers = max_workers.max(1);
        info!(
            engine = engine.engine_name(),
            max_workers, "Pooled predictor created"
        );
        Self {
            engine,
            active: ArcSwapOption::from(None),
            slots: Mutex::new(Slots::default()),
            available: Condvar::new(),
            max_workers,
            generation: AtomicU64::new(0),
            disposed: AtomicBool::new(false),
            update_lock: Mutex::new(()),
        }
    }

    /// Predict with exploration enabled.
    pub fn predict(&self, context: &Value) -> DecisionResult<Prediction> {
        self.predict_with(context, true)
    }

    /// Borrow a worker bound to the active model and score `context`.
    /// Blocks the calling thread while all `max_workers` are checked out.
    pub fn predict_with(&self, context: &Value, explore: bool) -> DecisionResult<Prediction> {
        let handle = self.capture_handle()?;
        let start = Instant::now();

        let mut lease = self.checkout(&handle)?;
        let decision = lease.worker()?.predict(context, explore)?;
        drop(lease);

        metrics::histogram!("predictor.latency_us").record(start.elapsed().as_micros() as f64);
        metrics::counter!("predictor.predictions").increment(1);

        Ok(Prediction {
            action: decision.action,
            model_version: handle.version().to_string(),
            explorer_state: decision.explorer_state,
        })
    }

    /// Load `bytes` through the engine and make the result the active model.
    /// Returns the new model version. On failure the previous model stays active.
    pub fn update_model(&self, bytes: &[u8]) -> DecisionResult<String> {
        let _guard = self.update_lock.lock();
        if self.disposed.load(Ordering::Acquire) {
            return Err(DecisionError::PredictorDisposed);
        }

        let model = self.engine.load(bytes)?;
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        let handle = Arc::new(ModelHandle::new(model, bytes, generation));
        let warm = handle.model().create_worker()?;

        let previous = self.active.swap(Some(Arc::clone(&handle)));
        {
            let mut slots = self.slots.lock();
            let before = slots.idle.len();
            slots.idle.retain(|w| w.generation == generation);
            debug!(
                discarded = before - slots.idle.len(),
                "Discarded idle workers of replaced model"
            );
            slots.idle.push(IdleWorker { generation, worker: warm });
        }

        // A dispose that raced this update must win.
        if self.disposed.load(Ordering::Acquire) {
            self.active.store(None);
            self.slots.lock().idle.clear();
            return Err(DecisionError::PredictorDisposed);
        }

        metrics::counter!("predictor.model_updates").increment(1);
        info!(
            version = handle.version(),
            generation,
            size_bytes = handle.size_bytes(),
            loaded_at = %handle.loaded_at(),
            previous = previous.as_ref().map(|h| h.version()).unwrap_or("<none>"),
            "Model swapped"
        );
        Ok(handle.version().to_string())
    }

    /// Release idle workers and the active model. Idempotent.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.active.store(None);
        let mut slots = self.slots.lock();
        slots.idle.clear();
        self.available.notify_all();
        info!(checked_out = slots.checked_out, "Pooled predictor disposed");
    }

    pub fn state(&self) -> PredictorState {
        if self.disposed.load(Ordering::Acquire) {
            PredictorState::Disposed
        } else if self.active.load().is_some() {
            PredictorState::Loaded
        } else {
            PredictorState::Uninitialized
        }
    }

    pub fn current_version(&self) -> Option<String> {
        self.active.load().as_ref().map(|h| h.version().to_string())
    }

    pub fn max_workers(&self) -> usize {
        self.max_workers
    }

    pub fn idle_workers(&self) -> usize {
        self.slots.lock().idle.len()
    }

    pub fn checked_out(&self) -> usize {
        self.slots.lock().checked_out
    }

    fn capture_handle(&self) -> DecisionResult<Arc<ModelHandle>> {
        if self.disposed.load(Ordering::Acquire) {
            return Err(DecisionError::PredictorDisposed);
        }
        self.active.load_full().ok_or_else(|| {
            if self.disposed.load(Ordering::Acquire) {
                DecisionError::PredictorDisposed
            } else {
                DecisionError::ModelNotLoaded
            }
        })
    }

    fn checkout<'a>(&'a self, handle: &'a ModelHandle) -> DecisionResult<WorkerLease<'a>> {
        let mut slots = self.slots.lock();
        while slots.checked_out >= self.max_workers {
            if self.disposed.load(Ordering::Acquire) {
                return Err(DecisionError::PredictorDisposed);
            }
            self.available.wait(&mut slots);
        }
        if self.disposed.load(Ordering::Acquire) {
            return Err(DecisionError::PredictorDisposed);
        }

        // A caller holding a replaced handle must not consume workers of a
        // newer generation; only older ones are discarded.
        let generation = handle.generation();
        slots.idle.retain(|idle| idle.generation >= generation);
        let worker = slots
            .idle
            .iter()
            .rposition(|idle| idle.generation == generation)
            .map(|pos| slots.idle.swap_remove(pos).worker);
        slots.checked_out += 1;
        drop(slots);

        Ok(WorkerLease {
            pool: self,
            handle,
            worker,
        })
    }

    fn release(&self, generation: u64, worker: Option<Box<dyn ModelWorker>>) {
        let current = self.active.load().as_ref().map(|h| h.generation());
        let mut slots = self.slots.lock();
        slots.checked_out = slots.checked_out.saturating_sub(1);
        if let Some(worker) = worker {
            if !self.disposed.load(Ordering::Acquire) && current == Some(generation) {
                slots.idle.push(IdleWorker { generation, worker });
            }
        }
        self.available.notify_one();
    }
}

/// A checked-out worker slot. Returned to the pool on drop, panics included.
struct WorkerLease<'a> {
    pool: &'a PooledPredictor,
    handle: &'a ModelHandle,
    worker: Option<Box<dyn ModelWorker>>,
}

impl WorkerLease<'_> {
    fn worker(&mut self) -> DecisionResult<&mut Box<dyn ModelWorker>> {
        if self.worker.is_none() {
            debug!(generation = self.handle.generation(), "Creating model worker");
            self.worker = Some(self.handle.model().create_worker()?);
        }
        self.worker
            .as_mut()
            .ok_or_else(|| DecisionError::Inference("worker unavailable".into()))
    }
}

impl Drop for WorkerLease<'_> {
    fn drop(&mut self) {
        let mut worker = self.worker.take();
        if std::thread::panicking() {
            warn!(
                generation = self.handle.generation(),
                "Discarding worker after panic during prediction"
            );
            worker = None;
        }
        self.pool.release(self.handle.generation(), worker);
    }
}
