//! Engine-agnostic prediction abstraction.
//!
//! A [`ModelEngine`] turns model bytes into a [`LoadedModel`]; the loaded
//! model is shared and immutable, while each [`ModelWorker`] carries the
//! mutable, non-thread-safe scratch state needed to score one context at a
//! time. The predictor pool hands workers out to concurrent callers.

use crate::error::DecisionResult;
use crate::types::{Action, ExplorerState};
use serde_json::Value;
use std::sync::Arc;

/// Parses model bytes into a shareable model.
pub trait ModelEngine: Send + Sync {
    fn load(&self, bytes: &[u8]) -> DecisionResult<Arc<dyn LoadedModel>>;

    /// Engine name for metrics/logging.
    fn engine_name(&self) -> &str;
}

/// An immutable, loaded model.
pub trait LoadedModel: Send + Sync {
    /// Version the model declares for itself, if any.
    fn version(&self) -> Option<&str>;

    fn create_worker(&self) -> DecisionResult<Box<dyn ModelWorker>>;
}

/// Stateful scorer bound to one model. Used by one caller at a time.
pub trait ModelWorker: Send {
    /// Score `context`. With `explore == false` the worker must exploit.
    fn predict(&mut self, context: &Value, explore: bool) -> DecisionResult<Decision>;
}

/// Engine output for one context.
#[derive(Debug, Clone, PartialEq)]
pub struct Decision {
    pub action: Action,
    pub explorer_state: ExplorerState,
}
