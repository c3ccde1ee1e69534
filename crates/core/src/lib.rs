pub mod config;
pub mod error;
pub mod inference;
pub mod observer;
pub mod retry;
pub mod types;

pub use config::AppConfig;
pub use error::{DecisionError, DecisionResult};
pub use inference::{Decision, LoadedModel, ModelEngine, ModelWorker};
pub use retry::RetryPolicy;
pub use types::{Action, ContextPayload, EventEnvelope, EventKind, ExplorerState, MapperState, Settings};
