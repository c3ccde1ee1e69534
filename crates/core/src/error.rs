use thiserror::Error;

pub type DecisionResult<T> = Result<T, DecisionError>;

#[derive(Error, Debug)]
pub enum DecisionError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("No model has been loaded")]
    ModelNotLoaded,

    #[error("Predictor has been disposed")]
    PredictorDisposed,

    #[error("Model loading error: {0}")]
    ModelLoad(String),

    #[error("Inference error: {0}")]
    Inference(String),

    #[error("Event batcher is closed")]
    BatcherClosed,

    #[error("Transient upload failure: {0}")]
    TransientUpload(String),

    #[error("Fatal upload failure: {0}")]
    FatalUpload(String),

    #[error("Upload abandoned after {attempts} attempts: {last_error}")]
    RetriesExhausted { attempts: u32, last_error: String },

    #[error("Upload cancelled by shutdown")]
    UploadCancelled,

    #[error("Unsupported explorer state: {0}")]
    UnsupportedExplorerState(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Poll failure ({target}): {message}")]
    Poll { target: String, message: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl DecisionError {
    /// Whether retrying the same upload may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, DecisionError::TransientUpload(_))
    }

    pub fn poll(target: impl Into<String>, message: impl Into<String>) -> Self {
        DecisionError::Poll {
            target: target.into(),
            message: message.into(),
        }
    }
}
