pub mod batcher;
pub mod observer;
pub mod partition;
pub mod transport;
pub mod uploader;
pub mod wire;

pub use batcher::{Batch, BatchLimits, EventBatcher};
pub use observer::{BatchSummary, CaptureObserver, FailureKind, NoOpObserver, UploadFailure, UploadObserver, UploadStats};
pub use transport::{EventTransport, HttpTransport, MemoryTransport, ScriptedOutcome};
pub use uploader::ReliableUploader;
pub use wire::{ExplorerStateRegistry, WireCodec, WireEvent};
