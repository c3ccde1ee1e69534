use chrono::{DateTime, Utc};
use decision_core::inference::LoadedModel;
use sha2::{Digest, Sha256};
use std::fmt;
use std::sync::Arc;

/// Immutable snapshot of one loaded model. Workers are bound to the
/// generation of the handle that created them.
pub struct ModelHandle {
    model: Arc<dyn LoadedModel>,
    version: String,
    generation: u64,
    loaded_at: DateTime<Utc>,
    size_bytes: usize,
}

impl ModelHandle {
    /// Wrap a loaded model. Models that do not declare a version are
    /// identified by a digest of their bytes.
    pub fn new(model: Arc<dyn LoadedModel>, bytes: &[u8], generation: u64) -> Self {
        let version = model
            .version()
            .map(str::to_string)
            .unwrap_or_else(|| digest_version(bytes));
        Self {
            model,
            version,
            generation,
            loaded_at: Utc::now(),
            size_bytes: bytes.len(),
        }
    }

    pub fn model(&self) -> &Arc<dyn LoadedModel> {
        &self.model
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn loaded_at(&self) -> DateTime<Utc> {
        self.loaded_at
    }

    pub fn size_bytes(&self) -> usize {
        self.size_bytes
    }
}

impl fmt::Debug for ModelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelHandle")
            .field("version", &self.version)
            .field("generation", &self.generation)
            .field("loaded_at", &self.loaded_at)
            .field("size_bytes", &self.size_bytes)
            .finish()
    }
}

/// First 8 bytes of the SHA-256 of `bytes`, hex encoded.
pub fn digest_version(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    hex::encode(&digest[..8])
}
