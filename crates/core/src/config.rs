use crate::error::{DecisionError, DecisionResult};
use crate::retry::RetryPolicy;
use serde::Deserialize;
use std::time::Duration;

/// Root client configuration. Loaded from environment variables
/// with the prefix `DECISION_SERVICE__`.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_client_id")]
    pub client_id: String,
    #[serde(default)]
    pub predictor: PredictorConfig,
    #[serde(default)]
    pub batching: BatchingConfig,
    #[serde(default)]
    pub upload: UploadConfig,
    #[serde(default)]
    pub refresh: RefreshConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PredictorConfig {
    /// Upper bound on simultaneously checked-out model workers.
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    /// Model file loaded at startup, if any.
    #[serde(default)]
    pub initial_model_path: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BatchingConfig {
    #[serde(default = "default_max_duration_ms")]
    pub max_duration_ms: u64,
    #[serde(default = "default_max_event_count")]
    pub max_event_count: usize,
    #[serde(default = "default_max_buffer_size_bytes")]
    pub max_buffer_size_bytes: usize,
    #[serde(default = "default_max_upload_queue_capacity")]
    pub max_upload_queue_capacity: usize,
    /// Sealed batches waiting for delivery before batching stalls.
    #[serde(default = "default_max_pending_batches")]
    pub max_pending_batches: usize,
    /// Fixed partition count; `None` partitions by raw key.
    #[serde(default)]
    pub partition_count: Option<u32>,
    /// Sent with every upload body as `"d"`.
    #[serde(default)]
    pub experimental_unit_duration_secs: Option<u64>,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub dropping: DroppingConfig,
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RetryKind {
    None,
    Fixed,
    Exponential,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_retry_kind")]
    pub policy: RetryKind,
    #[serde(default = "default_retry_base_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_retry_max_backoff_ms")]
    pub max_backoff_ms: u64,
    #[serde(default = "default_retry_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_jitter")]
    pub jitter: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DroppingConfig {
    /// Queue fill level (fraction of capacity) at which interactions start being dropped.
    #[serde(default = "default_max_queue_level_before_drop")]
    pub max_queue_level_before_drop: f32,
    #[serde(default)]
    pub probability_of_drop: f32,
    /// Replace a dropped interaction with a slim drop notice.
    #[serde(default)]
    pub emit_drop_notice: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UploadConfig {
    #[serde(default = "default_upload_endpoint")]
    pub endpoint: String,
    #[serde(default)]
    pub authorization_token: Option<String>,
    #[serde(default = "default_connection_timeout_ms")]
    pub connection_timeout_ms: u64,
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RefreshConfig {
    #[serde(default)]
    pub settings_url: Option<String>,
    #[serde(default)]
    pub model_url: Option<String>,
    #[serde(default = "default_poll_interval_ms")]
    pub settings_poll_interval_ms: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub model_poll_interval_ms: u64,
    #[serde(default = "default_connection_timeout_ms")]
    pub request_timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    /// Prometheus exporter port; disabled when unset.
    #[serde(default)]
    pub port: Option<u16>,
}

// Default functions
fn default_client_id() -> String {
    "decision-client".to_string()
}
fn default_max_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}
fn default_max_duration_ms() -> u64 {
    60_000
}
fn default_max_event_count() -> usize {
    10_000
}
fn default_max_buffer_size_bytes() -> usize {
    4 * 1024 * 1024
}
fn default_max_upload_queue_capacity() -> usize {
    1024
}
fn default_max_pending_batches() -> usize {
    16
}
fn default_retry_kind() -> RetryKind {
    RetryKind::Exponential
}
fn default_retry_base_ms() -> u64 {
    500
}
fn default_retry_max_backoff_ms() -> u64 {
    4000
}
fn default_retry_max_retries() -> u32 {
    3
}
fn default_retry_jitter() -> bool {
    true
}
fn default_max_queue_level_before_drop() -> f32 {
    1.0
}
fn default_upload_endpoint() -> String {
    "http://localhost:8080/join".to_string()
}
fn default_connection_timeout_ms() -> u64 {
    60_000
}
fn default_shutdown_grace_ms() -> u64 {
    5_000
}
fn default_poll_interval_ms() -> u64 {
    5_000
}

impl Default for PredictorConfig {
    fn default() -> Self {
        Self {
            max_workers: default_max_workers(),
            initial_model_path: None,
        }
    }
}

impl Default for BatchingConfig {
    fn default() -> Self {
        Self {
            max_duration_ms: default_max_duration_ms(),
            max_event_count: default_max_event_count(),
            max_buffer_size_bytes: default_max_buffer_size_bytes(),
            max_upload_queue_capacity: default_max_upload_queue_capacity(),
            max_pending_batches: default_max_pending_batches(),
            partition_count: None,
            experimental_unit_duration_secs: None,
            retry: RetryConfig::default(),
            dropping: DroppingConfig::default(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            policy: default_retry_kind(),
            base_delay_ms: default_retry_base_ms(),
            max_backoff_ms: default_retry_max_backoff_ms(),
            max_retries: default_retry_max_retries(),
            jitter: default_retry_jitter(),
        }
    }
}

impl Default for DroppingConfig {
    fn default() -> Self {
        Self {
            max_queue_level_before_drop: default_max_queue_level_before_drop(),
            probability_of_drop: 0.0,
            emit_drop_notice: false,
        }
    }
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            endpoint: default_upload_endpoint(),
            authorization_token: None,
            connection_timeout_ms: default_connection_timeout_ms(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
        }
    }
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            settings_url: None,
            model_url: None,
            settings_poll_interval_ms: default_poll_interval_ms(),
            model_poll_interval_ms: default_poll_interval_ms(),
            request_timeout_ms: default_connection_timeout_ms(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self { port: None }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            client_id: default_client_id(),
            predictor: PredictorConfig::default(),
            batching: BatchingConfig::default(),
            upload: UploadConfig::default(),
            refresh: RefreshConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl RetryConfig {
    pub fn to_policy(&self) -> RetryPolicy {
        match self.policy {
            RetryKind::None => RetryPolicy::None,
            RetryKind::Fixed => RetryPolicy::Fixed {
                delay: Duration::from_millis(self.base_delay_ms),
                max_retries: self.max_retries,
            },
            RetryKind::Exponential => RetryPolicy::Exponential {
                base: Duration::from_millis(self.base_delay_ms),
                max_backoff: Duration::from_millis(self.max_backoff_ms),
                max_retries: self.max_retries,
                jitter: self.jitter,
            },
        }
    }
}

impl BatchingConfig {
    pub fn max_duration(&self) -> Duration {
        Duration::from_millis(self.max_duration_ms)
    }

    /// Reject settings the pipeline cannot run with.
    pub fn validate(&self) -> DecisionResult<()> {
        if self.max_event_count == 0 {
            return Err(DecisionError::Config("max_event_count must be > 0".into()));
        }
        if self.max_buffer_size_bytes == 0 {
            return Err(DecisionError::Config(
                "max_buffer_size_bytes must be > 0".into(),
            ));
        }
        if self.max_duration_ms == 0 {
            return Err(DecisionError::Config("max_duration_ms must be > 0".into()));
        }
        if self.max_upload_queue_capacity == 0 || self.max_pending_batches == 0 {
            return Err(DecisionError::Config(
                "upload queue capacities must be > 0".into(),
            ));
        }
        if self.partition_count == Some(0) {
            return Err(DecisionError::Config("partition_count must be > 0".into()));
        }
        let d = &self.dropping;
        if !(0.0..=1.0).contains(&d.probability_of_drop)
            || !(0.0..=1.0).contains(&d.max_queue_level_before_drop)
        {
            return Err(DecisionError::Config(
                "dropping policy values must lie in [0, 1]".into(),
            ));
        }
        Ok(())
    }
}

impl AppConfig {
    /// Load configuration from environment variables.
    pub fn load() -> Result<Self, config::ConfigError> {
        let builder = config::Config::builder().add_source(
            config::Environment::with_prefix("DECISION_SERVICE")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_uploader_contract() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.batching.max_event_count, 10_000);
        assert_eq!(cfg.batching.max_buffer_size_bytes, 4 * 1024 * 1024);
        assert_eq!(cfg.batching.max_duration(), Duration::from_secs(60));
        assert_eq!(cfg.batching.max_upload_queue_capacity, 1024);
        assert!(cfg.predictor.max_workers >= 1);
        assert!(cfg.batching.validate().is_ok());
    }

    #[test]
    fn test_retry_config_to_policy() {
        let mut retry = RetryConfig::default();
        assert_eq!(retry.to_policy().max_retries(), 3);

        retry.policy = RetryKind::None;
        assert_eq!(retry.to_policy(), RetryPolicy::None);

        retry.policy = RetryKind::Fixed;
        retry.base_delay_ms = 100;
        assert_eq!(
            retry.to_policy(),
            RetryPolicy::Fixed {
                delay: Duration::from_millis(100),
                max_retries: 3
            }
        );
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut b = BatchingConfig::default();
        b.max_event_count = 0;
        assert!(matches!(b.validate(), Err(DecisionError::Config(_))));

        let mut b = BatchingConfig::default();
        b.dropping.probability_of_drop = 1.5;
        assert!(b.validate().is_err());

        let mut b = BatchingConfig::default();
        b.partition_count = Some(0);
        assert!(b.validate().is_err());
    }

    #[test]
    fn test_deserialize_partial_config() {
        let cfg: AppConfig = serde_json::from_str(
            r#"{"client_id":"edge-1","batching":{"max_event_count":50,"retry":{"policy":"fixed"}}}"#,
        )
        .unwrap();
        assert_eq!(cfg.client_id, "edge-1");
        assert_eq!(cfg.batching.max_event_count, 50);
        assert_eq!(cfg.batching.retry.policy, RetryKind::Fixed);
        assert_eq!(cfg.batching.max_upload_queue_capacity, 1024);
    }
}
