//! Decision client: local prediction plus fire-and-forget event logging.

use crate::refresh::{PollObserver, RefreshLoop};
use crate::sources::{ModelSource, SettingsSource};
use arc_swap::ArcSwap;
use decision_core::config::AppConfig;
use decision_core::error::{DecisionError, DecisionResult};
use decision_core::inference::ModelEngine;
use decision_core::types::{Action, ContextPayload, EventEnvelope, ExplorerState, Settings};
use decision_predictor::{PooledPredictor, PredictorState};
use decision_uploader::{
    EventTransport, ExplorerStateRegistry, ReliableUploader, UploadObserver, UploadStats, WireCodec,
};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

struct RefreshTask {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Chooses actions with the locally cached model and reports interactions
/// and outcomes to the aggregation endpoint.
pub struct DecisionClient {
    config: AppConfig,
    predictor: Arc<PooledPredictor>,
    uploader: ReliableUploader,
    settings: Arc<ArcSwap<Settings>>,
    refresh: Mutex<Option<RefreshTask>>,
}

impl DecisionClient {
    /// Must be called from within a Tokio runtime.
    pub fn new(
        config: AppConfig,
        engine: Arc<dyn ModelEngine>,
        transport: Arc<dyn EventTransport>,
        observer: Arc<dyn UploadObserver>,
    ) -> DecisionResult<Self> {
        Self::with_registry(
            config,
            engine,
            transport,
            observer,
            ExplorerStateRegistry::default(),
        )
    }

    /// As [`DecisionClient::new`], accepting custom explorer/mapper state names.
    pub fn with_registry(
        config: AppConfig,
        engine: Arc<dyn ModelEngine>,
        transport: Arc<dyn EventTransport>,
        observer: Arc<dyn UploadObserver>,
        registry: ExplorerStateRegistry,
    ) -> DecisionResult<Self> {
        let predictor = Arc::new(PooledPredictor::new(engine, config.predictor.max_workers));
        let codec = WireCodec::new(registry, config.batching.partition_count);
        let uploader = ReliableUploader::new(&config.batching, codec, transport, observer)?;

        info!(client_id = %config.client_id, "Decision client initialized");

        Ok(Self {
            config,
            predictor,
            uploader,
            settings: Arc::new(ArcSwap::from_pointee(Settings::default())),
            refresh: Mutex::new(None),
        })
    }

    /// Start polling the given sources on the configured intervals.
    /// Replaces a previously started loop.
    pub fn start_refresh(
        &self,
        model_source: Option<Arc<dyn ModelSource>>,
        settings_source: Option<Arc<dyn SettingsSource>>,
        observer: Arc<dyn PollObserver>,
    ) {
        let refresh = RefreshLoop {
            predictor: Arc::clone(&self.predictor),
            settings: Arc::clone(&self.settings),
            model_source,
            settings_source,
            observer,
            model_interval: Duration::from_millis(self.config.refresh.model_poll_interval_ms),
            settings_interval: Duration::from_millis(self.config.refresh.settings_poll_interval_ms),
            request_timeout: Duration::from_millis(self.config.refresh.request_timeout_ms),
        };
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(refresh.run(cancel.clone()));

        if let Some(previous) = self.refresh.lock().replace(RefreshTask { cancel, handle }) {
            previous.cancel.cancel();
        }
    }

    /// Pick an action for `context` and log the decision under `key`.
    /// Never waits on the network; a full upload queue only loses the event.
    pub fn choose_action(
        &self,
        key: &str,
        context: impl Into<ContextPayload>,
    ) -> DecisionResult<Action> {
        self.decide(key, context.into(), None)
    }

    /// Like [`choose_action`](Self::choose_action), but falls back to
    /// `default_action` (logged with probability 1) while no model is loaded.
    pub fn choose_action_or(
        &self,
        key: &str,
        context: impl Into<ContextPayload>,
        default_action: Action,
    ) -> DecisionResult<Action> {
        self.decide(key, context.into(), Some(default_action))
    }

    fn decide(
        &self,
        key: &str,
        context: ContextPayload,
        default_action: Option<Action>,
    ) -> DecisionResult<Action> {
        let features = context.to_value()?;
        let explore = self.settings.load().exploration_enabled;

        let (action, explorer_state, model_version) =
            match (self.predictor.predict_with(&features, explore), default_action) {
                (Ok(p), _) => (p.action, p.explorer_state, Some(p.model_version)),
                (Err(DecisionError::ModelNotLoaded), Some(default)) => {
                    debug!(key, "No model loaded, using default action");
                    metrics::counter!("client.default_actions").increment(1);
                    (default, ExplorerState::Probability(1.0), None)
                }
                (Err(e), _) => return Err(e),
            };

        let envelope =
            EventEnvelope::interaction(key, context, &action, explorer_state, model_version)?;
        if !self.uploader.try_upload(envelope) {
            metrics::counter!("client.interactions_lost").increment(1);
        }
        metrics::counter!("client.decisions").increment(1);
        Ok(action)
    }

    /// Log an outcome for an earlier decision. Returns whether it was queued.
    pub fn report_outcome(&self, key: &str, outcome: Value) -> bool {
        let accepted = self
            .uploader
            .try_upload(EventEnvelope::observation(key, outcome));
        if !accepted {
            metrics::counter!("client.observations_lost").increment(1);
            warn!(key, "Outcome not queued");
        }
        accepted
    }

    /// Log a numeric reward as `{"Reward": reward}`.
    pub fn report_reward(&self, key: &str, reward: f64) -> bool {
        self.report_outcome(key, json!({ "Reward": reward }))
    }

    /// Push a model directly, bypassing the refresh loop.
    pub fn update_model(&self, bytes: &[u8]) -> DecisionResult<String> {
        self.predictor.update_model(bytes)
    }

    pub fn settings(&self) -> Arc<Settings> {
        self.settings.load_full()
    }

    pub fn model_version(&self) -> Option<String> {
        self.predictor.current_version()
    }

    pub fn predictor_state(&self) -> PredictorState {
        self.predictor.state()
    }

    pub fn upload_stats(&self) -> UploadStats {
        self.uploader.stats()
    }

    /// Stop refreshing, drain the uploader within the configured grace
    /// period, then release the model. Safe to call more than once.
    pub async fn shutdown(&self) -> UploadStats {
        let refresh = self.refresh.lock().take();
        if let Some(task) = refresh {
            task.cancel.cancel();
            if let Err(e) = task.handle.await {
                error!(error = %e, "Refresh task failed");
            }
        }

        let grace = Duration::from_millis(self.config.upload.shutdown_grace_ms);
        let stats = self.uploader.shutdown(grace).await;
        self.predictor.dispose();

        info!(
            client_id = %self.config.client_id,
            delivered = stats.events_delivered,
            "Decision client shut down"
        );
        stats
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use decision_predictor::LinearPolicyEngine;
    use decision_uploader::{CaptureObserver, MemoryTransport};

    fn model_bytes() -> Vec<u8> {
        serde_json::to_vec(&json!({
            "version": "lin-1", "num_actions": 2, "feature_dim": 2,
            "weights": [[1.0, 0.0], [0.0, 1.0]], "epsilon": 0.5
        }))
        .unwrap()
    }

    fn client(transport: &Arc<MemoryTransport>) -> DecisionClient {
        DecisionClient::new(
            AppConfig::default(),
            Arc::new(LinearPolicyEngine),
            Arc::clone(transport) as Arc<dyn EventTransport>,
            Arc::new(CaptureObserver::new()),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_choose_action_requires_model() {
        let transport = Arc::new(MemoryTransport::new());
        let client = client(&transport);
        assert!(matches!(
            client.choose_action("k", json!({"features": [1.0, 0.0]})),
            Err(DecisionError::ModelNotLoaded)
        ));
        client.shutdown().await;
    }

    #[tokio::test]
    async fn test_default_action_before_model() {
        let transport = Arc::new(MemoryTransport::new());
        let client = client(&transport);
        let action = client
            .choose_action_or("k", json!({"features": [1.0, 0.0]}), Action::Single(7))
            .unwrap();
        assert_eq!(action, Action::Single(7));
        client.shutdown().await;

        let body: Value = serde_json::from_slice(&transport.sent()[0].1).unwrap();
        assert_eq!(body["j"][0]["p"], 1.0);
        assert_eq!(body["j"][0]["a"], 7);
        assert!(body["j"][0].get("stvw").is_none());
    }

    #[tokio::test]
    async fn test_exploration_follows_settings() {
        let transport = Arc::new(MemoryTransport::new());
        let client = client(&transport);
        client.update_model(&model_bytes()).unwrap();
        client.settings.store(Arc::new(Settings {
            exploration_enabled: false,
            ..Settings::default()
        }));

        for _ in 0..50 {
            let action = client
                .choose_action("k", json!({"features": [0.0, 1.0]}))
                .unwrap();
            assert_eq!(action, Action::Single(2));
        }
        client.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_disposes_and_is_idempotent() {
        let transport = Arc::new(MemoryTransport::new());
        let client = client(&transport);
        client.update_model(&model_bytes()).unwrap();
        client.report_reward("k", 1.0);

        let first = client.shutdown().await;
        let second = client.shutdown().await;
        assert_eq!(first, second);
        assert_eq!(first.events_delivered, 1);
        assert_eq!(client.predictor_state(), PredictorState::Disposed);
        assert!(!client.report_reward("k", 0.0));
        assert!(matches!(
            client.choose_action("k", json!({"features": [1.0]})),
            Err(DecisionError::PredictorDisposed)
        ));
    }
}
