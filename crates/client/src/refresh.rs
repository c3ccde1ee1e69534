//! Background polling of the model and settings sources.

use crate::sources::{HttpModelSource, ModelFetch, ModelSource, SettingsSource};
use arc_swap::ArcSwap;
use decision_core::error::DecisionError;
use decision_core::observer::invoke_guarded;
use decision_core::types::Settings;
use decision_predictor::PooledPredictor;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollTarget {
    Model,
    Settings,
}

/// Refresh loop notifications. A failed poll leaves the previous model and
/// settings in place.
pub trait PollObserver: Send + Sync {
    fn on_poll_failure(&self, _target: PollTarget, _error: &DecisionError) {}
    fn on_model_updated(&self, _version: &str) {}
    fn on_settings_updated(&self, _settings: &Settings) {}
}

pub struct NoOpPollObserver;

impl PollObserver for NoOpPollObserver {}

pub(crate) struct RefreshLoop {
    pub predictor: Arc<PooledPredictor>,
    pub settings: Arc<ArcSwap<Settings>>,
    pub model_source: Option<Arc<dyn ModelSource>>,
    pub settings_source: Option<Arc<dyn SettingsSource>>,
    pub observer: Arc<dyn PollObserver>,
    pub model_interval: Duration,
    pub settings_interval: Duration,
    /// Timeout for a model source created from a settings-provided URI.
    pub request_timeout: Duration,
}

impl RefreshLoop {
    pub async fn run(mut self, cancel: CancellationToken) {
        let mut model_tick = tokio::time::interval(self.model_interval);
        model_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut settings_tick = tokio::time::interval(self.settings_interval);
        settings_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            model = self.model_source.is_some(),
            settings = self.settings_source.is_some(),
            "Refresh loop started"
        );

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = settings_tick.tick(), if self.settings_source.is_some() => {
                    if self.poll_settings(&cancel).await {
                        model_tick.reset_immediately();
                    }
                }
                _ = model_tick.tick(), if self.model_source.is_some() => {
                    self.poll_model(&cancel).await;
                }
            }
        }
        info!("Refresh loop stopped");
    }

    /// Returns true when the settings moved the model source to a new
    /// location.
    async fn poll_settings(&mut self, cancel: &CancellationToken) -> bool {
        let Some(source) = &self.settings_source else {
            return false;
        };
        let fetched = tokio::select! {
            biased;
            _ = cancel.cancelled() => return false,
            fetched = source.fetch_settings() => fetched,
        };
        let settings = match fetched {
            Ok(settings) => Arc::new(settings),
            Err(e) => {
                self.failed(PollTarget::Settings, e);
                return false;
            }
        };

        debug!(
            exploration_enabled = settings.exploration_enabled,
            "Settings refreshed"
        );
        let previous = self.settings.swap(Arc::clone(&settings));
        invoke_guarded("on_settings_updated", || {
            self.observer.on_settings_updated(&settings)
        });

        match &settings.model_uri {
            Some(uri) if previous.model_uri.as_ref() != Some(uri) => self.retarget(uri),
            _ => false,
        }
    }

    /// Point model polling at `uri`, creating an HTTP source if none exists.
    fn retarget(&mut self, uri: &str) -> bool {
        let changed = match &self.model_source {
            Some(source) => source.set_location(uri),
            None => HttpModelSource::new(uri, self.request_timeout).map(|source| {
                self.model_source = Some(Arc::new(source));
                true
            }),
        };
        match changed {
            Ok(changed) => {
                if changed {
                    info!(uri, "Model source follows settings");
                }
                changed
            }
            Err(e) => {
                self.failed(PollTarget::Settings, e);
                false
            }
        }
    }

    async fn poll_model(&self, cancel: &CancellationToken) {
        let Some(source) = &self.model_source else {
            return;
        };
        let fetched = tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            fetched = source.fetch_model() => fetched,
        };
        let bytes = match fetched {
            Ok(ModelFetch::Updated(bytes)) => bytes,
            Ok(ModelFetch::NotModified) => {
                debug!("Model not modified");
                return;
            }
            Err(e) => return self.failed(PollTarget::Model, e),
        };

        // Model parsing is CPU bound; keep it off the async workers.
        let predictor = Arc::clone(&self.predictor);
        let loaded = tokio::task::spawn_blocking(move || predictor.update_model(&bytes))
            .await
            .map_err(|e| DecisionError::ModelLoad(format!("model load task failed: {e}")))
            .and_then(|r| r);

        match loaded {
            Ok(version) => {
                metrics::counter!("client.model_refreshes").increment(1);
                invoke_guarded("on_model_updated", || self.observer.on_model_updated(&version));
            }
            Err(e) => self.failed(PollTarget::Model, e),
        }
    }

    fn failed(&self, target: PollTarget, error: DecisionError) {
        metrics::counter!("client.poll_failures").increment(1);
        warn!(target = ?target, error = %error, "Poll failed, keeping previous state");
        invoke_guarded("on_poll_failure", || self.observer.on_poll_failure(target, &error));
    }
}
