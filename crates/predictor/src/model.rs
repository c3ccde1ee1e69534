//! Built-in linear scoring engine.
//!
//! Scores every action as `weights · features + bias` and picks one with
//! epsilon-greedy exploration. The model file is JSON:
//!
//! ```json
//! {"version": "m1", "num_actions": 3, "feature_dim": 4,
//!  "weights": [[..4..], [..4..], [..4..]], "bias": [0, 0, 0], "epsilon": 0.1}
//! ```
//!
//! The context must carry a numeric `features` array. Shorter arrays are
//! zero-padded and longer ones truncated to `feature_dim`.

use decision_core::error::{DecisionError, DecisionResult};
use decision_core::inference::{Decision, LoadedModel, ModelEngine, ModelWorker};
use decision_core::types::{Action, ExplorerState};
use ndarray::{Array1, Array2};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use tracing::info;

#[derive(Debug, Deserialize)]
struct LinearModelFile {
    #[serde(default)]
    version: Option<String>,
    num_actions: usize,
    feature_dim: usize,
    weights: Vec<Vec<f32>>,
    #[serde(default)]
    bias: Vec<f32>,
    #[serde(default)]
    epsilon: f32,
    /// Emit a full ranking instead of a single action.
    #[serde(default)]
    ranking: bool,
}

/// Engine producing [`LinearPolicyModel`]s.
#[derive(Debug, Default, Clone, Copy)]
pub struct LinearPolicyEngine;

impl ModelEngine for LinearPolicyEngine {
    fn load(&self, bytes: &[u8]) -> DecisionResult<Arc<dyn LoadedModel>> {
        let model = LinearPolicyModel::from_bytes(bytes)?;
        Ok(Arc::new(model))
    }

    fn engine_name(&self) -> &str {
        "linear"
    }
}

/// Loaded weight matrix, one row per action.
pub struct LinearPolicyModel {
    version: Option<String>,
    weights: Array2<f32>,
    bias: Array1<f32>,
    epsilon: f32,
    ranking: bool,
}

impl LinearPolicyModel {
    pub fn from_bytes(bytes: &[u8]) -> DecisionResult<Self> {
        let file: LinearModelFile = serde_json::from_slice(bytes)
            .map_err(|e| DecisionError::ModelLoad(format!("invalid model file: {e}")))?;

        if file.num_actions == 0 || file.feature_dim == 0 {
            return Err(DecisionError::ModelLoad(
                "num_actions and feature_dim must be > 0".into(),
            ));
        }
        if file.weights.len() != file.num_actions
            || file.weights.iter().any(|row| row.len() != file.feature_dim)
        {
            return Err(DecisionError::ModelLoad(format!(
                "weights must be {}x{}",
                file.num_actions, file.feature_dim
            )));
        }
        if !(0.0..=1.0).contains(&file.epsilon) {
            return Err(DecisionError::ModelLoad("epsilon must lie in [0, 1]".into()));
        }

        let flat: Vec<f32> = file.weights.into_iter().flatten().collect();
        let weights = Array2::from_shape_vec((file.num_actions, file.feature_dim), flat)
            .map_err(|e| DecisionError::ModelLoad(e.to_string()))?;
        let bias = if file.bias.is_empty() {
            Array1::zeros(file.num_actions)
        } else if file.bias.len() == file.num_actions {
            Array1::from_vec(file.bias)
        } else {
            return Err(DecisionError::ModelLoad(format!(
                "bias must have {} entries",
                file.num_actions
            )));
        };

        info!(
            version = file.version.as_deref().unwrap_or("<digest>"),
            num_actions = file.num_actions,
            feature_dim = file.feature_dim,
            "Linear policy model loaded"
        );

        Ok(Self {
            version: file.version,
            weights,
            bias,
            epsilon: file.epsilon,
            ranking: file.ranking,
        })
    }

    pub fn num_actions(&self) -> usize {
        self.weights.nrows()
    }

    pub fn feature_dim(&self) -> usize {
        self.weights.ncols()
    }
}

impl LoadedModel for LinearPolicyModel {
    fn version(&self) -> Option<&str> {
        self.version.as_deref()
    }

    fn create_worker(&self) -> DecisionResult<Box<dyn ModelWorker>> {
        Ok(Box::new(LinearPolicyWorker {
            weights: self.weights.clone(),
            bias: self.bias.clone(),
            epsilon: self.epsilon,
            ranking: self.ranking,
            features: Array1::zeros(self.feature_dim()),
            rng: StdRng::from_entropy(),
        }))
    }
}

/// Per-caller scorer with its own feature buffer and RNG.
struct LinearPolicyWorker {
    weights: Array2<f32>,
    bias: Array1<f32>,
    epsilon: f32,
    ranking: bool,
    features: Array1<f32>,
    rng: StdRng,
}

impl LinearPolicyWorker {
    fn fill_features(&mut self, context: &Value) -> DecisionResult<()> {
        let raw = context
            .get("features")
            .and_then(Value::as_array)
            .ok_or_else(|| DecisionError::Inference("context has no `features` array".into()))?;

        self.features.fill(0.0);
        for (slot, value) in self.features.iter_mut().zip(raw) {
            *slot = value.as_f64().ok_or_else(|| {
                DecisionError::Inference(format!("non-numeric feature: {value}"))
            })? as f32;
        }
        Ok(())
    }
}

impl ModelWorker for LinearPolicyWorker {
    fn predict(&mut self, context: &Value, explore: bool) -> DecisionResult<Decision> {
        self.fill_features(context)?;
        let scores = self.weights.dot(&self.features) + &self.bias;
        let n = scores.len();

        let greedy = argmax(&scores);
        let epsilon = if explore { self.epsilon } else { 0.0 };
        let is_explore = epsilon > 0.0 && self.rng.gen::<f32>() < epsilon;
        let chosen = if is_explore {
            self.rng.gen_range(0..n)
        } else {
            greedy
        };

        let uniform = epsilon / n as f32;
        let probability = if chosen == greedy {
            1.0 - epsilon + uniform
        } else {
            uniform
        };

        // Actions are 1-based on the wire.
        let action = if self.ranking {
            let mut order: Vec<usize> = (0..n).filter(|&i| i != chosen).collect();
            order.sort_by(|&a, &b| scores[b].total_cmp(&scores[a]));
            Action::Ranking(
                std::iter::once(chosen)
                    .chain(order)
                    .map(|i| i as u32 + 1)
                    .collect(),
            )
        } else {
            Action::Single(chosen as u32 + 1)
        };

        Ok(Decision {
            action,
            explorer_state: ExplorerState::EpsilonGreedy {
                epsilon,
                is_explore,
                probability,
            },
        })
    }
}

fn argmax(scores: &Array1<f32>) -> usize {
    scores
        .iter()
        .enumerate()
        .fold((0, f32::NEG_INFINITY), |(best, best_score), (i, &s)| {
            if s > best_score {
                (i, s)
            } else {
                (best, best_score)
            }
        })
        .0
}
