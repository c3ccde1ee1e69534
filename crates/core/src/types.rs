use crate::error::{DecisionError, DecisionResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// What an envelope records.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// A decision: context, chosen action and exploration metadata.
    Interaction,
    /// An outcome or reward reported against an earlier decision.
    Observation,
    /// Notice that an interaction was discarded under load.
    Drop,
}

/// Action chosen by a policy. Actions are 1-based.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Action {
    Single(u32),
    Ranking(Vec<u32>),
}

/// Context carried by an interaction.
#[derive(Debug, Clone, PartialEq)]
pub enum ContextPayload {
    /// Structured JSON, serialized as-is.
    Json(Value),
    /// Already-serialized JSON text, passed through raw on the wire.
    Serialized(String),
}

impl ContextPayload {
    /// Structured view of the context for feeding a model.
    pub fn to_value(&self) -> DecisionResult<Value> {
        match self {
            ContextPayload::Json(v) => Ok(v.clone()),
            ContextPayload::Serialized(s) => Ok(serde_json::from_str(s)?),
        }
    }
}

impl From<Value> for ContextPayload {
    fn from(v: Value) -> Self {
        ContextPayload::Json(v)
    }
}

/// Exploration metadata: enough to compute an unbiased reward estimate offline.
#[derive(Debug, Clone, PartialEq)]
pub enum ExplorerState {
    /// Per-action probability vector, emitted as `"p": [..]`.
    Probabilities(Vec<f32>),
    /// Probability of the chosen action, emitted as `"p": x`.
    Probability(f32),
    /// Epsilon-greedy state, emitted under `steg`.
    EpsilonGreedy {
        epsilon: f32,
        is_explore: bool,
        probability: f32,
    },
    /// Tau-first state, emitted under `sttf`.
    TauFirst {
        tau: u32,
        is_explore: bool,
        probability: f32,
    },
    /// Any other explorer. `type_id` is the wire field name and must be registered.
    Custom { type_id: String, state: Value },
}

impl ExplorerState {
    pub const EPSILON_GREEDY_ID: &'static str = "steg";
    pub const TAU_FIRST_ID: &'static str = "sttf";
    pub const PROBABILITY_FIELD: &'static str = "p";

    /// Name of the wire field this state is written under.
    pub fn field_name(&self) -> &str {
        match self {
            ExplorerState::Probabilities(_) | ExplorerState::Probability(_) => {
                Self::PROBABILITY_FIELD
            }
            ExplorerState::EpsilonGreedy { .. } => Self::EPSILON_GREEDY_ID,
            ExplorerState::TauFirst { .. } => Self::TAU_FIRST_ID,
            ExplorerState::Custom { type_id, .. } => type_id,
        }
    }
}

/// Model/mapper-specific state that travels with an interaction.
#[derive(Debug, Clone, PartialEq)]
pub enum MapperState {
    /// Id of the model that scored the context, emitted under `stvw`.
    ModelId(String),
    Custom { type_id: String, state: Value },
}

impl MapperState {
    pub const MODEL_ID: &'static str = "stvw";

    pub fn field_name(&self) -> &str {
        match self {
            MapperState::ModelId(_) => Self::MODEL_ID,
            MapperState::Custom { type_id, .. } => type_id,
        }
    }
}

/// One logged fact ready for transport.
#[derive(Debug, Clone, PartialEq)]
pub struct EventEnvelope {
    key: String,
    pub kind: EventKind,
    pub timestamp: DateTime<Utc>,
    /// Action for interactions, outcome for observations.
    pub value: Option<Value>,
    pub context: Option<ContextPayload>,
    pub explorer_state: Option<ExplorerState>,
    pub mapper_state: Option<MapperState>,
    pub model_version: Option<String>,
    pub probability_of_drop: Option<f32>,
}

impl EventEnvelope {
    pub fn new(key: impl Into<String>, kind: EventKind) -> Self {
        Self {
            key: key.into(),
            kind,
            timestamp: Utc::now(),
            value: None,
            context: None,
            explorer_state: None,
            mapper_state: None,
            model_version: None,
            probability_of_drop: None,
        }
    }

    pub fn interaction(
        key: impl Into<String>,
        context: ContextPayload,
        action: &Action,
        explorer_state: ExplorerState,
        model_version: Option<String>,
    ) -> DecisionResult<Self> {
        let mut envelope = Self::new(key, EventKind::Interaction);
        envelope.value = Some(serde_json::to_value(action)?);
        envelope.context = Some(context);
        envelope.explorer_state = Some(explorer_state);
        envelope.mapper_state = model_version.clone().map(MapperState::ModelId);
        envelope.model_version = model_version;
        Ok(envelope)
    }

    pub fn observation(key: impl Into<String>, outcome: Value) -> Self {
        let mut envelope = Self::new(key, EventKind::Observation);
        envelope.value = Some(outcome);
        envelope
    }

    /// Slim notice replacing an interaction discarded with `probability_of_drop`.
    pub fn drop_notice(key: impl Into<String>, probability_of_drop: f32) -> Self {
        let mut envelope = Self::new(key, EventKind::Drop);
        envelope.probability_of_drop = Some(probability_of_drop);
        envelope
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }
}

/// Application settings published by the settings source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    #[serde(rename = "TrainArguments", default)]
    pub train_arguments: String,
    #[serde(rename = "IsExplorationEnabled", default = "default_exploration_enabled")]
    pub exploration_enabled: bool,
    #[serde(rename = "ModelBlobUri", default)]
    pub model_uri: Option<String>,
    /// Fields this client does not interpret.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

fn default_exploration_enabled() -> bool {
    true
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            train_arguments: String::new(),
            exploration_enabled: default_exploration_enabled(),
            model_uri: None,
            extra: serde_json::Map::new(),
        }
    }
}

impl Settings {
    pub fn from_slice(bytes: &[u8]) -> DecisionResult<Self> {
        serde_json::from_slice(bytes).map_err(DecisionError::from)
    }
}
