//! Wire format for uploaded events.
//!
//! Each event is one JSON object:
//!
//! ```text
//! {"Version":"1","EventId":"<key>","TimeStamp":"<rfc3339>",
//!  "a":<action|outcome>,"c":<context>,
//!  "p":[..]|x  or  "<explorer>":{..},
//!  "<mapper>":{..},"pdrop":x}
//! ```
//!
//! Groups of events are wrapped as `{"i":"<batch id>","j":[..],"d":secs}`.

use crate::partition::partition_key;
use bytes::{Bytes, BytesMut};
use chrono::{DateTime, SecondsFormat, Utc};
use decision_core::error::{DecisionError, DecisionResult};
use decision_core::types::{ContextPayload, EventEnvelope, EventKind, ExplorerState, MapperState};
use serde::ser::{SerializeMap, Serializer};
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use serde_json::{Map, Value};
use std::collections::HashSet;
use uuid::Uuid;

const VERSION: &str = "1";
const FIELD_VERSION: &str = "Version";
const FIELD_EVENT_ID: &str = "EventId";
const FIELD_TIMESTAMP: &str = "TimeStamp";
const FIELD_VALUE: &str = "a";
const FIELD_CONTEXT: &str = "c";
const FIELD_PDROP: &str = "pdrop";

const RESERVED: &[&str] = &[
    FIELD_VERSION,
    FIELD_EVENT_ID,
    FIELD_TIMESTAMP,
    FIELD_VALUE,
    FIELD_CONTEXT,
    FIELD_PDROP,
    ExplorerState::PROBABILITY_FIELD,
    ExplorerState::EPSILON_GREEDY_ID,
    ExplorerState::TAU_FIRST_ID,
    MapperState::MODEL_ID,
];

#[derive(Serialize, Deserialize)]
struct EpsilonGreedyWire {
    e: f32,
    #[serde(rename = "isExplore")]
    is_explore: bool,
    p: f32,
}

#[derive(Serialize, Deserialize)]
struct TauFirstWire {
    t: u32,
    #[serde(rename = "isExplore")]
    is_explore: bool,
    p: f32,
}

#[derive(Serialize, Deserialize)]
struct ModelIdWire {
    m: String,
}

/// Names under which explorer and mapper state may be written.
#[derive(Debug, Clone)]
pub struct ExplorerStateRegistry {
    explorers: HashSet<String>,
    mappers: HashSet<String>,
}

impl Default for ExplorerStateRegistry {
    fn default() -> Self {
        Self {
            explorers: [ExplorerState::EPSILON_GREEDY_ID, ExplorerState::TAU_FIRST_ID]
                .into_iter()
                .map(String::from)
                .collect(),
            mappers: std::iter::once(MapperState::MODEL_ID.to_string()).collect(),
        }
    }
}

impl ExplorerStateRegistry {
    pub fn register_explorer(&mut self, type_id: impl Into<String>) -> DecisionResult<()> {
        let type_id = self.check_name(type_id.into())?;
        self.explorers.insert(type_id);
        Ok(())
    }

    pub fn register_mapper(&mut self, type_id: impl Into<String>) -> DecisionResult<()> {
        let type_id = self.check_name(type_id.into())?;
        self.mappers.insert(type_id);
        Ok(())
    }

    pub fn is_explorer(&self, type_id: &str) -> bool {
        self.explorers.contains(type_id)
    }

    pub fn is_mapper(&self, type_id: &str) -> bool {
        self.mappers.contains(type_id)
    }

    /// Built-in state names are reserved, and a name may belong to only
    /// one of the two sets.
    fn check_name(&self, type_id: String) -> DecisionResult<String> {
        if type_id.is_empty() || RESERVED.contains(&type_id.as_str()) {
            return Err(DecisionError::Config(format!(
                "`{type_id}` cannot be used as a state name"
            )));
        }
        if self.is_explorer(&type_id) || self.is_mapper(&type_id) {
            return Err(DecisionError::Config(format!(
                "`{type_id}` is already registered"
            )));
        }
        Ok(type_id)
    }
}

/// One serialized event ready for grouping and sending.
#[derive(Debug, Clone, PartialEq)]
pub struct WireEvent {
    pub key: String,
    pub partition_key: String,
    pub body: Bytes,
}

impl WireEvent {
    pub fn byte_size(&self) -> usize {
        self.body.len()
    }
}

/// Serializes envelopes and assigns partitions.
#[derive(Debug, Clone, Default)]
pub struct WireCodec {
    registry: ExplorerStateRegistry,
    partition_count: Option<u32>,
}

impl WireCodec {
    pub fn new(registry: ExplorerStateRegistry, partition_count: Option<u32>) -> Self {
        Self {
            registry,
            partition_count,
        }
    }

    pub fn partition_key(&self, key: &str) -> String {
        partition_key(key, self.partition_count)
    }

    /// Serialize one envelope. Fails with `UnsupportedExplorerState` for
    /// unregistered custom state names and `Serialization` for invalid
    /// pre-serialized context.
    pub fn transform_event(&self, envelope: &EventEnvelope) -> DecisionResult<WireEvent> {
        let mut buf = Vec::with_capacity(256);
        let mut ser = serde_json::Serializer::new(&mut buf);
        let mut map = (&mut ser).serialize_map(None)?;

        map.serialize_entry(FIELD_VERSION, VERSION)?;
        map.serialize_entry(FIELD_EVENT_ID, envelope.key())?;
        map.serialize_entry(
            FIELD_TIMESTAMP,
            &envelope
                .timestamp
                .to_rfc3339_opts(SecondsFormat::Millis, true),
        )?;
        if let Some(value) = &envelope.value {
            map.serialize_entry(FIELD_VALUE, value)?;
        }
        match &envelope.context {
            Some(ContextPayload::Json(v)) => map.serialize_entry(FIELD_CONTEXT, v)?,
            Some(ContextPayload::Serialized(s)) => {
                let raw = RawValue::from_string(s.clone())?;
                map.serialize_entry(FIELD_CONTEXT, &raw)?;
            }
            None => {}
        }

        if let Some(state) = &envelope.explorer_state {
            let name = state.field_name();
            match state {
                ExplorerState::Probabilities(p) => map.serialize_entry(name, p)?,
                ExplorerState::Probability(p) => map.serialize_entry(name, p)?,
                ExplorerState::EpsilonGreedy {
                    epsilon,
                    is_explore,
                    probability,
                } => map.serialize_entry(
                    name,
                    &EpsilonGreedyWire {
                        e: *epsilon,
                        is_explore: *is_explore,
                        p: *probability,
                    },
                )?,
                ExplorerState::TauFirst {
                    tau,
                    is_explore,
                    probability,
                } => map.serialize_entry(
                    name,
                    &TauFirstWire {
                        t: *tau,
                        is_explore: *is_explore,
                        p: *probability,
                    },
                )?,
                ExplorerState::Custom { type_id, state } => {
                    if !self.registry.is_explorer(type_id) {
                        return Err(DecisionError::UnsupportedExplorerState(type_id.clone()));
                    }
                    map.serialize_entry(name, state)?;
                }
            }
        }

        if let Some(mapper) = &envelope.mapper_state {
            match mapper {
                MapperState::ModelId(m) => {
                    map.serialize_entry(mapper.field_name(), &ModelIdWire { m: m.clone() })?
                }
                MapperState::Custom { type_id, state } => {
                    if !self.registry.is_mapper(type_id) {
                        return Err(DecisionError::UnsupportedExplorerState(type_id.clone()));
                    }
                    map.serialize_entry(type_id, state)?;
                }
            }
        }

        if let Some(pdrop) = envelope.probability_of_drop {
            map.serialize_entry(FIELD_PDROP, &pdrop)?;
        }
        map.end()?;

        Ok(WireEvent {
            key: envelope.key().to_string(),
            partition_key: self.partition_key(envelope.key()),
            body: Bytes::from(buf),
        })
    }

    /// Recover an envelope from one serialized event.
    pub fn decode_wire_event(&self, bytes: &[u8]) -> DecisionResult<EventEnvelope> {
        let mut obj: Map<String, Value> = serde_json::from_slice(bytes)?;

        let key = match obj.remove(FIELD_EVENT_ID) {
            Some(Value::String(k)) => k,
            _ => return Err(malformed("wire event has no EventId")),
        };
        let timestamp = obj
            .remove(FIELD_TIMESTAMP)
            .and_then(|v| v.as_str().map(str::to_string))
            .map(|s| DateTime::parse_from_rfc3339(&s).map(|t| t.with_timezone(&Utc)))
            .transpose()
            .map_err(|e| malformed(format!("bad TimeStamp: {e}")))?;

        let value = obj.remove(FIELD_VALUE);
        let context = obj.remove(FIELD_CONTEXT).map(ContextPayload::Json);
        let probability_of_drop = obj
            .remove(FIELD_PDROP)
            .and_then(|v| v.as_f64())
            .map(|p| p as f32);

        let mut explorer_state = match obj.remove(ExplorerState::PROBABILITY_FIELD) {
            Some(Value::Array(items)) => Some(ExplorerState::Probabilities(
                items
                    .iter()
                    .filter_map(Value::as_f64)
                    .map(|p| p as f32)
                    .collect(),
            )),
            Some(Value::Number(n)) => n.as_f64().map(|p| ExplorerState::Probability(p as f32)),
            _ => None,
        };
        let mut mapper_state = None;

        for (name, state) in obj {
            if name == FIELD_VERSION {
                continue;
            }
            if name == ExplorerState::EPSILON_GREEDY_ID {
                let w: EpsilonGreedyWire = serde_json::from_value(state)?;
                explorer_state = Some(ExplorerState::EpsilonGreedy {
                    epsilon: w.e,
                    is_explore: w.is_explore,
                    probability: w.p,
                });
            } else if name == ExplorerState::TAU_FIRST_ID {
                let w: TauFirstWire = serde_json::from_value(state)?;
                explorer_state = Some(ExplorerState::TauFirst {
                    tau: w.t,
                    is_explore: w.is_explore,
                    probability: w.p,
                });
            } else if name == MapperState::MODEL_ID {
                let w: ModelIdWire = serde_json::from_value(state)?;
                mapper_state = Some(MapperState::ModelId(w.m));
            } else if self.registry.is_explorer(&name) {
                explorer_state = Some(ExplorerState::Custom {
                    type_id: name,
                    state,
                });
            } else if self.registry.is_mapper(&name) {
                mapper_state = Some(MapperState::Custom {
                    type_id: name,
                    state,
                });
            } else {
                return Err(DecisionError::UnsupportedExplorerState(name));
            }
        }

        let kind = if explorer_state.is_some() {
            EventKind::Interaction
        } else if value.is_some() {
            EventKind::Observation
        } else {
            EventKind::Drop
        };

        let mut envelope = EventEnvelope::new(key, kind);
        if let Some(ts) = timestamp {
            envelope = envelope.with_timestamp(ts);
        }
        envelope.value = value;
        envelope.context = context;
        envelope.model_version = match &mapper_state {
            Some(MapperState::ModelId(m)) => Some(m.clone()),
            _ => None,
        };
        envelope.explorer_state = explorer_state;
        envelope.mapper_state = mapper_state;
        envelope.probability_of_drop = probability_of_drop;
        Ok(envelope)
    }
}

fn malformed(msg: impl std::fmt::Display) -> DecisionError {
    DecisionError::Serialization(serde::de::Error::custom(msg))
}

/// Wrap serialized events into one upload body.
pub fn encode_batch_body<'a>(
    batch_id: Uuid,
    events: impl IntoIterator<Item = &'a WireEvent>,
    experimental_unit_secs: Option<u64>,
) -> Bytes {
    let mut buf = BytesMut::with_capacity(1024);
    buf.extend_from_slice(b"{\"i\":\"");
    buf.extend_from_slice(batch_id.hyphenated().to_string().as_bytes());
    buf.extend_from_slice(b"\",\"j\":[");
    for (i, event) in events.into_iter().enumerate() {
        if i > 0 {
            buf.extend_from_slice(b",");
        }
        buf.extend_from_slice(&event.body);
    }
    buf.extend_from_slice(b"]");
    if let Some(d) = experimental_unit_secs {
        buf.extend_from_slice(format!(",\"d\":{d}").as_bytes());
    }
    buf.extend_from_slice(b"}");
    buf.freeze()
}
