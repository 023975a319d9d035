use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use task_queue_core::Metadata;

const DEFAULT_AGENT: &str = "unknown";
const DEFAULT_ACTION: &str = "execute";

/// What an orchestration task asks an agent to do.
///
/// Producers always write `Structured`, stored as the JSON object
/// `{"action", "agent", "payload"}`. Payloads that are not a JSON object
/// decode as `Raw`, taking agent and action from the task metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskEnvelope {
    Structured {
        agent: String,
        action: String,
        payload: Map<String, Value>,
    },
    Raw {
        agent: String,
        action: String,
        raw: String,
    },
}

impl TaskEnvelope {
    pub fn new(
        agent: impl Into<String>,
        action: impl Into<String>,
        payload: Map<String, Value>,
    ) -> Self {
        TaskEnvelope::Structured {
            agent: agent.into(),
            action: action.into(),
            payload,
        }
    }

    pub fn agent(&self) -> &str {
        match self {
            TaskEnvelope::Structured { agent, .. } | TaskEnvelope::Raw { agent, .. } => agent,
        }
    }

    pub fn action(&self) -> &str {
        match self {
            TaskEnvelope::Structured { action, .. } | TaskEnvelope::Raw { action, .. } => action,
        }
    }

    /// Arguments as an object; raw payloads appear under `"raw"`
    pub fn payload(&self) -> Map<String, Value> {
        match self {
            TaskEnvelope::Structured { payload, .. } => payload.clone(),
            TaskEnvelope::Raw { raw, .. } => {
                let mut payload = Map::new();
                payload.insert("raw".to_string(), Value::String(raw.clone()));
                payload
            }
        }
    }

    /// Metadata tags written alongside the payload
    pub fn metadata(&self) -> Metadata {
        let mut metadata = Metadata::new();
        metadata.insert("agent".to_string(), self.agent().to_string());
        metadata.insert("action".to_string(), self.action().to_string());
        metadata
    }

    /// Payload string stored on the task
    pub fn encode(&self) -> String {
        match self {
            TaskEnvelope::Structured {
                agent,
                action,
                payload,
            } => {
                // serde_json maps keep keys sorted, so the output is canonical
                let mut object = Map::new();
                object.insert("agent".to_string(), Value::String(agent.clone()));
                object.insert("action".to_string(), Value::String(action.clone()));
                object.insert("payload".to_string(), Value::Object(payload.clone()));
                Value::Object(object).to_string()
            }
            TaskEnvelope::Raw { raw, .. } => raw.clone(),
        }
    }

    /// Read a stored payload back. Never fails.
    pub fn decode(payload: &str, metadata: &Metadata) -> Self {
        let tag = |key: &str, default: &str| {
            metadata
                .get(key)
                .cloned()
                .unwrap_or_else(|| default.to_string())
        };

        let mut object = match serde_json::from_str::<Value>(payload) {
            Ok(Value::Object(object)) => object,
            _ => {
                return TaskEnvelope::Raw {
                    agent: tag("agent", DEFAULT_AGENT),
                    action: tag("action", DEFAULT_ACTION),
                    raw: payload.to_string(),
                }
            }
        };

        let agent = non_empty_string(object.get("agent")).unwrap_or_else(|| tag("agent", DEFAULT_AGENT));
        let action =
            non_empty_string(object.get("action")).unwrap_or_else(|| tag("action", DEFAULT_ACTION));

        let payload = match object.remove("payload") {
            Some(Value::Object(inner)) => inner,
            None | Some(Value::Null) => {
                object.remove("agent");
                object.remove("action");
                object
            }
            Some(other) => {
                let mut wrapped = Map::new();
                wrapped.insert("value".to_string(), other);
                wrapped
            }
        };

        TaskEnvelope::Structured {
            agent,
            action,
            payload,
        }
    }
}

fn non_empty_string(value: Option<&Value>) -> Option<String> {
    match value {
        Some(Value::String(s)) if !s.is_empty() => Some(s.clone()),
        _ => None,
    }
}
