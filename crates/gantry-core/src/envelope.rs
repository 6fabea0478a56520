//! Envelope and trace types
//!
//! An [`Envelope`] is the unit of data flow between nodes. Every node receives
//! one envelope and produces one (or, for fan-out nodes, several). The
//! envelope carries the payload, a snapshot of the variables visible when it
//! was created, the accumulated error trail, and the lineage [`Trace`].

use std::collections::BTreeMap;

use base64::Engine as _;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Current envelope schema version
pub const ENVELOPE_VERSION: u32 = 1;

/// Discriminator for the envelope payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    String,
    Number,
    Boolean,
    Array,
    Object,
    Null,
    Binary,
    Unknown,
}

impl DataType {
    /// Infer the discriminator from a JSON value.
    ///
    /// `Binary` is never inferred; binary payloads are constructed explicitly
    /// via [`Envelope::binary`] and carried as base64 strings.
    pub fn of(value: &serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => DataType::Null,
            serde_json::Value::Bool(_) => DataType::Boolean,
            serde_json::Value::Number(_) => DataType::Number,
            serde_json::Value::String(_) => DataType::String,
            serde_json::Value::Array(_) => DataType::Array,
            serde_json::Value::Object(_) => DataType::Object,
        }
    }
}

impl std::fmt::Display for DataType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::String => "string",
            Self::Number => "number",
            Self::Boolean => "boolean",
            Self::Array => "array",
            Self::Object => "object",
            Self::Null => "null",
            Self::Binary => "binary",
            Self::Unknown => "unknown",
        };
        write!(f, "{}", s)
    }
}

/// One entry in an envelope's error trail
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvelopeError {
    /// Graph id of the node that recorded the error
    pub node_id: String,

    /// Human-readable message
    pub message: String,

    /// Underlying cause, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cause: Option<String>,
}

/// Lineage record embedded in every envelope
///
/// Identifies where in a run an envelope was produced. Sub-workflow calls
/// chain traces through `parent`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trace {
    pub workflow_id: Uuid,
    pub run_id: Uuid,
    pub node_id: String,
    pub step_number: i32,
    pub attempt: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent: Option<Box<Trace>>,
}

impl Trace {
    /// Trace for the origin of a run, before any node has executed
    pub fn root(workflow_id: Uuid, run_id: Uuid) -> Self {
        Self {
            workflow_id,
            run_id,
            node_id: String::new(),
            step_number: 0,
            attempt: 1,
            parent: None,
        }
    }

    /// Derive the trace for the next node along an edge
    ///
    /// Returns a new trace with `node_id` set and `step_number` incremented;
    /// `attempt` resets to 1.
    pub fn next(&self, node_id: impl Into<String>) -> Self {
        Self {
            workflow_id: self.workflow_id,
            run_id: self.run_id,
            node_id: node_id.into(),
            step_number: self.step_number + 1,
            attempt: 1,
            parent: self.parent.clone(),
        }
    }

    /// Trace pinned to a concrete step row
    pub fn at_step(&self, node_id: impl Into<String>, step_number: i32, attempt: u32) -> Self {
        Self {
            workflow_id: self.workflow_id,
            run_id: self.run_id,
            node_id: node_id.into(),
            step_number,
            attempt,
            parent: self.parent.clone(),
        }
    }

    /// Trace for the root of a child run, keeping this trace as lineage
    pub fn child(&self, workflow_id: Uuid, run_id: Uuid) -> Self {
        Self {
            workflow_id,
            run_id,
            node_id: String::new(),
            step_number: 0,
            attempt: 1,
            parent: Some(Box::new(self.clone())),
        }
    }
}

/// The unit of data flow between nodes
///
/// Envelopes are value types; mutation helpers return a modified copy. A new
/// id is minted whenever an envelope is created or forked, so two step rows
/// never share an envelope id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub id: Uuid,
    pub issued_at: DateTime<Utc>,
    pub version: u32,
    pub data_type: DataType,
    pub data: serde_json::Value,
    #[serde(default)]
    pub variables: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub errors: Vec<EnvelopeError>,
    pub trace: Trace,
}

impl Envelope {
    /// Create an envelope around a JSON payload, inferring `data_type`
    pub fn new(data: serde_json::Value, trace: Trace) -> Self {
        Self {
            id: Uuid::now_v7(),
            issued_at: Utc::now(),
            version: ENVELOPE_VERSION,
            data_type: DataType::of(&data),
            data,
            variables: BTreeMap::new(),
            errors: Vec::new(),
            trace,
        }
    }

    /// Empty-object envelope, the input to runs triggered without a payload
    pub fn empty(trace: Trace) -> Self {
        Self::new(serde_json::json!({}), trace)
    }

    /// Envelope around a binary payload, carried as base64
    pub fn binary(bytes: &[u8], trace: Trace) -> Self {
        let encoded = base64::engine::general_purpose::STANDARD.encode(bytes);
        let mut env = Self::new(serde_json::Value::String(encoded), trace);
        env.data_type = DataType::Binary;
        env
    }

    /// Decode a binary payload
    ///
    /// Returns `None` if the envelope does not carry `binary` data.
    pub fn binary_data(&self) -> Option<Vec<u8>> {
        if self.data_type != DataType::Binary {
            return None;
        }
        self.data
            .as_str()
            .and_then(|s| base64::engine::general_purpose::STANDARD.decode(s).ok())
    }

    /// Fork this envelope: identical fields except a fresh `id` and `issued_at`
    pub fn fork(&self) -> Self {
        Self {
            id: Uuid::now_v7(),
            issued_at: Utc::now(),
            ..self.clone()
        }
    }

    /// New envelope carrying `data`, inheriting variables, errors, and trace
    pub fn with_data(&self, data: serde_json::Value) -> Self {
        Self {
            id: Uuid::now_v7(),
            issued_at: Utc::now(),
            version: ENVELOPE_VERSION,
            data_type: DataType::of(&data),
            data,
            variables: self.variables.clone(),
            errors: self.errors.clone(),
            trace: self.trace.clone(),
        }
    }

    /// New envelope with the trace replaced
    pub fn with_trace(&self, trace: Trace) -> Self {
        let mut env = self.fork();
        env.trace = trace;
        env
    }

    /// Append an error to the trail
    ///
    /// The payload is left untouched; the returned envelope is still handed
    /// downstream so error-handling nodes can consume it.
    pub fn add_error(
        mut self,
        node_id: impl Into<String>,
        message: impl Into<String>,
        cause: Option<String>,
    ) -> Self {
        self.errors.push(EnvelopeError {
            node_id: node_id.into(),
            message: message.into(),
            cause,
        });
        self
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    /// Replace the variable snapshot
    pub fn with_variables(mut self, variables: BTreeMap<String, serde_json::Value>) -> Self {
        self.variables = variables;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn trace() -> Trace {
        Trace::root(Uuid::now_v7(), Uuid::now_v7())
    }

    #[test]
    fn test_data_type_inference() {
        assert_eq!(DataType::of(&json!("x")), DataType::String);
        assert_eq!(DataType::of(&json!(1.5)), DataType::Number);
        assert_eq!(DataType::of(&json!(true)), DataType::Boolean);
        assert_eq!(DataType::of(&json!([1, 2])), DataType::Array);
        assert_eq!(DataType::of(&json!({"a": 1})), DataType::Object);
        assert_eq!(DataType::of(&json!(null)), DataType::Null);
    }

    #[test]
    fn test_fork_mints_new_id() {
        let env = Envelope::new(json!({"x": 5}), trace());
        let forked = env.fork();

        assert_ne!(env.id, forked.id);
        assert_eq!(env.data, forked.data);
        assert_eq!(env.data_type, forked.data_type);
        assert_eq!(env.trace, forked.trace);
    }

    #[test]
    fn test_trace_next_increments_step() {
        let t = trace();
        let next = t.next("node-b");

        assert_eq!(next.step_number, t.step_number + 1);
        assert_eq!(next.node_id, "node-b");
        assert_eq!(next.attempt, 1);
        assert_eq!(next.run_id, t.run_id);
    }

    #[test]
    fn test_child_trace_keeps_lineage() {
        let parent = trace().at_step("call", 3, 2);
        let child = parent.child(Uuid::now_v7(), Uuid::now_v7());

        assert_eq!(child.step_number, 0);
        let lineage = child.parent.as_deref().expect("parent trace");
        assert_eq!(lineage.node_id, "call");
        assert_eq!(lineage.step_number, 3);
    }

    #[test]
    fn test_add_error_preserves_data() {
        let env = Envelope::new(json!({"x": 5}), trace());
        let env = env.add_error("node-a", "boom", Some("cause".into()));

        assert_eq!(env.data, json!({"x": 5}));
        assert_eq!(env.errors.len(), 1);
        assert_eq!(env.errors[0].node_id, "node-a");
        assert_eq!(env.errors[0].cause.as_deref(), Some("cause"));
    }

    #[test]
    fn test_binary_round_trip() {
        let bytes = vec![0u8, 1, 2, 254, 255];
        let env = Envelope::binary(&bytes, trace());

        assert_eq!(env.data_type, DataType::Binary);
        assert_eq!(env.binary_data().unwrap(), bytes);
    }

    #[test]
    fn test_serde_round_trip() {
        let mut env = Envelope::new(json!({"a": [1, 2, 3]}), trace());
        env.variables.insert("k".into(), json!("v"));
        let env = env.add_error("n1", "failed", None);

        let wire = serde_json::to_string(&env).unwrap();
        let back: Envelope = serde_json::from_str(&wire).unwrap();

        assert_eq!(back.data_type, env.data_type);
        assert_eq!(back.data, env.data);
        assert_eq!(back.variables, env.variables);
        assert_eq!(back.errors, env.errors);
        assert_eq!(back.trace, env.trace);
    }
}
