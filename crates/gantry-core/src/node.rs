//! Node definition contract
//!
//! A node definition declares its metadata (type, label, parameters, and the
//! structural kind the engine must recognize) and an `execute` contract. The
//! engine guarantees at-least-once execution: a node may perform I/O but must
//! tolerate re-execution of the same step.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::envelope::Envelope;
use crate::variables::VariableStore;

/// Structural node kinds the engine recognizes
///
/// Everything except `Standard` changes how the coordinator routes around the
/// node: triggers are never executed by the step loop, branches route by
/// handle, loops fan out per element, merges wait for their fan-in, and
/// sub-workflow calls suspend until the child run terminates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    Standard,
    Trigger,
    Branch,
    Loop,
    Merge,
    SubWorkflow,
}

/// How a node with multiple predecessors becomes ready
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JoinKind {
    /// Ready when any one predecessor completes (default)
    Any,

    /// Ready when every instantiated predecessor is terminal (merge semantics)
    All,
}

/// Typed kind of a declared parameter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParameterKind {
    String,
    Number,
    Integer,
    Boolean,
    Enum,
    Object,
    Array,
    Credential,
    Code,
}

/// A value/label pair for enumerated parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptionItem {
    pub value: serde_json::Value,
    pub label: String,
}

impl OptionItem {
    pub fn new(value: impl Into<serde_json::Value>, label: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            label: label.into(),
        }
    }
}

/// Where a parameter's options come from
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "source")]
pub enum ParameterOptions {
    #[default]
    None,

    /// Fixed at registration time
    Static { items: Vec<OptionItem> },

    /// Computed at edit time via [`NodeDefinition::dynamic_options`]
    Dynamic,
}

/// Visibility predicate over sibling parameter values
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VisibilityRule {
    /// Name of the sibling parameter inspected
    pub parameter: String,

    /// Shown only when the sibling equals this value
    pub equals: serde_json::Value,
}

/// Declarative value checks applied at save/deploy time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "rule")]
pub enum ParameterValidator {
    NonEmpty,
    Min { value: f64 },
    Max { value: f64 },
    MinLength { value: usize },
    MaxLength { value: usize },
}

/// Declared parameter of a node type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterSpec {
    pub name: String,
    pub label: String,
    pub kind: ParameterKind,
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub visible_if: Option<VisibilityRule>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub validators: Vec<ParameterValidator>,
    #[serde(default)]
    pub options: ParameterOptions,
}

impl ParameterSpec {
    pub fn new(name: impl Into<String>, label: impl Into<String>, kind: ParameterKind) -> Self {
        Self {
            name: name.into(),
            label: label.into(),
            kind,
            required: false,
            default: None,
            group: None,
            visible_if: None,
            validators: Vec::new(),
            options: ParameterOptions::None,
        }
    }

    pub fn string(name: impl Into<String>, label: impl Into<String>) -> Self {
        Self::new(name, label, ParameterKind::String)
    }

    pub fn boolean(name: impl Into<String>, label: impl Into<String>) -> Self {
        Self::new(name, label, ParameterKind::Boolean)
    }

    pub fn integer(name: impl Into<String>, label: impl Into<String>) -> Self {
        Self::new(name, label, ParameterKind::Integer)
    }

    pub fn enumeration(
        name: impl Into<String>,
        label: impl Into<String>,
        items: Vec<OptionItem>,
    ) -> Self {
        let mut spec = Self::new(name, label, ParameterKind::Enum);
        spec.options = ParameterOptions::Static { items };
        spec
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn with_default(mut self, value: impl Into<serde_json::Value>) -> Self {
        self.default = Some(value.into());
        self
    }

    pub fn in_group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }

    pub fn visible_if(mut self, parameter: impl Into<String>, equals: impl Into<serde_json::Value>) -> Self {
        self.visible_if = Some(VisibilityRule {
            parameter: parameter.into(),
            equals: equals.into(),
        });
        self
    }

    pub fn validator(mut self, validator: ParameterValidator) -> Self {
        self.validators.push(validator);
        self
    }
}

/// Metadata returned by [`NodeDefinition::meta`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeMeta {
    /// Registered type name, e.g. `http_request`
    #[serde(rename = "type")]
    pub node_type: String,
    pub label: String,
    pub category: String,
    pub kind: NodeKind,
    pub join: JoinKind,
    #[serde(default)]
    pub parameters: Vec<ParameterSpec>,
}

impl NodeMeta {
    pub fn new(node_type: impl Into<String>, label: impl Into<String>, category: impl Into<String>) -> Self {
        Self {
            node_type: node_type.into(),
            label: label.into(),
            category: category.into(),
            kind: NodeKind::Standard,
            join: JoinKind::Any,
            parameters: Vec::new(),
        }
    }

    pub fn kind(mut self, kind: NodeKind) -> Self {
        self.kind = kind;
        if kind == NodeKind::Merge {
            self.join = JoinKind::All;
        }
        self
    }

    pub fn parameter(mut self, spec: ParameterSpec) -> Self {
        self.parameters.push(spec);
        self
    }

    /// Trigger nodes are read by the trigger engine, never by the step loop
    pub fn is_entry_point(&self) -> bool {
        self.kind == NodeKind::Trigger
    }
}

/// Result of a node execution
#[derive(Debug)]
pub enum NodeOutcome {
    /// Ordinary single-output node
    Envelope(Envelope),

    /// Branching node: route along edges whose `source_handle` matches
    Branch { envelope: Envelope, handle: String },

    /// For-each node: one downstream traversal per envelope
    Items(Vec<Envelope>),

    /// Sub-workflow call: the step stays running until the child run
    /// terminates
    Suspend { child_run_id: Uuid },
}

/// Error returned by node execution
#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    /// Bad node configuration; retrying cannot help
    #[error("invalid node configuration: {0}")]
    Config(String),

    /// Execution failed; retried per the run's retry policy
    #[error("node execution failed: {0}")]
    Failed(String),

    /// Execution observed the cancellation signal
    #[error("node execution cancelled")]
    Cancelled,
}

impl NodeError {
    pub fn config(msg: impl Into<String>) -> Self {
        NodeError::Config(msg.into())
    }

    pub fn failed(msg: impl Into<String>) -> Self {
        NodeError::Failed(msg.into())
    }

    /// Whether the step scheduler may retry after this error
    pub fn is_retryable(&self) -> bool {
        matches!(self, NodeError::Failed(_))
    }
}

/// Launches child runs on behalf of sub-workflow call nodes
///
/// Implemented by the run coordinator; injected so node definitions stay free
/// of persistence concerns.
#[async_trait]
pub trait RunLauncher: Send + Sync {
    /// Create a child run of `workflow_id` suspended under `parent_step_id`
    async fn launch_child(
        &self,
        workflow_id: Uuid,
        input: Envelope,
        parent_step_id: Uuid,
    ) -> Result<Uuid, NodeError>;
}

/// Context handed to every node execution
///
/// Carries identity (for tracing), the cooperative cancellation token, the
/// remaining run deadline, scoped variable access, and the resolved
/// connection configuration when the node references one.
#[derive(Clone)]
pub struct ExecutionContext {
    pub workflow_id: Uuid,
    pub run_id: Uuid,
    pub node_id: String,
    pub step_id: Uuid,
    pub step_number: i32,
    pub attempt: u32,
    pub max_attempts: u32,
    deadline: Option<DateTime<Utc>>,
    cancel: CancellationToken,
    variables: Arc<dyn VariableStore>,
    launcher: Option<Arc<dyn RunLauncher>>,
    connection: Option<serde_json::Value>,
}

impl ExecutionContext {
    pub fn new(
        workflow_id: Uuid,
        run_id: Uuid,
        node_id: impl Into<String>,
        step_id: Uuid,
        step_number: i32,
        attempt: u32,
        max_attempts: u32,
        variables: Arc<dyn VariableStore>,
    ) -> Self {
        Self {
            workflow_id,
            run_id,
            node_id: node_id.into(),
            step_id,
            step_number,
            attempt,
            max_attempts,
            deadline: None,
            cancel: CancellationToken::new(),
            variables,
            launcher: None,
            connection: None,
        }
    }

    pub fn with_deadline(mut self, deadline: DateTime<Utc>) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn with_launcher(mut self, launcher: Arc<dyn RunLauncher>) -> Self {
        self.launcher = Some(launcher);
        self
    }

    pub fn with_connection(mut self, connection: serde_json::Value) -> Self {
        self.connection = Some(connection);
        self
    }

    /// Scoped variable store addressed via this context's trace identity
    pub fn variables(&self) -> &Arc<dyn VariableStore> {
        &self.variables
    }

    /// Resolved connection configuration, if the node references one
    pub fn connection(&self) -> Option<&serde_json::Value> {
        self.connection.as_ref()
    }

    /// Run launcher for sub-workflow call nodes
    pub fn launcher(&self) -> Option<&Arc<dyn RunLauncher>> {
        self.launcher.as_ref()
    }

    /// Check if cancellation was requested
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves when cancellation is requested; for `select!` patterns
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    /// Token clone for blocking I/O the node performs
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Remaining run budget, if the run carries a deadline
    ///
    /// Returns `Duration::ZERO` once the deadline has passed.
    pub fn remaining_budget(&self) -> Option<Duration> {
        self.deadline.map(|deadline| {
            (deadline - Utc::now()).to_std().unwrap_or(Duration::ZERO)
        })
    }

    pub fn is_last_attempt(&self) -> bool {
        self.attempt >= self.max_attempts
    }
}

impl std::fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("workflow_id", &self.workflow_id)
            .field("run_id", &self.run_id)
            .field("node_id", &self.node_id)
            .field("step_number", &self.step_number)
            .field("attempt", &self.attempt)
            .finish_non_exhaustive()
    }
}

/// A registered node type
///
/// Implementations must be stateless across executions; per-run state belongs
/// in the variable store or the envelope.
#[async_trait]
pub trait NodeDefinition: Send + Sync {
    /// Static metadata: type, label, parameters, structural kind
    fn meta(&self) -> NodeMeta;

    /// Execute the node against one input envelope
    ///
    /// Must tolerate re-execution: delivery is at-least-once and a step may
    /// be re-run after a worker crash with the same attempt number.
    async fn execute(
        &self,
        ctx: &ExecutionContext,
        config: &serde_json::Value,
        input: Envelope,
    ) -> Result<NodeOutcome, NodeError>;

    /// Called once at process startup, before the registry is installed
    fn initialize(&self) {}

    /// Edit-time option computation for `Dynamic` parameters
    async fn dynamic_options(
        &self,
        _parameter: &str,
        _siblings: &serde_json::Value,
    ) -> Result<Vec<OptionItem>, NodeError> {
        Ok(Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parameter_builder() {
        let spec = ParameterSpec::string("url", "URL")
            .required()
            .in_group("request")
            .validator(ParameterValidator::NonEmpty)
            .visible_if("mode", "manual");

        assert_eq!(spec.name, "url");
        assert!(spec.required);
        assert_eq!(spec.group.as_deref(), Some("request"));
        assert_eq!(spec.validators.len(), 1);
        assert_eq!(spec.visible_if.as_ref().unwrap().parameter, "mode");
    }

    #[test]
    fn test_merge_kind_defaults_to_all_join() {
        let meta = NodeMeta::new("merge", "Merge", "flow").kind(NodeKind::Merge);
        assert_eq!(meta.join, JoinKind::All);

        let meta = NodeMeta::new("noop", "No-op", "utility");
        assert_eq!(meta.join, JoinKind::Any);
    }

    #[test]
    fn test_node_error_retryability() {
        assert!(NodeError::failed("transient").is_retryable());
        assert!(!NodeError::config("bad").is_retryable());
        assert!(!NodeError::Cancelled.is_retryable());
    }

    #[test]
    fn test_entry_point_detection() {
        let meta = NodeMeta::new("webhook", "Webhook", "trigger").kind(NodeKind::Trigger);
        assert!(meta.is_entry_point());
    }
}
