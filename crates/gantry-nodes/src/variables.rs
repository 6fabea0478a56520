//! Variable access nodes
//!
//! Read and write the scoped variable store from inside a run. Scope keys
//! resolve through the execution context: `run` → the current run id,
//! `workflow` → the workflow id, `global` → empty.

use async_trait::async_trait;
use serde_json::Value;

use gantry_core::{
    Envelope, ExecutionContext, NodeDefinition, NodeError, NodeMeta, NodeOutcome, OptionItem,
    ParameterSpec, ParameterValidator, VariableScope,
};

fn scope_from_config(config: &Value) -> Result<VariableScope, NodeError> {
    config
        .get("scope")
        .and_then(|v| v.as_str())
        .unwrap_or("run")
        .parse()
        .map_err(NodeError::Config)
}

fn scope_key(ctx: &ExecutionContext, scope: VariableScope) -> String {
    match scope {
        VariableScope::Run => ctx.run_id.to_string(),
        VariableScope::Workflow => ctx.workflow_id.to_string(),
        VariableScope::Global => String::new(),
    }
}

fn scope_parameter() -> ParameterSpec {
    ParameterSpec::enumeration(
        "scope",
        "Scope",
        vec![
            OptionItem::new("run", "Run"),
            OptionItem::new("workflow", "Workflow"),
            OptionItem::new("global", "Global"),
        ],
    )
    .with_default("run")
}

/// Reads a variable; the value becomes the output data
pub struct VariableGetNode;

#[async_trait]
impl NodeDefinition for VariableGetNode {
    fn meta(&self) -> NodeMeta {
        NodeMeta::new("variable_get", "Get Variable", "variables")
            .parameter(
                ParameterSpec::string("name", "Name")
                    .required()
                    .validator(ParameterValidator::NonEmpty),
            )
            .parameter(scope_parameter())
            .parameter(ParameterSpec::new(
                "default",
                "Default",
                gantry_core::ParameterKind::Object,
            ))
    }

    async fn execute(
        &self,
        ctx: &ExecutionContext,
        config: &Value,
        input: Envelope,
    ) -> Result<NodeOutcome, NodeError> {
        let name = config
            .get("name")
            .and_then(|v| v.as_str())
            .ok_or_else(|| NodeError::config("variable_get requires a name"))?;
        let scope = scope_from_config(config)?;
        let key = scope_key(ctx, scope);

        let value = ctx
            .variables()
            .get(scope, &key, name)
            .await
            .map_err(|e| NodeError::failed(e.to_string()))?
            .or_else(|| config.get("default").cloned())
            .unwrap_or(Value::Null);

        Ok(NodeOutcome::Envelope(input.with_data(value)))
    }
}

/// Writes a variable; the input passes through unchanged
pub struct VariableSetNode;

#[async_trait]
impl NodeDefinition for VariableSetNode {
    fn meta(&self) -> NodeMeta {
        NodeMeta::new("variable_set", "Set Variable", "variables")
            .parameter(
                ParameterSpec::string("name", "Name")
                    .required()
                    .validator(ParameterValidator::NonEmpty),
            )
            .parameter(scope_parameter())
            .parameter(ParameterSpec::new(
                "value",
                "Value",
                gantry_core::ParameterKind::Object,
            ))
            .parameter(ParameterSpec::string("from_field", "From field"))
    }

    async fn execute(
        &self,
        ctx: &ExecutionContext,
        config: &Value,
        input: Envelope,
    ) -> Result<NodeOutcome, NodeError> {
        let name = config
            .get("name")
            .and_then(|v| v.as_str())
            .ok_or_else(|| NodeError::config("variable_set requires a name"))?;
        let scope = scope_from_config(config)?;
        let key = scope_key(ctx, scope);

        // Literal value wins; otherwise a field of the flowing data
        let value = match config.get("value") {
            Some(value) => value.clone(),
            None => match config.get("from_field").and_then(|v| v.as_str()) {
                Some(field) => gantry_core::json::lookup_path(&input.data, field)
                    .cloned()
                    .unwrap_or(Value::Null),
                None => input.data.clone(),
            },
        };

        ctx.variables()
            .set(scope, &key, name, value)
            .await
            .map_err(|e| NodeError::failed(e.to_string()))?;

        Ok(NodeOutcome::Envelope(input.fork()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::ctx;
    use serde_json::json;

    #[tokio::test]
    async fn test_set_then_get_round_trip() {
        let (ctx, trace) = ctx("var1");
        let input = Envelope::new(json!({"payload": 42}), trace);

        let set_config = json!({"name": "saved", "scope": "run", "from_field": "payload"});
        VariableSetNode
            .execute(&ctx, &set_config, input.clone())
            .await
            .unwrap();

        let get_config = json!({"name": "saved", "scope": "run"});
        let outcome = VariableGetNode
            .execute(&ctx, &get_config, input)
            .await
            .unwrap();
        match outcome {
            NodeOutcome::Envelope(env) => assert_eq!(env.data, json!(42)),
            other => panic!("expected envelope outcome, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_get_missing_uses_default() {
        let (ctx, trace) = ctx("var1");
        let input = Envelope::new(json!({}), trace);

        let config = json!({"name": "absent", "default": "fallback"});
        let outcome = VariableGetNode.execute(&ctx, &config, input).await.unwrap();
        match outcome {
            NodeOutcome::Envelope(env) => assert_eq!(env.data, json!("fallback")),
            other => panic!("expected envelope outcome, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unknown_scope_rejected() {
        let (ctx, trace) = ctx("var1");
        let input = Envelope::new(json!({}), trace);

        let err = VariableGetNode
            .execute(&ctx, &json!({"name": "x", "scope": "tenant"}), input)
            .await
            .unwrap_err();
        assert!(matches!(err, NodeError::Config(_)));
    }
}
