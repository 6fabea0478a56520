//! Branch node: route along `true`/`false` handles

use async_trait::async_trait;
use serde_json::Value;

use gantry_core::json::lookup_path;
use gantry_core::{
    Envelope, ExecutionContext, NodeDefinition, NodeError, NodeKind, NodeMeta, NodeOutcome,
    OptionItem, ParameterKind, ParameterSpec, ParameterValidator,
};

/// Evaluates a comparison against a field of the input data and emits on the
/// `true` or `false` handle
pub struct BranchNode;

fn compare(left: &Value, op: &str, right: &Value) -> Result<bool, NodeError> {
    let result = match op {
        "exists" => !left.is_null(),
        "eq" => left == right,
        "ne" => left != right,
        "gt" | "lt" | "gte" | "lte" => {
            let (Some(l), Some(r)) = (left.as_f64(), right.as_f64()) else {
                return Ok(false);
            };
            match op {
                "gt" => l > r,
                "lt" => l < r,
                "gte" => l >= r,
                _ => l <= r,
            }
        }
        "contains" => match (left, right) {
            (Value::String(haystack), Value::String(needle)) => haystack.contains(needle.as_str()),
            (Value::Array(items), needle) => items.contains(needle),
            _ => false,
        },
        other => return Err(NodeError::config(format!("unknown operator: {}", other))),
    };
    Ok(result)
}

#[async_trait]
impl NodeDefinition for BranchNode {
    fn meta(&self) -> NodeMeta {
        NodeMeta::new("branch", "Branch", "flow")
            .kind(NodeKind::Branch)
            .parameter(
                ParameterSpec::string("field", "Field")
                    .required()
                    .validator(ParameterValidator::NonEmpty),
            )
            .parameter(
                ParameterSpec::enumeration(
                    "op",
                    "Operator",
                    vec![
                        OptionItem::new("eq", "Equals"),
                        OptionItem::new("ne", "Not equals"),
                        OptionItem::new("gt", "Greater than"),
                        OptionItem::new("gte", "Greater or equal"),
                        OptionItem::new("lt", "Less than"),
                        OptionItem::new("lte", "Less or equal"),
                        OptionItem::new("contains", "Contains"),
                        OptionItem::new("exists", "Exists"),
                    ],
                )
                .required()
                .with_default("eq"),
            )
            .parameter(ParameterSpec::new("value", "Value", ParameterKind::Object))
    }

    async fn execute(
        &self,
        _ctx: &ExecutionContext,
        config: &Value,
        input: Envelope,
    ) -> Result<NodeOutcome, NodeError> {
        let field = config
            .get("field")
            .and_then(|v| v.as_str())
            .ok_or_else(|| NodeError::config("branch requires a field"))?;
        let op = config.get("op").and_then(|v| v.as_str()).unwrap_or("eq");
        let expected = config.get("value").cloned().unwrap_or(Value::Null);

        let actual = lookup_path(&input.data, field).cloned().unwrap_or(Value::Null);
        let taken = compare(&actual, op, &expected)?;

        let handle = if taken { "true" } else { "false" };
        Ok(NodeOutcome::Branch {
            envelope: input.fork(),
            handle: handle.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::ctx;
    use serde_json::json;

    async fn run_branch(config: Value, data: Value) -> String {
        let (ctx, trace) = ctx("branch1");
        let input = Envelope::new(data, trace);
        match BranchNode.execute(&ctx, &config, input).await.unwrap() {
            NodeOutcome::Branch { handle, .. } => handle,
            other => panic!("expected branch outcome, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_gt_selects_true_handle() {
        let handle = run_branch(json!({"field": "x", "op": "gt", "value": 0}), json!({"x": 5})).await;
        assert_eq!(handle, "true");
    }

    #[tokio::test]
    async fn test_gt_selects_false_handle() {
        let handle =
            run_branch(json!({"field": "x", "op": "gt", "value": 0}), json!({"x": -3})).await;
        assert_eq!(handle, "false");
    }

    #[tokio::test]
    async fn test_missing_field_compares_as_null() {
        let handle = run_branch(json!({"field": "y", "op": "exists"}), json!({"x": 1})).await;
        assert_eq!(handle, "false");
    }

    #[tokio::test]
    async fn test_contains_on_arrays() {
        let handle = run_branch(
            json!({"field": "tags", "op": "contains", "value": "alpha"}),
            json!({"tags": ["alpha", "beta"]}),
        )
        .await;
        assert_eq!(handle, "true");
    }

    #[tokio::test]
    async fn test_unknown_operator_rejected() {
        let (ctx, trace) = ctx("branch1");
        let input = Envelope::new(json!({"x": 1}), trace);
        let err = BranchNode
            .execute(&ctx, &json!({"field": "x", "op": "between"}), input)
            .await
            .unwrap_err();
        assert!(matches!(err, NodeError::Config(_)));
    }
}
