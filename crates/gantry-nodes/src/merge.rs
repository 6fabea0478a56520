//! Merge node: fan-in convergence point
//!
//! The coordinator enqueues a merge step only after every instantiated
//! predecessor step is terminal, and hands it an array of the completed
//! predecessors' outputs ordered by step number. This node applies the
//! configured strategy to that array.

use async_trait::async_trait;
use serde_json::Value;

use gantry_core::json::deep_merge;
use gantry_core::{
    Envelope, ExecutionContext, NodeDefinition, NodeError, NodeKind, NodeMeta, NodeOutcome,
    OptionItem, ParameterSpec,
};

pub struct MergeNode;

#[async_trait]
impl NodeDefinition for MergeNode {
    fn meta(&self) -> NodeMeta {
        NodeMeta::new("merge", "Merge", "flow")
            .kind(NodeKind::Merge)
            .parameter(
                ParameterSpec::enumeration(
                    "strategy",
                    "Strategy",
                    vec![
                        OptionItem::new("deep_merge", "Deep merge (last writer wins)"),
                        OptionItem::new("first", "First input"),
                        OptionItem::new("collect", "Collect into array"),
                    ],
                )
                .with_default("deep_merge"),
            )
    }

    async fn execute(
        &self,
        _ctx: &ExecutionContext,
        config: &Value,
        input: Envelope,
    ) -> Result<NodeOutcome, NodeError> {
        let inputs = match &input.data {
            Value::Array(items) => items.clone(),
            other => vec![other.clone()],
        };

        let strategy = config
            .get("strategy")
            .and_then(|v| v.as_str())
            .unwrap_or("deep_merge");

        let data = match strategy {
            "collect" => Value::Array(inputs),
            "first" => inputs.into_iter().next().unwrap_or(Value::Null),
            "deep_merge" => {
                let mut merged = Value::Object(Default::default());
                for item in &inputs {
                    deep_merge(&mut merged, item);
                }
                merged
            }
            other => {
                return Err(NodeError::config(format!("unknown merge strategy: {}", other)));
            }
        };

        Ok(NodeOutcome::Envelope(input.with_data(data)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::ctx;
    use serde_json::json;

    async fn run_merge(config: Value, data: Value) -> Value {
        let (ctx, trace) = ctx("merge1");
        let input = Envelope::new(data, trace);
        match MergeNode.execute(&ctx, &config, input).await.unwrap() {
            NodeOutcome::Envelope(env) => env.data,
            other => panic!("expected envelope outcome, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_deep_merge_last_writer_wins() {
        let data = run_merge(
            json!({}),
            json!([{"a": 1, "shared": "x"}, {"b": 2, "shared": "y"}]),
        )
        .await;
        assert_eq!(data, json!({"a": 1, "b": 2, "shared": "y"}));
    }

    #[tokio::test]
    async fn test_first_strategy() {
        let data = run_merge(json!({"strategy": "first"}), json!([{"a": 1}, {"b": 2}])).await;
        assert_eq!(data, json!({"a": 1}));
    }

    #[tokio::test]
    async fn test_collect_strategy() {
        let data = run_merge(json!({"strategy": "collect"}), json!([1, 2, 3])).await;
        assert_eq!(data, json!([1, 2, 3]));
    }
}
