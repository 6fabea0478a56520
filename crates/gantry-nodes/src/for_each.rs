//! For-each loop node
//!
//! Emits one envelope per element of an array; the coordinator spawns one
//! downstream subgraph traversal per envelope, each with its own iteration
//! index, converging again at a merge node.

use async_trait::async_trait;
use serde_json::Value;

use gantry_core::json::lookup_path;
use gantry_core::{
    Envelope, ExecutionContext, NodeDefinition, NodeError, NodeKind, NodeMeta, NodeOutcome,
    ParameterSpec,
};

pub struct ForEachNode;

#[async_trait]
impl NodeDefinition for ForEachNode {
    fn meta(&self) -> NodeMeta {
        NodeMeta::new("for_each", "For Each", "flow")
            .kind(NodeKind::Loop)
            .parameter(ParameterSpec::string("field", "Items field"))
    }

    async fn execute(
        &self,
        _ctx: &ExecutionContext,
        config: &Value,
        input: Envelope,
    ) -> Result<NodeOutcome, NodeError> {
        let source = match config.get("field").and_then(|v| v.as_str()) {
            Some(field) if !field.is_empty() => lookup_path(&input.data, field)
                .cloned()
                .unwrap_or(Value::Null),
            _ => input.data.clone(),
        };

        let elements = match source {
            Value::Array(items) => items,
            Value::Null => Vec::new(),
            other => vec![other],
        };

        let items = elements
            .into_iter()
            .map(|element| input.with_data(element))
            .collect();

        Ok(NodeOutcome::Items(items))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::ctx;
    use serde_json::json;

    #[tokio::test]
    async fn test_splits_array_field() {
        let (ctx, trace) = ctx("loop1");
        let input = Envelope::new(json!({"items": [1, 2, 3]}), trace);

        let outcome = ForEachNode
            .execute(&ctx, &json!({"field": "items"}), input)
            .await
            .unwrap();
        match outcome {
            NodeOutcome::Items(items) => {
                assert_eq!(items.len(), 3);
                assert_eq!(items[0].data, json!(1));
                assert_eq!(items[2].data, json!(3));
            }
            other => panic!("expected items outcome, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_whole_data_when_no_field() {
        let (ctx, trace) = ctx("loop1");
        let input = Envelope::new(json!(["a", "b"]), trace);

        let outcome = ForEachNode.execute(&ctx, &json!({}), input).await.unwrap();
        match outcome {
            NodeOutcome::Items(items) => assert_eq!(items.len(), 2),
            other => panic!("expected items outcome, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_missing_field_yields_no_items() {
        let (ctx, trace) = ctx("loop1");
        let input = Envelope::new(json!({"x": 1}), trace);

        let outcome = ForEachNode
            .execute(&ctx, &json!({"field": "missing"}), input)
            .await
            .unwrap();
        match outcome {
            NodeOutcome::Items(items) => assert!(items.is_empty()),
            other => panic!("expected items outcome, got {:?}", other),
        }
    }
}
