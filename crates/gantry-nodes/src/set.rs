//! Set node: write fields into the flowing data

use async_trait::async_trait;
use serde_json::Value;

use gantry_core::json::deep_merge;
use gantry_core::{
    Envelope, ExecutionContext, NodeDefinition, NodeError, NodeMeta, NodeOutcome, OptionItem,
    ParameterKind, ParameterSpec,
};

/// Merges (or replaces) configured values into the envelope data
pub struct SetNode;

#[async_trait]
impl NodeDefinition for SetNode {
    fn meta(&self) -> NodeMeta {
        NodeMeta::new("set", "Set", "transform")
            .parameter(
                ParameterSpec::new("values", "Values", ParameterKind::Object)
                    .required()
                    .with_default(serde_json::json!({})),
            )
            .parameter(
                ParameterSpec::enumeration(
                    "mode",
                    "Mode",
                    vec![
                        OptionItem::new("merge", "Merge into input"),
                        OptionItem::new("replace", "Replace input"),
                    ],
                )
                .with_default("merge"),
            )
    }

    async fn execute(
        &self,
        _ctx: &ExecutionContext,
        config: &Value,
        input: Envelope,
    ) -> Result<NodeOutcome, NodeError> {
        let values = config.get("values").cloned().unwrap_or(Value::Null);
        let mode = config.get("mode").and_then(|v| v.as_str()).unwrap_or("merge");

        let data = match mode {
            "replace" => values,
            "merge" => {
                let mut data = input.data.clone();
                deep_merge(&mut data, &values);
                data
            }
            other => {
                return Err(NodeError::config(format!("unknown set mode: {}", other)));
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

    #[tokio::test]
    async fn test_merge_mode() {
        let (ctx, trace) = ctx("set1");
        let input = Envelope::new(json!({"a": 1}), trace);
        let config = json!({"values": {"b": 2}});

        let outcome = SetNode.execute(&ctx, &config, input).await.unwrap();
        match outcome {
            NodeOutcome::Envelope(env) => assert_eq!(env.data, json!({"a": 1, "b": 2})),
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_replace_mode() {
        let (ctx, trace) = ctx("set1");
        let input = Envelope::new(json!({"a": 1}), trace);
        let config = json!({"values": {"b": 2}, "mode": "replace"});

        let outcome = SetNode.execute(&ctx, &config, input).await.unwrap();
        match outcome {
            NodeOutcome::Envelope(env) => assert_eq!(env.data, json!({"b": 2})),
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unknown_mode_is_config_error() {
        let (ctx, trace) = ctx("set1");
        let input = Envelope::new(json!({}), trace);
        let err = SetNode
            .execute(&ctx, &json!({"mode": "upsert"}), input)
            .await
            .unwrap_err();
        assert!(matches!(err, NodeError::Config(_)));
    }
}
