//! No-op node, for wiring tests and as a placeholder

use async_trait::async_trait;

use gantry_core::{Envelope, ExecutionContext, NodeDefinition, NodeError, NodeMeta, NodeOutcome};

/// Passes its input through untouched
pub struct NoopNode;

#[async_trait]
impl NodeDefinition for NoopNode {
    fn meta(&self) -> NodeMeta {
        NodeMeta::new("noop", "No-op", "utility")
    }

    async fn execute(
        &self,
        _ctx: &ExecutionContext,
        _config: &serde_json::Value,
        input: Envelope,
    ) -> Result<NodeOutcome, NodeError> {
        Ok(NodeOutcome::Envelope(input))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::ctx;
    use serde_json::json;

    #[tokio::test]
    async fn test_noop_passes_input_through() {
        let (ctx, trace) = ctx("n1");
        let input = Envelope::new(json!({}), trace);
        let input_data = input.data.clone();

        let outcome = NoopNode.execute(&ctx, &json!({}), input).await.unwrap();
        match outcome {
            NodeOutcome::Envelope(env) => assert_eq!(env.data, input_data),
            other => panic!("expected envelope outcome, got {:?}", other),
        }
    }
}
