//! Echo node: replies with its input data
//!
//! The conventional terminal node for sync-mode webhooks; whatever arrives
//! becomes the run output and therefore the HTTP response body.

use async_trait::async_trait;

use gantry_core::{Envelope, ExecutionContext, NodeDefinition, NodeError, NodeMeta, NodeOutcome};

pub struct EchoNode;

#[async_trait]
impl NodeDefinition for EchoNode {
    fn meta(&self) -> NodeMeta {
        NodeMeta::new("echo", "Echo", "utility")
    }

    async fn execute(
        &self,
        _ctx: &ExecutionContext,
        _config: &serde_json::Value,
        input: Envelope,
    ) -> Result<NodeOutcome, NodeError> {
        let data = input.data.clone();
        Ok(NodeOutcome::Envelope(input.with_data(data)))
    }
}
