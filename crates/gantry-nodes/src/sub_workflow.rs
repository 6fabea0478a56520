//! Sub-workflow call node
//!
//! Launches a child run of another workflow and suspends the calling step
//! until the child reaches a terminal state. The coordinator resumes the
//! step with the child's output as its own.

use async_trait::async_trait;
use serde_json::Value;
use uuid::Uuid;

use gantry_core::{
    Envelope, ExecutionContext, NodeDefinition, NodeError, NodeKind, NodeMeta, NodeOutcome,
    ParameterSpec, ParameterValidator,
};

pub struct SubWorkflowNode;

#[async_trait]
impl NodeDefinition for SubWorkflowNode {
    fn meta(&self) -> NodeMeta {
        NodeMeta::new("sub_workflow", "Call Workflow", "flow")
            .kind(NodeKind::SubWorkflow)
            .parameter(
                ParameterSpec::string("workflow_id", "Workflow")
                    .required()
                    .validator(ParameterValidator::NonEmpty),
            )
    }

    async fn execute(
        &self,
        ctx: &ExecutionContext,
        config: &Value,
        input: Envelope,
    ) -> Result<NodeOutcome, NodeError> {
        let workflow_id = config
            .get("workflow_id")
            .and_then(|v| v.as_str())
            .and_then(|s| Uuid::parse_str(s).ok())
            .ok_or_else(|| NodeError::config("sub_workflow requires a workflow_id"))?;

        let launcher = ctx
            .launcher()
            .ok_or_else(|| NodeError::config("no run launcher available in this context"))?;

        // The child's root trace keeps this step as lineage
        let child_input = input.with_trace(input.trace.clone());
        let child_run_id = launcher
            .launch_child(workflow_id, child_input, ctx.step_id)
            .await?;

        Ok(NodeOutcome::Suspend { child_run_id })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::ctx;
    use serde_json::json;

    #[tokio::test]
    async fn test_missing_workflow_id_is_config_error() {
        let (ctx, trace) = ctx("call1");
        let input = Envelope::new(json!({}), trace);

        let err = SubWorkflowNode
            .execute(&ctx, &json!({}), input)
            .await
            .unwrap_err();
        assert!(matches!(err, NodeError::Config(_)));
    }

    #[tokio::test]
    async fn test_missing_launcher_is_config_error() {
        let (ctx, trace) = ctx("call1");
        let input = Envelope::new(json!({}), trace);
        let config = json!({"workflow_id": Uuid::now_v7().to_string()});

        let err = SubWorkflowNode.execute(&ctx, &config, input).await.unwrap_err();
        assert!(matches!(err, NodeError::Config(_)));
    }
}
