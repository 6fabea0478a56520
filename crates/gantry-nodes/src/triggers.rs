//! Trigger entry-point node definitions
//!
//! Entry-point nodes are never executed by the queue-driven step loop; the
//! trigger engine reads their configuration when a workflow version deploys
//! and wires the corresponding trigger rows. Their `execute` is therefore a
//! hard error.

use async_trait::async_trait;
use serde_json::Value;

use gantry_core::{
    Envelope, ExecutionContext, NodeDefinition, NodeError, NodeKind, NodeMeta, NodeOutcome,
    OptionItem, ParameterSpec, ParameterValidator,
};

/// Inbound webhook entry point
pub struct WebhookTriggerNode;

#[async_trait]
impl NodeDefinition for WebhookTriggerNode {
    fn meta(&self) -> NodeMeta {
        NodeMeta::new("webhook_trigger", "Webhook", "trigger")
            .kind(NodeKind::Trigger)
            .parameter(
                ParameterSpec::enumeration(
                    "method",
                    "Method",
                    ["GET", "POST", "PUT", "DELETE"]
                        .into_iter()
                        .map(|m| OptionItem::new(m, m))
                        .collect(),
                )
                .with_default("POST"),
            )
            .parameter(ParameterSpec::string("secret", "Shared secret").in_group("security"))
            .parameter(
                ParameterSpec::enumeration(
                    "mode",
                    "Response mode",
                    vec![
                        OptionItem::new("async", "Respond immediately (202)"),
                        OptionItem::new("sync", "Wait for run output"),
                    ],
                )
                .with_default("async"),
            )
            .parameter(
                ParameterSpec::integer("timeout_seconds", "Sync wait (seconds)")
                    .with_default(30)
                    .visible_if("mode", "sync"),
            )
            .parameter(
                ParameterSpec::integer("response_status", "Success status")
                    .with_default(200)
                    .visible_if("mode", "sync"),
            )
    }

    async fn execute(
        &self,
        _ctx: &ExecutionContext,
        _config: &Value,
        _input: Envelope,
    ) -> Result<NodeOutcome, NodeError> {
        Err(NodeError::config(
            "webhook_trigger is an entry point and is never executed",
        ))
    }
}

/// Cron schedule entry point
pub struct ScheduleTriggerNode;

#[async_trait]
impl NodeDefinition for ScheduleTriggerNode {
    fn meta(&self) -> NodeMeta {
        NodeMeta::new("schedule_trigger", "Schedule", "trigger")
            .kind(NodeKind::Trigger)
            .parameter(
                ParameterSpec::string("cron", "Cron expression")
                    .required()
                    .validator(ParameterValidator::NonEmpty),
            )
    }

    async fn execute(
        &self,
        _ctx: &ExecutionContext,
        _config: &Value,
        _input: Envelope,
    ) -> Result<NodeOutcome, NodeError> {
        Err(NodeError::config(
            "schedule_trigger is an entry point and is never executed",
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::ctx;
    use serde_json::json;

    #[tokio::test]
    async fn test_trigger_nodes_refuse_execution() {
        let (ctx, trace) = ctx("hook");
        let input = Envelope::new(json!({}), trace);

        assert!(WebhookTriggerNode
            .execute(&ctx, &json!({}), input.clone())
            .await
            .is_err());
        assert!(ScheduleTriggerNode
            .execute(&ctx, &json!({}), input)
            .await
            .is_err());
    }
}
