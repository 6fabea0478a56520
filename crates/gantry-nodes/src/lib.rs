//! # Gantry Nodes
//!
//! The built-in node catalog. Structural nodes the engine recognizes
//! (branch, for-each, merge, sub-workflow call, trigger entry-points) plus a
//! small set of general-purpose nodes (`noop`, `echo`, `set`,
//! `http_request`, variable access).
//!
//! Concrete third-party integrations register through the same
//! [`NodeDefinition`](gantry_core::NodeDefinition) contract but live out of
//! tree.

use std::sync::Arc;

use gantry_core::{NodeRegistry, RegistryError};

pub mod branch;
pub mod echo;
pub mod for_each;
pub mod http_request;
pub mod merge;
pub mod noop;
pub mod set;
pub mod sub_workflow;
pub mod triggers;
pub mod variables;

#[cfg(test)]
pub(crate) mod test_support;

pub use branch::BranchNode;
pub use echo::EchoNode;
pub use for_each::ForEachNode;
pub use http_request::HttpRequestNode;
pub use merge::MergeNode;
pub use noop::NoopNode;
pub use set::SetNode;
pub use sub_workflow::SubWorkflowNode;
pub use triggers::{ScheduleTriggerNode, WebhookTriggerNode};
pub use variables::{VariableGetNode, VariableSetNode};

/// Register every built-in node definition
pub fn register_builtins(registry: &mut NodeRegistry) -> Result<(), RegistryError> {
    registry.register(Arc::new(NoopNode))?;
    registry.register(Arc::new(EchoNode))?;
    registry.register(Arc::new(SetNode))?;
    registry.register(Arc::new(BranchNode))?;
    registry.register(Arc::new(ForEachNode))?;
    registry.register(Arc::new(MergeNode))?;
    registry.register(Arc::new(SubWorkflowNode))?;
    registry.register(Arc::new(HttpRequestNode::new()))?;
    registry.register(Arc::new(VariableGetNode))?;
    registry.register(Arc::new(VariableSetNode))?;
    registry.register(Arc::new(WebhookTriggerNode))?;
    registry.register(Arc::new(ScheduleTriggerNode))?;
    Ok(())
}

/// A registry pre-populated with the built-in catalog
pub fn builtin_registry() -> NodeRegistry {
    let mut registry = NodeRegistry::new();
    register_builtins(&mut registry).expect("builtin node types are distinct");
    registry
}

#[cfg(test)]
mod tests {
    use super::*;
    use gantry_core::NodeKind;

    #[test]
    fn test_builtin_catalog() {
        let registry = builtin_registry();

        for node_type in [
            "noop",
            "echo",
            "set",
            "branch",
            "for_each",
            "merge",
            "sub_workflow",
            "http_request",
            "variable_get",
            "variable_set",
            "webhook_trigger",
            "schedule_trigger",
        ] {
            assert!(registry.contains(node_type), "missing {}", node_type);
        }
    }

    #[test]
    fn test_structural_kinds() {
        let registry = builtin_registry();

        assert_eq!(registry.kind_of("branch"), Some(NodeKind::Branch));
        assert_eq!(registry.kind_of("for_each"), Some(NodeKind::Loop));
        assert_eq!(registry.kind_of("merge"), Some(NodeKind::Merge));
        assert_eq!(registry.kind_of("sub_workflow"), Some(NodeKind::SubWorkflow));
        assert_eq!(registry.kind_of("webhook_trigger"), Some(NodeKind::Trigger));
        assert_eq!(registry.kind_of("schedule_trigger"), Some(NodeKind::Trigger));
        assert_eq!(registry.kind_of("noop"), Some(NodeKind::Standard));
    }
}
