//! Process-wide node registry
//!
//! The registry maps `node_type` strings to node definitions. It is built
//! during startup, installed exactly once, and read lock-free thereafter;
//! workers and the HTTP surface must not start before installation.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, OnceLock};

use crate::node::{NodeDefinition, NodeKind, NodeMeta};

static GLOBAL: OnceLock<Arc<NodeRegistry>> = OnceLock::new();

/// Errors from registry operations
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// Node type not registered; the referencing step fails without retry
    #[error("unknown node type: {0}")]
    UnknownNodeType(String),

    /// A node type was registered twice
    #[error("node type already registered: {0}")]
    DuplicateNodeType(String),

    /// The global registry was installed twice
    #[error("node registry already installed")]
    AlreadyInstalled,
}

/// Catalog of node definitions
pub struct NodeRegistry {
    definitions: HashMap<String, Arc<dyn NodeDefinition>>,
}

impl Default for NodeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self {
            definitions: HashMap::new(),
        }
    }

    /// Register a node definition under its declared type
    pub fn register(&mut self, definition: Arc<dyn NodeDefinition>) -> Result<(), RegistryError> {
        let node_type = definition.meta().node_type;
        if self.definitions.contains_key(&node_type) {
            return Err(RegistryError::DuplicateNodeType(node_type));
        }
        self.definitions.insert(node_type, definition);
        Ok(())
    }

    /// Look up a definition, failing with `UnknownNodeType`
    pub fn get(&self, node_type: &str) -> Result<Arc<dyn NodeDefinition>, RegistryError> {
        self.definitions
            .get(node_type)
            .cloned()
            .ok_or_else(|| RegistryError::UnknownNodeType(node_type.to_string()))
    }

    pub fn contains(&self, node_type: &str) -> bool {
        self.definitions.contains_key(node_type)
    }

    /// Metadata for every registered type, sorted by type name
    pub fn metas(&self) -> Vec<NodeMeta> {
        let mut metas: Vec<NodeMeta> = self.definitions.values().map(|d| d.meta()).collect();
        metas.sort_by(|a, b| a.node_type.cmp(&b.node_type));
        metas
    }

    /// Metadata filtered by structural kind
    pub fn metas_of_kind(&self, kind: NodeKind) -> Vec<NodeMeta> {
        self.metas().into_iter().filter(|m| m.kind == kind).collect()
    }

    /// Structural kind of a node type, if registered
    pub fn kind_of(&self, node_type: &str) -> Option<NodeKind> {
        self.definitions.get(node_type).map(|d| d.meta().kind)
    }

    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }

    pub fn node_types(&self) -> impl Iterator<Item = &str> {
        self.definitions.keys().map(|s| s.as_str())
    }

    /// Install this registry as the process-wide catalog
    ///
    /// Runs each definition's `initialize` hook, then freezes the registry.
    /// Must be called exactly once, before the worker loop or HTTP server
    /// starts.
    pub fn install(self) -> Result<Arc<NodeRegistry>, RegistryError> {
        for definition in self.definitions.values() {
            definition.initialize();
        }
        let registry = Arc::new(self);
        GLOBAL
            .set(registry.clone())
            .map_err(|_| RegistryError::AlreadyInstalled)?;
        Ok(registry)
    }

    /// The installed process-wide registry
    pub fn global() -> Option<Arc<NodeRegistry>> {
        GLOBAL.get().cloned()
    }
}

impl fmt::Debug for NodeRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeRegistry")
            .field("node_types", &self.definitions.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::Envelope;
    use crate::node::{ExecutionContext, NodeError, NodeOutcome};
    use async_trait::async_trait;

    struct TestNode;

    #[async_trait]
    impl NodeDefinition for TestNode {
        fn meta(&self) -> NodeMeta {
            NodeMeta::new("test_node", "Test", "testing")
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

    #[test]
    fn test_register_and_get() {
        let mut registry = NodeRegistry::new();
        registry.register(Arc::new(TestNode)).unwrap();

        assert!(registry.contains("test_node"));
        assert!(registry.get("test_node").is_ok());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_unknown_node_type() {
        let registry = NodeRegistry::new();
        let err = match registry.get("missing") {
            Err(e) => e,
            Ok(_) => panic!("expected an error"),
        };
        assert!(matches!(err, RegistryError::UnknownNodeType(_)));
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let mut registry = NodeRegistry::new();
        registry.register(Arc::new(TestNode)).unwrap();
        let err = registry.register(Arc::new(TestNode)).unwrap_err();
        assert!(matches!(err, RegistryError::DuplicateNodeType(_)));
    }

    #[test]
    fn test_metas_sorted() {
        let mut registry = NodeRegistry::new();
        registry.register(Arc::new(TestNode)).unwrap();
        let metas = registry.metas();
        assert_eq!(metas.len(), 1);
        assert_eq!(metas[0].node_type, "test_node");
    }
}
