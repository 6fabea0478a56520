//! Variable store backed by the persistence store
//!
//! Production runs use this store so variables survive restarts. Tests and
//! one-off node execution use [`gantry_core::MemoryVariableStore`] instead;
//! the engine selects at startup.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;

use gantry_core::{VariableError, VariableScope, VariableStore};
use gantry_storage::EngineStore;

pub struct PersistentVariableStore {
    store: Arc<dyn EngineStore>,
}

impl PersistentVariableStore {
    pub fn new(store: Arc<dyn EngineStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl VariableStore for PersistentVariableStore {
    async fn get(
        &self,
        scope: VariableScope,
        scope_key: &str,
        name: &str,
    ) -> Result<Option<serde_json::Value>, VariableError> {
        self.store
            .get_variable(scope, scope_key, name)
            .await
            .map_err(|e| VariableError::store(e.to_string()))
    }

    async fn set(
        &self,
        scope: VariableScope,
        scope_key: &str,
        name: &str,
        value: serde_json::Value,
    ) -> Result<(), VariableError> {
        self.store
            .set_variable(scope, scope_key, name, value)
            .await
            .map_err(|e| VariableError::store(e.to_string()))
    }

    async fn delete(
        &self,
        scope: VariableScope,
        scope_key: &str,
        name: &str,
    ) -> Result<(), VariableError> {
        self.store
            .delete_variable(scope, scope_key, name)
            .await
            .map_err(|e| VariableError::store(e.to_string()))
    }

    async fn list(
        &self,
        scope: VariableScope,
        scope_key: &str,
    ) -> Result<BTreeMap<String, serde_json::Value>, VariableError> {
        self.store
            .list_variables(scope, scope_key)
            .await
            .map_err(|e| VariableError::store(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gantry_storage::InMemoryEngineStore;
    use serde_json::json;

    #[tokio::test]
    async fn test_persistent_store_delegates() {
        let backing = Arc::new(InMemoryEngineStore::new());
        let store = PersistentVariableStore::new(backing.clone());

        store
            .set(VariableScope::Workflow, "wf-1", "limit", json!(10))
            .await
            .unwrap();

        assert_eq!(
            store
                .get(VariableScope::Workflow, "wf-1", "limit")
                .await
                .unwrap(),
            Some(json!(10))
        );

        let all = store.list(VariableScope::Workflow, "wf-1").await.unwrap();
        assert_eq!(all.len(), 1);

        store
            .delete(VariableScope::Workflow, "wf-1", "limit")
            .await
            .unwrap();
        assert!(store
            .get(VariableScope::Workflow, "wf-1", "limit")
            .await
            .unwrap()
            .is_none());
    }
}
