//! Scoped variable store contract
//!
//! Variables are keyed by `(scope, scope_key, name)`. Run-scoped variables
//! are deleted when their run reaches a terminal state; workflow and global
//! variables live until explicitly removed. Writers to the same key are
//! serialized; last writer wins, with no versioning.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Variable visibility scope
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VariableScope {
    /// Scoped to one run; `scope_key` is the run id
    Run,

    /// Shared across runs of one workflow; `scope_key` is the workflow id
    Workflow,

    /// Process-wide; `scope_key` is empty
    Global,
}

impl std::fmt::Display for VariableScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Run => write!(f, "run"),
            Self::Workflow => write!(f, "workflow"),
            Self::Global => write!(f, "global"),
        }
    }
}

impl std::str::FromStr for VariableScope {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "run" => Ok(Self::Run),
            "workflow" => Ok(Self::Workflow),
            "global" => Ok(Self::Global),
            other => Err(format!("unknown variable scope: {}", other)),
        }
    }
}

/// Error from variable store operations
#[derive(Debug, thiserror::Error)]
pub enum VariableError {
    #[error("variable store error: {0}")]
    Store(String),
}

impl VariableError {
    pub fn store(msg: impl Into<String>) -> Self {
        VariableError::Store(msg.into())
    }
}

/// Scoped key/value store addressed via trace context
///
/// Backed either by the persistence store (survives restarts) or by
/// [`MemoryVariableStore`]; the engine selects at startup.
#[async_trait]
pub trait VariableStore: Send + Sync {
    /// Read a variable; `None` when unset
    async fn get(
        &self,
        scope: VariableScope,
        scope_key: &str,
        name: &str,
    ) -> Result<Option<serde_json::Value>, VariableError>;

    /// Write a variable, overwriting any previous value
    async fn set(
        &self,
        scope: VariableScope,
        scope_key: &str,
        name: &str,
        value: serde_json::Value,
    ) -> Result<(), VariableError>;

    /// Remove a variable; removing an absent key is not an error
    async fn delete(
        &self,
        scope: VariableScope,
        scope_key: &str,
        name: &str,
    ) -> Result<(), VariableError>;

    /// All variables within one scope instance
    async fn list(
        &self,
        scope: VariableScope,
        scope_key: &str,
    ) -> Result<BTreeMap<String, serde_json::Value>, VariableError>;
}

/// In-memory variable store
///
/// Used by tests and by one-off node execution (the draft node-test
/// endpoint), where writes must not leak into persisted state.
#[derive(Default)]
pub struct MemoryVariableStore {
    values: std::sync::RwLock<BTreeMap<(VariableScope, String, String), serde_json::Value>>,
}

impl MemoryVariableStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl VariableStore for MemoryVariableStore {
    async fn get(
        &self,
        scope: VariableScope,
        scope_key: &str,
        name: &str,
    ) -> Result<Option<serde_json::Value>, VariableError> {
        let key = (scope, scope_key.to_string(), name.to_string());
        Ok(self.values.read().unwrap().get(&key).cloned())
    }

    async fn set(
        &self,
        scope: VariableScope,
        scope_key: &str,
        name: &str,
        value: serde_json::Value,
    ) -> Result<(), VariableError> {
        let key = (scope, scope_key.to_string(), name.to_string());
        self.values.write().unwrap().insert(key, value);
        Ok(())
    }

    async fn delete(
        &self,
        scope: VariableScope,
        scope_key: &str,
        name: &str,
    ) -> Result<(), VariableError> {
        let key = (scope, scope_key.to_string(), name.to_string());
        self.values.write().unwrap().remove(&key);
        Ok(())
    }

    async fn list(
        &self,
        scope: VariableScope,
        scope_key: &str,
    ) -> Result<BTreeMap<String, serde_json::Value>, VariableError> {
        Ok(self
            .values
            .read()
            .unwrap()
            .iter()
            .filter(|((s, k, _), _)| *s == scope && k == scope_key)
            .map(|((_, _, name), value)| (name.clone(), value.clone()))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_memory_store_round_trip() {
        let store = MemoryVariableStore::new();

        store
            .set(VariableScope::Run, "run-1", "count", json!(3))
            .await
            .unwrap();
        assert_eq!(
            store.get(VariableScope::Run, "run-1", "count").await.unwrap(),
            Some(json!(3))
        );

        // Scopes are isolated
        assert!(store
            .get(VariableScope::Workflow, "run-1", "count")
            .await
            .unwrap()
            .is_none());

        store
            .delete(VariableScope::Run, "run-1", "count")
            .await
            .unwrap();
        assert!(store
            .get(VariableScope::Run, "run-1", "count")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_memory_store_last_writer_wins() {
        let store = MemoryVariableStore::new();

        store
            .set(VariableScope::Global, "", "flag", json!("a"))
            .await
            .unwrap();
        store
            .set(VariableScope::Global, "", "flag", json!("b"))
            .await
            .unwrap();

        assert_eq!(
            store.get(VariableScope::Global, "", "flag").await.unwrap(),
            Some(json!("b"))
        );
    }
}
