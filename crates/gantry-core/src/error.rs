// Error taxonomy for engine operations

use thiserror::Error;

use crate::node::NodeError;
use crate::registry::RegistryError;

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, EngineError>;

/// Distinguished failure reasons persisted on runs and steps
pub mod reason {
    /// Run exceeded `max_steps_per_run`
    pub const STEP_BUDGET_EXCEEDED: &str = "step_budget_exceeded";

    /// Run exceeded `timeout_seconds`
    pub const TIMEOUT: &str = "timeout";

    /// A step referenced a node type absent from the fleet's registry
    pub const UNKNOWN_NODE_TYPE: &str = "unknown_node_type";

    /// A queue item exhausted its delivery attempts
    pub const DELIVERY_EXHAUSTED: &str = "delivery_exhausted";
}

/// Errors that cross engine component boundaries
///
/// The variants follow the behavioral taxonomy the HTTP surface maps onto
/// status codes: validation → 400, not-found → 404, precondition → 409,
/// everything else → 500.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Bad input at an API boundary; no state change happened
    #[error("validation error: {0}")]
    Validation(String),

    /// Unknown id
    #[error("not found: {0}")]
    NotFound(String),

    /// State precondition violated (e.g. transitioning a terminal run)
    #[error("precondition failed: {0}")]
    Precondition(String),

    /// Persistence failure, surfaced after retries are exhausted
    #[error("store error: {0}")]
    Store(String),

    /// A node definition reported failure
    #[error(transparent)]
    Node(#[from] NodeError),

    /// The executing fleet does not provide the referenced node type
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// `max_steps_per_run` or `timeout_seconds` exceeded
    #[error("budget exceeded: {0}")]
    BudgetExceeded(String),

    /// Operation observed the cancellation signal
    #[error("cancelled")]
    Cancelled,

    /// Bad engine configuration
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Internal error
    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl EngineError {
    pub fn validation(msg: impl Into<String>) -> Self {
        EngineError::Validation(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        EngineError::NotFound(msg.into())
    }

    pub fn precondition(msg: impl Into<String>) -> Self {
        EngineError::Precondition(msg.into())
    }

    pub fn store(msg: impl Into<String>) -> Self {
        EngineError::Store(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        EngineError::Configuration(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_includes_context() {
        let err = EngineError::not_found("run 42");
        assert_eq!(err.to_string(), "not found: run 42");

        let err = EngineError::BudgetExceeded(reason::STEP_BUDGET_EXCEEDED.to_string());
        assert!(err.to_string().contains("step_budget_exceeded"));
    }

    #[test]
    fn test_node_error_conversion() {
        let err: EngineError = NodeError::failed("boom").into();
        assert!(matches!(err, EngineError::Node(_)));
    }
}
