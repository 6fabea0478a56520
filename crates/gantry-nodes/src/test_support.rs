//! Shared helpers for node tests

use std::sync::Arc;

use uuid::Uuid;

use gantry_core::{ExecutionContext, MemoryVariableStore, Trace};

/// A bare execution context plus a matching trace for building inputs
pub fn ctx(node_id: &str) -> (ExecutionContext, Trace) {
    let workflow_id = Uuid::now_v7();
    let run_id = Uuid::now_v7();
    let trace = Trace::root(workflow_id, run_id).at_step(node_id, 1, 1);
    let ctx = ExecutionContext::new(
        workflow_id,
        run_id,
        node_id,
        Uuid::now_v7(),
        1,
        1,
        3,
        Arc::new(MemoryVariableStore::new()),
    );
    (ctx, trace)
}
