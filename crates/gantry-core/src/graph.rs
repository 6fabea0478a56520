//! Workflow graph definitions
//!
//! A workflow definition is an ordered set of typed nodes connected by edges.
//! Handles name semantically distinct outputs: a branch node emits on `true`
//! or `false`, and any node may carry an `error` handle consumed only when
//! the node fails terminally.

use serde::{Deserialize, Serialize};

/// Handle that error-handler edges attach to
pub const ERROR_HANDLE: &str = "error";

/// Editor position of a node; carried through verbatim
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

/// One node in a workflow definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSpec {
    /// Stable id unique within the definition
    pub id: String,

    /// Registered node type, e.g. `http_request`
    #[serde(rename = "type")]
    pub node_type: String,

    #[serde(default)]
    pub position: Position,

    /// Node-type specific configuration
    #[serde(default)]
    pub config: serde_json::Value,
}

/// One edge in a workflow definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EdgeSpec {
    pub id: String,
    pub source: String,
    pub target: String,

    /// Names the source output this edge is bound to; `None` is the default
    /// output
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_handle: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_handle: Option<String>,
}

impl EdgeSpec {
    /// Whether this edge consumes terminal node failures
    pub fn is_error_handler(&self) -> bool {
        self.source_handle.as_deref() == Some(ERROR_HANDLE)
    }
}

/// A complete workflow graph
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GraphDefinition {
    #[serde(default)]
    pub nodes: Vec<NodeSpec>,
    #[serde(default)]
    pub edges: Vec<EdgeSpec>,
}

/// Structural validation failures
#[derive(Debug, thiserror::Error)]
pub enum GraphError {
    #[error("duplicate node id: {0}")]
    DuplicateNode(String),

    #[error("duplicate edge id: {0}")]
    DuplicateEdge(String),

    #[error("edge {edge_id} references unknown node: {node_id}")]
    DanglingEdge { edge_id: String, node_id: String },

    #[error("graph contains a cycle not mediated by a loop node (through {0})")]
    UnmediatedCycle(String),
}

impl GraphDefinition {
    /// Validate node/edge identity invariants
    ///
    /// Every edge endpoint must reference an existing node id and ids must be
    /// unique. Cycle checking is separate ([`Self::validate_cycles`]) because
    /// it needs node-kind knowledge from the registry.
    pub fn validate(&self) -> Result<(), GraphError> {
        let mut seen = std::collections::HashSet::new();
        for node in &self.nodes {
            if !seen.insert(node.id.as_str()) {
                return Err(GraphError::DuplicateNode(node.id.clone()));
            }
        }

        let mut edge_ids = std::collections::HashSet::new();
        for edge in &self.edges {
            if !edge_ids.insert(edge.id.as_str()) {
                return Err(GraphError::DuplicateEdge(edge.id.clone()));
            }
            for endpoint in [&edge.source, &edge.target] {
                if !seen.contains(endpoint.as_str()) {
                    return Err(GraphError::DanglingEdge {
                        edge_id: edge.id.clone(),
                        node_id: endpoint.clone(),
                    });
                }
            }
        }

        Ok(())
    }

    /// Reject cycles that do not pass through a loop node
    ///
    /// `is_loop` reports whether a node id belongs to a loop-kind node. Edges
    /// leaving a loop node are cut before the reachability check, so cycles
    /// mediated by a loop are permitted.
    pub fn validate_cycles(&self, is_loop: impl Fn(&str) -> bool) -> Result<(), GraphError> {
        use std::collections::HashMap;

        let mut adjacency: HashMap<&str, Vec<&str>> = HashMap::new();
        for edge in &self.edges {
            if is_loop(&edge.source) {
                continue;
            }
            adjacency.entry(&edge.source).or_default().push(&edge.target);
        }

        // Iterative DFS with coloring: 0 = unvisited, 1 = in stack, 2 = done
        let mut color: HashMap<&str, u8> = HashMap::new();
        for node in &self.nodes {
            if color.get(node.id.as_str()).copied().unwrap_or(0) != 0 {
                continue;
            }
            let mut stack: Vec<(&str, usize)> = vec![(node.id.as_str(), 0)];
            color.insert(node.id.as_str(), 1);
            while let Some((current, next_child)) = stack.pop() {
                let children = adjacency.get(current).map(|v| v.as_slice()).unwrap_or(&[]);
                if next_child < children.len() {
                    stack.push((current, next_child + 1));
                    let child = children[next_child];
                    match color.get(child).copied().unwrap_or(0) {
                        0 => {
                            color.insert(child, 1);
                            stack.push((child, 0));
                        }
                        1 => return Err(GraphError::UnmediatedCycle(child.to_string())),
                        _ => {}
                    }
                } else {
                    color.insert(current, 2);
                }
            }
        }

        Ok(())
    }

    pub fn node(&self, id: &str) -> Option<&NodeSpec> {
        self.nodes.iter().find(|n| n.id == id)
    }

    /// All edges leaving `node_id`
    pub fn outgoing<'a, 'b>(&'a self, node_id: &'b str) -> impl Iterator<Item = &'a EdgeSpec> + 'b
    where
        'a: 'b,
    {
        self.edges.iter().filter(move |e| e.source == node_id)
    }

    /// All edges arriving at `node_id`
    pub fn incoming<'a, 'b>(&'a self, node_id: &'b str) -> impl Iterator<Item = &'a EdgeSpec> + 'b
    where
        'a: 'b,
    {
        self.edges.iter().filter(move |e| e.target == node_id)
    }

    /// Edges to follow after a step produced `chosen_handle`
    ///
    /// With a chosen handle only matching edges are followed. Without one,
    /// every non-error edge is followed (no handle discrimination).
    pub fn successors(&self, node_id: &str, chosen_handle: Option<&str>) -> Vec<&EdgeSpec> {
        self.outgoing(node_id)
            .filter(|e| match chosen_handle {
                Some(handle) => e.source_handle.as_deref() == Some(handle),
                None => !e.is_error_handler(),
            })
            .collect()
    }

    /// Error-handler edges leaving `node_id`
    pub fn error_handlers(&self, node_id: &str) -> Vec<&EdgeSpec> {
        self.outgoing(node_id).filter(|e| e.is_error_handler()).collect()
    }

    /// Nodes matching an entry-point predicate (trigger nodes)
    pub fn entry_points(&self, is_entry: impl Fn(&NodeSpec) -> bool) -> Vec<&NodeSpec> {
        self.nodes.iter().filter(|n| is_entry(n)).collect()
    }

    /// Graph-level predecessor node ids of `node_id` (excluding error edges)
    pub fn predecessor_nodes(&self, node_id: &str) -> Vec<&str> {
        self.incoming(node_id)
            .filter(|e| !e.is_error_handler())
            .map(|e| e.source.as_str())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn node(id: &str, node_type: &str) -> NodeSpec {
        NodeSpec {
            id: id.into(),
            node_type: node_type.into(),
            position: Position::default(),
            config: json!({}),
        }
    }

    fn edge(id: &str, source: &str, target: &str, handle: Option<&str>) -> EdgeSpec {
        EdgeSpec {
            id: id.into(),
            source: source.into(),
            target: target.into(),
            source_handle: handle.map(String::from),
            target_handle: None,
        }
    }

    fn branch_graph() -> GraphDefinition {
        GraphDefinition {
            nodes: vec![
                node("start", "noop"),
                node("branch", "branch"),
                node("a", "noop"),
                node("b", "noop"),
            ],
            edges: vec![
                edge("e1", "start", "branch", None),
                edge("e2", "branch", "a", Some("true")),
                edge("e3", "branch", "b", Some("false")),
            ],
        }
    }

    #[test]
    fn test_validate_accepts_branch_graph() {
        branch_graph().validate().unwrap();
    }

    #[test]
    fn test_validate_rejects_dangling_edge() {
        let mut graph = branch_graph();
        graph.edges.push(edge("e4", "a", "missing", None));

        assert!(matches!(
            graph.validate(),
            Err(GraphError::DanglingEdge { .. })
        ));
    }

    #[test]
    fn test_validate_rejects_duplicate_node() {
        let mut graph = branch_graph();
        graph.nodes.push(node("a", "noop"));

        assert!(matches!(graph.validate(), Err(GraphError::DuplicateNode(_))));
    }

    #[test]
    fn test_successors_follow_chosen_handle() {
        let graph = branch_graph();

        let true_edges = graph.successors("branch", Some("true"));
        assert_eq!(true_edges.len(), 1);
        assert_eq!(true_edges[0].target, "a");

        let all = graph.successors("start", None);
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].target, "branch");
    }

    #[test]
    fn test_error_handler_edges_not_followed_by_default() {
        let mut graph = branch_graph();
        graph.nodes.push(node("handler", "noop"));
        graph
            .edges
            .push(edge("e5", "start", "handler", Some(ERROR_HANDLE)));

        let default = graph.successors("start", None);
        assert_eq!(default.len(), 1);
        assert_eq!(default[0].target, "branch");

        let handlers = graph.error_handlers("start");
        assert_eq!(handlers.len(), 1);
        assert_eq!(handlers[0].target, "handler");
    }

    #[test]
    fn test_cycle_detection() {
        let mut graph = GraphDefinition {
            nodes: vec![node("a", "noop"), node("b", "noop")],
            edges: vec![edge("e1", "a", "b", None), edge("e2", "b", "a", None)],
        };

        assert!(matches!(
            graph.validate_cycles(|_| false),
            Err(GraphError::UnmediatedCycle(_))
        ));

        // The same shape is fine when the back-edge leaves a loop node
        graph.nodes[1].node_type = "for_each".into();
        graph.validate_cycles(|id| id == "b").unwrap();
    }
}
