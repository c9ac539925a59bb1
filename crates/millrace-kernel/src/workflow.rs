//! Workflow graph structure
//!
//! A workflow is a directed acyclic graph of data-only nodes. The engine
//! never executes node logic itself; it schedules nodes in topological
//! order and hands each one to the matching handler.

use std::collections::{HashMap, HashSet, VecDeque};

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Closed set of node behaviors the scheduler dispatches on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NodeKind {
    /// LLM call routed to the external node-type handler.
    Llm { operation: String },
    /// HTTP request node, external handler.
    Http,
    /// Data transform node, external handler.
    Transform,
    /// Suspends the execution and resumes via a durable timer.
    Delay,
    /// Tenant code executed in the sandbox.
    Sandboxed,
    /// Third-party connector routed through the integration dispatcher.
    Connector { app: String, operation: String },
    /// Anything the engine does not recognize; routed to the fallback path.
    Unknown { type_name: String },
}

impl NodeKind {
    /// Resolve a kind from a raw node type string like `"llm.generate"`,
    /// `"connector:stripe.charge"` or `"delay"`.
    pub fn from_type_name(type_name: &str) -> Self {
        let t = type_name.trim();
        let lower = t.to_ascii_lowercase();
        if let Some(op) = lower.strip_prefix("llm.").or_else(|| lower.strip_prefix("llm:")) {
            return NodeKind::Llm {
                operation: op.to_string(),
            };
        }
        if let Some(rest) = lower
            .strip_prefix("connector:")
            .or_else(|| lower.strip_prefix("connector."))
        {
            let (app, operation) = match rest.split_once('.') {
                Some((a, o)) => (a.to_string(), o.to_string()),
                None => (rest.to_string(), "default".to_string()),
            };
            return NodeKind::Connector { app, operation };
        }
        match lower.as_str() {
            "http" | "http.request" => NodeKind::Http,
            "transform" => NodeKind::Transform,
            "delay" | "wait" => NodeKind::Delay,
            "code" | "script" | "sandboxed" => NodeKind::Sandboxed,
            "llm" => NodeKind::Llm {
                operation: "generate".to_string(),
            },
            _ => NodeKind::Unknown {
                type_name: t.to_string(),
            },
        }
    }

    /// Connector id for concurrency accounting, when the kind carries one.
    pub fn connector_app(&self) -> Option<&str> {
        match self {
            NodeKind::Connector { app, .. } => Some(app),
            _ => None,
        }
    }
}

/// Tenant code attached to a sandboxed node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeCode {
    pub code: String,
    /// Entry-point function name; defaults to `main`.
    #[serde(default = "default_entry_point")]
    pub entry_point: String,
}

fn default_entry_point() -> String {
    "main".to_string()
}

/// One node of a workflow graph. Data only; behavior lives in handlers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowNode {
    pub id: String,
    pub label: String,
    pub kind: NodeKind,
    /// Raw parameters; references into other nodes' outputs are resolved
    /// by the external parameter resolver at execution time.
    #[serde(default)]
    pub params: Value,
    /// Per-node timeout override.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    /// Connector id override for concurrency accounting and breakers.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connector_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub runtime: Option<RuntimeCode>,
}

impl WorkflowNode {
    pub fn new(id: impl Into<String>, label: impl Into<String>, kind: NodeKind) -> Self {
        Self {
            id: id.into(),
            label: label.into(),
            kind,
            params: Value::Null,
            timeout_ms: None,
            connector_id: None,
            runtime: None,
        }
    }

    pub fn with_params(mut self, params: Value) -> Self {
        self.params = params;
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    pub fn with_runtime(mut self, code: impl Into<String>, entry_point: impl Into<String>) -> Self {
        self.runtime = Some(RuntimeCode {
            code: code.into(),
            entry_point: entry_point.into(),
        });
        self
    }

    /// Effective connector id: explicit override, else the kind's app.
    pub fn effective_connector_id(&self) -> Option<String> {
        self.connector_id
            .clone()
            .or_else(|| self.kind.connector_app().map(str::to_string))
    }

    /// Delay in milliseconds for a delay node, read from params.
    /// Accepts `delayMs`, `delay_ms` or a bare number.
    pub fn delay_ms(&self) -> u64 {
        match &self.params {
            Value::Number(n) => n.as_u64().unwrap_or(0),
            Value::Object(map) => map
                .get("delayMs")
                .or_else(|| map.get("delay_ms"))
                .and_then(Value::as_u64)
                .unwrap_or(0),
            _ => 0,
        }
    }

    /// Whether this node carries tenant code for the sandbox.
    pub fn is_sandboxed(&self) -> bool {
        self.runtime.is_some() || self.kind == NodeKind::Sandboxed
    }
}

/// Directed edge between two nodes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Edge {
    pub from: String,
    pub to: String,
}

/// Workflow graph: nodes plus adjacency, with validation and a
/// deterministic topological order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowGraph {
    pub id: String,
    pub name: String,
    nodes: HashMap<String, WorkflowNode>,
    edges: HashMap<String, Vec<Edge>>,
    reverse_edges: HashMap<String, Vec<Edge>>,
    /// Insertion order, used to break topological-sort ties deterministically.
    node_order: Vec<String>,
}

impl WorkflowGraph {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            nodes: HashMap::new(),
            edges: HashMap::new(),
            reverse_edges: HashMap::new(),
            node_order: Vec::new(),
        }
    }

    pub fn add_node(&mut self, node: WorkflowNode) -> &mut Self {
        let node_id = node.id.clone();
        if !self.nodes.contains_key(&node_id) {
            self.node_order.push(node_id.clone());
        }
        self.nodes.insert(node_id.clone(), node);
        self.edges.entry(node_id.clone()).or_default();
        self.reverse_edges.entry(node_id).or_default();
        self
    }

    pub fn connect(&mut self, from: &str, to: &str) -> &mut Self {
        let edge = Edge {
            from: from.to_string(),
            to: to.to_string(),
        };
        self.edges.entry(edge.from.clone()).or_default().push(edge.clone());
        self.reverse_edges.entry(edge.to.clone()).or_default().push(edge);
        self
    }

    pub fn get_node(&self, node_id: &str) -> Option<&WorkflowNode> {
        self.nodes.get(node_id)
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn node_ids(&self) -> impl Iterator<Item = &str> {
        self.node_order.iter().map(String::as_str)
    }

    pub fn successors(&self, node_id: &str) -> impl Iterator<Item = &str> {
        self.edges
            .get(node_id)
            .map(|v| v.as_slice())
            .unwrap_or(&[])
            .iter()
            .map(|e| e.to.as_str())
    }

    pub fn predecessors(&self, node_id: &str) -> impl Iterator<Item = &str> {
        self.reverse_edges
            .get(node_id)
            .map(|v| v.as_slice())
            .unwrap_or(&[])
            .iter()
            .map(|e| e.from.as_str())
    }

    /// Distinct connector ids across all nodes, in first-seen order.
    pub fn connector_ids(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for id in &self.node_order {
            if let Some(connector) = self.nodes[id].effective_connector_id()
                && seen.insert(connector.clone())
            {
                out.push(connector);
            }
        }
        out
    }

    /// Kahn topological sort, breaking ties by node insertion order so the
    /// result is stable across runs of the same graph.
    pub fn topological_sort(&self) -> Result<Vec<String>, String> {
        let mut in_degree: HashMap<&str, usize> =
            self.nodes.keys().map(|id| (id.as_str(), 0)).collect();
        for edges in self.edges.values() {
            for edge in edges {
                if let Some(d) = in_degree.get_mut(edge.to.as_str()) {
                    *d += 1;
                }
            }
        }

        let mut queue: VecDeque<&str> = self
            .node_order
            .iter()
            .map(String::as_str)
            .filter(|id| in_degree.get(id).copied() == Some(0))
            .collect();
        let mut result = Vec::with_capacity(self.nodes.len());

        while let Some(node_id) = queue.pop_front() {
            result.push(node_id.to_string());
            // Collect newly-freed successors, then enqueue them in insertion
            // order to keep the sort deterministic.
            let mut freed: Vec<&str> = Vec::new();
            for edge in self.edges.get(node_id).map(|v| v.as_slice()).unwrap_or(&[]) {
                if let Some(d) = in_degree.get_mut(edge.to.as_str()) {
                    *d -= 1;
                    if *d == 0 {
                        freed.push(edge.to.as_str());
                    }
                }
            }
            freed.sort_by_key(|id| self.node_order.iter().position(|n| n.as_str() == *id));
            queue.extend(freed);
        }

        if result.len() != self.nodes.len() {
            return Err("workflow graph contains a cycle".to_string());
        }
        Ok(result)
    }

    pub fn has_cycle(&self) -> bool {
        self.topological_sort().is_err()
    }

    /// Validate graph integrity, returning every problem found.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.nodes.is_empty() {
            errors.push("workflow has no nodes".to_string());
        }

        for (from, edges) in &self.edges {
            if !self.nodes.contains_key(from) {
                errors.push(format!("edge source node '{}' not found", from));
            }
            for edge in edges {
                if !self.nodes.contains_key(&edge.to) {
                    errors.push(format!("edge target node '{}' not found", edge.to));
                }
            }
        }

        if self.has_cycle() {
            errors.push("workflow graph contains a cycle".to_string());
        }

        for node in self.nodes.values() {
            if node.is_sandboxed() && node.runtime.is_none() {
                errors.push(format!("sandboxed node '{}' carries no code", node.id));
            }
        }

        if errors.is_empty() { Ok(()) } else { Err(errors) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn linear_graph() -> WorkflowGraph {
        let mut graph = WorkflowGraph::new("wf-1", "Linear");
        graph.add_node(WorkflowNode::new("a", "A", NodeKind::Transform));
        graph.add_node(WorkflowNode::new("b", "B", NodeKind::Http));
        graph.add_node(WorkflowNode::new("c", "C", NodeKind::Transform));
        graph.connect("a", "b");
        graph.connect("b", "c");
        graph
    }

    #[test]
    fn topological_sort_respects_edges() {
        let graph = linear_graph();
        assert_eq!(graph.topological_sort().unwrap(), vec!["a", "b", "c"]);
    }

    #[test]
    fn topological_sort_is_deterministic_for_diamonds() {
        let mut graph = WorkflowGraph::new("wf-d", "Diamond");
        graph.add_node(WorkflowNode::new("start", "Start", NodeKind::Transform));
        graph.add_node(WorkflowNode::new("left", "Left", NodeKind::Transform));
        graph.add_node(WorkflowNode::new("right", "Right", NodeKind::Transform));
        graph.add_node(WorkflowNode::new("join", "Join", NodeKind::Transform));
        graph.connect("start", "left");
        graph.connect("start", "right");
        graph.connect("left", "join");
        graph.connect("right", "join");

        let first = graph.topological_sort().unwrap();
        for _ in 0..10 {
            assert_eq!(graph.topological_sort().unwrap(), first);
        }
        assert_eq!(first, vec!["start", "left", "right", "join"]);
    }

    #[test]
    fn cycle_detected() {
        let mut graph = linear_graph();
        graph.connect("c", "a");
        assert!(graph.has_cycle());
        assert!(
            graph
                .validate()
                .unwrap_err()
                .iter()
                .any(|e| e.contains("cycle"))
        );
    }

    #[test]
    fn validate_reports_missing_edge_targets() {
        let mut graph = linear_graph();
        graph.connect("c", "ghost");
        let errors = graph.validate().unwrap_err();
        assert!(errors.iter().any(|e| e.contains("ghost")));
    }

    #[test]
    fn node_kind_resolution() {
        assert_eq!(
            NodeKind::from_type_name("llm.generate"),
            NodeKind::Llm {
                operation: "generate".into()
            }
        );
        assert_eq!(
            NodeKind::from_type_name("connector:stripe.charge"),
            NodeKind::Connector {
                app: "stripe".into(),
                operation: "charge".into()
            }
        );
        assert_eq!(NodeKind::from_type_name("delay"), NodeKind::Delay);
        assert_eq!(
            NodeKind::from_type_name("weird-thing"),
            NodeKind::Unknown {
                type_name: "weird-thing".into()
            }
        );
    }

    #[test]
    fn delay_ms_from_params() {
        let node = WorkflowNode::new("d", "Delay", NodeKind::Delay)
            .with_params(json!({"delayMs": 30000}));
        assert_eq!(node.delay_ms(), 30_000);

        let zero = WorkflowNode::new("d", "Delay", NodeKind::Delay).with_params(json!({}));
        assert_eq!(zero.delay_ms(), 0);
    }

    #[test]
    fn connector_ids_deduped_in_order() {
        let mut graph = WorkflowGraph::new("wf-c", "Connectors");
        graph.add_node(WorkflowNode::new(
            "a",
            "A",
            NodeKind::from_type_name("connector:stripe.charge"),
        ));
        graph.add_node(WorkflowNode::new(
            "b",
            "B",
            NodeKind::from_type_name("connector:slack.post"),
        ));
        graph.add_node(WorkflowNode::new(
            "c",
            "C",
            NodeKind::from_type_name("connector:stripe.refund"),
        ));
        assert_eq!(graph.connector_ids(), vec!["stripe", "slack"]);
    }
}
