//! Workflow graph definitions

use std::collections::{BTreeSet, HashSet};

use chrono::{DateTime, Utc};
use petgraph::algo::toposort;
use petgraph::graphmap::DiGraphMap;
use petgraph::visit::Dfs;
use petgraph::Direction;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[cfg(feature = "openapi")]
use utoipa::ToSchema;

use crate::reliability::RetryPolicy;

/// Kind of work a node performs; selects the block handler
///
/// Written as a snake_case string both in JSON and in logs. `Custom` carries
/// a registry key for handlers contributed outside the engine and is written
/// as `custom:{name}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum BlockType {
    HttpRequest,
    Email,
    Blockchain,
    AiPrompt,
    Transform,
    Delay,
    ManualApproval,
    Webhook,
    Custom(String),
}

impl std::fmt::Display for BlockType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::HttpRequest => write!(f, "http_request"),
            Self::Email => write!(f, "email"),
            Self::Blockchain => write!(f, "blockchain"),
            Self::AiPrompt => write!(f, "ai_prompt"),
            Self::Transform => write!(f, "transform"),
            Self::Delay => write!(f, "delay"),
            Self::ManualApproval => write!(f, "manual_approval"),
            Self::Webhook => write!(f, "webhook"),
            Self::Custom(name) => write!(f, "custom:{name}"),
        }
    }
}

impl std::str::FromStr for BlockType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "http_request" => Ok(Self::HttpRequest),
            "email" => Ok(Self::Email),
            "blockchain" => Ok(Self::Blockchain),
            "ai_prompt" => Ok(Self::AiPrompt),
            "transform" => Ok(Self::Transform),
            "delay" => Ok(Self::Delay),
            "manual_approval" => Ok(Self::ManualApproval),
            "webhook" => Ok(Self::Webhook),
            other => match other.strip_prefix("custom:") {
                Some(name) if !name.is_empty() => Ok(Self::Custom(name.to_string())),
                _ => Err(format!("unknown block type: {other}")),
            },
        }
    }
}

impl TryFrom<String> for BlockType {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<BlockType> for String {
    fn from(block_type: BlockType) -> Self {
        block_type.to_string()
    }
}

/// One node of a workflow graph
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(ToSchema))]
pub struct NodeDefinition {
    pub id: String,
    #[cfg_attr(feature = "openapi", schema(value_type = String, example = "manual_approval"))]
    pub block_type: BlockType,
    #[serde(default)]
    pub config: serde_json::Value,
    /// Overrides the block type's retry policy
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[cfg_attr(feature = "openapi", schema(value_type = Option<Object>))]
    pub retry_policy: Option<RetryPolicy>,
    /// Overrides the block type's circuit
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub circuit_id: Option<String>,
}

impl NodeDefinition {
    pub fn new(id: impl Into<String>, block_type: BlockType) -> Self {
        Self {
            id: id.into(),
            block_type,
            config: serde_json::Value::Null,
            retry_policy: None,
            circuit_id: None,
        }
    }

    pub fn with_config(mut self, config: serde_json::Value) -> Self {
        self.config = config;
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = Some(policy);
        self
    }

    pub fn with_circuit(mut self, circuit_id: impl Into<String>) -> Self {
        self.circuit_id = Some(circuit_id.into());
        self
    }
}

/// `to` depends on `from`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(ToSchema))]
pub struct Edge {
    pub from: String,
    pub to: String,
}

impl Edge {
    pub fn new(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
        }
    }
}

/// Structural problems in a workflow graph
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GraphError {
    #[error("workflow has no nodes")]
    Empty,

    #[error("duplicate node id: {0}")]
    DuplicateNode(String),

    #[error("edge references unknown node: {0}")]
    UnknownNode(String),

    #[error("dependency cycle through node: {0}")]
    Cycle(String),
}

/// A workflow graph: nodes plus dependency edges
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(ToSchema))]
pub struct WorkflowDefinition {
    pub id: Uuid,
    pub name: String,
    pub nodes: Vec<NodeDefinition>,
    #[serde(default)]
    pub edges: Vec<Edge>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

impl WorkflowDefinition {
    pub fn new(id: Uuid, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            nodes: vec![],
            edges: vec![],
            updated_at: Utc::now(),
        }
    }

    pub fn with_node(mut self, node: NodeDefinition) -> Self {
        self.nodes.push(node);
        self
    }

    pub fn with_edge(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.edges.push(Edge::new(from, to));
        self
    }

    /// Check ids are unique, edges resolve and the graph is acyclic
    pub fn validate(&self) -> Result<(), GraphError> {
        if self.nodes.is_empty() {
            return Err(GraphError::Empty);
        }

        let mut seen = HashSet::new();
        for node in &self.nodes {
            if !seen.insert(node.id.as_str()) {
                return Err(GraphError::DuplicateNode(node.id.clone()));
            }
        }

        for edge in &self.edges {
            for end in [&edge.from, &edge.to] {
                if !seen.contains(end.as_str()) {
                    return Err(GraphError::UnknownNode(end.clone()));
                }
            }
        }

        toposort(&self.graph(), None)
            .map(|_| ())
            .map_err(|cycle| GraphError::Cycle(cycle.node_id().to_string()))
    }

    pub fn node(&self, node_id: &str) -> Option<&NodeDefinition> {
        self.nodes.iter().find(|n| n.id == node_id)
    }

    /// Direct dependencies of a node
    pub fn predecessors(&self, node_id: &str) -> Vec<&str> {
        self.edges
            .iter()
            .filter(|e| e.to == node_id)
            .map(|e| e.from.as_str())
            .collect()
    }

    /// Nodes nothing depends on; their outputs form the execution output
    pub fn sinks(&self) -> Vec<&str> {
        let sources: HashSet<&str> = self.edges.iter().map(|e| e.from.as_str()).collect();
        self.nodes
            .iter()
            .map(|n| n.id.as_str())
            .filter(|id| !sources.contains(id))
            .collect()
    }

    /// Every node reachable downstream of `node_id`, excluding itself
    pub fn dependents_of(&self, node_id: &str) -> BTreeSet<String> {
        let graph = self.graph();
        let mut out = BTreeSet::new();
        if !graph.contains_node(node_id) {
            return out;
        }

        let mut dfs = Dfs::new(&graph, node_id);
        while let Some(next) = dfs.next(&graph) {
            if next != node_id {
                out.insert(next.to_string());
            }
        }
        out
    }

    /// Node ids in dependency order
    pub fn topological_order(&self) -> Result<Vec<&str>, GraphError> {
        toposort(&self.graph(), None)
            .map_err(|cycle| GraphError::Cycle(cycle.node_id().to_string()))
    }

    /// Nodes with no dependencies
    pub fn roots(&self) -> Vec<&str> {
        let graph = self.graph();
        self.nodes
            .iter()
            .map(|n| n.id.as_str())
            .filter(|id| {
                graph
                    .neighbors_directed(id, Direction::Incoming)
                    .next()
                    .is_none()
            })
            .collect()
    }

    fn graph(&self) -> DiGraphMap<&str, ()> {
        let mut graph = DiGraphMap::new();
        for node in &self.nodes {
            graph.add_node(node.id.as_str());
        }
        for edge in &self.edges {
            graph.add_edge(edge.from.as_str(), edge.to.as_str(), ());
        }
        graph
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn diamond() -> WorkflowDefinition {
        WorkflowDefinition::new(Uuid::now_v7(), "diamond")
            .with_node(NodeDefinition::new("a", BlockType::Transform))
            .with_node(NodeDefinition::new("b", BlockType::Transform))
            .with_node(NodeDefinition::new("c", BlockType::Transform))
            .with_node(NodeDefinition::new("d", BlockType::Transform))
            .with_edge("a", "b")
            .with_edge("a", "c")
            .with_edge("b", "d")
            .with_edge("c", "d")
    }

    #[test]
    fn test_valid_graph() {
        let wf = diamond();
        assert!(wf.validate().is_ok());
        assert_eq!(wf.roots(), vec!["a"]);
        assert_eq!(wf.sinks(), vec!["d"]);

        let mut preds = wf.predecessors("d");
        preds.sort();
        assert_eq!(preds, vec!["b", "c"]);

        let order = wf.topological_order().unwrap();
        assert_eq!(order.first(), Some(&"a"));
        assert_eq!(order.last(), Some(&"d"));
    }

    #[test]
    fn test_dependents_are_transitive() {
        let wf = diamond();
        let deps: Vec<String> = wf.dependents_of("b").into_iter().collect();
        assert_eq!(deps, vec!["d".to_string()]);
        assert_eq!(wf.dependents_of("a").len(), 3);
        assert!(wf.dependents_of("d").is_empty());
    }

    #[test]
    fn test_rejects_cycle() {
        let wf = diamond().with_edge("d", "a");
        assert!(matches!(wf.validate(), Err(GraphError::Cycle(_))));
    }

    #[test]
    fn test_rejects_unknown_and_duplicate_nodes() {
        let wf = diamond().with_edge("a", "zzz");
        assert_eq!(wf.validate(), Err(GraphError::UnknownNode("zzz".into())));

        let wf = diamond().with_node(NodeDefinition::new("a", BlockType::Email));
        assert_eq!(wf.validate(), Err(GraphError::DuplicateNode("a".into())));

        let wf = WorkflowDefinition::new(Uuid::now_v7(), "empty");
        assert_eq!(wf.validate(), Err(GraphError::Empty));
    }

    #[test]
    fn test_block_type_serialization() {
        let json = serde_json::to_value(BlockType::ManualApproval).unwrap();
        assert_eq!(json, serde_json::json!("manual_approval"));

        let custom: BlockType = serde_json::from_value(serde_json::json!("custom:slack")).unwrap();
        assert_eq!(custom, BlockType::Custom("slack".into()));
    }

    #[test]
    fn test_block_type_display_matches_json() {
        for block_type in [BlockType::Delay, BlockType::AiPrompt, BlockType::Custom("slack".into())] {
            let json = serde_json::to_value(&block_type).unwrap();
            assert_eq!(json, serde_json::Value::String(block_type.to_string()));
            assert_eq!(block_type.to_string().parse::<BlockType>(), Ok(block_type));
        }

        assert!(serde_json::from_value::<BlockType>(serde_json::json!("custom:")).is_err());
        assert!(serde_json::from_value::<BlockType>(serde_json::json!("slack")).is_err());
    }
}
