//! Traffic graph: nodes are mesh identities, edges are observed traffic.
//!
//! - **Identity** ([`id`]): deterministic `(NodeId, NodeType)` for a set of mesh labels
//! - **Model** ([`TrafficMap`]): `petgraph` directed graph with an id index
//! - **Snapshot** ([`snapshot`]): serde JSON form used to load and emit graphs
//!
//! A `TrafficMap` is built upstream. Appenders only touch [`Metadata`]; the
//! node and edge structure is fixed once the map is handed to the pipeline.

pub mod id;
pub mod snapshot;

use std::collections::{BTreeMap, HashMap};
use std::str::FromStr;

use petgraph::Direction;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;
use serde::{Deserialize, Serialize};

use crate::error::GraphError;

pub use id::{NodeIdentity, UNKNOWN, UNKNOWN_SOURCE_ID, id, is_ok};

/// Result type for graph operations.
pub type GraphResult<T> = std::result::Result<T, GraphError>;

/// Edge metadata key for the response-time percentile, in milliseconds.
pub const RESPONSE_TIME: &str = "responseTime";

/// Opaque node key.
///
/// Produced by [`id`] for a given identity and granularity. Identical inputs
/// always produce identical ids.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    /// Wrap an id produced elsewhere (e.g. read from a snapshot).
    pub fn new(raw: impl Into<String>) -> Self {
        NodeId(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Composite key of an edge: the ordered `(source, dest)` pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EdgeKey {
    pub source: NodeId,
    pub dest: NodeId,
}

impl EdgeKey {
    pub fn new(source: NodeId, dest: NodeId) -> Self {
        Self { source, dest }
    }
}

impl std::fmt::Display for EdgeKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} -> {}", self.source, self.dest)
    }
}

/// Classification of a graph node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum NodeType {
    App,
    Service,
    Workload,
    Unknown,
}

impl std::fmt::Display for NodeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeType::App => write!(f, "app"),
            NodeType::Service => write!(f, "service"),
            NodeType::Workload => write!(f, "workload"),
            NodeType::Unknown => write!(f, "unknown"),
        }
    }
}

/// Granularity at which distinct identities collapse into one node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum GraphType {
    /// One node per app, versions collapsed.
    App,
    /// One node per app version (or per workload when known).
    VersionedApp,
    /// One node per workload.
    #[default]
    Workload,
    /// Processed as a workload graph; service nodes are the point of interest.
    Service,
}

impl std::fmt::Display for GraphType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GraphType::App => write!(f, "app"),
            GraphType::VersionedApp => write!(f, "versionedApp"),
            GraphType::Workload => write!(f, "workload"),
            GraphType::Service => write!(f, "service"),
        }
    }
}

impl FromStr for GraphType {
    type Err = GraphError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "app" => Ok(GraphType::App),
            "versionedApp" => Ok(GraphType::VersionedApp),
            "workload" => Ok(GraphType::Workload),
            "service" => Ok(GraphType::Service),
            other => Err(GraphError::UnknownGraphType {
                value: other.to_string(),
            }),
        }
    }
}

/// Open mapping of computed telemetry, keyed by name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Metadata(BTreeMap<String, serde_json::Value>);

impl Metadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.0.get(key)
    }

    /// Numeric value for `key`, if present and numeric.
    pub fn get_f64(&self, key: &str) -> Option<f64> {
        self.0.get(key).and_then(|v| v.as_f64())
    }

    pub fn insert(&mut self, key: impl Into<String>, value: serde_json::Value) {
        self.0.insert(key.into(), value);
    }

    /// Store a numeric value. JSON has no NaN or infinity, so non-finite
    /// values are refused and leave the key as it was.
    pub fn set_f64(&mut self, key: impl Into<String>, value: f64) -> bool {
        match serde_json::Number::from_f64(value) {
            Some(n) => {
                self.0.insert(key.into(), serde_json::Value::Number(n));
                true
            }
            None => false,
        }
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn remove(&mut self, key: &str) -> Option<serde_json::Value> {
        self.0.remove(key)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// A graph vertex: one service, workload or app at the map's granularity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Node {
    pub id: NodeId,
    pub node_type: NodeType,
    pub namespace: String,
    #[serde(default)]
    pub workload: String,
    #[serde(default)]
    pub app: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub service: String,
    #[serde(default)]
    pub metadata: Metadata,
}

impl Node {
    /// Build the node an identity resolves to at `graph_type`.
    ///
    /// Service nodes keep only service-level identity; workload and app nodes
    /// keep workload, app and version.
    pub fn from_identity(identity: &NodeIdentity<'_>, graph_type: GraphType) -> Self {
        let (id, node_type) = identity.resolve(graph_type);
        let namespace = identity.namespace().to_string();
        match node_type {
            NodeType::Service => Self {
                id,
                node_type,
                namespace,
                workload: String::new(),
                app: String::new(),
                version: String::new(),
                service: identity.service.to_string(),
                metadata: Metadata::new(),
            },
            _ => Self {
                id,
                node_type,
                namespace,
                workload: identity.workload.to_string(),
                app: identity.app.to_string(),
                version: identity.version.to_string(),
                service: String::new(),
                metadata: Metadata::new(),
            },
        }
    }
}

/// Directed traffic between two nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    pub source: NodeId,
    pub dest: NodeId,
    #[serde(default)]
    pub metadata: Metadata,
}

impl Edge {
    pub fn key(&self) -> EdgeKey {
        EdgeKey::new(self.source.clone(), self.dest.clone())
    }
}

/// The traffic graph handed to the appender pipeline.
///
/// At most one edge exists per ordered `(source, dest)` pair. Iteration order
/// is insertion order, so repeated evaluation visits nodes and edges the same
/// way.
#[derive(Clone, Default)]
pub struct TrafficMap {
    graph: DiGraph<Node, Edge>,
    index: HashMap<NodeId, NodeIndex>,
}

impl TrafficMap {
    /// Create a new empty traffic map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a node, returning the stored one.
    ///
    /// If a node with the same id already exists it is kept and returned.
    pub fn add_node(&mut self, node: Node) -> &mut Node {
        let idx = match self.index.get(&node.id).copied() {
            Some(idx) => idx,
            None => {
                let id = node.id.clone();
                let idx = self.graph.add_node(node);
                self.index.insert(id, idx);
                idx
            }
        };
        &mut self.graph[idx]
    }

    /// Resolve `identity` and insert the resulting node, returning its id.
    pub fn add_identity(&mut self, identity: &NodeIdentity<'_>, graph_type: GraphType) -> NodeId {
        self.add_node(Node::from_identity(identity, graph_type))
            .id
            .clone()
    }

    /// Add the edge `source -> dest`, or return the existing one.
    pub fn add_edge(&mut self, source: &NodeId, dest: &NodeId) -> GraphResult<&mut Edge> {
        let src = self.lookup(source)?;
        let dst = self.lookup(dest)?;
        let edge_idx = match self.graph.find_edge(src, dst) {
            Some(e) => e,
            None => self.graph.add_edge(
                src,
                dst,
                Edge {
                    source: source.clone(),
                    dest: dest.clone(),
                    metadata: Metadata::new(),
                },
            ),
        };
        Ok(&mut self.graph[edge_idx])
    }

    fn lookup(&self, id: &NodeId) -> GraphResult<NodeIndex> {
        self.index
            .get(id)
            .copied()
            .ok_or_else(|| GraphError::NodeNotFound { id: id.to_string() })
    }

    pub fn node(&self, id: &NodeId) -> Option<&Node> {
        self.index.get(id).map(|idx| &self.graph[*idx])
    }

    pub fn node_mut(&mut self, id: &NodeId) -> Option<&mut Node> {
        let idx = *self.index.get(id)?;
        Some(&mut self.graph[idx])
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.index.contains_key(id)
    }

    pub fn edge(&self, source: &NodeId, dest: &NodeId) -> Option<&Edge> {
        let e = self.graph.find_edge(*self.index.get(source)?, *self.index.get(dest)?)?;
        self.graph.edge_weight(e)
    }

    pub fn edge_mut(&mut self, source: &NodeId, dest: &NodeId) -> Option<&mut Edge> {
        let e = self.graph.find_edge(*self.index.get(source)?, *self.index.get(dest)?)?;
        self.graph.edge_weight_mut(e)
    }

    /// All nodes in insertion order.
    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.graph.node_weights()
    }

    /// All edges in insertion order.
    pub fn edges(&self) -> impl Iterator<Item = &Edge> {
        self.graph.edge_weights()
    }

    /// Mutable access to every edge; structure stays fixed.
    pub fn edges_mut(&mut self) -> impl Iterator<Item = &mut Edge> {
        self.graph.edge_weights_mut()
    }

    /// Outgoing edges of `id`.
    pub fn edges_from(&self, id: &NodeId) -> Vec<&Edge> {
        match self.index.get(id) {
            Some(idx) => {
                let mut out: Vec<&Edge> = self
                    .graph
                    .edges_directed(*idx, Direction::Outgoing)
                    .map(|e| e.weight())
                    .collect();
                // petgraph walks adjacency lists newest-first.
                out.reverse();
                out
            }
            None => vec![],
        }
    }

    /// Number of nodes.
    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    /// Number of edges.
    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }
}

impl std::fmt::Debug for TrafficMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrafficMap")
            .field("nodes", &self.len())
            .field("edges", &self.edge_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn workload(ns: &'static str, wl: &'static str) -> NodeIdentity<'static> {
        NodeIdentity {
            service_namespace: ns,
            service: "",
            workload_namespace: ns,
            workload: wl,
            app: wl,
            version: "v1",
        }
    }

    #[test]
    fn add_node_is_idempotent() {
        let mut map = TrafficMap::new();
        let a = map.add_identity(&workload("bookinfo", "productpage"), GraphType::Workload);
        let b = map.add_identity(&workload("bookinfo", "productpage"), GraphType::Workload);
        assert_eq!(a, b);
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn one_edge_per_ordered_pair() {
        let mut map = TrafficMap::new();
        let a = map.add_identity(&workload("bookinfo", "productpage"), GraphType::Workload);
        let b = map.add_identity(&workload("bookinfo", "reviews"), GraphType::Workload);

        map.add_edge(&a, &b).unwrap().metadata.set_f64(RESPONSE_TIME, 1.0);
        let again = map.add_edge(&a, &b).unwrap();
        assert_eq!(again.metadata.get_f64(RESPONSE_TIME), Some(1.0));
        map.add_edge(&b, &a).unwrap();

        assert_eq!(map.edge_count(), 2);
        assert_eq!(map.edges_from(&a).len(), 1);
    }

    #[test]
    fn edge_to_missing_node_fails() {
        let mut map = TrafficMap::new();
        let a = map.add_identity(&workload("bookinfo", "productpage"), GraphType::Workload);
        let missing = NodeId::new("wl_bookinfo_ghost");
        assert!(matches!(
            map.add_edge(&a, &missing),
            Err(GraphError::NodeNotFound { .. })
        ));
    }

    #[test]
    fn service_nodes_drop_workload_identity() {
        let identity = NodeIdentity {
            service_namespace: "bookinfo",
            service: "reviews",
            workload_namespace: "bookinfo",
            workload: "",
            app: "",
            version: "",
        };
        let node = Node::from_identity(&identity, GraphType::Workload);
        assert_eq!(node.node_type, NodeType::Service);
        assert_eq!(node.service, "reviews");
        assert!(node.workload.is_empty());
        assert!(node.version.is_empty());
    }

    #[test]
    fn graph_type_parses() {
        assert_eq!("versionedApp".parse::<GraphType>().unwrap(), GraphType::VersionedApp);
        assert_eq!(GraphType::App.to_string(), "app");
        assert!("cluster".parse::<GraphType>().is_err());
    }

    #[test]
    fn metadata_numeric_access() {
        let mut md = Metadata::new();
        assert!(md.get_f64(RESPONSE_TIME).is_none());
        md.set_f64(RESPONSE_TIME, 250.0);
        assert_eq!(md.get_f64(RESPONSE_TIME), Some(250.0));
        assert_eq!(md.len(), 1);
    }

    #[test]
    fn metadata_refuses_non_finite_values() {
        let mut md = Metadata::new();
        assert!(!md.set_f64(RESPONSE_TIME, f64::INFINITY));
        assert!(!md.set_f64(RESPONSE_TIME, f64::NAN));
        assert!(!md.contains_key(RESPONSE_TIME));

        assert!(md.set_f64(RESPONSE_TIME, 12.5));
        assert!(!md.set_f64(RESPONSE_TIME, f64::NEG_INFINITY));
        assert_eq!(md.get_f64(RESPONSE_TIME), Some(12.5));
    }
}
