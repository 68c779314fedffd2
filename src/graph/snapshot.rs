//! JSON snapshot of a traffic map.
//!
//! Upstream graph generation hands the core a snapshot; the CLI writes the
//! enriched map back in the same shape.

use serde::{Deserialize, Serialize};

use crate::error::GraphError;

use super::{Edge, GraphResult, GraphType, Node, TrafficMap};

/// Serializable form of a [`TrafficMap`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphSnapshot {
    /// Granularity the node ids were generated at, if known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub graph_type: Option<GraphType>,
    pub nodes: Vec<Node>,
    #[serde(default)]
    pub edges: Vec<Edge>,
}

impl GraphSnapshot {
    /// Capture the nodes and edges of `map` in iteration order.
    pub fn from_map(map: &TrafficMap, graph_type: Option<GraphType>) -> Self {
        Self {
            graph_type,
            nodes: map.nodes().cloned().collect(),
            edges: map.edges().cloned().collect(),
        }
    }

    /// Rebuild a traffic map. Every edge endpoint must be a listed node.
    pub fn into_map(self) -> GraphResult<TrafficMap> {
        let mut map = TrafficMap::new();
        for node in self.nodes {
            map.add_node(node);
        }
        for edge in self.edges {
            let stored = map.add_edge(&edge.source, &edge.dest).map_err(|e| GraphError::Snapshot {
                message: format!("edge {} -> {}: {e}", edge.source, edge.dest),
            })?;
            stored.metadata = edge.metadata;
        }
        Ok(map)
    }

    pub fn from_json(json: &str) -> GraphResult<Self> {
        serde_json::from_str(json).map_err(|e| GraphError::Snapshot {
            message: e.to_string(),
        })
    }

    pub fn to_json_pretty(&self) -> GraphResult<String> {
        serde_json::to_string_pretty(self).map_err(|e| GraphError::Snapshot {
            message: e.to_string(),
        })
    }
}
