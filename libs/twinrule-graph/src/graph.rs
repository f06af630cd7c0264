//! Twin graph
//!
//! An arena of twins indexed by [`NodeHandle`] with an adjacency list of edges.
//! The graph is rebuilt wholesale from a [`TwinSnapshot`] for each generation and
//! is read-only afterwards.
//!
//! ```text
//!   TwinSnapshot { twins, relationships }
//!          │ TwinGraph::build(snapshot, &registry)
//!          ▼
//!   nodes:    [TwinNode; n]            id / external id -> NodeHandle
//!   edges:    [Edge{from,to,relation}]
//!   outgoing: [[EdgeHandle]; n]
//!   incoming: [[EdgeHandle]; n]
//! ```

use crate::error::{GraphError, Result};
use crate::relation::{RelationId, RelationRegistry};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

// ============================================================================
// Snapshot types
// ============================================================================

/// One twin as served by the twin directory
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TwinNode {
    pub id: String,
    pub model_id: String,
    /// Models this twin's model extends, closest first
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extends: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Telemetry id for capability twins (trend id)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    /// Free-form twin properties, exposed to formulas as `this`
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub properties: serde_json::Value,
}

impl TwinNode {
    pub fn new(id: impl Into<String>, model_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            model_id: model_id.into(),
            extends: Vec::new(),
            name: None,
            external_id: None,
            unit: None,
            properties: serde_json::Value::Null,
        }
    }

    pub fn with_external_id(mut self, external_id: impl Into<String>) -> Self {
        self.external_id = Some(external_id.into());
        self
    }

    pub fn with_unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = Some(unit.into());
        self
    }

    pub fn with_properties(mut self, properties: serde_json::Value) -> Self {
        self.properties = properties;
        self
    }

    /// Id telemetry for this twin arrives under
    pub fn point_id(&self) -> &str {
        self.external_id.as_deref().unwrap_or(&self.id)
    }

    /// Exact or inherited model match, ignoring case
    pub fn is_model(&self, model_id: &str) -> bool {
        self.model_id.eq_ignore_ascii_case(model_id)
            || self.extends.iter().any(|m| m.eq_ignore_ascii_case(model_id))
    }

    /// Properties as a JSON object, with `id` and `modelId` filled in
    pub fn this_value(&self) -> serde_json::Value {
        let mut object = match &self.properties {
            serde_json::Value::Object(map) => map.clone(),
            _ => serde_json::Map::new(),
        };
        object
            .entry("id")
            .or_insert_with(|| serde_json::Value::String(self.id.clone()));
        object
            .entry("modelId")
            .or_insert_with(|| serde_json::Value::String(self.model_id.clone()));
        serde_json::Value::Object(object)
    }
}

/// Directed relationship between two twins
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelationshipRecord {
    pub source: String,
    pub target: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub substance: Option<String>,
}

impl RelationshipRecord {
    pub fn new(source: impl Into<String>, name: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            name: name.into(),
            substance: None,
        }
    }

    pub fn with_substance(mut self, substance: impl Into<String>) -> Self {
        self.substance = Some(substance.into());
        self
    }
}

/// Read-only twin directory snapshot
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TwinSnapshot {
    pub twins: Vec<TwinNode>,
    pub relationships: Vec<RelationshipRecord>,
}

// ============================================================================
// Arena graph
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeHandle(u32);

impl NodeHandle {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EdgeHandle(u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Edge {
    pub from: NodeHandle,
    pub to: NodeHandle,
    pub relation: RelationId,
}

/// Edge seen from one endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Neighbor {
    pub node: NodeHandle,
    pub relation: RelationId,
    /// `true` when the edge points away from the node being expanded
    pub outgoing: bool,
}

#[derive(Debug, Default)]
pub struct TwinGraph {
    nodes: Vec<TwinNode>,
    edges: Vec<Edge>,
    outgoing: Vec<Vec<EdgeHandle>>,
    incoming: Vec<Vec<EdgeHandle>>,
    by_id: FxHashMap<String, NodeHandle>,
    by_external_id: FxHashMap<String, NodeHandle>,
}

impl TwinGraph {
    /// Build a graph from a snapshot
    ///
    /// Duplicate twin ids are rejected. Relationships with a missing endpoint are
    /// skipped with a warning, as the directory may serve partial topologies.
    pub fn build(snapshot: TwinSnapshot, registry: &RelationRegistry) -> Result<Self> {
        let mut graph = TwinGraph::default();

        for twin in snapshot.twins {
            let handle = NodeHandle(graph.nodes.len() as u32);
            if graph.by_id.insert(twin.id.clone(), handle).is_some() {
                return Err(GraphError::DuplicateTwin(twin.id));
            }
            if let Some(external_id) = &twin.external_id {
                if let Some(previous) = graph.by_external_id.insert(external_id.clone(), handle) {
                    warn!(
                        "External id {} shared by {} and {}",
                        external_id, graph.nodes[previous.index()].id, twin.id
                    );
                }
            }
            graph.nodes.push(twin);
            graph.outgoing.push(Vec::new());
            graph.incoming.push(Vec::new());
        }

        let mut skipped = 0usize;
        for record in snapshot.relationships {
            let (Some(&from), Some(&to)) = (graph.by_id.get(&record.source), graph.by_id.get(&record.target))
            else {
                let err = GraphError::DanglingRelationship {
                    name: record.name,
                    source_id: record.source,
                    target_id: record.target,
                };
                warn!("Skipping relationship: {}", err);
                skipped += 1;
                continue;
            };
            let relation = registry.intern(&record.name, record.substance.as_deref());
            let handle = EdgeHandle(graph.edges.len() as u32);
            graph.edges.push(Edge { from, to, relation });
            graph.outgoing[from.index()].push(handle);
            graph.incoming[to.index()].push(handle);
        }

        debug!(
            "Built twin graph: {} twins, {} relationships ({} skipped)",
            graph.nodes.len(),
            graph.edges.len(),
            skipped
        );
        Ok(graph)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    pub fn node(&self, handle: NodeHandle) -> &TwinNode {
        &self.nodes[handle.index()]
    }

    pub fn handle(&self, twin_id: &str) -> Option<NodeHandle> {
        self.by_id.get(twin_id).copied()
    }

    pub fn require(&self, twin_id: &str) -> Result<NodeHandle> {
        self.handle(twin_id)
            .ok_or_else(|| GraphError::twin_not_found(twin_id))
    }

    pub fn by_external_id(&self, external_id: &str) -> Option<NodeHandle> {
        self.by_external_id.get(external_id).copied()
    }

    pub fn handles(&self) -> impl Iterator<Item = NodeHandle> + '_ {
        (0..self.nodes.len() as u32).map(NodeHandle)
    }

    /// Twins of `model_id` (including inherited), ordered by twin id
    pub fn nodes_of_model(&self, model_id: &str) -> Vec<NodeHandle> {
        let mut handles: Vec<NodeHandle> = self
            .handles()
            .filter(|h| self.node(*h).is_model(model_id))
            .collect();
        handles.sort_by(|a, b| self.node(*a).id.cmp(&self.node(*b).id));
        handles
    }

    /// Edges touching `handle` in both directions
    pub fn neighbors(&self, handle: NodeHandle) -> impl Iterator<Item = Neighbor> + '_ {
        let out = self.outgoing[handle.index()].iter().map(move |e| {
            let edge = self.edges[e.0 as usize];
            Neighbor {
                node: edge.to,
                relation: edge.relation,
                outgoing: true,
            }
        });
        let inc = self.incoming[handle.index()].iter().map(move |e| {
            let edge = self.edges[e.0 as usize];
            Neighbor {
                node: edge.from,
                relation: edge.relation,
                outgoing: false,
            }
        });
        out.chain(inc)
    }
}
