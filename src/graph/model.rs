use std::collections::{BTreeSet, HashMap};
use std::path::Path;

use thiserror::Error;

use super::payload::{NodeRecord, SubmissionPayload};

/// Reasons a submitted graph cannot be turned into a [`Graph`].
///
/// Every variant is a malformed-graph error: the request is rejected as a
/// whole and nothing is packaged or submitted.
#[derive(Error, Debug, PartialEq)]
pub enum GraphError {
    #[error("JSON parse error: {0}")]
    ParseError(String),

    #[error("Pipeline name is empty")]
    EmptyPipelineName,

    #[error("Pipeline contains no nodes")]
    NoNodes,

    #[error("Node {0} is missing field '{1}'")]
    MissingField(String, &'static str),

    #[error("Node '{0}' has no app_data section")]
    MissingAppData(String),

    #[error("Duplicate node id: '{0}'")]
    DuplicateNodeId(String),

    #[error("Node '{0}' links to unknown node '{1}'")]
    UnknownLink(String, String),

    #[error("Link from node '{0}' feeds unknown node '{1}'")]
    UnknownDownstream(String, String),

    #[error("Node '{0}' has a link without node_id_ref")]
    EmptyLink(String),

    #[error("Cannot derive a step name from notebook path '{0}'")]
    InvalidSourceRef(String),

    #[error("Nodes '{1}' and '{2}' both derive step name '{0}'")]
    DuplicateStepName(String, String, String),
}

/// One unit of computable work: a notebook run inside a container image
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    pub id: String,
    /// Notebook path, relative to the packaging source root
    pub source_ref: String,
    pub image: String,
    name: String,
}

impl Node {
    pub fn new(
        id: impl Into<String>,
        source_ref: impl Into<String>,
        image: impl Into<String>,
    ) -> Result<Self, GraphError> {
        let source_ref = source_ref.into();
        let name = derive_step_name(&source_ref)
            .ok_or_else(|| GraphError::InvalidSourceRef(source_ref.clone()))?;
        Ok(Self {
            id: id.into(),
            source_ref,
            image: image.into(),
            name,
        })
    }

    /// Step name: notebook file name up to its first '.'
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// `to` must not start until `from` has completed
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Edge {
    pub from: String,
    pub to: String,
}

/// Normalized node/edge description of one submitted pipeline.
///
/// Built once per request and never mutated afterwards. Construction
/// guarantees unique ids, unique step names and that every edge endpoint
/// names a node of this graph. Acyclicity is checked by the DAG compiler.
#[derive(Debug, Clone)]
pub struct Graph {
    pipeline_name: String,
    nodes: Vec<Node>,
    edges: Vec<Edge>,
    index: HashMap<String, usize>,
}

// ============================================================================
// SBIO: Pure parsing functions (no I/O)
// ============================================================================

/// Derive the step name from a notebook path (`work/train.v2.ipynb` -> `train`).
pub fn derive_step_name(source_ref: &str) -> Option<String> {
    let file_name = Path::new(source_ref).file_name()?.to_str()?;
    let stem = file_name.split('.').next()?;
    if stem.is_empty() {
        None
    } else {
        Some(stem.to_string())
    }
}

fn non_blank(value: Option<&String>) -> Option<&str> {
    value.map(|s| s.trim()).filter(|s| !s.is_empty())
}

fn node_label(record: &NodeRecord, position: usize) -> String {
    match non_blank(record.id.as_ref()) {
        Some(id) => format!("'{}'", id),
        None => format!("#{}", position),
    }
}

fn node_from_record(record: &NodeRecord, position: usize) -> Result<Node, GraphError> {
    let label = node_label(record, position);
    let id = non_blank(record.id.as_ref()).ok_or(GraphError::MissingField(label.clone(), "id"))?;
    let app = record
        .app_data
        .as_ref()
        .ok_or_else(|| GraphError::MissingAppData(id.to_string()))?;
    let notebook = non_blank(app.notebook.as_ref())
        .ok_or_else(|| GraphError::MissingField(label.clone(), "notebook"))?;
    let image = non_blank(app.docker_image.as_ref())
        .ok_or_else(|| GraphError::MissingField(label.clone(), "docker_image"))?;

    Node::new(id, notebook, image)
}

impl Graph {
    /// Build a graph from already-typed nodes and edges, applying the same
    /// checks as payload parsing.
    pub fn new(
        pipeline_name: impl Into<String>,
        nodes: Vec<Node>,
        edges: Vec<Edge>,
    ) -> Result<Self, GraphError> {
        let pipeline_name = pipeline_name.into();
        if pipeline_name.trim().is_empty() {
            return Err(GraphError::EmptyPipelineName);
        }
        if nodes.is_empty() {
            return Err(GraphError::NoNodes);
        }

        let mut index = HashMap::new();
        let mut names: HashMap<&str, &str> = HashMap::new();
        for (pos, node) in nodes.iter().enumerate() {
            if index.insert(node.id.clone(), pos).is_some() {
                return Err(GraphError::DuplicateNodeId(node.id.clone()));
            }
            if let Some(other) = names.insert(node.name(), &node.id) {
                return Err(GraphError::DuplicateStepName(
                    node.name().to_string(),
                    other.to_string(),
                    node.id.clone(),
                ));
            }
        }

        for edge in &edges {
            if !index.contains_key(&edge.from) {
                return Err(GraphError::UnknownLink(edge.to.clone(), edge.from.clone()));
            }
            if !index.contains_key(&edge.to) {
                return Err(GraphError::UnknownDownstream(
                    edge.from.clone(),
                    edge.to.clone(),
                ));
            }
        }

        // Duplicate links collapse into a single dependency
        let edges: Vec<Edge> = edges.into_iter().collect::<BTreeSet<_>>().into_iter().collect();

        Ok(Self {
            pipeline_name,
            nodes,
            edges,
            index,
        })
    }

    /// Normalize an editor payload.
    ///
    /// Edges come from each node's first input port; a node without ports
    /// or without a `links` list is an entry point.
    pub fn from_payload(payload: &SubmissionPayload) -> Result<Self, GraphError> {
        let records = &payload.pipeline_data.nodes;

        let mut nodes = Vec::with_capacity(records.len());
        let mut edges = Vec::new();
        for (pos, record) in records.iter().enumerate() {
            let node = node_from_record(record, pos)?;
            for upstream in record.upstream_refs() {
                let from = upstream
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .ok_or_else(|| GraphError::EmptyLink(node.id.clone()))?;
                edges.push(Edge {
                    from: from.to_string(),
                    to: node.id.clone(),
                });
            }
            nodes.push(node);
        }

        Self::new(payload.pipeline_name.clone(), nodes, edges)
    }

    /// Parse and normalize a JSON payload.
    /// Pure function - no I/O.
    pub fn from_json(content: &str) -> Result<Self, GraphError> {
        let payload: SubmissionPayload =
            serde_json::from_str(content).map_err(|e| GraphError::ParseError(e.to_string()))?;
        Self::from_payload(&payload)
    }

    pub fn pipeline_name(&self) -> &str {
        &self.pipeline_name
    }

    /// Nodes in submission order
    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    /// Edges, deduplicated and sorted
    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    pub fn node(&self, id: &str) -> Option<&Node> {
        self.index.get(id).map(|&pos| &self.nodes[pos])
    }

    /// Ids of the nodes with an edge into `id`
    pub fn upstream_of(&self, id: &str) -> Vec<&str> {
        self.edges
            .iter()
            .filter(|e| e.to == id)
            .map(|e| e.from.as_str())
            .collect()
    }
}
