//! DAG compilation: one step per node, dependencies mirroring the graph links.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use petgraph::algo::toposort;
use petgraph::graphmap::DiGraphMap;
use thiserror::Error;
use tracing::debug;

use crate::graph::Graph;
use crate::staging::{SecretKeyRef, StagingProtocol};

#[derive(Error, Debug, PartialEq)]
pub enum DagError {
    #[error("Cycle detected in pipeline graph involving node '{0}'")]
    Cycle(String),

    #[error("No step body was built for node '{0}'")]
    MissingStepBody(String),

    #[error("Dependency references unknown node '{0}'")]
    UnknownNode(String),
}

/// What packaging and staging produced for one node
#[derive(Debug, Clone, PartialEq)]
pub struct StepBody {
    pub protocol: StagingProtocol,
    /// Container environment the protocol expects
    pub env: BTreeMap<String, SecretKeyRef>,
}

/// Compiled execution unit bound to one node
#[derive(Debug, Clone, PartialEq)]
pub struct Step {
    /// Node id
    pub id: String,
    /// Display name derived from the notebook file name
    pub name: String,
    pub image: String,
    pub protocol: StagingProtocol,
    pub env: BTreeMap<String, SecretKeyRef>,
    /// Ids of the steps that must complete first
    pub depends_on: BTreeSet<String>,
}

impl Step {
    /// The full staging protocol as one shell command
    pub fn command(&self) -> String {
        self.protocol.render()
    }

    pub fn is_entry_point(&self) -> bool {
        self.depends_on.is_empty()
    }
}

/// Validated DAG of steps, keyed by node id
#[derive(Debug, Clone, PartialEq)]
pub struct StepGraph {
    pipeline_name: String,
    steps: BTreeMap<String, Step>,
}

impl StepGraph {
    pub fn pipeline_name(&self) -> &str {
        &self.pipeline_name
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&Step> {
        self.steps.get(id)
    }

    /// Steps ordered by id
    pub fn steps(&self) -> impl Iterator<Item = &Step> {
        self.steps.values()
    }

    pub fn entry_points(&self) -> Vec<&Step> {
        self.steps().filter(|s| s.is_entry_point()).collect()
    }

    /// One execution order consistent with every dependency.
    ///
    /// Deterministic for a given step graph; steps without a dependency
    /// relation carry no ordering guarantee.
    pub fn topological_order(&self) -> Result<Vec<&Step>, DagError> {
        // Edge direction: dependency -> dependent
        let mut graph: DiGraphMap<&str, ()> = DiGraphMap::new();
        for id in self.steps.keys() {
            graph.add_node(id.as_str());
        }
        for step in self.steps.values() {
            for dep in &step.depends_on {
                if dep == &step.id {
                    return Err(DagError::Cycle(step.id.clone()));
                }
                if !self.steps.contains_key(dep) {
                    return Err(DagError::UnknownNode(dep.clone()));
                }
                graph.add_edge(dep.as_str(), step.id.as_str(), ());
            }
        }

        match toposort(&graph, None) {
            Ok(order) => Ok(order.into_iter().map(|id| &self.steps[id]).collect()),
            Err(cycle) => Err(DagError::Cycle(cycle.node_id().to_string())),
        }
    }
}

/// Assemble the step graph for `graph` from the per-node bodies.
///
/// Every node needs a body: callers must finish packaging all nodes before
/// compiling. Dependencies are keyed by node id, so node order does not
/// affect the result.
pub fn compile(
    graph: &Graph,
    mut bodies: HashMap<String, StepBody>,
) -> Result<StepGraph, DagError> {
    let mut steps = BTreeMap::new();
    for node in graph.nodes() {
        let body = bodies
            .remove(&node.id)
            .ok_or_else(|| DagError::MissingStepBody(node.id.clone()))?;
        steps.insert(
            node.id.clone(),
            Step {
                id: node.id.clone(),
                name: node.name().to_string(),
                image: node.image.clone(),
                protocol: body.protocol,
                env: body.env,
                depends_on: BTreeSet::new(),
            },
        );
    }

    for edge in graph.edges() {
        if !steps.contains_key(&edge.from) {
            return Err(DagError::UnknownNode(edge.from.clone()));
        }
        let step = steps
            .get_mut(&edge.to)
            .ok_or_else(|| DagError::UnknownNode(edge.to.clone()))?;
        step.depends_on.insert(edge.from.clone());
    }

    let step_graph = StepGraph {
        pipeline_name: graph.pipeline_name().to_string(),
        steps,
    };
    let order = step_graph.topological_order()?;
    debug!(
        pipeline = %step_graph.pipeline_name,
        order = ?order.iter().map(|s| s.id.as_str()).collect::<Vec<_>>(),
        "pipeline dependencies are set"
    );

    Ok(step_graph)
}
