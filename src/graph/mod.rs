//! Graph model: the editor's node/link payload and its normalized form.

pub mod model;
pub mod payload;

pub use model::{derive_step_name, Edge, Graph, GraphError, Node};
pub use payload::{AppData, InputPort, LinkRecord, NodeRecord, PipelineData, SubmissionPayload};

use std::path::Path;
use thiserror::Error;

/// Errors for payload file I/O (separate from pure parsing errors)
#[derive(Error, Debug)]
pub enum LoadError {
    #[error("Failed to read file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Graph error: {0}")]
    GraphError(#[from] GraphError),
}

// ============================================================================
// SBIO: I/O wrapper - thin layer over pure functions
// ============================================================================

/// Load and normalize a payload file from disk.
pub fn load_graph_file(path: &Path) -> Result<Graph, LoadError> {
    let content = std::fs::read_to_string(path)?;
    let graph = Graph::from_json(&content)?;
    Ok(graph)
}
