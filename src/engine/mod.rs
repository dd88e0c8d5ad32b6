//! Pipeline engine: compiles step graphs to workflow packages and drives the
//! upload / experiment / run sequence against Kubeflow Pipelines.

pub mod kfp;
pub mod workflow;

pub use kfp::KfpClient;
pub use workflow::{compile_workflow, sanitize_name, write_workflow, Workflow};

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::dag::StepGraph;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Failed to compile workflow: {0}")]
    Compile(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Pipelines API error: {status} - {message}")]
    Api { status: u16, message: String },

    #[error("JSON parse error: {0}")]
    Parse(String),

    #[error("Pipelines request timed out after {0:?}")]
    Timeout(Duration),
}

impl EngineError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }
}

/// A workflow package written to disk, ready for upload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledPipeline {
    pub name: String,
    pub path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineHandle {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExperimentHandle {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunHandle {
    pub id: String,
    pub name: String,
}

// ============================================================================
// SBIO: Trait for abstraction (allows mocking in tests)
// ============================================================================

#[async_trait]
pub trait PipelineEngine: Send + Sync {
    /// Service account compiled workflows run as
    fn service_account(&self) -> &str;

    /// Compile `steps` into a workflow package at `output`.
    async fn compile(
        &self,
        steps: &StepGraph,
        name: &str,
        output: &Path,
    ) -> Result<CompiledPipeline, EngineError> {
        let workflow = compile_workflow(steps, self.service_account());
        write_workflow(&workflow, output)?;
        Ok(CompiledPipeline {
            name: name.to_string(),
            path: output.to_path_buf(),
        })
    }

    async fn upload_pipeline(
        &self,
        compiled: &CompiledPipeline,
        name: &str,
    ) -> Result<PipelineHandle, EngineError>;

    async fn create_experiment(&self, name: &str) -> Result<ExperimentHandle, EngineError>;

    async fn run_pipeline(
        &self,
        experiment: &ExperimentHandle,
        pipeline: &PipelineHandle,
        job_name: &str,
    ) -> Result<RunHandle, EngineError>;

    /// Where a human can watch the run
    fn run_url(&self, run: &RunHandle) -> String;
}

// ============================================================================
// SBIO: Mock implementation for testing (no I/O)
// ============================================================================
