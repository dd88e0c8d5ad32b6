//! Command implementations for the CLI
//!
//! SBIO pattern: Commands return Results, I/O is handled by caller

use std::path::Path;

use thiserror::Error;
use tokio_util::sync::CancellationToken;

use super::ServeArgs;
use crate::config::Settings;
use crate::dag::StepGraph;
use crate::engine::{compile_workflow, Workflow};
use crate::graph::{load_graph_file, Graph, LoadError};
use crate::packaging::SubmissionStamp;
use crate::submit::{engine_pipeline_name, plan, Scheduler, SubmissionOutcome, SubmitError};

/// Errors that can occur during command execution
#[derive(Error, Debug)]
pub enum CommandError {
    #[error("Payload error: {0}")]
    Payload(#[from] LoadError),

    #[error(transparent)]
    Submit(#[from] SubmitError),
}

/// Result type for commands
pub type CommandResult<T> = Result<T, CommandError>;

/// Everything the dry run shows
#[derive(Debug, Clone)]
pub struct CompileReport {
    /// Name the engine would register the pipeline under
    pub pipeline_name: String,
    pub steps: StepGraph,
    pub workflow: Workflow,
}

// ============================================================================
// Pure business logic
// ============================================================================

/// Compile a graph the way a submission at `stamp` would, stopping before
/// any archive is built.
pub fn compile_graph(
    settings: &Settings,
    graph: &Graph,
    stamp: &SubmissionStamp,
) -> CommandResult<CompileReport> {
    let steps = plan(graph, &settings.storage, stamp)?;
    let workflow = compile_workflow(&steps, &settings.engine.service_account);
    Ok(CompileReport {
        pipeline_name: engine_pipeline_name(graph, stamp),
        steps,
        workflow,
    })
}

/// Address the server binds to: flags first, then settings
pub fn serve_addr(settings: &Settings, args: &ServeArgs) -> String {
    let bind_addr = args
        .bind_addr
        .as_deref()
        .unwrap_or(&settings.server.bind_addr);
    let port = args.port.unwrap_or(settings.server.port);
    format!("{}:{}", bind_addr, port)
}

// ============================================================================
// I/O boundary functions
// ============================================================================

/// Load a payload file and compile it (dry run)
pub fn compile_payload(settings: &Settings, payload: &Path) -> CommandResult<CompileReport> {
    let graph = load_graph_file(payload)?;
    compile_graph(settings, &graph, &SubmissionStamp::now())
}

/// Load a payload file and run a full submission
pub async fn submit_payload(
    scheduler: &Scheduler,
    payload: &Path,
    cancel: CancellationToken,
) -> CommandResult<SubmissionOutcome> {
    let graph = load_graph_file(payload)?;
    Ok(scheduler.submit(&graph, cancel).await?)
}
