//! Submission orchestration
//!
//! A [`Scheduler`] takes one validated graph through the whole flow:
//! provision the bucket, package and upload every node, compile the step
//! graph once all archives are in place, then hand the compiled workflow to
//! the pipeline engine. Any failing stage aborts the submission.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::{stream, StreamExt, TryStreamExt};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{Settings, StorageSettings};
use crate::dag::{self, DagError, StepBody, StepGraph};
use crate::engine::{sanitize_name, EngineError, KfpClient, PipelineEngine};
use crate::graph::{Graph, GraphError, Node};
use crate::packaging::{ArchiveId, PackagedArchive, Packager, PackagingError, SubmissionStamp};
use crate::staging::{SecretKeyRef, StagingProtocol, ACCESS_KEY_VAR, SECRET_KEY_VAR};
use crate::storage::{ensure_bucket, ObjectStore, S3Store, StorageError};

#[derive(Error, Debug)]
pub enum SubmitError {
    #[error("Malformed pipeline graph: {0}")]
    MalformedGraph(#[from] GraphError),

    #[error("Packaging failed: {0}")]
    Packaging(#[from] PackagingError),

    #[error("Pipeline graph is not acyclic: {0}")]
    CyclicGraph(#[from] DagError),

    #[error("Object storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Pipeline submission failed: {0}")]
    Submission(#[from] EngineError),

    #[error("Submission cancelled")]
    Cancelled,
}

impl SubmitError {
    /// HTTP status reported for this failure
    pub fn status_code(&self) -> u16 {
        match self {
            Self::MalformedGraph(_) => 400,
            Self::Packaging(PackagingError::OutsideSourceRoot(_)) => 400,
            Self::Packaging(_) => 500,
            Self::CyclicGraph(_) => 422,
            Self::Storage(e) if e.is_timeout() => 504,
            Self::Storage(_) => 502,
            Self::Submission(e) if e.is_timeout() => 504,
            Self::Submission(_) => 502,
            Self::Cancelled => 503,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::MalformedGraph(_) => "MalformedGraph",
            Self::Packaging(_) => "PackagingError",
            Self::CyclicGraph(_) => "CyclicGraph",
            Self::Storage(_) => "StorageError",
            Self::Submission(_) => "SubmissionError",
            Self::Cancelled => "Cancelled",
        }
    }

    /// Message safe to hand back to the caller. Remote response bodies are
    /// only logged, never returned.
    pub fn public_message(&self) -> String {
        match self {
            Self::MalformedGraph(_) | Self::Packaging(_) | Self::CyclicGraph(_) => {
                self.to_string()
            }
            Self::Storage(e) if e.is_timeout() => "Object storage timed out".to_string(),
            Self::Storage(_) => "Object storage request failed".to_string(),
            Self::Submission(e) if e.is_timeout() => "Pipeline engine timed out".to_string(),
            Self::Submission(_) => "Pipeline submission failed".to_string(),
            Self::Cancelled => self.to_string(),
        }
    }
}

/// What a successful submission hands back
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmissionOutcome {
    /// Pipeline name as registered with the engine (`<pipeline><stamp>`)
    pub pipeline_name: String,
    pub run_id: String,
    pub url: String,
}

// ============================================================================
// SBIO: Pure business logic (no I/O)
// ============================================================================

/// Environment every step container gets so the staging protocol can
/// authenticate against object storage.
pub fn credential_env(storage: &StorageSettings) -> BTreeMap<String, SecretKeyRef> {
    let credentials = &storage.worker_credentials;
    let entry = |key: &str| SecretKeyRef {
        name: credentials.secret.clone(),
        key: key.to_string(),
    };
    BTreeMap::from([
        (ACCESS_KEY_VAR.to_string(), entry(&credentials.access_key_field)),
        (SECRET_KEY_VAR.to_string(), entry(&credentials.secret_key_field)),
    ])
}

/// Step bodies for every node, given the archive each node was packed into.
pub fn step_bodies(
    graph: &Graph,
    storage: &StorageSettings,
    archives: &HashMap<String, ArchiveId>,
) -> HashMap<String, StepBody> {
    let coords = storage.coordinates();
    let env = credential_env(storage);
    graph
        .nodes()
        .iter()
        .filter_map(|node| {
            let archive = archives.get(&node.id)?;
            Some((
                node.id.clone(),
                StepBody {
                    protocol: StagingProtocol::for_step(node.name(), archive, &coords),
                    env: env.clone(),
                },
            ))
        })
        .collect()
}

/// Compile the step graph a submission at `stamp` would produce, without
/// packaging or uploading anything.
pub fn plan(
    graph: &Graph,
    storage: &StorageSettings,
    stamp: &SubmissionStamp,
) -> Result<StepGraph, SubmitError> {
    let archives = graph
        .nodes()
        .iter()
        .map(|n| {
            (
                n.id.clone(),
                ArchiveId::new(graph.pipeline_name(), n.name(), stamp),
            )
        })
        .collect();
    Ok(dag::compile(graph, step_bodies(graph, storage, &archives))?)
}

/// Name the engine registers the pipeline under
pub fn engine_pipeline_name(graph: &Graph, stamp: &SubmissionStamp) -> String {
    format!("{}{}", graph.pipeline_name(), stamp.as_str())
}

// ============================================================================
// I/O boundary functions
// ============================================================================

/// Scratch directory for one submission, removed on drop
#[derive(Debug)]
struct WorkDir {
    path: PathBuf,
}

impl WorkDir {
    fn create(
        root: &Path,
        pipeline_name: &str,
        stamp: &SubmissionStamp,
    ) -> Result<Self, PackagingError> {
        let path = root.join(format!(
            "{}-{}",
            sanitize_name(pipeline_name),
            stamp.as_str()
        ));
        std::fs::create_dir_all(&path).map_err(|source| PackagingError::WriteArchive {
            path: path.clone(),
            source,
        })?;
        Ok(Self { path })
    }

    fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for WorkDir {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_dir_all(&self.path) {
            warn!(path = %self.path.display(), error = %e, "failed to remove work directory");
        }
    }
}

/// Drives submissions against one object store and one pipeline engine
#[derive(Clone)]
pub struct Scheduler {
    settings: Arc<Settings>,
    store: Arc<dyn ObjectStore>,
    engine: Arc<dyn PipelineEngine>,
}

impl Scheduler {
    pub fn new(
        settings: Settings,
        store: Arc<dyn ObjectStore>,
        engine: Arc<dyn PipelineEngine>,
    ) -> Self {
        Self {
            settings: Arc::new(settings),
            store,
            engine,
        }
    }

    /// Scheduler backed by the S3 store and Kubeflow client the settings describe
    pub fn from_settings(settings: Settings) -> Result<Self, SubmitError> {
        let store = S3Store::new(&settings.storage)?;
        let engine = KfpClient::new(&settings.engine)?;
        Ok(Self::new(settings, Arc::new(store), Arc::new(engine)))
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Run one submission end to end.
    ///
    /// A cyclic graph is rejected before anything touches storage. Once
    /// `cancel` fires no further upload starts and nothing reaches the
    /// engine. The per-submission work directory is removed in every case.
    pub async fn submit(
        &self,
        graph: &Graph,
        cancel: CancellationToken,
    ) -> Result<SubmissionOutcome, SubmitError> {
        let stamp = SubmissionStamp::now();
        plan(graph, &self.settings.storage, &stamp)?;

        let work_dir = WorkDir::create(
            &self.settings.packaging.work_dir,
            graph.pipeline_name(),
            &stamp,
        )?;
        info!(
            pipeline = %graph.pipeline_name(),
            nodes = graph.nodes().len(),
            stamp = %stamp.as_str(),
            "submission started"
        );

        check_cancelled(&cancel)?;
        let bucket = &self.settings.storage.bucket;
        self.storage_call(ensure_bucket(self.store.as_ref(), bucket))
            .await?;

        // Barrier: every archive is uploaded before dependencies are wired
        let archives = self
            .stage_archives(graph, &stamp, work_dir.path(), &cancel)
            .await?;
        let archive_ids = archives
            .into_iter()
            .map(|a| (a.node_id, a.archive_id))
            .collect();
        let steps = dag::compile(
            graph,
            step_bodies(graph, &self.settings.storage, &archive_ids),
        )?;

        let pipeline_name = engine_pipeline_name(graph, &stamp);
        let output = work_dir
            .path()
            .join(format!("{}.yaml", sanitize_name(&pipeline_name)));

        check_cancelled(&cancel)?;
        let compiled = self.engine.compile(&steps, &pipeline_name, &output).await?;
        debug!(path = %compiled.path.display(), "workflow compiled");

        check_cancelled(&cancel)?;
        let pipeline = self
            .engine_call(self.engine.upload_pipeline(&compiled, &pipeline_name))
            .await?;
        check_cancelled(&cancel)?;
        let experiment = self
            .engine_call(self.engine.create_experiment(&pipeline_name))
            .await?;
        check_cancelled(&cancel)?;
        let run = self
            .engine_call(
                self.engine
                    .run_pipeline(&experiment, &pipeline, stamp.as_str()),
            )
            .await?;

        let url = self.engine.run_url(&run);
        info!(pipeline = %pipeline_name, run = %run.id, %url, "submission complete");

        Ok(SubmissionOutcome {
            pipeline_name,
            run_id: run.id,
            url,
        })
    }

    /// Package and upload every node, at most `max_concurrent_uploads` at once.
    async fn stage_archives(
        &self,
        graph: &Graph,
        stamp: &SubmissionStamp,
        work_dir: &Path,
        cancel: &CancellationToken,
    ) -> Result<Vec<PackagedArchive>, SubmitError> {
        let packager = Packager::new(&self.settings.packaging.source_root, work_dir);
        let limit = self.settings.packaging.max_concurrent_uploads.max(1);

        let staged: Vec<_> = graph
            .nodes()
            .iter()
            .map(|node| self.stage_node(&packager, graph.pipeline_name(), node, stamp, cancel))
            .collect();
        stream::iter(staged)
            .buffer_unordered(limit)
            .try_collect()
            .await
    }

    async fn stage_node(
        &self,
        packager: &Packager,
        pipeline_name: &str,
        node: &Node,
        stamp: &SubmissionStamp,
        cancel: &CancellationToken,
    ) -> Result<PackagedArchive, SubmitError> {
        check_cancelled(cancel)?;

        let archive = {
            let packager = packager.clone();
            let pipeline_name = pipeline_name.to_string();
            let node = node.clone();
            let stamp = stamp.clone();
            tokio::task::spawn_blocking(move || packager.package(&pipeline_name, &node, &stamp))
                .await
                .map_err(|e| PackagingError::Worker(e.to_string()))??
        };

        check_cancelled(cancel)?;
        self.storage_call(self.store.put_object(
            &self.settings.storage.bucket,
            archive.archive_id.as_str(),
            &archive.local_path,
        ))
        .await?;
        info!(
            node = %node.id,
            archive = %archive.archive_id,
            sha256 = %archive.sha256,
            "archive uploaded"
        );

        Ok(archive)
    }

    async fn storage_call<T>(
        &self,
        call: impl Future<Output = Result<T, StorageError>>,
    ) -> Result<T, StorageError> {
        let limit = self.settings.storage.timeout();
        tokio::time::timeout(limit, call)
            .await
            .map_err(|_| StorageError::Timeout(limit))?
    }

    async fn engine_call<T>(
        &self,
        call: impl Future<Output = Result<T, EngineError>>,
    ) -> Result<T, EngineError> {
        let limit = self.settings.engine.timeout();
        tokio::time::timeout(limit, call)
            .await
            .map_err(|_| EngineError::Timeout(limit))?
    }
}

fn check_cancelled(cancel: &CancellationToken) -> Result<(), SubmitError> {
    if cancel.is_cancelled() {
        Err(SubmitError::Cancelled)
    } else {
        Ok(())
    }
}
