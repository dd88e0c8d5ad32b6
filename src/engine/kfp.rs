use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::{
    CompiledPipeline, EngineError, ExperimentHandle, PipelineEngine, PipelineHandle, RunHandle,
};
use crate::config::{EngineSettings, Secret};

// ============================================================================
// Wire types (apis/v1beta1)
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct ApiPipeline {
    pub id: String,
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct CreateExperimentRequest<'a> {
    pub name: &'a str,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiExperiment {
    pub id: String,
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct CreateRunRequest<'a> {
    pub name: &'a str,
    pub pipeline_spec: PipelineSpec<'a>,
    pub resource_references: Vec<ResourceReference<'a>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PipelineSpec<'a> {
    pub pipeline_id: &'a str,
}

#[derive(Debug, Clone, Serialize)]
pub struct ResourceReference<'a> {
    pub key: ResourceKey<'a>,
    pub relationship: &'static str,
}

#[derive(Debug, Clone, Serialize)]
pub struct ResourceKey<'a> {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub id: &'a str,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiRunDetail {
    pub run: ApiRun,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiRun {
    pub id: String,
    #[serde(default)]
    pub name: String,
}

impl<'a> CreateRunRequest<'a> {
    /// A run of `pipeline_id` owned by `experiment_id`
    pub fn new(name: &'a str, pipeline_id: &'a str, experiment_id: &'a str) -> Self {
        Self {
            name,
            pipeline_spec: PipelineSpec { pipeline_id },
            resource_references: vec![ResourceReference {
                key: ResourceKey {
                    kind: "EXPERIMENT",
                    id: experiment_id,
                },
                relationship: "OWNER",
            }],
        }
    }
}

// ============================================================================
// SBIO: I/O implementation (real HTTP client)
// ============================================================================

/// Kubeflow Pipelines REST client
#[derive(Clone)]
pub struct KfpClient {
    client: reqwest::Client,
    base_url: String,
    token: Option<Secret>,
    service_account: String,
    timeout: Duration,
}

impl std::fmt::Debug for KfpClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KfpClient")
            .field("base_url", &self.base_url)
            .field("service_account", &self.service_account)
            .finish()
    }
}

impl KfpClient {
    pub fn new(settings: &EngineSettings) -> Result<Self, EngineError> {
        let client = reqwest::Client::builder()
            .timeout(settings.timeout())
            .build()
            .map_err(|e| EngineError::Http(e.to_string()))?;
        Ok(Self {
            client,
            base_url: settings.url.trim_end_matches('/').to_string(),
            token: settings.token.clone().filter(|t| !t.is_empty()),
            service_account: settings.service_account.clone(),
            timeout: settings.timeout(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn api_url(&self, path: &str) -> String {
        format!("{}/apis/v1beta1/{}", self.base_url, path)
    }

    fn authorized(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match self.token {
            Some(ref token) => req.header("Authorization", format!("Bearer {}", token.expose())),
            None => req,
        }
    }

    async fn send<T: serde::de::DeserializeOwned>(
        &self,
        req: reqwest::RequestBuilder,
    ) -> Result<T, EngineError> {
        let response = self
            .authorized(req)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    EngineError::Timeout(self.timeout)
                } else {
                    EngineError::Http(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(EngineError::Api {
                status: status.as_u16(),
                message: text,
            });
        }

        response
            .json()
            .await
            .map_err(|e| EngineError::Parse(e.to_string()))
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "pipeline.yaml".to_string())
}

#[async_trait]
impl PipelineEngine for KfpClient {
    fn service_account(&self) -> &str {
        &self.service_account
    }

    async fn upload_pipeline(
        &self,
        compiled: &CompiledPipeline,
        name: &str,
    ) -> Result<PipelineHandle, EngineError> {
        let bytes = tokio::fs::read(&compiled.path)
            .await
            .map_err(|e| EngineError::Io(format!("{}: {}", compiled.path.display(), e)))?;
        let part = Part::bytes(bytes)
            .file_name(file_name(&compiled.path))
            .mime_str("application/x-yaml")
            .map_err(|e| EngineError::Http(e.to_string()))?;
        let form = Form::new().part("uploadfile", part);

        debug!(pipeline = name, path = %compiled.path.display(), "uploading pipeline");
        let pipeline: ApiPipeline = self
            .send(
                self.client
                    .post(self.api_url("pipelines/upload"))
                    .query(&[("name", name)])
                    .multipart(form),
            )
            .await?;
        info!(pipeline = name, id = %pipeline.id, "pipeline uploaded");

        Ok(PipelineHandle {
            id: pipeline.id,
            name: if pipeline.name.is_empty() {
                name.to_string()
            } else {
                pipeline.name
            },
        })
    }

    async fn create_experiment(&self, name: &str) -> Result<ExperimentHandle, EngineError> {
        let experiment: ApiExperiment = self
            .send(
                self.client
                    .post(self.api_url("experiments"))
                    .json(&CreateExperimentRequest { name }),
            )
            .await?;
        debug!(experiment = name, id = %experiment.id, "experiment created");

        Ok(ExperimentHandle {
            id: experiment.id,
            name: name.to_string(),
        })
    }

    async fn run_pipeline(
        &self,
        experiment: &ExperimentHandle,
        pipeline: &PipelineHandle,
        job_name: &str,
    ) -> Result<RunHandle, EngineError> {
        let detail: ApiRunDetail = self
            .send(
                self.client
                    .post(self.api_url("runs"))
                    .json(&CreateRunRequest::new(job_name, &pipeline.id, &experiment.id)),
            )
            .await?;
        info!(run = %detail.run.id, pipeline = %pipeline.name, "run started");

        Ok(RunHandle {
            id: detail.run.id,
            name: if detail.run.name.is_empty() {
                job_name.to_string()
            } else {
                detail.run.name
            },
        })
    }

    fn run_url(&self, run: &RunHandle) -> String {
        format!("{}/#/runs/details/{}", self.base_url, run.id)
    }
}
