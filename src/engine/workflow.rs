//! Argo `Workflow` manifests, the format Kubeflow Pipelines accepts on upload

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;

use serde::{Deserialize, Serialize};

use super::EngineError;
use crate::dag::StepGraph;

pub const WORKFLOW_API_VERSION: &str = "argoproj.io/v1alpha1";

/// Annotation recording the pipeline name as submitted, before sanitizing
pub const PIPELINE_NAME_ANNOTATION: &str = "nbpipe.io/pipeline-name";

const MAX_NAME_LEN: usize = 63;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Workflow {
    pub api_version: String,
    pub kind: String,
    pub metadata: WorkflowMetadata,
    pub spec: WorkflowSpec,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowMetadata {
    pub generate_name: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowSpec {
    pub entrypoint: String,
    pub service_account_name: String,
    pub templates: Vec<Template>,
}

/// Either the DAG entrypoint or one container step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Template {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dag: Option<DagTemplate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container: Option<Container>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DagTemplate {
    pub tasks: Vec<DagTask>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DagTask {
    pub name: String,
    pub template: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Container {
    pub image: String,
    pub command: Vec<String>,
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<EnvVar>,
}

/// Container variable read from a Kubernetes secret
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvVar {
    pub name: String,
    pub value_from: EnvVarSource,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvVarSource {
    pub secret_key_ref: SecretKeySelector,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecretKeySelector {
    pub name: String,
    pub key: String,
}

impl Workflow {
    pub fn to_yaml(&self) -> Result<String, EngineError> {
        serde_yaml::to_string(self).map_err(|e| EngineError::Compile(e.to_string()))
    }

    /// One container template per step
    pub fn container_templates(&self) -> impl Iterator<Item = &Template> {
        self.spec.templates.iter().filter(|t| t.container.is_some())
    }

    pub fn dag_tasks(&self) -> &[DagTask] {
        self.spec
            .templates
            .iter()
            .find(|t| t.name == self.spec.entrypoint)
            .and_then(|t| t.dag.as_ref())
            .map(|d| d.tasks.as_slice())
            .unwrap_or(&[])
    }
}

// ============================================================================
// SBIO: Pure compilation (no I/O)
// ============================================================================

/// Reduce a name to a DNS-1123 label: lowercase `[a-z0-9-]`, at most 63 chars.
pub fn sanitize_name(name: &str) -> String {
    let replaced: String = name
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_lowercase() || c.is_ascii_digit() { c } else { '-' })
        .collect();
    let mut out: String = replaced
        .split('-')
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join("-");
    out.truncate(MAX_NAME_LEN);
    let out = out.trim_end_matches('-').to_string();
    if out.is_empty() {
        "step".to_string()
    } else {
        out
    }
}

fn unique_name(base: String, used: &mut HashSet<String>) -> String {
    if used.insert(base.clone()) {
        return base;
    }
    let mut n = 2;
    loop {
        let suffix = format!("-{}", n);
        let mut candidate = base.clone();
        candidate.truncate(MAX_NAME_LEN - suffix.len());
        candidate.push_str(&suffix);
        if used.insert(candidate.clone()) {
            return candidate;
        }
        n += 1;
    }
}

/// Compile a step graph into an Argo workflow: a DAG entrypoint with one
/// task per step plus one `sh -c` container template per step.
pub fn compile_workflow(steps: &StepGraph, service_account: &str) -> Workflow {
    let entrypoint = sanitize_name(steps.pipeline_name());
    let mut used = HashSet::from([entrypoint.clone()]);

    // Step ids iterate in sorted order, so suffixes are stable
    let names: HashMap<&str, String> = steps
        .steps()
        .map(|s| (s.id.as_str(), unique_name(sanitize_name(&s.name), &mut used)))
        .collect();

    let mut tasks = Vec::with_capacity(steps.len());
    let mut templates = Vec::with_capacity(steps.len() + 1);
    for step in steps.steps() {
        let name = names[step.id.as_str()].clone();
        let mut dependencies: Vec<String> = step
            .depends_on
            .iter()
            .filter_map(|dep| names.get(dep.as_str()).cloned())
            .collect();
        dependencies.sort();

        tasks.push(DagTask {
            name: name.clone(),
            template: name.clone(),
            dependencies,
        });
        templates.push(Template {
            name,
            dag: None,
            container: Some(Container {
                image: step.image.clone(),
                command: vec!["sh".to_string(), "-c".to_string()],
                args: vec![step.command()],
                env: step
                    .env
                    .iter()
                    .map(|(var, secret)| EnvVar {
                        name: var.clone(),
                        value_from: EnvVarSource {
                            secret_key_ref: SecretKeySelector {
                                name: secret.name.clone(),
                                key: secret.key.clone(),
                            },
                        },
                    })
                    .collect(),
            }),
        });
    }

    templates.insert(
        0,
        Template {
            name: entrypoint.clone(),
            dag: Some(DagTemplate { tasks }),
            container: None,
        },
    );

    Workflow {
        api_version: WORKFLOW_API_VERSION.to_string(),
        kind: "Workflow".to_string(),
        metadata: WorkflowMetadata {
            generate_name: format!("{}-", entrypoint),
            annotations: BTreeMap::from([(
                PIPELINE_NAME_ANNOTATION.to_string(),
                steps.pipeline_name().to_string(),
            )]),
        },
        spec: WorkflowSpec {
            entrypoint,
            service_account_name: service_account.to_string(),
            templates,
        },
    }
}

// ============================================================================
// I/O boundary functions
// ============================================================================

/// Write the workflow YAML to `path`, creating parent directories.
pub fn write_workflow(workflow: &Workflow, path: &Path) -> Result<(), EngineError> {
    let yaml = workflow.to_yaml()?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| EngineError::Io(e.to_string()))?;
    }
    std::fs::write(path, yaml).map_err(|e| EngineError::Io(e.to_string()))
}
