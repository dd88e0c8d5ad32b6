use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Submission body posted by the pipeline editor
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SubmissionPayload {
    #[serde(default)]
    pub pipeline_name: String,
    pub pipeline_data: PipelineData,
}

/// The `pipeline_data` section: one record per canvas node
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct PipelineData {
    #[serde(default)]
    pub nodes: Vec<NodeRecord>,
}

/// A node as the editor describes it.
///
/// Every field is optional here so that missing values are reported as
/// malformed-graph errors naming the node, not as opaque JSON errors.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct NodeRecord {
    #[serde(default)]
    pub id: Option<String>,

    /// Input ports; only the first port carries dependency links
    #[serde(default)]
    pub inputs: Vec<InputPort>,

    #[serde(default)]
    pub app_data: Option<AppData>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct InputPort {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub links: Option<Vec<LinkRecord>>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct LinkRecord {
    #[serde(default)]
    pub node_id_ref: Option<String>,
}

/// Free-form node metadata holding the notebook path and runtime image
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct AppData {
    #[serde(default)]
    pub notebook: Option<String>,

    #[serde(default)]
    pub docker_image: Option<String>,

    /// Editor-specific keys we carry but do not interpret
    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

impl NodeRecord {
    /// Upstream node ids declared on the first input port, in declaration order.
    ///
    /// `None` entries are links without a `node_id_ref`.
    pub fn upstream_refs(&self) -> Vec<Option<&str>> {
        self.inputs
            .first()
            .and_then(|port| port.links.as_ref())
            .map(|links| links.iter().map(|l| l.node_id_ref.as_deref()).collect())
            .unwrap_or_default()
    }
}
