use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::staging::StorageCoordinates;

/// Default MinIO client download location used by workers
pub const DEFAULT_STORAGE_CLI_URL: &str = "https://dl.min.io/client/mc/release/linux-amd64/mc";

/// Secret the Kubeflow install provisions for its own MinIO
pub const DEFAULT_CREDENTIALS_SECRET: &str = "mlpipeline-minio-artifact";

/// Default port for the scheduler HTTP API
pub const DEFAULT_PORT: u16 = 8080;

/// Errors that can occur while parsing or validating settings
#[derive(Error, Debug, PartialEq)]
pub enum SettingsError {
    #[error("Failed to parse settings: {0}")]
    ParseError(String),

    #[error("Cannot expand '{0}': {1}")]
    UndefinedVariable(String, String),

    #[error("Invalid setting {0}: {1}")]
    Invalid(&'static str, String),
}

/// A credential value. Never printed by `Debug`.
#[derive(Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(transparent)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::fmt::Debug for Secret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Secret(***)")
    }
}

/// Complete settings file
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub storage: StorageSettings,
    #[serde(default)]
    pub engine: EngineSettings,
    #[serde(default)]
    pub packaging: PackagingSettings,
    #[serde(default)]
    pub server: ServerSettings,
}

/// Object storage (S3 / MinIO) holding archives and notebook outputs
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct StorageSettings {
    /// Endpoint URL, e.g. "http://minio.kubeflow:9000"
    #[serde(default = "default_storage_endpoint")]
    pub endpoint: String,

    /// Endpoint as reachable from worker pods, if different
    #[serde(default)]
    pub worker_endpoint: Option<String>,

    #[serde(default)]
    pub access_key: Secret,

    #[serde(default)]
    pub secret_key: Secret,

    #[serde(default = "default_bucket")]
    pub bucket: String,

    #[serde(default = "default_region")]
    pub region: String,

    /// Host alias the worker registers with the storage CLI
    #[serde(default = "default_alias")]
    pub alias: String,

    #[serde(default = "default_cli_url")]
    pub cli_url: String,

    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Where worker pods read the storage credentials from
    #[serde(default)]
    pub worker_credentials: WorkerCredentials,
}

/// Kubernetes secret holding the storage credentials for worker pods
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct WorkerCredentials {
    #[serde(default = "default_credentials_secret")]
    pub secret: String,
    #[serde(default = "default_access_key_field")]
    pub access_key_field: String,
    #[serde(default = "default_secret_key_field")]
    pub secret_key_field: String,
}

impl Default for WorkerCredentials {
    fn default() -> Self {
        Self {
            secret: default_credentials_secret(),
            access_key_field: default_access_key_field(),
            secret_key_field: default_secret_key_field(),
        }
    }
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            endpoint: default_storage_endpoint(),
            worker_endpoint: None,
            access_key: Secret::default(),
            secret_key: Secret::default(),
            bucket: default_bucket(),
            region: default_region(),
            alias: default_alias(),
            cli_url: default_cli_url(),
            timeout_secs: default_timeout_secs(),
            worker_credentials: WorkerCredentials::default(),
        }
    }
}

impl StorageSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Coordinates handed to the staging protocol
    pub fn coordinates(&self) -> StorageCoordinates {
        StorageCoordinates {
            alias: self.alias.clone(),
            endpoint: self
                .worker_endpoint
                .clone()
                .unwrap_or_else(|| self.endpoint.clone()),
            bucket: self.bucket.clone(),
            cli_url: self.cli_url.clone(),
        }
    }
}

/// Kubeflow Pipelines API
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct EngineSettings {
    /// Pipelines API host, e.g. "http://ml-pipeline-ui.kubeflow:80/pipeline"
    #[serde(default = "default_engine_url")]
    pub url: String,

    #[serde(default)]
    pub token: Option<Secret>,

    /// Service account the workflow pods run as
    #[serde(default = "default_service_account")]
    pub service_account: String,

    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            url: default_engine_url(),
            token: None,
            service_account: default_service_account(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl EngineSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Local archive building
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct PackagingSettings {
    /// Directory notebook paths are resolved against
    #[serde(default = "default_source_root")]
    pub source_root: PathBuf,

    /// Scratch directory for archives and compiled workflows
    #[serde(default = "default_work_dir")]
    pub work_dir: PathBuf,

    /// Upper bound on nodes packaged and uploaded at once
    #[serde(default = "default_max_concurrent_uploads")]
    pub max_concurrent_uploads: usize,
}

impl Default for PackagingSettings {
    fn default() -> Self {
        Self {
            source_root: default_source_root(),
            work_dir: default_work_dir(),
            max_concurrent_uploads: default_max_concurrent_uploads(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ServerSettings {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            port: default_port(),
        }
    }
}

fn default_storage_endpoint() -> String {
    "http://localhost:9000".to_string()
}

fn default_bucket() -> String {
    "nbpipe".to_string()
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_alias() -> String {
    "nbpipe".to_string()
}

fn default_cli_url() -> String {
    DEFAULT_STORAGE_CLI_URL.to_string()
}

fn default_timeout_secs() -> u64 {
    60
}

fn default_credentials_secret() -> String {
    DEFAULT_CREDENTIALS_SECRET.to_string()
}

fn default_access_key_field() -> String {
    "accesskey".to_string()
}

fn default_secret_key_field() -> String {
    "secretkey".to_string()
}

fn default_engine_url() -> String {
    "http://localhost:8888".to_string()
}

fn default_service_account() -> String {
    "pipeline-runner".to_string()
}

fn default_source_root() -> PathBuf {
    PathBuf::from(".")
}

fn default_work_dir() -> PathBuf {
    PathBuf::from("pipeline_files")
}

fn default_max_concurrent_uploads() -> usize {
    4
}

fn default_bind_addr() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

// ============================================================================
// SBIO: Pure functions (no I/O beyond reading the process environment)
// ============================================================================

/// Expand `$VAR` / `${VAR}` in every string of a YAML document
pub fn expand_env_in_value(value: serde_yaml::Value) -> Result<serde_yaml::Value, SettingsError> {
    use serde_yaml::Value;

    match value {
        Value::String(s) => {
            let expanded = shellexpand::env(&s)
                .map_err(|e| SettingsError::UndefinedVariable(s.clone(), e.to_string()))?;
            Ok(Value::String(expanded.into_owned()))
        }
        Value::Sequence(seq) => seq
            .into_iter()
            .map(expand_env_in_value)
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Sequence),
        Value::Mapping(map) => {
            let mut out = serde_yaml::Mapping::with_capacity(map.len());
            for (k, v) in map {
                out.insert(k, expand_env_in_value(v)?);
            }
            Ok(Value::Mapping(out))
        }
        other => Ok(other),
    }
}

/// Parse a settings YAML string, expanding environment references.
pub fn parse_settings(content: &str) -> Result<Settings, SettingsError> {
    let raw: serde_yaml::Value =
        serde_yaml::from_str(content).map_err(|e| SettingsError::ParseError(e.to_string()))?;
    // An empty document parses as null
    if raw.is_null() {
        return Ok(Settings::default());
    }
    let expanded = expand_env_in_value(raw)?;
    let settings: Settings =
        serde_yaml::from_value(expanded).map_err(|e| SettingsError::ParseError(e.to_string()))?;
    validate_settings(&settings)?;
    Ok(settings)
}

/// Check values serde cannot rule out on its own
pub fn validate_settings(settings: &Settings) -> Result<(), SettingsError> {
    if settings.storage.bucket.trim().is_empty() {
        return Err(SettingsError::Invalid(
            "storage.bucket",
            "must not be empty".to_string(),
        ));
    }
    if settings.storage.alias.trim().is_empty() {
        return Err(SettingsError::Invalid(
            "storage.alias",
            "must not be empty".to_string(),
        ));
    }
    let credentials = &settings.storage.worker_credentials;
    for (field, value) in [
        ("storage.worker-credentials.secret", &credentials.secret),
        ("storage.worker-credentials.access-key-field", &credentials.access_key_field),
        ("storage.worker-credentials.secret-key-field", &credentials.secret_key_field),
    ] {
        if value.trim().is_empty() {
            return Err(SettingsError::Invalid(field, "must not be empty".to_string()));
        }
    }
    if settings.packaging.max_concurrent_uploads == 0 {
        return Err(SettingsError::Invalid(
            "packaging.max-concurrent-uploads",
            "must be >= 1 (got 0)".to_string(),
        ));
    }
    if settings.storage.timeout_secs == 0 {
        return Err(SettingsError::Invalid(
            "storage.timeout-secs",
            "must be >= 1 (got 0)".to_string(),
        ));
    }
    if settings.engine.timeout_secs == 0 {
        return Err(SettingsError::Invalid(
            "engine.timeout-secs",
            "must be >= 1 (got 0)".to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_document_uses_defaults() {
        let settings = parse_settings("").unwrap();
        assert_eq!(settings.storage.bucket, "nbpipe");
        assert_eq!(settings.packaging.max_concurrent_uploads, 4);
        assert_eq!(settings.server.port, DEFAULT_PORT);
        assert_eq!(settings.engine.service_account, "pipeline-runner");
    }

    #[test]
    fn test_parse_full_settings() {
        let yaml = r#"
storage:
  endpoint: http://minio.kubeflow:9000
  access-key: minio
  secret-key: minio123
  bucket: notebooks
  alias: aiworkspace
engine:
  url: http://kfp.example.com/pipeline
  timeout-secs: 30
packaging:
  source-root: /home/jovyan
  max-concurrent-uploads: 8
server:
  port: 9090
"#;
        let settings = parse_settings(yaml).unwrap();
        assert_eq!(settings.storage.endpoint, "http://minio.kubeflow:9000");
        assert_eq!(settings.storage.secret_key.expose(), "minio123");
        assert_eq!(settings.engine.timeout(), Duration::from_secs(30));
        assert_eq!(settings.packaging.source_root, PathBuf::from("/home/jovyan"));
        assert_eq!(settings.packaging.max_concurrent_uploads, 8);
        assert_eq!(settings.server.port, 9090);
    }

    #[test]
    fn test_env_expansion() {
        std::env::set_var("NBPIPE_TEST_SECRET_KEY", "s3cr3t");
        let yaml = "storage:\n  secret-key: ${NBPIPE_TEST_SECRET_KEY}\n";
        let settings = parse_settings(yaml).unwrap();
        assert_eq!(settings.storage.secret_key.expose(), "s3cr3t");
    }

    #[test]
    fn test_undefined_variable() {
        let yaml = "storage:\n  secret-key: ${NBPIPE_TEST_DEFINITELY_UNSET}\n";
        assert!(matches!(
            parse_settings(yaml),
            Err(SettingsError::UndefinedVariable(_, _))
        ));
    }

    #[test]
    fn test_worker_credentials() {
        let settings = parse_settings("").unwrap();
        assert_eq!(
            settings.storage.worker_credentials.secret,
            DEFAULT_CREDENTIALS_SECRET
        );
        assert_eq!(settings.storage.worker_credentials.access_key_field, "accesskey");

        let yaml = "storage:\n  worker-credentials:\n    secret: notebook-storage\n";
        let settings = parse_settings(yaml).unwrap();
        assert_eq!(settings.storage.worker_credentials.secret, "notebook-storage");
        assert_eq!(settings.storage.worker_credentials.secret_key_field, "secretkey");

        let yaml = "storage:\n  worker-credentials:\n    secret: ''\n";
        assert!(matches!(
            parse_settings(yaml),
            Err(SettingsError::Invalid("storage.worker-credentials.secret", _))
        ));
    }

    #[test]
    fn test_zero_workers_rejected() {
        let yaml = "packaging:\n  max-concurrent-uploads: 0\n";
        assert!(matches!(
            parse_settings(yaml),
            Err(SettingsError::Invalid("packaging.max-concurrent-uploads", _))
        ));
    }

    #[test]
    fn test_secret_debug_is_redacted() {
        let secret = Secret::new("minio123");
        assert_eq!(format!("{:?}", secret), "Secret(***)");
        let settings = StorageSettings {
            secret_key: secret,
            ..Default::default()
        };
        assert!(!format!("{:?}", settings).contains("minio123"));
    }

    #[test]
    fn test_worker_endpoint_overrides_coordinates() {
        let settings = StorageSettings {
            endpoint: "http://localhost:9000".to_string(),
            worker_endpoint: Some("http://minio-service.kubeflow:9000".to_string()),
            ..Default::default()
        };
        let coords = settings.coordinates();
        assert_eq!(coords.endpoint, "http://minio-service.kubeflow:9000");
        assert_eq!(coords.bucket, "nbpipe");
    }
}
