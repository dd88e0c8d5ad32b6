use std::path::Path;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use regex::Regex;
use reqwest::{Method, StatusCode, Url};
use tracing::debug;

use super::sigv4::S3Signer;
use super::{ObjectStore, StorageError};
use crate::config::StorageSettings;

/// Path-style S3 client (MinIO and other S3-compatible services)
#[derive(Debug, Clone)]
pub struct S3Store {
    client: reqwest::Client,
    base_url: Url,
    region: String,
    timeout: Duration,
    signer: S3Signer,
}

// ============================================================================
// SBIO: Pure business logic (no I/O)
// ============================================================================

/// URL for a `/bucket[/key]` path below the endpoint, keeping any path
/// prefix the endpoint carries.
pub fn request_url(base: &Url, path: &str) -> Result<Url, StorageError> {
    let joined = format!("{}{}", base.as_str().trim_end_matches('/'), path);
    Url::parse(&joined).map_err(|e| StorageError::InvalidEndpoint(format!("{}: {}", joined, e)))
}

/// Extract `<Code>` from an S3 XML error body
pub fn error_code(body: &str) -> Option<String> {
    let pattern = Regex::new(r"<Code>([^<]+)</Code>").ok()?;
    pattern
        .captures(body)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
}

fn create_bucket_body(region: &str) -> Vec<u8> {
    if region == "us-east-1" {
        Vec::new()
    } else {
        format!(
            "<CreateBucketConfiguration xmlns=\"http://s3.amazonaws.com/doc/2006-03-01/\">\
             <LocationConstraint>{}</LocationConstraint></CreateBucketConfiguration>",
            region
        )
        .into_bytes()
    }
}

// ============================================================================
// SBIO: I/O implementation (real HTTP client)
// ============================================================================

impl S3Store {
    pub fn new(settings: &StorageSettings) -> Result<Self, StorageError> {
        let base_url = Url::parse(&settings.endpoint)
            .map_err(|e| StorageError::InvalidEndpoint(format!("{}: {}", settings.endpoint, e)))?;
        if base_url.host_str().is_none() {
            return Err(StorageError::InvalidEndpoint(settings.endpoint.clone()));
        }
        let client = reqwest::Client::builder()
            .timeout(settings.timeout())
            .build()
            .map_err(|e| StorageError::Http(e.to_string()))?;

        Ok(Self {
            client,
            base_url,
            region: settings.region.clone(),
            timeout: settings.timeout(),
            signer: S3Signer::new(
                settings.access_key.expose(),
                settings.secret_key.expose(),
                &settings.region,
            ),
        })
    }

    async fn send(
        &self,
        method: Method,
        path: &str,
        body: Vec<u8>,
    ) -> Result<reqwest::Response, StorageError> {
        let url = request_url(&self.base_url, path)?;
        let signed = self
            .signer
            .sign(method.as_str(), url.as_str(), &body, SystemTime::now())?;

        debug!(%method, %url, bytes = body.len(), "storage request");
        let mut request = self.client.request(method, url);
        for (name, value) in signed {
            request = request.header(name, value);
        }
        request
            .body(body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    StorageError::Timeout(self.timeout)
                } else {
                    StorageError::Http(e.to_string())
                }
            })
    }

    async fn api_error(response: reqwest::Response) -> StorageError {
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        StorageError::Api {
            status,
            code: error_code(&body).unwrap_or_else(|| "Unknown".to_string()),
        }
    }
}

#[async_trait]
impl ObjectStore for S3Store {
    async fn bucket_exists(&self, bucket: &str) -> Result<bool, StorageError> {
        let response = self
            .send(Method::HEAD, &format!("/{}", bucket), Vec::new())
            .await?;
        match response.status() {
            s if s.is_success() => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            _ => Err(Self::api_error(response).await),
        }
    }

    async fn make_bucket(&self, bucket: &str) -> Result<(), StorageError> {
        let response = self
            .send(
                Method::PUT,
                &format!("/{}", bucket),
                create_bucket_body(&self.region),
            )
            .await?;
        if response.status().is_success() {
            return Ok(());
        }

        match Self::api_error(response).await {
            StorageError::Api { code, .. } if code == "BucketAlreadyOwnedByYou" => {
                Err(StorageError::BucketAlreadyOwnedByYou(bucket.to_string()))
            }
            StorageError::Api { code, .. } if code == "BucketAlreadyExists" => {
                Err(StorageError::BucketAlreadyExists(bucket.to_string()))
            }
            other => Err(other),
        }
    }

    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        local_path: &Path,
    ) -> Result<(), StorageError> {
        let body = tokio::fs::read(local_path)
            .await
            .map_err(|e| StorageError::ReadFile(local_path.to_path_buf(), e.to_string()))?;
        let response = self
            .send(Method::PUT, &format!("/{}/{}", bucket, key), body)
            .await?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(Self::api_error(response).await)
        }
    }
}
