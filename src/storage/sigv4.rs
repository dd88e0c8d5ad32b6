//! AWS Signature Version 4 for path-style S3 requests

use std::time::SystemTime;

use aws_credential_types::Credentials;
use aws_sigv4::http_request::{
    sign, PayloadChecksumKind, PercentEncodingMode, SignableBody, SignableRequest,
    SigningSettings, UriPathNormalizationMode,
};
use aws_sigv4::sign::v4;

use super::StorageError;

const SERVICE: &str = "s3";
const PROVIDER_NAME: &str = "nbpipe-settings";

/// S3 flavour of SigV4: the path is signed exactly as sent and the payload
/// hash travels in `x-amz-content-sha256`.
fn s3_settings() -> SigningSettings {
    let mut settings = SigningSettings::default();
    settings.percent_encoding_mode = PercentEncodingMode::Single;
    settings.uri_path_normalization_mode = UriPathNormalizationMode::Disabled;
    settings.payload_checksum_kind = PayloadChecksumKind::XAmzSha256;
    settings
}

/// Signs requests for one set of static credentials
#[derive(Clone)]
pub struct S3Signer {
    credentials: Credentials,
    region: String,
}

impl std::fmt::Debug for S3Signer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3Signer")
            .field("region", &self.region)
            .finish()
    }
}

impl S3Signer {
    pub fn new(access_key: &str, secret_key: &str, region: &str) -> Self {
        Self {
            credentials: Credentials::new(access_key, secret_key, None, None, PROVIDER_NAME),
            region: region.to_string(),
        }
    }

    /// Headers to attach to a request. `url` must be the URL the request is
    /// actually sent to, path prefix included.
    pub fn sign(
        &self,
        method: &str,
        url: &str,
        body: &[u8],
        at: SystemTime,
    ) -> Result<Vec<(String, String)>, StorageError> {
        let identity = self.credentials.clone().into();
        let params = v4::SigningParams::builder()
            .identity(&identity)
            .region(&self.region)
            .name(SERVICE)
            .time(at)
            .settings(s3_settings())
            .build()
            .map_err(|e| StorageError::Signing(e.to_string()))?
            .into();

        let request =
            SignableRequest::new(method, url, std::iter::empty(), SignableBody::Bytes(body))
                .map_err(|e| StorageError::Signing(e.to_string()))?;
        let (instructions, _signature) = sign(request, &params)
            .map_err(|e| StorageError::Signing(e.to_string()))?
            .into_parts();

        Ok(instructions
            .headers()
            .map(|(name, value)| (name.to_string(), value.to_string()))
            .collect())
    }
}
