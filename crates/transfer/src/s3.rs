use std::sync::Arc;

use object_store::aws::AmazonS3Builder;
use object_store::{ClientOptions, ObjectStore};
use url::Url;

use crate::{ObjectTransfer, TransferError};

/// Connection details for an S3-compatible bucket.
#[derive(Debug, Clone, Default)]
pub struct S3Settings {
    /// Custom endpoint such as a MinIO URL; empty means AWS.
    pub url: String,
    pub access_key_id: String,
    pub access_key_secret: String,
    pub bucket: String,
    pub region: String,
    pub ssl_verify: bool,
}

impl ObjectTransfer {
    /// Builds a path-style S3 client that can also presign urls.
    pub fn s3(settings: &S3Settings) -> Result<Self, TransferError> {
        if settings.bucket.is_empty() {
            return Err(TransferError::Configure("bucket name is empty".into()));
        }

        let mut builder = AmazonS3Builder::new()
            .with_bucket_name(&settings.bucket)
            .with_region(&settings.region)
            .with_virtual_hosted_style_request(false)
            .with_client_options(
                ClientOptions::new().with_allow_invalid_certificates(!settings.ssl_verify),
            );
        if !settings.access_key_id.is_empty() {
            builder = builder
                .with_access_key_id(&settings.access_key_id)
                .with_secret_access_key(&settings.access_key_secret);
        }
        if !settings.url.is_empty() {
            let endpoint = Url::parse(&settings.url)
                .map_err(|err| TransferError::Configure(format!("endpoint {}: {err}", settings.url)))?;
            builder = builder
                .with_allow_http(endpoint.scheme() == "http")
                .with_endpoint(settings.url.trim_end_matches('/'));
        }

        let client = Arc::new(
            builder
                .build()
                .map_err(|err| TransferError::Configure(err.to_string()))?,
        );
        let store: Arc<dyn ObjectStore> = client.clone();
        Ok(Self::new(store, &settings.bucket).with_signer(client))
    }
}
